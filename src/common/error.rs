use std::io;
use std::sync::Arc;

/// ReplicationError is the error kind shared by the log, the log cache, the replication queue and
/// the retryable request tracker.
///
/// It is `Clone` so that a single outcome can be handed to every registration coalesced onto the
/// same running request.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
    #[error("Corruption: {0}")]
    Corruption(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Incomplete: {0}")]
    Incomplete(String),
    #[error("Expired: {message} (min running request id {min_running_request_id})")]
    Expired { message: String, min_running_request_id: i64 },
    #[error("Already present: {0}")]
    AlreadyPresent(String),
    #[error("Timed out: {0}")]
    TimedOut(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// A broken internal invariant. The embedding application decides whether to crash.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

impl ReplicationError {
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ReplicationError::Internal(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ReplicationError::NotFound(_))
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(self, ReplicationError::Incomplete(_))
    }

    pub fn is_already_present(&self) -> bool {
        matches!(self, ReplicationError::AlreadyPresent(_))
    }

    pub(crate) fn shutting_down() -> Self {
        ReplicationError::ServiceUnavailable("WAL is shutting down".to_string())
    }
}

impl From<io::Error> for ReplicationError {
    fn from(e: io::Error) -> Self {
        ReplicationError::Io(Arc::new(e))
    }
}

impl From<prost::DecodeError> for ReplicationError {
    fn from(e: prost::DecodeError) -> Self {
        ReplicationError::Corruption(format!("Unable to decode protobuf: {}", e))
    }
}

impl From<prost::EncodeError> for ReplicationError {
    fn from(e: prost::EncodeError) -> Self {
        ReplicationError::Internal(format!("Unable to encode protobuf: {}", e))
    }
}
