use crate::common::ReplicationError;
use crate::consensus::{ConsensusRequest, ConsensusResponse, RemoteBootstrapRequest};
use crate::grpc;
use crate::grpc::consensus_service_client::ConsensusServiceClient;
use std::convert::TryFrom;
use tokio::time::Duration;
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint};

#[derive(Debug, thiserror::Error)]
pub enum PeerProxyError {
    #[error("Invalid peer address: {0}")]
    InvalidUri(#[from] uri::InvalidUri),
    #[error("Unable to connect to peer: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("RPC failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("RPC timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Malformed response: {0}")]
    Malformed(#[from] ReplicationError),
}

impl PeerProxyError {
    /// The peer answered, even if only with an error.
    pub fn peer_is_responsive(&self) -> bool {
        matches!(self, PeerProxyError::Status(_) | PeerProxyError::Malformed(_))
    }
}

/// PeerProxy sends replication RPCs to one remote peer.
#[async_trait::async_trait]
pub trait PeerProxy: Send + Sync + 'static {
    async fn update_consensus(&self, request: ConsensusRequest) -> Result<ConsensusResponse, PeerProxyError>;

    async fn start_remote_bootstrap(&self, request: RemoteBootstrapRequest) -> Result<(), PeerProxyError>;
}

/// gRPC implementation of [`PeerProxy`]. The channel connects on first use and reconnects on its own.
#[derive(Clone)]
pub struct GrpcPeerProxy {
    client: ConsensusServiceClient<Channel>,
}

impl GrpcPeerProxy {
    /// `addr` is a URL such as `http://10.0.0.7:9100`.
    pub fn new(addr: impl Into<String>) -> Result<Self, PeerProxyError> {
        let endpoint = Endpoint::from_shared(addr.into())?;
        let channel = endpoint.connect_lazy()?;

        Ok(GrpcPeerProxy {
            client: ConsensusServiceClient::new(channel),
        })
    }
}

#[async_trait::async_trait]
impl PeerProxy for GrpcPeerProxy {
    async fn update_consensus(&self, request: ConsensusRequest) -> Result<ConsensusResponse, PeerProxyError> {
        let mut client = self.client.clone();
        let response = client
            .update_consensus(grpc::ConsensusRequestPb::from(&request))
            .await?;

        Ok(ConsensusResponse::try_from(response.into_inner())?)
    }

    async fn start_remote_bootstrap(&self, request: RemoteBootstrapRequest) -> Result<(), PeerProxyError> {
        let mut client = self.client.clone();
        client
            .start_remote_bootstrap(grpc::StartRemoteBootstrapRequestPb::from(&request))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_invalid_address() {
        let result = GrpcPeerProxy::new("not a uri");
        assert!(matches!(result, Err(PeerProxyError::InvalidUri(_))));

        // Lazy: nothing listens there and construction still succeeds.
        assert!(GrpcPeerProxy::new("http://127.0.0.1:1").is_ok());
    }

    #[test]
    fn only_answers_count_as_responsive() {
        assert!(PeerProxyError::Status(tonic::Status::unavailable("down")).peer_is_responsive());
        assert!(!PeerProxyError::TimedOut(Duration::from_secs(3)).peer_is_responsive());
    }
}
