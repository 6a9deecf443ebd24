mod options;
mod ranges;
mod requests;

pub use options::RetryableRequestsOptions;
pub use requests::ConsensusRound;
pub use requests::ReplicationFinishedCallback;
pub use requests::RetryableRequests;
pub use requests::RetryableRequestsCounts;
