mod actor;
mod api;
mod common;
mod consensus;
mod frontier;
mod retryable;
mod wal;
mod grpc {
    include!("../generated/consensus.rs");
}

pub use api::ReplicationOptions;
pub use api::TabletReplication;
pub use api::TabletReplicationConfig;
pub use api::TabletReplicationError;
pub use api::TabletStorage;
pub use common::mocked_clock;
pub use common::Clock;
pub use common::HybridTime;
pub use common::MemTracker;
pub use common::MockClock;
pub use common::MockClockController;
pub use common::OpId;
pub use common::RealClock;
pub use common::ReplicationError;
pub use common::Result;
pub use consensus::CommitProgress;
pub use consensus::ConsensusError;
pub use consensus::ConsensusErrorCode;
pub use consensus::ConsensusRequest;
pub use consensus::ConsensusResponse;
pub use consensus::ConsensusStatus;
pub use consensus::GrpcPeerProxy;
pub use consensus::LeaseExpiration;
pub use consensus::LeaseWatermark;
pub use consensus::LogCache;
pub use consensus::LogCacheOptions;
pub use consensus::MajorityReplicatedData;
pub use consensus::MemberType;
pub use consensus::PeerHandle;
pub use consensus::PeerOptions;
pub use consensus::PeerProxy;
pub use consensus::PeerProxyError;
pub use consensus::PeerRequest;
pub use consensus::QueueMode;
pub use consensus::QueueObserver;
pub use consensus::QueueOptions;
pub use consensus::QueueState;
pub use consensus::RaftConfig;
pub use consensus::RaftPeer;
pub use consensus::ReadOpsResult;
pub use consensus::RemoteBootstrapRequest;
pub use consensus::ReplicationQueue;
pub use consensus::SafeTimeProvider;
pub use consensus::TabletErrorCode;
pub use consensus::TabletServerError;
pub use consensus::TrackedPeer;
pub use frontier::ConsensusFrontier;
pub use frontier::FlushedFrontierTracker;
pub use frontier::UpdateDirection;
pub use retryable::ConsensusRound;
pub use retryable::ReplicationFinishedCallback;
pub use retryable::RetryableRequests;
pub use retryable::RetryableRequestsCounts;
pub use retryable::RetryableRequestsOptions;
pub use wal::append_completion;
pub use wal::ClientId;
pub use wal::DurabilityPolicy;
pub use wal::EntryType;
pub use wal::Log;
pub use wal::LogEntryBatch;
pub use wal::LogOptions;
pub use wal::LogReader;
pub use wal::LogRecord;
pub use wal::Payload;
pub use wal::StatusCallback;
pub use wal::WriteRequest;
