mod log_cache;
mod messages;
mod observer;
mod options;
mod peer;
mod peer_proxy;
mod queue;
mod tracked_peer;
mod watermark;

pub use log_cache::LogCache;
pub use log_cache::ReadOpsResult;
pub use messages::ConsensusError;
pub use messages::ConsensusErrorCode;
pub use messages::ConsensusRequest;
pub use messages::ConsensusResponse;
pub use messages::ConsensusStatus;
pub use messages::MemberType;
pub use messages::RaftConfig;
pub use messages::RaftPeer;
pub use messages::RemoteBootstrapRequest;
pub use messages::TabletErrorCode;
pub use messages::TabletServerError;
pub use observer::CommitProgress;
pub use observer::QueueObserver;
pub use options::LogCacheOptions;
pub use options::PeerOptions;
pub use options::QueueOptions;
pub use peer::PeerHandle;
pub use peer_proxy::GrpcPeerProxy;
pub use peer_proxy::PeerProxy;
pub use peer_proxy::PeerProxyError;
pub use queue::PeerRequest;
pub use queue::QueueMode;
pub use queue::QueueState;
pub use queue::ReplicationQueue;
pub use queue::SafeTimeProvider;
pub use tracked_peer::LeaseExpiration;
pub use tracked_peer::TrackedPeer;
pub use watermark::LeaseWatermark;
pub use watermark::MajorityReplicatedData;
