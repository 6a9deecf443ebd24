use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Clone, Debug)]
pub struct LogCacheOptions {
    /// Budget of one tablet's cache.
    pub tablet_limit_bytes: i64,
    /// Budget shared by the caches of every tablet on the server.
    pub server_limit_bytes: i64,
}

impl Default for LogCacheOptions {
    fn default() -> Self {
        LogCacheOptions {
            tablet_limit_bytes: 128 * 1024 * 1024,
            server_limit_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueueOptions {
    max_batch_size_bytes: Arc<AtomicUsize>,
    pub follower_unavailable_considered_failed: Duration,
    pub leader_lease_duration: Duration,
    pub ht_lease_duration: Duration,
    pub enable_exponential_backoff: bool,
    /// Consecutive retransmissions after which a follower no longer holds back cache eviction.
    /// Zero disables the check.
    pub lagging_follower_threshold: u32,
    /// A change data capture checkpoint older than this does not hold back cache eviction.
    pub cdc_checkpoint_interval: Duration,
}

impl QueueOptions {
    /// Per-request budget for replicated records. Clones of these options share the value, so it
    /// can be tuned while queues are running.
    pub fn max_batch_size_bytes(&self) -> usize {
        self.max_batch_size_bytes.load(Ordering::Relaxed)
    }

    pub fn set_max_batch_size_bytes(&self, bytes: usize) {
        self.max_batch_size_bytes.store(bytes, Ordering::Relaxed);
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            max_batch_size_bytes: Arc::new(AtomicUsize::new(4 * 1024 * 1024)),
            follower_unavailable_considered_failed: Duration::from_secs(900),
            leader_lease_duration: Duration::from_millis(2000),
            ht_lease_duration: Duration::from_millis(2000),
            enable_exponential_backoff: true,
            lagging_follower_threshold: 10,
            cdc_checkpoint_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct PeerOptions {
    pub heartbeat_interval: Duration,
    pub rpc_timeout: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        PeerOptions {
            heartbeat_interval: Duration::from_millis(500),
            rpc_timeout: Duration::from_secs(3),
        }
    }
}
