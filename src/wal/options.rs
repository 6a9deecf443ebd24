use std::time::Duration;

/// When appended data is forced to stable storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DurabilityPolicy {
    /// fsync after every group of appended batches.
    Always,
    /// fsync once the oldest unsynced batch is `interval` old or `bytes` are pending, whichever
    /// comes first.
    Periodic { interval: Duration, bytes: u64 },
    /// Never fsync. Data still goes through the OS page cache.
    Disabled,
}

#[derive(Clone, Debug)]
pub struct LogOptions {
    pub initial_segment_size_bytes: u64,
    pub max_segment_size_bytes: u64,
    pub durability: DurabilityPolicy,
    pub min_segments_to_retain: usize,
    pub min_seconds_to_retain: u64,
    pub async_preallocate_segments: bool,
    pub long_wait_threshold: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            initial_segment_size_bytes: 1024 * 1024,
            max_segment_size_bytes: 64 * 1024 * 1024,
            durability: DurabilityPolicy::Periodic {
                interval: Duration::from_millis(1000),
                bytes: 1024 * 1024,
            },
            min_segments_to_retain: 2,
            min_seconds_to_retain: 900,
            async_preallocate_segments: true,
            long_wait_threshold: Duration::from_secs(15),
        }
    }
}
