use crate::consensus::{LogCacheOptions, PeerOptions, QueueOptions};
use crate::retryable::RetryableRequestsOptions;
use crate::wal::{DurabilityPolicy, LogOptions};
use std::convert::TryFrom;
use tokio::time::Duration;

/// Room a replication request needs besides its records.
const REQUEST_OVERHEAD_BYTES: usize = 1024;

/// Tunables for one tablet's replication stack. Unset fields take their defaults.
#[derive(Clone, Debug, Default)]
pub struct ReplicationOptions {
    // WAL
    pub initial_segment_size_bytes: Option<u64>,
    pub max_segment_size_bytes: Option<u64>,
    pub durability: Option<DurabilityPolicy>,
    pub min_segments_to_retain: Option<usize>,
    pub min_seconds_to_retain: Option<u64>,
    pub async_preallocate_segments: Option<bool>,
    pub long_wait_threshold: Option<Duration>,
    // Log cache
    pub tablet_cache_limit_bytes: Option<i64>,
    pub server_cache_limit_bytes: Option<i64>,
    // Queue
    pub max_batch_size_bytes: Option<usize>,
    pub max_rpc_message_size_bytes: Option<usize>,
    pub follower_unavailable_considered_failed: Option<Duration>,
    pub leader_lease_duration: Option<Duration>,
    pub ht_lease_duration: Option<Duration>,
    pub enable_exponential_backoff: Option<bool>,
    pub lagging_follower_threshold: Option<u32>,
    pub cdc_checkpoint_interval: Option<Duration>,
    // Peers
    pub heartbeat_interval: Option<Duration>,
    pub rpc_timeout: Option<Duration>,
    // Retryable requests
    pub retryable_request_timeout: Option<Duration>,
    pub retryable_range_time_limit: Option<Duration>,
}

pub(super) struct ReplicationOptionsValidated {
    pub log: LogOptions,
    pub cache: LogCacheOptions,
    pub queue: QueueOptions,
    pub peer: PeerOptions,
    pub retryable: RetryableRequestsOptions,
    pub max_rpc_message_size_bytes: usize,
}

impl ReplicationOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.log.initial_segment_size_bytes > self.log.max_segment_size_bytes {
            return Err("Initial segment size must not exceed the maximum segment size");
        }
        if self.cache.tablet_limit_bytes > self.cache.server_limit_bytes {
            return Err("Tablet log cache limit must not exceed the server-wide limit");
        }
        if self.queue.max_batch_size_bytes() + REQUEST_OVERHEAD_BYTES >= self.max_rpc_message_size_bytes {
            return Err("Max batch size plus request overhead must be below the max RPC message size");
        }
        if self.queue.leader_lease_duration == Duration::from_secs(0)
            || self.queue.ht_lease_duration == Duration::from_secs(0)
        {
            return Err("Leader lease durations must be non-zero");
        }
        if self.retryable.range_time_limit > self.retryable.request_timeout {
            return Err("Retryable range time limit must not exceed the request timeout");
        }
        if self.peer.heartbeat_interval >= self.queue.follower_unavailable_considered_failed {
            return Err("Heartbeat interval must be shorter than the failed follower threshold");
        }

        Ok(())
    }
}

impl TryFrom<ReplicationOptions> for ReplicationOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ReplicationOptions) -> Result<Self, Self::Error> {
        let log_defaults = LogOptions::default();
        let cache_defaults = LogCacheOptions::default();
        let peer_defaults = PeerOptions::default();
        let retryable_defaults = RetryableRequestsOptions::default();

        let mut queue = QueueOptions::default();
        if let Some(threshold) = options.follower_unavailable_considered_failed {
            queue.follower_unavailable_considered_failed = threshold;
        }
        if let Some(duration) = options.leader_lease_duration {
            queue.leader_lease_duration = duration;
        }
        if let Some(duration) = options.ht_lease_duration {
            queue.ht_lease_duration = duration;
        }
        if let Some(enabled) = options.enable_exponential_backoff {
            queue.enable_exponential_backoff = enabled;
        }
        if let Some(threshold) = options.lagging_follower_threshold {
            queue.lagging_follower_threshold = threshold;
        }
        if let Some(interval) = options.cdc_checkpoint_interval {
            queue.cdc_checkpoint_interval = interval;
        }
        if let Some(max_batch_size_bytes) = options.max_batch_size_bytes {
            queue.set_max_batch_size_bytes(max_batch_size_bytes);
        }

        let values = ReplicationOptionsValidated {
            log: LogOptions {
                initial_segment_size_bytes: options
                    .initial_segment_size_bytes
                    .unwrap_or(log_defaults.initial_segment_size_bytes),
                max_segment_size_bytes: options
                    .max_segment_size_bytes
                    .unwrap_or(log_defaults.max_segment_size_bytes),
                durability: options.durability.unwrap_or(log_defaults.durability),
                min_segments_to_retain: options
                    .min_segments_to_retain
                    .unwrap_or(log_defaults.min_segments_to_retain),
                min_seconds_to_retain: options
                    .min_seconds_to_retain
                    .unwrap_or(log_defaults.min_seconds_to_retain),
                async_preallocate_segments: options
                    .async_preallocate_segments
                    .unwrap_or(log_defaults.async_preallocate_segments),
                long_wait_threshold: options.long_wait_threshold.unwrap_or(log_defaults.long_wait_threshold),
            },
            cache: LogCacheOptions {
                tablet_limit_bytes: options
                    .tablet_cache_limit_bytes
                    .unwrap_or(cache_defaults.tablet_limit_bytes),
                server_limit_bytes: options
                    .server_cache_limit_bytes
                    .unwrap_or(cache_defaults.server_limit_bytes),
            },
            queue,
            peer: PeerOptions {
                heartbeat_interval: options.heartbeat_interval.unwrap_or(peer_defaults.heartbeat_interval),
                rpc_timeout: options.rpc_timeout.unwrap_or(peer_defaults.rpc_timeout),
            },
            retryable: RetryableRequestsOptions {
                request_timeout: options
                    .retryable_request_timeout
                    .unwrap_or(retryable_defaults.request_timeout),
                range_time_limit: options
                    .retryable_range_time_limit
                    .unwrap_or(retryable_defaults.range_time_limit),
            },
            max_rpc_message_size_bytes: options.max_rpc_message_size_bytes.unwrap_or(8 * 1024 * 1024),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = ReplicationOptionsValidated::try_from(ReplicationOptions::default()).unwrap();

        assert_eq!(validated.log.max_segment_size_bytes, 64 * 1024 * 1024);
        assert_eq!(validated.cache.tablet_limit_bytes, 128 * 1024 * 1024);
        assert_eq!(validated.queue.max_batch_size_bytes(), 4 * 1024 * 1024);
        assert_eq!(validated.peer.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(validated.retryable.request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_validation() {
        fn run(expect_valid: bool, options: ReplicationOptions) {
            assert_eq!(ReplicationOptionsValidated::try_from(options).is_ok(), expect_valid);
        }

        run(
            true,
            ReplicationOptions {
                max_batch_size_bytes: Some(1024),
                durability: Some(DurabilityPolicy::Always),
                ..ReplicationOptions::default()
            },
        );
        run(
            false,
            ReplicationOptions {
                initial_segment_size_bytes: Some(2048),
                max_segment_size_bytes: Some(1024),
                ..ReplicationOptions::default()
            },
        );
        run(
            false,
            ReplicationOptions {
                max_batch_size_bytes: Some(8 * 1024 * 1024),
                ..ReplicationOptions::default()
            },
        );
        run(
            false,
            ReplicationOptions {
                leader_lease_duration: Some(Duration::from_secs(0)),
                ..ReplicationOptions::default()
            },
        );
        run(
            false,
            ReplicationOptions {
                retryable_request_timeout: Some(Duration::from_secs(10)),
                ..ReplicationOptions::default()
            },
        );
        run(
            false,
            ReplicationOptions {
                tablet_cache_limit_bytes: Some(2048),
                server_cache_limit_bytes: Some(1024),
                ..ReplicationOptions::default()
            },
        );
    }

    #[test]
    fn batch_size_stays_tunable() {
        let validated = ReplicationOptionsValidated::try_from(ReplicationOptions::default()).unwrap();
        let shared = validated.queue.clone();

        shared.set_max_batch_size_bytes(1024);

        assert_eq!(validated.queue.max_batch_size_bytes(), 1024);
    }
}
