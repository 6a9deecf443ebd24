use tokio::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryableRequestsOptions {
    /// How long a replicated request is remembered after it was received.
    pub request_timeout: Duration,
    /// Upper bound on the time span of one replicated range, so that continuous traffic still
    /// produces ranges old enough to expire.
    pub range_time_limit: Duration,
}

impl Default for RetryableRequestsOptions {
    fn default() -> Self {
        RetryableRequestsOptions {
            request_timeout: Duration::from_secs(120),
            range_time_limit: Duration::from_secs(30),
        }
    }
}
