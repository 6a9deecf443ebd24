use crate::common::{OpId, Result};
use crate::consensus::MajorityReplicatedData;

/// What the consensus layer made of a majority-replicated update.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitProgress {
    /// The queue only ever moves its committed op id forward.
    pub committed_op_id: OpId,
    pub last_applied_op_id: OpId,
}

/// QueueObserver receives the replication queue's notifications, one at a time and in the order the
/// triggering events happened for that tablet.
pub trait QueueObserver: Send + Sync {
    /// Majority watermarks moved. Returns the resulting commit and apply progress.
    fn update_majority_replicated(&self, data: &MajorityReplicatedData) -> Result<CommitProgress>;

    /// A follower answered with a higher term; this leader is stale.
    fn notify_term_change(&self, term: i64);

    /// A follower has been unreachable for too long, or can no longer be caught up from the log.
    fn notify_failed_follower(&self, peer_uuid: &str, term: i64, reason: &str);

    fn majority_replicated_num_sst_files_changed(&self, _majority_num_sst_files: u64) {}
}
