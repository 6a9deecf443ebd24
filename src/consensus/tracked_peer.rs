use crate::common::OpId;
use crate::consensus::MemberType;
use std::fmt;
use tokio::time::Instant;

/// A lease grant in flight to a follower: what was last offered, and what the follower is known to
/// have acknowledged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseExpiration<T> {
    pub last_sent: T,
    pub last_received: T,
}

impl<T: Copy + Default> LeaseExpiration<T> {
    pub fn reset(&mut self) {
        self.last_sent = T::default();
        self.last_received = T::default();
    }

    /// The follower replied to the request carrying `last_sent`.
    pub fn on_reply(&mut self) {
        self.last_received = self.last_sent;
    }
}

/// TrackedPeer is the leader's view of one replica's progress, the local one included.
#[derive(Clone, Debug)]
pub struct TrackedPeer {
    pub uuid: String,
    /// Nothing was heard from this peer since it was tracked.
    pub is_new: bool,
    /// Index of the next record to send.
    pub next_index: i64,
    pub last_received: OpId,
    pub last_known_committed_idx: i64,
    pub last_applied: OpId,
    pub is_last_exchange_successful: bool,
    pub last_successful_communication_time: Instant,
    pub needs_remote_bootstrap: bool,
    pub member_type: MemberType,
    pub num_sst_files: u64,
    /// Records in the last unacknowledged request, -1 once it was acknowledged.
    pub last_num_messages_sent: i64,
    /// Requests sent since the last acknowledgement, -1 when none is pending.
    pub current_retransmissions: i64,
    pub leader_lease_expiration: LeaseExpiration<Option<Instant>>,
    /// Physical microseconds.
    pub leader_ht_lease_expiration: LeaseExpiration<u64>,
    pub(crate) failed_follower_notified: bool,
}

impl TrackedPeer {
    pub fn new(uuid: impl Into<String>, next_index: i64, now: Instant) -> Self {
        TrackedPeer {
            uuid: uuid.into(),
            is_new: true,
            next_index,
            last_received: OpId::MIN,
            last_known_committed_idx: -1,
            last_applied: OpId::MIN,
            is_last_exchange_successful: false,
            last_successful_communication_time: now,
            needs_remote_bootstrap: false,
            member_type: MemberType::Unknown,
            num_sst_files: 0,
            last_num_messages_sent: -1,
            current_retransmissions: -1,
            leader_lease_expiration: LeaseExpiration::default(),
            leader_ht_lease_expiration: LeaseExpiration::default(),
            failed_follower_notified: false,
        }
    }

    pub fn reset_leases(&mut self) {
        self.leader_lease_expiration.reset();
        self.leader_ht_lease_expiration.reset();
    }

    /// The peer answered; the unreachability clock restarts.
    pub(crate) fn mark_communicated(&mut self, now: Instant) {
        self.last_successful_communication_time = now;
        self.failed_follower_notified = false;
    }

    /// Lagging peers keep retransmitting without an acknowledgement.
    pub fn is_lagging(&self, threshold: u32) -> bool {
        self.current_retransmissions >= i64::from(threshold)
    }
}

impl fmt::Display for TrackedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Peer: {}, Is new: {}, Last received: {}, Next index: {}, Last known committed idx: {}, \
             Last exchange result: {}, Needs remote bootstrap: {}",
            self.uuid,
            self.is_new,
            self.last_received,
            self.next_index,
            self.last_known_committed_idx,
            if self.is_last_exchange_successful { "SUCCESS" } else { "ERROR" },
            self.needs_remote_bootstrap,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Duration;

    #[test]
    fn lease_reply_acknowledges_last_sent() {
        let now = Instant::now();
        let mut peer = TrackedPeer::new("peer-1", 5, now);
        peer.leader_lease_expiration.last_sent = Some(now + Duration::from_secs(2));
        peer.leader_ht_lease_expiration.last_sent = 1_000;
        assert_eq!(peer.leader_lease_expiration.last_received, None);

        peer.leader_lease_expiration.on_reply();
        peer.leader_ht_lease_expiration.on_reply();
        assert_eq!(peer.leader_lease_expiration.last_received, Some(now + Duration::from_secs(2)));
        assert_eq!(peer.leader_ht_lease_expiration.last_received, 1_000);

        peer.reset_leases();
        assert_eq!(peer.leader_lease_expiration, LeaseExpiration::default());
        assert_eq!(peer.leader_ht_lease_expiration.last_received, 0);
    }

    #[test]
    fn lagging_counts_retransmissions() {
        let mut peer = TrackedPeer::new("peer-1", 1, Instant::now());
        assert!(!peer.is_lagging(2));
        peer.current_retransmissions = 2;
        assert!(peer.is_lagging(2));
        assert!(peer.to_string().contains("Last exchange result: ERROR"));
    }
}
