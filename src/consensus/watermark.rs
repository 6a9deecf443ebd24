use crate::common::{HybridTime, OpId};
use crate::consensus::{MemberType, TrackedPeer};
use std::cmp::Ordering;
use std::fmt;
use tokio::time::Instant;

/// Majority-acknowledged leader lease expiration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LeaseWatermark {
    /// Not enough voters acknowledged a lease.
    None,
    Until(Instant),
    /// Single-voter configuration: the leader's own lease never runs out.
    Unbounded,
}

impl Default for LeaseWatermark {
    fn default() -> Self {
        LeaseWatermark::None
    }
}

/// Everything a majority of voters acknowledged, as of one peer response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MajorityReplicatedData {
    pub op_id: OpId,
    pub leader_lease_expiration: LeaseWatermark,
    /// Physical microseconds.
    pub ht_lease_expiration: u64,
    pub num_sst_files: u64,
}

impl fmt::Display for MajorityReplicatedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ op_id: {} leader_lease_expiration: {:?} ht_lease_expiration: {} num_sst_files: {} }}",
            self.op_id, self.leader_lease_expiration, self.ht_lease_expiration, self.num_sst_files
        )
    }
}

/// One per-peer quantity the leader needs a majority for.
pub(crate) trait WatermarkPolicy {
    type Value: Copy + fmt::Debug;

    const NAME: &'static str;

    fn not_enough_peers_value() -> Self::Value;

    /// `Some` when the local peer counts as having acknowledged everything, for leases.
    fn infinite_for_local() -> Option<Self::Value> {
        None
    }

    fn extract_value(peer: &TrackedPeer) -> Self::Value;

    /// Order in which the watermark is selected; the result is the value at least a majority of
    /// peers are at or past.
    fn compare(lhs: &Self::Value, rhs: &Self::Value) -> Ordering;
}

pub(crate) struct OpIdPolicy;

impl WatermarkPolicy for OpIdPolicy {
    type Value = OpId;

    const NAME: &'static str = "OpId";

    fn not_enough_peers_value() -> OpId {
        OpId::MIN
    }

    fn extract_value(peer: &TrackedPeer) -> OpId {
        peer.last_received
    }

    fn compare(lhs: &OpId, rhs: &OpId) -> Ordering {
        lhs.index.cmp(&rhs.index)
    }
}

pub(crate) struct LeaderLeasePolicy;

impl WatermarkPolicy for LeaderLeasePolicy {
    type Value = LeaseWatermark;

    const NAME: &'static str = "Leader lease expiration";

    fn not_enough_peers_value() -> LeaseWatermark {
        LeaseWatermark::None
    }

    fn infinite_for_local() -> Option<LeaseWatermark> {
        Some(LeaseWatermark::Unbounded)
    }

    fn extract_value(peer: &TrackedPeer) -> LeaseWatermark {
        peer.leader_lease_expiration
            .last_received
            .map_or(LeaseWatermark::None, LeaseWatermark::Until)
    }

    fn compare(lhs: &LeaseWatermark, rhs: &LeaseWatermark) -> Ordering {
        lhs.cmp(rhs)
    }
}

pub(crate) struct HtLeasePolicy;

impl WatermarkPolicy for HtLeasePolicy {
    type Value = u64;

    const NAME: &'static str = "Hybrid time leader lease expiration";

    fn not_enough_peers_value() -> u64 {
        HybridTime::MIN.physical_micros()
    }

    fn infinite_for_local() -> Option<u64> {
        Some(HybridTime::MAX.physical_micros())
    }

    fn extract_value(peer: &TrackedPeer) -> u64 {
        peer.leader_ht_lease_expiration.last_received
    }

    fn compare(lhs: &u64, rhs: &u64) -> Ordering {
        lhs.cmp(rhs)
    }
}

pub(crate) struct NumSstFilesPolicy;

impl WatermarkPolicy for NumSstFilesPolicy {
    type Value = u64;

    const NAME: &'static str = "Num SST files";

    fn not_enough_peers_value() -> u64 {
        0
    }

    fn extract_value(peer: &TrackedPeer) -> u64 {
        peer.num_sst_files
    }

    // Descending: the count a majority is at or below.
    fn compare(lhs: &u64, rhs: &u64) -> Ordering {
        rhs.cmp(lhs)
    }
}

/// Selects the highest value (in policy order) that `majority_size` voters with a successful last
/// exchange have reached.
pub(crate) fn compute_watermark<'a, P, I>(
    logger: &slog::Logger,
    peers: I,
    local_uuid: &str,
    majority_size: Option<usize>,
) -> P::Value
where
    P: WatermarkPolicy,
    I: ExactSizeIterator<Item = &'a TrackedPeer>,
{
    let num_peers_required = match majority_size {
        Some(m) if peers.len() >= m => m,
        _ => return P::not_enough_peers_value(),
    };

    let local_infinite = P::infinite_for_local();
    if num_peers_required == 1 {
        if let Some(infinite) = local_infinite {
            return infinite;
        }
    }

    let mut num_peers_with_infinite = 0;
    let mut watermarks = Vec::with_capacity(peers.len());
    for peer in peers {
        if local_infinite.is_some() && peer.uuid == local_uuid {
            num_peers_with_infinite += 1;
            continue;
        }
        if peer.member_type != MemberType::Voter || !peer.is_last_exchange_successful {
            continue;
        }
        watermarks.push(P::extract_value(peer));
    }

    let num_responsive_peers = watermarks.len() + num_peers_with_infinite;
    if num_responsive_peers < num_peers_required {
        slog::trace!(
            logger,
            "{} watermark: not enough responsive peers ({} of {} required)",
            P::NAME,
            num_responsive_peers,
            num_peers_required
        );
        return P::not_enough_peers_value();
    }

    let index_of_interest = num_responsive_peers - num_peers_required;
    let (_, nth, _) = watermarks.select_nth_unstable_by(index_of_interest, P::compare);
    slog::trace!(logger, "{} watermark: {:?}", P::NAME, nth);
    *nth
}
