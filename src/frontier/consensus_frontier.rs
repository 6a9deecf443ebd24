use crate::common::{HybridTime, OpId};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateDirection {
    Largest,
    Smallest,
}

/// ConsensusFrontier summarizes how far replicated state has made it into one storage flush or
/// compaction output: the last op id, the hybrid time of that op, and the history cutoff used for
/// garbage collecting old versions.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ConsensusFrontier {
    op_id: OpId,
    hybrid_time: HybridTime,
    history_cutoff: HybridTime,
}

impl Default for ConsensusFrontier {
    fn default() -> Self {
        ConsensusFrontier {
            op_id: OpId::MIN,
            hybrid_time: HybridTime::INVALID,
            history_cutoff: HybridTime::INVALID,
        }
    }
}

impl ConsensusFrontier {
    pub fn new(op_id: OpId, hybrid_time: HybridTime, history_cutoff: HybridTime) -> Self {
        ConsensusFrontier {
            op_id,
            hybrid_time,
            history_cutoff: normalize_history_cutoff(history_cutoff),
        }
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    pub fn hybrid_time(&self) -> HybridTime {
        self.hybrid_time
    }

    pub fn history_cutoff(&self) -> HybridTime {
        self.history_cutoff
    }

    pub fn set_op_id(&mut self, op_id: OpId) {
        self.op_id = op_id;
    }

    pub fn set_hybrid_time(&mut self, hybrid_time: HybridTime) {
        self.hybrid_time = hybrid_time;
    }

    pub fn set_history_cutoff(&mut self, history_cutoff: HybridTime) {
        self.history_cutoff = normalize_history_cutoff(history_cutoff);
    }

    /// Merges `other` into `self` field by field, moving each defined field in `direction`.
    pub fn update(&mut self, other: &ConsensusFrontier, direction: UpdateDirection) {
        update_op_id(&mut self.op_id, other.op_id, direction);
        update_hybrid_time(&mut self.hybrid_time, other.hybrid_time, direction);
        update_hybrid_time(&mut self.history_cutoff, other.history_cutoff, direction);
    }

    /// Whether `updated` may follow `self` without any of op id or hybrid time going backwards in
    /// `direction`. The history cutoff is not checked: a later compaction may legitimately run at
    /// a lower cutoff after the retention interval was raised.
    pub fn is_update_valid(&self, updated: &ConsensusFrontier, direction: UpdateDirection) -> bool {
        let op_id_valid = self.op_id.is_empty()
            || updated.op_id.is_empty()
            || in_direction(&self.op_id, &updated.op_id, direction);
        let ht_valid = !self.hybrid_time.is_valid()
            || !updated.hybrid_time.is_valid()
            || in_direction(&self.hybrid_time, &updated.hybrid_time, direction);

        op_id_valid && ht_valid
    }

    /// Whether `self` is at least as far as `other` in `direction` for both the op id and the
    /// hybrid time. Undefined fields on either side do not count against dominance.
    pub fn dominates(&self, other: &ConsensusFrontier, direction: UpdateDirection) -> bool {
        let mut merged_op_id = other.op_id;
        update_op_id(&mut merged_op_id, self.op_id, direction);
        let mut merged_ht = other.hybrid_time;
        update_hybrid_time(&mut merged_ht, self.hybrid_time, direction);

        merged_op_id == self.op_id && merged_ht == self.hybrid_time
    }
}

// The minimum hybrid time carries no information as a cutoff.
fn normalize_history_cutoff(history_cutoff: HybridTime) -> HybridTime {
    if history_cutoff == HybridTime::MIN {
        HybridTime::INVALID
    } else {
        history_cutoff
    }
}

fn in_direction<T: Ord>(current: &T, updated: &T, direction: UpdateDirection) -> bool {
    match direction {
        UpdateDirection::Largest => updated >= current,
        UpdateDirection::Smallest => updated <= current,
    }
}

fn update_op_id(current: &mut OpId, new_value: OpId, direction: UpdateDirection) {
    if new_value.is_empty() {
        return;
    }
    if current.is_empty() {
        *current = new_value;
        return;
    }
    match direction {
        UpdateDirection::Largest => current.make_at_least(new_value),
        UpdateDirection::Smallest => current.make_at_most(new_value),
    }
}

fn update_hybrid_time(current: &mut HybridTime, new_value: HybridTime, direction: UpdateDirection) {
    match direction {
        UpdateDirection::Largest => current.make_at_least(new_value),
        UpdateDirection::Smallest => current.make_at_most(new_value),
    }
}

impl fmt::Debug for ConsensusFrontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ op_id: {} hybrid_time: {} history_cutoff: {} }}",
            self.op_id, self.hybrid_time, self.history_cutoff
        )
    }
}

impl fmt::Display for ConsensusFrontier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpdateDirection::{Largest, Smallest};

    fn frontier(term: i64, index: i64, ht_micros: u64, cutoff_micros: u64) -> ConsensusFrontier {
        ConsensusFrontier::new(
            OpId::new(term, index),
            HybridTime::from_micros(ht_micros),
            HybridTime::from_micros(cutoff_micros),
        )
    }

    #[test]
    fn default_frontier_accepts_anything() {
        let empty = ConsensusFrontier::default();
        assert_eq!(empty, empty);
        assert_eq!(
            empty.to_string(),
            "{ op_id: 0.0 hybrid_time: <invalid> history_cutoff: <invalid> }"
        );
        assert!(empty.is_update_valid(&empty, Largest));
        assert!(empty.is_update_valid(&empty, Smallest));

        let op_id_only = ConsensusFrontier::new(OpId::new(0, 1), HybridTime::INVALID, HybridTime::INVALID);
        assert!(empty.is_update_valid(&op_id_only, Largest));
    }

    #[test]
    fn history_cutoff_may_regress_but_op_id_may_not() {
        let base = frontier(1, 1, 1000, 500);

        assert!(base.is_update_valid(&frontier(1, 1, 1000, 200), Largest));
        assert!(!base.is_update_valid(&frontier(1, 0, 1000, 500), Largest));
    }

    #[test]
    fn update_validity_by_direction() {
        let base = frontier(1, 1, 1000, 500);
        assert_eq!(
            base.to_string(),
            "{ op_id: 1.1 hybrid_time: { physical: 1000 } history_cutoff: { physical: 500 } }"
        );
        let higher_idx = frontier(1, 2, 1000, 500);
        let higher_ht = frontier(1, 1, 1001, 500);
        let higher_cutoff = frontier(1, 1, 1000, 501);
        let higher_idx_lower_ht = frontier(1, 2, 999, 500);

        assert!(base.is_update_valid(&higher_idx, Largest));
        assert!(base.is_update_valid(&higher_ht, Largest));
        assert!(!higher_idx.is_update_valid(&base, Largest));
        assert!(!higher_ht.is_update_valid(&base, Largest));
        assert!(!base.is_update_valid(&higher_idx, Smallest));
        assert!(!base.is_update_valid(&higher_ht, Smallest));
        assert!(higher_idx.is_update_valid(&base, Smallest));
        assert!(higher_ht.is_update_valid(&base, Smallest));

        assert!(!higher_idx_lower_ht.is_update_valid(&base, Largest));
        assert!(!base.is_update_valid(&higher_idx_lower_ht, Smallest));

        assert!(base.is_update_valid(&higher_cutoff, Largest));
        assert!(base.is_update_valid(&higher_cutoff, Smallest));
        assert!(higher_cutoff.is_update_valid(&base, Largest));
        assert!(higher_cutoff.is_update_valid(&base, Smallest));

        // Zero op id means "unknown".
        let zero_op_id = ConsensusFrontier::new(OpId::MIN, HybridTime::INVALID, HybridTime::INVALID);
        assert!(base.is_update_valid(&zero_op_id, Largest));
        assert!(base.is_update_valid(&zero_op_id, Smallest));
        assert!(zero_op_id.is_update_valid(&base, Largest));
        assert!(zero_op_id.is_update_valid(&base, Smallest));
    }

    #[test]
    fn dominance_ignores_history_cutoff() {
        let base = frontier(1, 1, 1000, 500);
        let higher_idx = frontier(1, 2, 1000, 500);
        let higher_ht = frontier(1, 1, 1001, 500);
        let higher_cutoff = frontier(1, 1, 1000, 501);
        let higher_idx_lower_ht = frontier(1, 2, 999, 500);

        assert!(higher_idx.dominates(&base, Largest));
        assert!(higher_ht.dominates(&base, Largest));
        assert!(!higher_idx.dominates(&base, Smallest));
        assert!(!higher_ht.dominates(&base, Smallest));
        assert!(!base.dominates(&higher_idx, Largest));
        assert!(base.dominates(&higher_idx, Smallest));

        // Equal on op id and hybrid time, so each dominates the other.
        assert!(higher_cutoff.dominates(&base, Largest));
        assert!(base.dominates(&higher_cutoff, Largest));

        // Incomparable.
        assert!(!base.dominates(&higher_idx_lower_ht, Largest));
        assert!(!base.dominates(&higher_idx_lower_ht, Smallest));
        assert!(!higher_idx_lower_ht.dominates(&base, Largest));
        assert!(!higher_idx_lower_ht.dominates(&base, Smallest));
    }

    #[test]
    fn update_merges_each_field() {
        let mut merged = frontier(1, 5, 1000, 500);
        merged.update(&frontier(2, 3, 900, 700), Largest);
        assert_eq!(merged, frontier(2, 3, 1000, 700));

        let mut merged = frontier(1, 5, 1000, 500);
        merged.update(&frontier(2, 3, 900, 700), Smallest);
        assert_eq!(merged, frontier(1, 5, 900, 500));

        let mut from_empty = ConsensusFrontier::default();
        from_empty.update(&frontier(1, 1, 10, 5), Smallest);
        assert_eq!(from_empty, frontier(1, 1, 10, 5));
    }

    #[test]
    fn minimum_history_cutoff_is_unset() {
        let f = ConsensusFrontier::new(OpId::new(2, 3), HybridTime::MIN, HybridTime::MIN);
        assert_eq!(f.to_string(), "{ op_id: 2.3 hybrid_time: <min> history_cutoff: <invalid> }");

        let f = ConsensusFrontier::new(
            OpId::new(2, 3),
            HybridTime::from_u64(100_000),
            HybridTime::from_u64(200_000),
        );
        assert_eq!(
            f.to_string(),
            "{ op_id: 2.3 hybrid_time: { physical: 24 logical: 1696 } \
             history_cutoff: { physical: 48 logical: 3392 } }"
        );
    }
}
