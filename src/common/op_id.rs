use crate::grpc::OpIdPb;
use std::fmt;

/// OpId identifies a replicated log record by the leadership term it was created in and its
/// position in the log.
///
/// Ordering is lexicographic on `(term, index)`. Within one leader's tenure only the index moves,
/// so callers comparing progress of peers usually compare `index` alone.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    /// Sentinel for "nothing replicated yet". Index 0 is never a real log record.
    pub const MIN: OpId = OpId { term: 0, index: 0 };
    pub const MAX: OpId = OpId {
        term: i64::MAX,
        index: i64::MAX,
    };
    pub const INVALID: OpId = OpId { term: -1, index: -1 };

    pub const fn new(term: i64, index: i64) -> Self {
        OpId { term, index }
    }

    pub fn is_valid(&self) -> bool {
        self.term >= 0 && self.index >= 0
    }

    /// Empty means either the minimum sentinel or unset; neither carries information.
    pub fn is_empty(&self) -> bool {
        self.term == 0 && self.index == 0
    }

    pub fn make_at_least(&mut self, other: OpId) {
        if other.is_valid() && (!self.is_valid() || other > *self) {
            *self = other;
        }
    }

    pub fn make_at_most(&mut self, other: OpId) {
        if other.is_valid() && (!self.is_valid() || other < *self) {
            *self = other;
        }
    }
}

impl Default for OpId {
    fn default() -> Self {
        OpId::MIN
    }
}

impl fmt::Debug for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

// ------- Conversions --------

impl From<OpIdPb> for OpId {
    fn from(pb: OpIdPb) -> Self {
        OpId::new(pb.term, pb.index)
    }
}

impl From<&OpIdPb> for OpId {
    fn from(pb: &OpIdPb) -> Self {
        OpId::new(pb.term, pb.index)
    }
}

impl From<OpId> for OpIdPb {
    fn from(op_id: OpId) -> Self {
        OpIdPb {
            term: op_id.term,
            index: op_id.index,
        }
    }
}

/// Absent protobuf op ids decode to the minimum sentinel.
pub(crate) fn op_id_or_min(pb: &Option<OpIdPb>) -> OpId {
    pb.as_ref().map(OpId::from).unwrap_or(OpId::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_term_then_index() {
        assert!(OpId::new(1, 9) < OpId::new(2, 1));
        assert!(OpId::new(2, 1) < OpId::new(2, 2));
        assert!(OpId::MIN < OpId::new(0, 1));
        assert!(OpId::new(i64::MAX - 1, 0) < OpId::MAX);
    }

    #[test]
    fn make_at_least_ignores_invalid() {
        let mut op_id = OpId::new(2, 5);
        op_id.make_at_least(OpId::INVALID);
        assert_eq!(op_id, OpId::new(2, 5));

        op_id.make_at_least(OpId::new(2, 4));
        assert_eq!(op_id, OpId::new(2, 5));

        op_id.make_at_least(OpId::new(3, 1));
        assert_eq!(op_id, OpId::new(3, 1));

        let mut unset = OpId::INVALID;
        unset.make_at_most(OpId::new(1, 1));
        assert_eq!(unset, OpId::new(1, 1));
    }
}
