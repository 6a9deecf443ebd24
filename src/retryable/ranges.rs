use crate::common::OpId;
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::{Duration, Instant};

/// A closed run of replicated request ids `[first_id, last_id]` of one client.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct ReplicatedRange {
    pub first_id: i64,
    pub last_id: i64,
    pub min_op_id: OpId,
    pub min_time: Instant,
    pub max_time: Instant,
}

impl ReplicatedRange {
    fn singleton(request_id: i64, op_id: OpId, time: Instant) -> Self {
        ReplicatedRange {
            first_id: request_id,
            last_id: request_id,
            min_op_id: op_id,
            min_time: time,
            max_time: time,
        }
    }

    fn insert_time(&mut self, time: Instant) {
        self.min_time = self.min_time.min(time);
        self.max_time = self.max_time.max(time);
    }
}

impl fmt::Debug for ReplicatedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ first_id: {} last_id: {} min_op_id: {} span: {:?} }}",
            self.first_id,
            self.last_id,
            self.min_op_id,
            self.max_time - self.min_time
        )
    }
}

/// The replicated request ids of one client, kept as disjoint ranges.
///
/// Ranges are indexed twice: by `last_id`, so the range that could hold a request id is a single
/// lower-bound lookup, and by `min_op_id`, so time-based expiry can walk them in log order.
#[derive(Default, Debug)]
pub(crate) struct ReplicatedRanges {
    by_last_id: BTreeMap<i64, ReplicatedRange>,
    by_min_op_id: BTreeMap<OpId, i64>,
}

impl ReplicatedRanges {
    pub(crate) fn len(&self) -> usize {
        self.by_last_id.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_last_id.is_empty()
    }

    pub(crate) fn contains(&self, request_id: i64) -> bool {
        matches!(self.lower_bound(request_id), Some(range) if range.first_id <= request_id)
    }

    pub(crate) fn min_op_id(&self) -> Option<OpId> {
        self.by_min_op_id.keys().next().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ReplicatedRange> {
        self.by_last_id.values()
    }

    /// Forgets every id below `min_id`. A range straddling `min_id` is trimmed to start at it.
    /// Returns the number of ranges removed.
    pub(crate) fn discard_below(&mut self, min_id: i64) -> usize {
        let below: Vec<i64> = self.by_last_id.range(..min_id).map(|(last_id, _)| *last_id).collect();
        for last_id in &below {
            self.remove(*last_id);
        }
        if let Some((_, range)) = self.by_last_id.range_mut(min_id..).next() {
            if range.first_id < min_id {
                range.first_id = min_id;
            }
        }
        below.len()
    }

    /// Drops ranges in op id order for as long as their newest member is older than
    /// `clean_start`. Returns the number of ranges removed.
    pub(crate) fn expire_older_than(&mut self, clean_start: Instant) -> usize {
        let mut expired = Vec::new();
        for last_id in self.by_min_op_id.values() {
            match self.by_last_id.get(last_id) {
                Some(range) if range.max_time < clean_start => expired.push(*last_id),
                _ => break,
            }
        }
        for last_id in &expired {
            self.remove(*last_id);
        }
        expired.len()
    }

    /// Records `request_id` as replicated at `op_id`. Neighbouring ranges absorb it when the
    /// resulting time span stays within `range_time_limit`.
    ///
    /// Returns false if the id was already replicated.
    pub(crate) fn add(&mut self, request_id: i64, op_id: OpId, time: Instant, range_time_limit: Duration) -> bool {
        let following = self.lower_bound(request_id).cloned();
        if let Some(following) = &following {
            if following.first_id <= request_id {
                return false;
            }
        }

        // Attaching to the start of a range is rare, so its time span is not checked.
        if let Some(mut following) = following.filter(|r| r.first_id == request_id + 1) {
            self.remove(following.last_id);
            following.first_id = request_id;
            following.min_op_id = following.min_op_id.min(op_id);
            following.insert_time(time);

            if let Some(preceding) = self.preceding(request_id) {
                if preceding.last_id + 1 == request_id && following.max_time <= preceding.min_time + range_time_limit
                {
                    self.remove(preceding.last_id);
                    following.first_id = preceding.first_id;
                    following.min_op_id = following.min_op_id.min(preceding.min_op_id);
                    following.insert_time(preceding.min_time);
                    following.insert_time(preceding.max_time);
                }
            }
            self.insert(following);
            return true;
        }

        if let Some(mut preceding) = self.preceding(request_id) {
            if preceding.last_id + 1 == request_id && time <= preceding.min_time + range_time_limit {
                self.remove(preceding.last_id);
                preceding.last_id = request_id;
                preceding.min_op_id = preceding.min_op_id.min(op_id);
                preceding.insert_time(time);
                self.insert(preceding);
                return true;
            }
        }

        self.insert(ReplicatedRange::singleton(request_id, op_id, time));
        true
    }

    fn lower_bound(&self, request_id: i64) -> Option<&ReplicatedRange> {
        self.by_last_id.range(request_id..).next().map(|(_, range)| range)
    }

    fn preceding(&self, request_id: i64) -> Option<ReplicatedRange> {
        self.by_last_id
            .range(..request_id)
            .next_back()
            .map(|(_, range)| range.clone())
    }

    fn insert(&mut self, range: ReplicatedRange) {
        self.by_min_op_id.insert(range.min_op_id, range.last_id);
        self.by_last_id.insert(range.last_id, range);
    }

    fn remove(&mut self, last_id: i64) -> Option<ReplicatedRange> {
        let range = self.by_last_id.remove(&last_id)?;
        self.by_min_op_id.remove(&range.min_op_id);
        Some(range)
    }
}
