use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// MemTracker counts bytes held by one owner and rolls them up into every ancestor. A tablet's log
/// cache tracker is a child of the server-wide cache tracker, so one tablet filling its own budget
/// can never push the whole server past the shared one.
#[derive(Debug)]
pub struct MemTracker {
    id: String,
    limit: Option<i64>,
    consumption: AtomicI64,
    parent: Option<Arc<MemTracker>>,
}

impl MemTracker {
    pub fn new_root(id: impl Into<String>, limit: Option<i64>) -> Arc<Self> {
        Arc::new(MemTracker {
            id: id.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: None,
        })
    }

    pub fn new_child(parent: &Arc<MemTracker>, id: impl Into<String>, limit: Option<i64>) -> Arc<Self> {
        Arc::new(MemTracker {
            id: id.into(),
            limit,
            consumption: AtomicI64::new(0),
            parent: Some(parent.clone()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn consumption(&self) -> i64 {
        self.consumption.load(Ordering::Acquire)
    }

    /// Unconditionally charges `bytes` to this tracker and its ancestors.
    pub fn consume(&self, bytes: i64) {
        let mut tracker = Some(self);
        while let Some(t) = tracker {
            t.consumption.fetch_add(bytes, Ordering::AcqRel);
            tracker = t.parent.as_deref();
        }
    }

    /// Charges `bytes` only if no tracker in the chain would go over its limit.
    pub fn try_consume(&self, bytes: i64) -> bool {
        if bytes > self.spare_capacity() {
            return false;
        }
        self.consume(bytes);
        true
    }

    pub fn release(&self, bytes: i64) {
        self.consume(-bytes);
    }

    /// Smallest headroom across this tracker and its ancestors.
    pub fn spare_capacity(&self) -> i64 {
        let mut spare = i64::MAX;
        let mut tracker = Some(self);
        while let Some(t) = tracker {
            if let Some(limit) = t.limit {
                spare = spare.min(limit - t.consumption());
            }
            tracker = t.parent.as_deref();
        }
        spare
    }

    pub fn limit_exceeded(&self) -> bool {
        self.spare_capacity() < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_consumption_rolls_up_to_parent() {
        let server = MemTracker::new_root("log_cache", Some(100));
        let tablet_a = MemTracker::new_child(&server, "tablet-a", Some(80));
        let tablet_b = MemTracker::new_child(&server, "tablet-b", Some(80));

        assert!(tablet_a.try_consume(60));
        assert_eq!(server.consumption(), 60);

        // Tablet B is under its own limit but the shared budget only has 40 left.
        assert!(!tablet_b.try_consume(50));
        assert_eq!(tablet_b.consumption(), 0);
        assert!(tablet_b.try_consume(40));
        assert_eq!(server.spare_capacity(), 0);

        tablet_a.release(60);
        assert_eq!(server.consumption(), 40);
        assert_eq!(tablet_a.spare_capacity(), 60);
    }

    #[test]
    fn forced_consumption_can_exceed_limit() {
        let tracker = MemTracker::new_root("t", Some(10));
        tracker.consume(15);
        assert!(tracker.limit_exceeded());
        assert_eq!(tracker.spare_capacity(), -5);
    }
}
