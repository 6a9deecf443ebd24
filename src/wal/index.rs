use crate::common::OpId;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct LogIndexEntry {
    pub op_id: OpId,
    pub segment_sequence_number: u64,
    pub offset: u64,
}

/// Maps a log index to where its replicate lives on disk.
#[derive(Default)]
pub(crate) struct LogIndex {
    entries: Mutex<BTreeMap<i64, LogIndexEntry>>,
}

impl LogIndex {
    pub(crate) fn new() -> Self {
        LogIndex::default()
    }

    /// A later entry for the same index replaces the earlier one; that is a follower having its
    /// uncommitted suffix overwritten by a new leader.
    pub(crate) fn add_entry(&self, entry: LogIndexEntry) {
        self.entries.lock().insert(entry.op_id.index, entry);
    }

    pub(crate) fn get_entry(&self, index: i64) -> Option<LogIndexEntry> {
        self.entries.lock().get(&index).copied()
    }

    pub(crate) fn max_entry(&self) -> Option<LogIndexEntry> {
        self.entries.lock().values().next_back().copied()
    }

    /// Drops every entry for indexes below `min_index_to_retain`.
    pub(crate) fn gc(&self, min_index_to_retain: i64) {
        let mut entries = self.entries.lock();
        let retained = entries.split_off(&min_index_to_retain);
        *entries = retained;
    }

    /// Forgets `index` and everything after it.
    pub(crate) fn truncate_from(&self, index: i64) {
        let _ = self.entries.lock().split_off(&index);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
