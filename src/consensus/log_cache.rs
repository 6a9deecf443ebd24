use crate::common::{HybridTime, MemTracker, OpId, ReplicationError, Result};
use crate::consensus::LogCacheOptions;
use crate::wal::{EntryType, Log, LogRecord, Payload, StatusCallback};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

const SERVER_TRACKER_ID: &str = "log_cache";

struct CacheEntry {
    record: Arc<LogRecord>,
    mem_usage: i64,
    /// Charged against the memory tracker.
    tracked: bool,
}

struct CacheState {
    cache: BTreeMap<i64, CacheEntry>,
    /// Index the next contiguous append must start at.
    next_sequential_op_index: i64,
    /// Entries at or above this index are not yet known to be durable and must stay cached.
    min_pinned_op_index: i64,
    num_ops: usize,
    size_bytes: i64,
}

impl CacheState {
    fn remove_entry(&mut self, index: i64, tracker: &MemTracker) -> Option<i64> {
        let entry = self.cache.remove(&index)?;
        if entry.tracked {
            tracker.release(entry.mem_usage);
        }
        self.num_ops -= 1;
        self.size_bytes -= entry.mem_usage;
        Some(entry.mem_usage)
    }

    fn evict_some(&mut self, stop_after_index: i64, bytes_to_evict: i64, tracker: &MemTracker) -> i64 {
        let candidates: Vec<i64> = self
            .cache
            .range(1..)
            .map(|(index, _)| *index)
            .take_while(|index| *index <= stop_after_index && *index < self.min_pinned_op_index)
            .collect();

        let mut bytes_evicted = 0;
        for index in candidates {
            bytes_evicted += self.remove_entry(index, tracker).unwrap_or(0);
            if bytes_evicted >= bytes_to_evict {
                break;
            }
        }
        bytes_evicted
    }
}

/// Records handed to a peer, plus where they start.
#[derive(Debug, Default)]
pub struct ReadOpsResult {
    pub messages: Vec<Arc<LogRecord>>,
    pub preceding_op: OpId,
    pub have_more_messages: bool,
    /// Part of `messages` that had to be loaded from the log.
    pub read_from_disk_size: usize,
}

/// LogCache is a write-through cache in front of the tablet's log. Records are kept from the
/// moment they are appended until every peer has them, within a per-tablet and a server-wide
/// memory budget; evicted records are read back from the log transparently.
///
/// Index 0 always holds a sentinel for `OpId::MIN`, so "preceding op of index 1" needs no special
/// case.
pub struct LogCache {
    logger: slog::Logger,
    log: Arc<Log>,
    tracker: Arc<MemTracker>,
    state: Arc<Mutex<CacheState>>,
    disk_reads: AtomicU64,
}

impl LogCache {
    /// The tracker whose budget is shared by the caches of all tablets on this server.
    pub fn server_tracker(options: &LogCacheOptions) -> Arc<MemTracker> {
        MemTracker::new_root(SERVER_TRACKER_ID, Some(options.server_limit_bytes))
    }

    pub fn new(
        logger: slog::Logger,
        log: Arc<Log>,
        server_tracker: &Arc<MemTracker>,
        options: &LogCacheOptions,
    ) -> Self {
        let tablet_id = log.tablet_id().to_string();
        let tracker = MemTracker::new_child(
            server_tracker,
            format!("{}-{}", SERVER_TRACKER_ID, tablet_id),
            Some(options.tablet_limit_bytes),
        );

        let sentinel = Arc::new(LogRecord::new(OpId::MIN, HybridTime::INVALID, Payload::NoOp));
        let mut cache = BTreeMap::new();
        cache.insert(
            0,
            CacheEntry {
                mem_usage: mem_usage(&sentinel),
                record: sentinel,
                tracked: false,
            },
        );

        LogCache {
            logger: logger.new(slog::o!("component" => "log_cache")),
            log,
            tracker,
            state: Arc::new(Mutex::new(CacheState {
                cache,
                next_sequential_op_index: 0,
                min_pinned_op_index: 0,
                num_ops: 0,
                size_bytes: 0,
            })),
            disk_reads: AtomicU64::new(0),
        }
    }

    /// Sets where appends continue. Only valid while the cache holds nothing but its sentinel.
    pub fn init(&self, preceding_op: OpId) -> Result<()> {
        let mut state = self.state.lock();
        if state.cache.len() != 1 {
            return Err(ReplicationError::IllegalState(format!(
                "Log cache must be empty to init, has {} ops",
                state.num_ops
            )));
        }
        state.next_sequential_op_index = preceding_op.index + 1;
        state.min_pinned_op_index = state.next_sequential_op_index;
        Ok(())
    }

    /// Caches `records` and queues them to the log. A batch starting below the next expected
    /// index replaces every cached record from its first index on.
    ///
    /// `callback` fires once the log has synced the batch. If the log refuses the batch the error
    /// is returned and the callback is dropped.
    pub fn append_operations(
        &self,
        records: Vec<Arc<LogRecord>>,
        committed_op_id: OpId,
        batch_time: Instant,
        callback: StatusCallback,
    ) -> Result<()> {
        let (first_index, last_index) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first.op_id.index, last.op_id.index),
            _ => {
                // Still goes through the log so the callback fires after every earlier append.
                let batch = self.log.reserve(EntryType::FlushMarker, vec![], committed_op_id, batch_time)?;
                return self.log.async_append(batch, callback);
            }
        };

        let entries: Vec<CacheEntry> = records
            .iter()
            .map(|record| CacheEntry {
                record: record.clone(),
                mem_usage: mem_usage(record),
                tracked: false,
            })
            .collect();

        {
            let mut state = self.state.lock();
            if first_index > state.next_sequential_op_index {
                return Err(ReplicationError::Internal(format!(
                    "Append of op {} leaves a gap, next expected index is {}",
                    records[0].op_id, state.next_sequential_op_index
                )));
            }
            if first_index < state.next_sequential_op_index {
                slog::info!(
                    self.logger,
                    "Overwriting cached ops {}..{}",
                    first_index,
                    state.next_sequential_op_index - 1
                );
                for index in first_index..state.next_sequential_op_index {
                    state.remove_entry(index, &self.tracker);
                }
            }
            for entry in entries {
                let index = entry.record.op_id.index;
                state.num_ops += 1;
                state.size_bytes += entry.mem_usage;
                state.cache.insert(index, entry);
                state.next_sequential_op_index = index + 1;
            }
        }

        let state = self.state.clone();
        let log_callback: StatusCallback = Box::new(move |result| {
            if result.is_ok() {
                let mut state = state.lock();
                // Released before the caller's callback runs.
                if state.min_pinned_op_index <= last_index {
                    state.min_pinned_op_index = last_index + 1;
                }
            }
            callback(result);
        });

        if let Err(e) = self
            .log
            .async_append_replicates(records, committed_op_id, batch_time, log_callback)
        {
            slog::warn!(self.logger, "Couldn't append to log: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// True once `index` was handed to the log, whether or not it is synced yet.
    pub fn has_op_been_written(&self, index: i64) -> bool {
        index < self.state.lock().next_sequential_op_index
    }

    /// `Incomplete` for an index not written yet, `NotFound` for one collected from the log.
    pub fn lookup_op_id(&self, op_index: i64) -> Result<OpId> {
        {
            let state = self.state.lock();
            // Never race the log for an op that is still on its way there.
            if op_index >= state.next_sequential_op_index {
                return Err(ReplicationError::Incomplete(format!(
                    "Op with index {} is ahead of the local log (next sequential op: {})",
                    op_index, state.next_sequential_op_index
                )));
            }
            if let Some(entry) = state.cache.get(&op_index) {
                return Ok(entry.record.op_id);
            }
        }

        self.log.reader().lookup_op_id(op_index)
    }

    /// Reads the records following `after_op_index`, up to `to_op_index` inclusive (0 for no bound)
    /// and within `max_size_bytes`. At least one record is returned when there is one.
    pub fn read_ops(&self, after_op_index: i64, to_op_index: i64, max_size_bytes: usize) -> Result<ReadOpsResult> {
        let mut result = ReadOpsResult {
            preceding_op: self.lookup_op_id(after_op_index)?,
            ..ReadOpsResult::default()
        };

        let mut next_index = after_op_index + 1;
        let mut remaining_space = i64::try_from(max_size_bytes).unwrap_or(i64::MAX);
        loop {
            let (to_index, up_to) = {
                let state = self.state.lock();
                let to_index = if to_op_index > 0 {
                    to_op_index + 1
                } else {
                    state.next_sequential_op_index
                };
                if remaining_space <= 0 || next_index >= to_index {
                    break;
                }

                match state.cache.range(next_index..).next() {
                    Some((index, _)) if *index == next_index => {
                        for (index, entry) in state.cache.range(next_index..to_index) {
                            if *index != next_index {
                                break;
                            }
                            let size = entry.record.serialized_size() as i64;
                            remaining_space -= size;
                            if remaining_space < 0 && !result.messages.is_empty() {
                                result.have_more_messages = true;
                                break;
                            }
                            result.messages.push(entry.record.clone());
                            next_index += 1;
                        }
                        continue;
                    }
                    Some((index, _)) => (to_index, (*index - 1).min(to_index - 1)),
                    None => (to_index, to_index - 1),
                }
            };
            debug_assert!(up_to < to_index);

            let records = self
                .log
                .reader()
                .read_replicates_in_range(next_index, up_to, usize::try_from(remaining_space).unwrap_or(0))
                .map_err(|e| prepend(e, &format!("Failed to read ops {}..{}", next_index, up_to)))?;
            self.disk_reads.fetch_add(records.len() as u64, Ordering::Relaxed);
            slog::debug!(self.logger, "Successfully read {} ops from disk", records.len());

            for record in records {
                if record.op_id.index != next_index {
                    return Err(ReplicationError::Corruption(format!(
                        "Expected op index {} from the log, got {}",
                        next_index, record.op_id
                    )));
                }
                let size = record.serialized_size() as i64;
                remaining_space -= size;
                if remaining_space >= 0 || result.messages.is_empty() {
                    result.read_from_disk_size += size as usize;
                    result.messages.push(record);
                    next_index += 1;
                } else {
                    result.have_more_messages = true;
                    break;
                }
            }
        }

        Ok(result)
    }

    /// Evicts unpinned records with index up to `stop_after_index`, oldest first, until at least
    /// `bytes_to_evict` bytes are freed. Returns the bytes freed.
    pub fn evict_through_op(&self, stop_after_index: i64, bytes_to_evict: i64) -> i64 {
        let mut state = self.state.lock();
        let evicted = state.evict_some(stop_after_index, bytes_to_evict, &self.tracker);
        if evicted > 0 {
            slog::trace!(self.logger, "Evicted {} bytes through op {}", evicted, stop_after_index);
        }
        evicted
    }

    /// Charges the given cached records to the memory budget, once their durability was
    /// confirmed. Records already charged or already gone are skipped. Going over budget evicts
    /// right away.
    pub fn track_operations_memory(&self, op_ids: &[OpId]) {
        if op_ids.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        let mut mem_required = 0;
        for op_id in op_ids {
            if let Some(entry) = state.cache.get_mut(&op_id.index) {
                if entry.record.op_id.term == op_id.term && !entry.tracked {
                    entry.tracked = true;
                    mem_required += entry.mem_usage;
                }
            }
        }
        if mem_required == 0 || self.tracker.try_consume(mem_required) {
            return;
        }

        let spare = self.tracker.spare_capacity();
        let need_to_free = mem_required - spare;
        slog::debug!(
            self.logger,
            "Memory limit would be exceeded trying to track {} bytes (available {}), evicting",
            mem_required,
            spare
        );
        self.tracker.consume(mem_required);
        let min_pinned = state.min_pinned_op_index;
        state.evict_some(min_pinned, need_to_free, &self.tracker);
    }

    /// Bytes charged to this cache's budget.
    pub fn bytes_used(&self) -> i64 {
        self.tracker.consumption()
    }

    pub fn num_cached_ops(&self) -> usize {
        self.state.lock().num_ops
    }

    /// The index to read after to get the oldest record still available.
    pub fn earliest_op_index(&self) -> i64 {
        let next = self.state.lock().next_sequential_op_index;
        self.log.min_replicate_index().unwrap_or(next) - 1
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    pub fn stats_string(&self) -> String {
        let state = self.state.lock();
        self.stats_string_locked(&state)
    }

    fn stats_string_locked(&self, state: &CacheState) -> String {
        format!(
            "LogCacheStats(num_ops={}, bytes={}, disk_reads={})",
            state.num_ops,
            state.size_bytes,
            self.disk_reads.load(Ordering::Relaxed)
        )
    }
}

impl fmt::Display for LogCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "Pinned index: {}, {}",
            state.min_pinned_op_index,
            self.stats_string_locked(&state)
        )
    }
}

impl Drop for LogCache {
    fn drop(&mut self) {
        self.tracker.release(self.tracker.consumption());
    }
}

fn mem_usage(record: &LogRecord) -> i64 {
    (record.serialized_size() + mem::size_of::<LogRecord>()) as i64
}

fn prepend(error: ReplicationError, context: &str) -> ReplicationError {
    match error {
        ReplicationError::NotFound(msg) => ReplicationError::NotFound(format!("{}: {}", context, msg)),
        ReplicationError::Corruption(msg) => ReplicationError::Corruption(format!("{}: {}", context, msg)),
        other => other,
    }
}
