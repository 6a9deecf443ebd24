use crate::common::{wall_clock_micros, OpId, ReplicationError, Result};
use crate::grpc::LogSegmentHeaderPb;
use crate::wal::appender::Appender;
use crate::wal::entry_batch::{append_completion, EntryType, LogEntryBatch, StatusCallback};
use crate::wal::index::LogIndex;
use crate::wal::options::{DurabilityPolicy, LogOptions};
use crate::wal::reader::{index_batch, LogReader};
use crate::wal::segment::{
    encode_batch, placeholder_file_name, segment_file_name, ReadableSegment, WritableSegment, MAJOR_VERSION,
    MINOR_VERSION,
};
use crate::wal::LogRecord;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Log is the tablet's write-ahead log: a directory of segments, one of which is being appended
/// to by the tablet's appender.
///
/// `open()` must be called from within a Tokio runtime; the appender and segment allocation run on
/// its blocking pool.
pub struct Log {
    core: Arc<LogCore>,
    appender: Mutex<Option<Appender>>,
}

pub(crate) struct LogCore {
    logger: slog::Logger,
    tablet_id: String,
    wal_dir: PathBuf,
    options: LogOptions,
    schema: Bytes,
    schema_version: u32,
    opened_at: tokio::time::Instant,

    writer: Mutex<WriterState>,

    allocation: Mutex<AllocationState>,
    allocation_cond: Condvar,

    last_synced: Mutex<OpId>,
    last_synced_cond: Condvar,

    reader: Arc<LogReader>,
    index: Arc<LogIndex>,

    cdc_min_replicated_index: AtomicI64,
    wal_retention_secs: AtomicU64,
}

struct WriterState {
    active: Option<WritableSegment>,
    active_readable: Option<Arc<ReadableSegment>>,
    next_sequence_number: u64,
    cur_max_segment_size: u64,
    last_appended: OpId,
    unsynced_bytes: u64,
    first_unsynced_at: Option<Instant>,
    closed: bool,
}

enum AllocationState {
    NotStarted,
    InProgress,
    Finished(Result<PathBuf>),
}

impl Log {
    pub fn open(
        logger: slog::Logger,
        tablet_id: impl Into<String>,
        wal_dir: impl AsRef<Path>,
        options: LogOptions,
        schema: Bytes,
        schema_version: u32,
    ) -> Result<Self> {
        let tablet_id = tablet_id.into();
        let wal_dir = wal_dir.as_ref().to_path_buf();
        let logger = logger.new(slog::o!("tablet_id" => tablet_id.clone(), "component" => "log"));
        fs::create_dir_all(&wal_dir)?;

        let index = Arc::new(LogIndex::new());
        let reader = Arc::new(LogReader::open(logger.clone(), &wal_dir, index.clone())?);
        let last_entry = index.max_entry().map(|e| e.op_id).unwrap_or(OpId::MIN);
        let next_sequence_number = reader.last_sequence_number().map_or(0, |seq| seq + 1);

        let core = Arc::new(LogCore {
            logger: logger.clone(),
            tablet_id,
            wal_dir,
            schema,
            schema_version,
            opened_at: tokio::time::Instant::now(),
            writer: Mutex::new(WriterState {
                active: None,
                active_readable: None,
                next_sequence_number,
                cur_max_segment_size: options.initial_segment_size_bytes,
                last_appended: last_entry,
                unsynced_bytes: 0,
                first_unsynced_at: None,
                closed: false,
            }),
            options,
            allocation: Mutex::new(AllocationState::NotStarted),
            allocation_cond: Condvar::new(),
            last_synced: Mutex::new(last_entry),
            last_synced_cond: Condvar::new(),
            reader,
            index,
            cdc_min_replicated_index: AtomicI64::new(i64::MAX),
            wal_retention_secs: AtomicU64::new(0),
        });

        {
            let placeholder = core.create_placeholder()?;
            let mut writer = core.writer.lock();
            core.switch_to_allocated_segment(&mut writer, &placeholder)?;
        }
        slog::info!(logger, "Opened log, last entry {}", last_entry);

        let appender = Appender::spawn(core.clone());
        Ok(Log {
            core,
            appender: Mutex::new(Some(appender)),
        })
    }

    /// Wraps records into a batch. Nothing is written until it is passed to `async_append`.
    pub fn reserve(
        &self,
        entry_type: EntryType,
        records: Vec<Arc<LogRecord>>,
        committed_op_id: OpId,
        batch_time: tokio::time::Instant,
    ) -> Result<LogEntryBatch> {
        let mono_time = batch_time.saturating_duration_since(self.core.opened_at).as_micros() as u64;
        LogEntryBatch::reserve(entry_type, records, committed_op_id, mono_time)
    }

    /// Queues a reserved batch. The callback fires once the batch is durable per the durability
    /// policy. If the log is shutting down the batch is rejected and the callback dropped unfired.
    pub fn async_append(&self, mut batch: LogEntryBatch, callback: StatusCallback) -> Result<()> {
        batch.mark_ready(callback);
        let appender = self.appender.lock();
        match appender.as_ref() {
            Some(appender) => appender.submit(batch).map_err(|_| ReplicationError::shutting_down()),
            None => Err(ReplicationError::shutting_down()),
        }
    }

    pub fn async_append_replicates(
        &self,
        records: Vec<Arc<LogRecord>>,
        committed_op_id: OpId,
        batch_time: tokio::time::Instant,
        callback: StatusCallback,
    ) -> Result<()> {
        let batch = self.reserve(EntryType::Replicate, records, committed_op_id, batch_time)?;
        self.async_append(batch, callback)
    }

    /// Resolves once everything queued before this call went through a sync.
    pub async fn wait_until_all_flushed(&self) -> Result<()> {
        let batch = self.reserve(EntryType::FlushMarker, vec![], OpId::MIN, tokio::time::Instant::now())?;
        let (callback, rx) = append_completion();
        self.async_append(batch, callback)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::shutting_down()),
        }
    }

    /// Blocks the calling thread until the last synced op reaches `min_allowed.index`.
    ///
    /// With a timeout, returns `OpId::MIN` if it expired first. Without one, waits indefinitely and
    /// logs an error each time the long-wait threshold passes.
    pub fn wait_for_safe_op_id_to_apply(&self, min_allowed: OpId, timeout: Option<Duration>) -> OpId {
        let core = &self.core;
        let mut synced = core.last_synced.lock();

        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while synced.index < min_allowed.index {
                    if core.last_synced_cond.wait_until(&mut synced, deadline).timed_out() {
                        if synced.index >= min_allowed.index {
                            break;
                        }
                        return OpId::MIN;
                    }
                }
                *synced
            }
            None => {
                let start = Instant::now();
                let threshold = core.options.long_wait_threshold;
                let mut next_report = start + threshold;
                while synced.index < min_allowed.index {
                    core.last_synced_cond.wait_for(&mut synced, Duration::from_secs(1));
                    if synced.index < min_allowed.index && Instant::now() >= next_report {
                        slog::error!(
                            core.logger,
                            "Waiting for op {} to be synced for {:?}, last synced {}",
                            min_allowed,
                            start.elapsed(),
                            *synced
                        );
                        next_report += threshold;
                    }
                }
                *synced
            }
        }
    }

    /// Overrides the last synced op id. Only meaningful after `wait_until_all_flushed`.
    pub fn reset_last_synced_entry_op_id(&self, op_id: OpId) {
        let mut synced = self.core.last_synced.lock();
        *synced = op_id;
        self.core.last_synced_cond.notify_all();
    }

    /// Deletes closed segments that only hold ops below `min_op_idx`, keeping the retention
    /// floors. Returns how many segments were deleted.
    pub fn gc(&self, min_op_idx: i64) -> Result<usize> {
        let core = &self.core;
        let to_delete = core.segments_to_gc(min_op_idx);
        let last = match to_delete.last() {
            Some(last) => last.sequence_number(),
            None => return Ok(0),
        };

        core.reader.trim_segments_up_to_and_including(last);
        let mut num_gced = 0;
        for segment in &to_delete {
            slog::info!(
                core.logger,
                "Deleting log segment {} (GCed ops < {})",
                segment.path().display(),
                min_op_idx
            );
            fs::remove_file(segment.path())?;
            num_gced += 1;
        }

        if let Some(min_remaining) = core.reader.min_replicate_index() {
            if min_remaining > 0 {
                core.index.gc(min_remaining);
            }
        }
        Ok(num_gced)
    }

    /// Bytes `gc(min_op_idx)` would reclaim right now.
    pub fn gcable_data_size(&self, min_op_idx: i64) -> u64 {
        self.core
            .segments_to_gc(min_op_idx)
            .iter()
            .map(|segment| segment.file_size())
            .sum()
    }

    pub fn on_disk_size(&self) -> u64 {
        self.core
            .reader
            .segments_snapshot()
            .iter()
            .map(|segment| segment.file_size())
            .sum()
    }

    /// Drains queued appends, syncs and writes the footer of the active segment. Later calls are
    /// no-ops.
    pub async fn close(&self) -> Result<()> {
        let appender = self.appender.lock().take();
        match appender {
            Some(appender) => {
                let result = appender.shutdown().await;
                slog::info!(self.core.logger, "Log closed");
                result
            }
            None => Ok(()),
        }
    }

    pub fn reader(&self) -> &Arc<LogReader> {
        &self.core.reader
    }

    pub fn num_segments(&self) -> usize {
        self.core.reader.num_segments()
    }

    /// The last op known to be synced.
    pub fn latest_entry_op_id(&self) -> OpId {
        *self.core.last_synced.lock()
    }

    pub fn last_appended_op_id(&self) -> OpId {
        self.core.writer.lock().last_appended
    }

    pub fn min_replicate_index(&self) -> Option<i64> {
        self.core.reader.min_replicate_index()
    }

    pub fn set_cdc_min_replicated_index(&self, index: i64) {
        self.core.cdc_min_replicated_index.store(index, Ordering::Release);
    }

    pub fn set_wal_retention_secs(&self, secs: u64) {
        self.core.wal_retention_secs.store(secs, Ordering::Release);
    }

    pub fn tablet_id(&self) -> &str {
        &self.core.tablet_id
    }
}

impl LogCore {
    pub(crate) fn logger(&self) -> &slog::Logger {
        &self.logger
    }

    pub(crate) fn do_append(self: &Arc<Self>, batch: &LogEntryBatch) -> Result<()> {
        if batch.is_flush_marker() {
            return Ok(());
        }

        let pb = batch.to_pb();
        let encoded = encode_batch(&pb);

        let mut writer = self.writer.lock();
        if writer.closed {
            return Err(ReplicationError::shutting_down());
        }
        self.roll_over_if_necessary(&mut writer, encoded.len() as u64)?;

        let active = writer
            .active
            .as_mut()
            .ok_or_else(|| ReplicationError::Internal("No active segment to append to".to_string()))?;
        let sequence_number = active.sequence_number();
        let offset = active.append(&pb, &encoded)?;
        let written = active.size();
        if let Some(readable) = &writer.active_readable {
            readable.update_readable_to(written);
        }
        index_batch(&self.index, &pb, sequence_number, offset);

        if let Some(op_id) = batch.max_replicate_op_id() {
            writer.last_appended = op_id;
        }
        writer.unsynced_bytes += encoded.len() as u64;
        if writer.first_unsynced_at.is_none() {
            writer.first_unsynced_at = Some(Instant::now());
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        let last_appended = {
            let mut writer = self.writer.lock();
            if self.needs_fsync(&writer) {
                if let Some(active) = &writer.active {
                    active.sync()?;
                }
                writer.unsynced_bytes = 0;
                writer.first_unsynced_at = None;
            }
            writer.last_appended
        };

        let mut synced = self.last_synced.lock();
        *synced = last_appended;
        self.last_synced_cond.notify_all();
        Ok(())
    }

    fn needs_fsync(&self, writer: &WriterState) -> bool {
        if writer.unsynced_bytes == 0 {
            return false;
        }
        match self.options.durability {
            DurabilityPolicy::Always => true,
            DurabilityPolicy::Periodic { interval, bytes } => {
                writer.unsynced_bytes >= bytes || writer.first_unsynced_at.map_or(false, |t| t.elapsed() >= interval)
            }
            DurabilityPolicy::Disabled => false,
        }
    }

    /// Called once the appender drains after the last sender is gone.
    pub(crate) fn close_active_segment(&self) -> Result<()> {
        self.sync()?;

        let mut writer = self.writer.lock();
        writer.closed = true;
        self.close_active_segment_locked(&mut writer)?;
        drop(writer);

        // Nobody will switch to a pending placeholder anymore.
        let mut allocation = self.allocation.lock();
        while let AllocationState::InProgress = *allocation {
            self.allocation_cond.wait(&mut allocation);
        }
        if let AllocationState::Finished(Ok(path)) = std::mem::replace(&mut *allocation, AllocationState::NotStarted) {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn roll_over_if_necessary(self: &Arc<Self>, writer: &mut WriterState, batch_bytes: u64) -> Result<()> {
        let active_size = writer.active.as_ref().map_or(0, |a| a.size());
        let (not_started, finished) = {
            let allocation = self.allocation.lock();
            (
                matches!(*allocation, AllocationState::NotStarted),
                matches!(*allocation, AllocationState::Finished(_)),
            )
        };

        if not_started {
            if active_size + batch_bytes + 4 > writer.cur_max_segment_size {
                slog::info!(
                    self.logger,
                    "Max segment size {} reached. Starting new segment allocation.",
                    writer.cur_max_segment_size
                );
                self.async_allocate_segment();
                if !self.options.async_preallocate_segments {
                    self.roll_over(writer)?;
                }
            }
        } else if finished {
            self.roll_over(writer)?;
        } else {
            slog::trace!(self.logger, "Segment allocation already in progress");
        }
        Ok(())
    }

    fn async_allocate_segment(self: &Arc<Self>) {
        *self.allocation.lock() = AllocationState::InProgress;
        let core = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = core.create_placeholder();
            *core.allocation.lock() = AllocationState::Finished(result);
            core.allocation_cond.notify_all();
        });
    }

    fn create_placeholder(&self) -> Result<PathBuf> {
        let path = self.wal_dir.join(placeholder_file_name());
        File::create(&path)?;
        Ok(path)
    }

    /// Closes the active segment and switches to the allocated one, blocking until the allocation
    /// completes.
    fn roll_over(&self, writer: &mut WriterState) -> Result<()> {
        let placeholder = {
            let mut allocation = self.allocation.lock();
            let wait_start = Instant::now();
            while let AllocationState::InProgress = *allocation {
                self.allocation_cond.wait(&mut allocation);
            }
            let waited = wait_start.elapsed();
            if waited > Duration::from_millis(50) {
                slog::warn!(self.logger, "Waited {:?} for segment allocation", waited);
            }
            match std::mem::replace(&mut *allocation, AllocationState::NotStarted) {
                AllocationState::Finished(result) => result?,
                _ => {
                    return Err(ReplicationError::Internal(
                        "Rolling over without an allocated segment".to_string(),
                    ))
                }
            }
        };

        self.close_active_segment_locked(writer)?;
        self.switch_to_allocated_segment(writer, &placeholder)?;
        writer.cur_max_segment_size = (writer.cur_max_segment_size * 2).min(self.options.max_segment_size_bytes);
        Ok(())
    }

    fn close_active_segment_locked(&self, writer: &mut WriterState) -> Result<()> {
        if let Some(active) = writer.active.take() {
            let path = active.path().to_path_buf();
            active.close(wall_clock_micros())?;
            let closed = Arc::new(ReadableSegment::open(&path)?);
            self.reader.replace_last_segment(closed)?;
            writer.active_readable = None;
        }
        Ok(())
    }

    fn switch_to_allocated_segment(&self, writer: &mut WriterState, placeholder: &Path) -> Result<()> {
        let sequence_number = writer.next_sequence_number;
        let path = self.wal_dir.join(segment_file_name(sequence_number));
        fs::rename(placeholder, &path)?;
        File::open(&self.wal_dir)?.sync_all()?;

        let header = LogSegmentHeaderPb {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            sequence_number: sequence_number as i64,
            tablet_id: self.tablet_id.clone(),
            schema: self.schema.to_vec(),
            schema_version: self.schema_version,
        };
        let segment = WritableSegment::create(&path, &header)?;
        let readable = Arc::new(ReadableSegment::open_active(&path, header, segment.first_entry_offset())?);
        self.reader.append_segment(readable.clone());

        writer.active = Some(segment);
        writer.active_readable = Some(readable);
        writer.next_sequence_number += 1;
        slog::info!(self.logger, "Switched to new log segment {}", path.display());
        Ok(())
    }

    fn segments_to_gc(&self, min_op_idx: i64) -> Vec<Arc<ReadableSegment>> {
        let cdc_index = self.cdc_min_replicated_index.load(Ordering::Acquire);
        let mut segments = self.reader.segment_prefix_not_including(min_op_idx, cdc_index);

        let max_to_delete = self
            .reader
            .num_segments()
            .saturating_sub(self.options.min_segments_to_retain);
        segments.truncate(max_to_delete);

        let retention_secs = self
            .options
            .min_seconds_to_retain
            .max(self.wal_retention_secs.load(Ordering::Acquire));
        let now = wall_clock_micros() as i64;
        let cutoff = now - (retention_secs as i64).saturating_mul(1_000_000);
        let young = segments.iter().position(|segment| {
            segment
                .footer()
                .and_then(|f| f.close_timestamp_micros)
                .map_or(false, |closed_at| closed_at as i64 > cutoff)
        });
        if let Some(young) = young {
            segments.truncate(young);
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HybridTime;
    use crate::wal::Payload;
    use tempfile::TempDir;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn test_options() -> LogOptions {
        LogOptions {
            initial_segment_size_bytes: 256,
            max_segment_size_bytes: 512,
            durability: DurabilityPolicy::Always,
            min_segments_to_retain: 1,
            min_seconds_to_retain: 0,
            async_preallocate_segments: false,
            ..LogOptions::default()
        }
    }

    fn open_log(dir: &TempDir, options: LogOptions) -> Log {
        Log::open(test_logger(), "tablet-1", dir.path(), options, Bytes::new(), 0).unwrap()
    }

    fn record(term: i64, index: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(
            OpId::new(term, index),
            HybridTime::from_micros(index as u64),
            Payload::ChangeConfig(Bytes::from(vec![b'x'; 40])),
        ))
    }

    async fn append(log: &Log, records: Vec<Arc<LogRecord>>) -> Result<()> {
        let (callback, rx) = append_completion();
        log.async_append_replicates(records, OpId::MIN, tokio::time::Instant::now(), callback)?;
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn append_then_read_back() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir, test_options());

        // -- execute & verify --
        for i in 1..=3 {
            append(&log, vec![record(1, i)]).await.unwrap();
        }
        assert_eq!(log.latest_entry_op_id(), OpId::new(1, 3));
        assert_eq!(log.last_appended_op_id(), OpId::new(1, 3));
        assert_eq!(log.reader().lookup_op_id(2).unwrap(), OpId::new(1, 2));
        assert!(log.reader().lookup_op_id(4).unwrap_err().is_not_found());

        let read = log.reader().read_replicates_in_range(1, 3, usize::MAX).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(*read[1], *record(1, 2));

        // Byte budget still returns at least one record.
        let read = log.reader().read_replicates_in_range(1, 3, 1).unwrap();
        assert_eq!(read.len(), 1);

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn segments_roll_over_and_grow() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir, test_options());

        for i in 1..=20 {
            append(&log, vec![record(1, i)]).await.unwrap();
        }

        assert!(log.num_segments() > 2);
        // Everything is still readable across segments.
        let read = log.reader().read_replicates_in_range(1, 20, usize::MAX).unwrap();
        assert_eq!(read.len(), 20);
        assert_eq!(read[19].op_id, OpId::new(1, 20));

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_recovers_index_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = open_log(&dir, test_options());
            for i in 1..=10 {
                append(&log, vec![record(1, i)]).await.unwrap();
            }
            log.close().await.unwrap();
        }

        let log = open_log(&dir, test_options());
        assert_eq!(log.latest_entry_op_id(), OpId::new(1, 10));
        assert_eq!(log.reader().lookup_op_id(7).unwrap(), OpId::new(1, 7));

        append(&log, vec![record(1, 11)]).await.unwrap();
        assert_eq!(log.reader().read_replicates_in_range(10, 11, usize::MAX).unwrap().len(), 2);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn gc_respects_retention_floors() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let options = LogOptions {
            min_segments_to_retain: 2,
            ..test_options()
        };
        let log = open_log(&dir, options);
        for i in 1..=30 {
            append(&log, vec![record(1, i)]).await.unwrap();
        }
        let segments_before = log.num_segments();
        assert!(segments_before > 3);

        // -- execute & verify --

        // Nothing is entirely below index 1.
        assert_eq!(log.gc(1).unwrap(), 0);

        // Change data capture still needs everything from 5 on.
        log.set_cdc_min_replicated_index(5);
        let reclaimable = log.gcable_data_size(25);
        let deleted = log.gc(25).unwrap();
        assert!(log.reader().lookup_op_id(5).is_ok());
        assert_eq!(log.num_segments(), segments_before - deleted);
        assert_eq!(deleted > 0, reclaimable > 0);

        // Without the consumer, gc never drops a segment holding an op >= 25 and keeps two.
        log.set_cdc_min_replicated_index(i64::MAX);
        log.gc(25).unwrap();
        assert!(log.num_segments() >= 2);
        assert!(log.reader().lookup_op_id(25).is_ok());
        assert!(log.min_replicate_index().unwrap() <= 25);

        // Very young segments are protected by the time floor.
        log.set_wal_retention_secs(3600);
        assert_eq!(log.gc(i64::MAX).unwrap(), 0);

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn configured_time_floor_keeps_young_segments() {
        // -- setup --
        let young_dir = tempfile::tempdir().unwrap();
        let young = open_log(
            &young_dir,
            LogOptions {
                min_seconds_to_retain: 3600,
                ..test_options()
            },
        );
        let expired_dir = tempfile::tempdir().unwrap();
        let expired = open_log(&expired_dir, test_options());
        for i in 1..=30 {
            append(&young, vec![record(1, i)]).await.unwrap();
            append(&expired, vec![record(1, i)]).await.unwrap();
        }
        let segments_before = young.num_segments();
        assert!(segments_before > 3);

        // -- execute & verify --
        assert_eq!(young.gcable_data_size(i64::MAX), 0);
        assert_eq!(young.gc(i64::MAX).unwrap(), 0);
        assert_eq!(young.num_segments(), segments_before);

        // A lower runtime retention does not undercut the configured floor.
        young.set_wal_retention_secs(0);
        assert_eq!(young.gc(i64::MAX).unwrap(), 0);

        assert!(expired.gcable_data_size(i64::MAX) > 0);
        assert!(expired.gc(i64::MAX).unwrap() > 0);
        assert!(expired.num_segments() >= 1);

        young.close().await.unwrap();
        expired.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_for_safe_op_id() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(open_log(&dir, test_options()));

        // Times out with the minimum op id.
        let waited = log.wait_for_safe_op_id_to_apply(OpId::new(1, 1), Some(Duration::from_millis(20)));
        assert_eq!(waited, OpId::MIN);

        let waiter = {
            let log = log.clone();
            tokio::task::spawn_blocking(move || log.wait_for_safe_op_id_to_apply(OpId::new(1, 2), None))
        };
        append(&log, vec![record(1, 1), record(1, 2)]).await.unwrap();
        assert_eq!(waiter.await.unwrap(), OpId::new(1, 2));

        log.wait_until_all_flushed().await.unwrap();
        log.reset_last_synced_entry_op_id(OpId::new(1, 1));
        assert_eq!(log.latest_entry_op_id(), OpId::new(1, 1));

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn append_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir, test_options());
        append(&log, vec![record(1, 1)]).await.unwrap();

        log.close().await.unwrap();
        log.close().await.unwrap();

        let err = append(&log, vec![record(1, 2)]).await.unwrap_err();
        assert!(matches!(err, ReplicationError::ServiceUnavailable(_)));
        assert!(log.on_disk_size() > 0);
    }

    #[tokio::test]
    async fn overwritten_suffix_reads_new_term() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir, test_options());
        append(&log, vec![record(1, 1), record(1, 2), record(1, 3)]).await.unwrap();

        append(&log, vec![record(2, 2)]).await.unwrap();

        assert_eq!(log.reader().lookup_op_id(2).unwrap(), OpId::new(2, 2));
        assert!(log.reader().lookup_op_id(3).unwrap_err().is_not_found());
        log.close().await.unwrap();
    }
}
