use crate::common::{OpId, ReplicationError, Result};
use crate::grpc::{LogEntryBatchPb, LogEntryType};
use crate::wal::index::{LogIndex, LogIndexEntry};
use crate::wal::segment::{is_placeholder_file_name, parse_segment_file_name, ReadableSegment};
use crate::wal::LogRecord;
use parking_lot::Mutex;
use std::convert::TryFrom;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// LogReader owns the readable view of every segment in the WAL directory, including the active
/// one, and serves reads of replicates by index.
pub struct LogReader {
    logger: slog::Logger,
    segments: Mutex<Vec<Arc<ReadableSegment>>>,
    index: Arc<LogIndex>,
}

impl LogReader {
    /// Loads every segment found in `wal_dir` and rebuilds `index` from their contents.
    /// Leftover placeholder files from an interrupted allocation are removed.
    pub(crate) fn open(logger: slog::Logger, wal_dir: &Path, index: Arc<LogIndex>) -> Result<Self> {
        let mut sequence_numbers = Vec::new();
        for dir_entry in fs::read_dir(wal_dir)? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let file_name = file_name.to_string_lossy();
            if is_placeholder_file_name(&file_name) {
                slog::info!(logger, "Removing leftover placeholder segment {}", file_name);
                fs::remove_file(dir_entry.path())?;
            } else if let Some(sequence_number) = parse_segment_file_name(&file_name) {
                sequence_numbers.push((sequence_number, dir_entry.path()));
            }
        }
        sequence_numbers.sort_by_key(|(seq, _)| *seq);

        let mut segments = Vec::with_capacity(sequence_numbers.len());
        for (sequence_number, path) in sequence_numbers {
            let segment = ReadableSegment::open(&path)?;
            if segment.sequence_number() != sequence_number {
                return Err(ReplicationError::Corruption(format!(
                    "Segment {} claims sequence number {}",
                    path.display(),
                    segment.sequence_number()
                )));
            }
            if let Some(prev) = segments.last().map(|s: &Arc<ReadableSegment>| s.sequence_number()) {
                if prev + 1 != sequence_number {
                    return Err(ReplicationError::Corruption(format!(
                        "Segment sequence gap between {} and {}",
                        prev, sequence_number
                    )));
                }
            }
            if segment.footer_was_rebuilt() {
                slog::info!(logger, "Rebuilt footer of segment {} by scanning", path.display());
            }

            for (offset, batch) in segment.read_all_batches()? {
                index_batch(&index, &batch, sequence_number, offset);
            }
            segments.push(Arc::new(segment));
        }

        slog::debug!(logger, "Loaded {} log segments", segments.len());
        Ok(LogReader {
            logger,
            segments: Mutex::new(segments),
            index,
        })
    }

    pub fn num_segments(&self) -> usize {
        self.segments.lock().len()
    }

    pub(crate) fn segments_snapshot(&self) -> Vec<Arc<ReadableSegment>> {
        self.segments.lock().clone()
    }

    pub(crate) fn last_sequence_number(&self) -> Option<u64> {
        self.segments.lock().last().map(|s| s.sequence_number())
    }

    pub(crate) fn append_segment(&self, segment: Arc<ReadableSegment>) {
        self.segments.lock().push(segment);
    }

    /// Swaps the view of the last segment, used once the active segment gets its footer.
    pub(crate) fn replace_last_segment(&self, segment: Arc<ReadableSegment>) -> Result<()> {
        let mut segments = self.segments.lock();
        match segments.last_mut() {
            Some(last) if last.sequence_number() == segment.sequence_number() => {
                *last = segment;
                Ok(())
            }
            _ => Err(ReplicationError::Internal(format!(
                "Cannot replace last segment with sequence number {}",
                segment.sequence_number()
            ))),
        }
    }

    pub(crate) fn trim_segments_up_to_and_including(&self, sequence_number: u64) {
        let mut segments = self.segments.lock();
        segments.retain(|s| s.sequence_number() > sequence_number);
        slog::debug!(
            self.logger,
            "Trimmed segments up to {}, {} left",
            sequence_number,
            segments.len()
        );
    }

    /// Longest prefix of closed segments whose replicates are all below `index` and below the
    /// change-data-capture consumer's retained index.
    pub(crate) fn segment_prefix_not_including(&self, index: i64, cdc_index: i64) -> Vec<Arc<ReadableSegment>> {
        let segments = self.segments.lock();
        let mut prefix = Vec::new();
        for segment in segments.iter() {
            let footer = match segment.footer() {
                Some(footer) => footer,
                None => break,
            };
            let max_index = footer.max_replicate_index.unwrap_or(-1);
            if max_index >= cdc_index || max_index >= index {
                break;
            }
            prefix.push(segment.clone());
        }
        prefix
    }

    pub fn min_replicate_index(&self) -> Option<i64> {
        for segment in self.segments_snapshot() {
            match segment.footer() {
                Some(footer) => {
                    if let Some(min) = footer.min_replicate_index {
                        return Some(min);
                    }
                }
                None => {
                    let batches = segment.read_all_batches().ok()?;
                    return batches.iter().flat_map(|(_, b)| replicate_indexes(b)).min();
                }
            }
        }
        None
    }

    pub fn lookup_op_id(&self, index: i64) -> Result<OpId> {
        self.index
            .get_entry(index)
            .map(|entry| entry.op_id)
            .ok_or_else(|| ReplicationError::NotFound(format!("Op index {} is not in the log", index)))
    }

    /// Reads replicates `start..=end`, stopping early once `max_bytes` would be exceeded. At least
    /// one record is returned when `start` exists.
    pub fn read_replicates_in_range(&self, start: i64, end: i64, max_bytes: usize) -> Result<Vec<Arc<LogRecord>>> {
        let mut records = Vec::new();
        let mut total_size = 0;
        let mut last_batch: Option<(u64, u64, LogEntryBatchPb)> = None;

        for index in start..=end {
            let entry = self
                .index
                .get_entry(index)
                .ok_or_else(|| ReplicationError::NotFound(format!("Op index {} is not in the log", index)))?;

            let cached = matches!(&last_batch, Some((seq, offset, _))
                if *seq == entry.segment_sequence_number && *offset == entry.offset);
            if !cached {
                let batch = self.read_batch(&entry)?;
                last_batch = Some((entry.segment_sequence_number, entry.offset, batch));
            }
            let batch = match &last_batch {
                Some((_, _, batch)) => batch,
                None => continue,
            };

            let record = find_replicate(batch, index)?;
            let size = record.serialized_size();
            if !records.is_empty() && total_size + size > max_bytes {
                break;
            }
            total_size += size;
            records.push(Arc::new(record));
        }

        Ok(records)
    }

    fn read_batch(&self, entry: &LogIndexEntry) -> Result<LogEntryBatchPb> {
        let segment = self
            .segments
            .lock()
            .iter()
            .find(|s| s.sequence_number() == entry.segment_sequence_number)
            .cloned()
            .ok_or_else(|| {
                ReplicationError::NotFound(format!(
                    "Segment {} holding op {} was garbage collected",
                    entry.segment_sequence_number, entry.op_id
                ))
            })?;
        segment.read_batch_at(entry.offset)
    }
}

pub(crate) fn index_batch(index: &LogIndex, batch: &LogEntryBatchPb, segment_sequence_number: u64, offset: u64) {
    let mut first = true;
    for entry in &batch.entry {
        if entry.r#type != LogEntryType::Replicate as i32 {
            continue;
        }
        let id = match entry.replicate.as_ref().and_then(|r| r.id.as_ref()) {
            Some(id) => OpId::from(id),
            None => continue,
        };
        if first {
            index.truncate_from(id.index);
            first = false;
        }
        index.add_entry(LogIndexEntry {
            op_id: id,
            segment_sequence_number,
            offset,
        });
    }
}

fn replicate_indexes(batch: &LogEntryBatchPb) -> impl Iterator<Item = i64> + '_ {
    batch
        .entry
        .iter()
        .filter_map(|e| e.replicate.as_ref().and_then(|r| r.id.as_ref()).map(|id| id.index))
}

fn find_replicate(batch: &LogEntryBatchPb, index: i64) -> Result<LogRecord> {
    let msg = batch
        .entry
        .iter()
        .filter_map(|e| e.replicate.as_ref())
        .find(|r| r.id.as_ref().map(|id| id.index) == Some(index))
        .ok_or_else(|| ReplicationError::Corruption(format!("Indexed batch does not contain op index {}", index)))?;
    LogRecord::try_from(msg.clone())
}
