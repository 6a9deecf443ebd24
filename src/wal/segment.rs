use crate::common::{ReplicationError, Result};
use crate::grpc::{LogEntryBatchPb, LogEntryType, LogSegmentFooterPb, LogSegmentHeaderPb};
use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Segment layout:
///
/// ```text
/// +-------------+------------+-------------+-----+----------------+------------+--------------+
/// | hdr magic 8 | hdr len u32| header pb   | ... | frames         | footer pb  | len u32 |    |
/// |             |            |             |     | [len][crc][pb] |            | ftr magic 8  |
/// +-------------+------------+-------------+-----+----------------+------------+--------------+
/// ```
///
/// Every frame is `[len u32 LE][crc32c u32 LE][LogEntryBatchPb]`. The footer only exists once the
/// segment was closed cleanly.
const HEADER_MAGIC: &[u8; 8] = b"tcwalhdr";
const FOOTER_MAGIC: &[u8; 8] = b"tcwalftr";
const HEADER_PREFIX_LEN: u64 = 12;
const FRAME_HEADER_LEN: u64 = 8;
const FOOTER_TRAILER_LEN: u64 = 12;

pub(crate) const MAJOR_VERSION: u32 = 1;
pub(crate) const MINOR_VERSION: u32 = 0;

const SEGMENT_PREFIX: &str = "wal-";
const PLACEHOLDER_PREFIX: &str = ".tmp.newsegment";

pub(crate) fn segment_file_name(sequence_number: u64) -> String {
    format!("{}{:09}", SEGMENT_PREFIX, sequence_number)
}

pub(crate) fn parse_segment_file_name(file_name: &str) -> Option<u64> {
    let digits = file_name.strip_prefix(SEGMENT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub(crate) fn placeholder_file_name() -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}{:016x}", PLACEHOLDER_PREFIX, suffix)
}

pub(crate) fn is_placeholder_file_name(file_name: &str) -> bool {
    file_name.starts_with(PLACEHOLDER_PREFIX)
}

/// Entry statistics that end up in the segment footer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct SegmentFooter {
    pub num_entries: i64,
    pub min_replicate_index: Option<i64>,
    pub max_replicate_index: Option<i64>,
    pub close_timestamp_micros: Option<u64>,
}

impl SegmentFooter {
    pub(crate) fn record_batch(&mut self, batch: &LogEntryBatchPb) {
        self.num_entries += batch.entry.len() as i64;
        for entry in &batch.entry {
            if entry.r#type != LogEntryType::Replicate as i32 {
                continue;
            }
            let index = match entry.replicate.as_ref().and_then(|r| r.id.as_ref()) {
                Some(id) => id.index,
                None => continue,
            };
            self.min_replicate_index = Some(self.min_replicate_index.map_or(index, |i| i.min(index)));
            self.max_replicate_index = Some(self.max_replicate_index.map_or(index, |i| i.max(index)));
        }
    }

    fn to_pb(&self) -> LogSegmentFooterPb {
        LogSegmentFooterPb {
            num_entries: self.num_entries,
            min_replicate_index: self.min_replicate_index.unwrap_or(-1),
            max_replicate_index: self.max_replicate_index.unwrap_or(-1),
            close_timestamp_micros: self.close_timestamp_micros.unwrap_or(0) as i64,
        }
    }

    fn from_pb(pb: LogSegmentFooterPb) -> Self {
        SegmentFooter {
            num_entries: pb.num_entries,
            min_replicate_index: if pb.min_replicate_index < 0 { None } else { Some(pb.min_replicate_index) },
            max_replicate_index: if pb.max_replicate_index < 0 { None } else { Some(pb.max_replicate_index) },
            close_timestamp_micros: if pb.close_timestamp_micros > 0 {
                Some(pb.close_timestamp_micros as u64)
            } else {
                None
            },
        }
    }
}

/// The single segment currently being appended to.
pub(crate) struct WritableSegment {
    path: PathBuf,
    file: File,
    sequence_number: u64,
    first_entry_offset: u64,
    written_offset: u64,
    footer: SegmentFooter,
}

impl WritableSegment {
    pub(crate) fn create(path: &Path, header: &LogSegmentHeaderPb) -> Result<Self> {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;

        let encoded = header.encode_pb();
        let mut buf = BytesMut::with_capacity(HEADER_PREFIX_LEN as usize + encoded.len());
        buf.put_slice(HEADER_MAGIC);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_slice(&encoded);
        file.write_all(&buf)?;

        Ok(WritableSegment {
            path: path.to_path_buf(),
            file,
            sequence_number: header.sequence_number as u64,
            first_entry_offset: buf.len() as u64,
            written_offset: buf.len() as u64,
            footer: SegmentFooter::default(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub(crate) fn first_entry_offset(&self) -> u64 {
        self.first_entry_offset
    }

    pub(crate) fn size(&self) -> u64 {
        self.written_offset
    }

    pub(crate) fn footer(&self) -> &SegmentFooter {
        &self.footer
    }

    /// Appends one frame and returns the offset it starts at.
    pub(crate) fn append(&mut self, batch: &LogEntryBatchPb, encoded: &[u8]) -> Result<u64> {
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN as usize + encoded.len());
        frame.put_u32_le(encoded.len() as u32);
        frame.put_u32_le(crc32c::crc32c(encoded));
        frame.put_slice(encoded);
        self.file.write_all(&frame)?;

        let offset = self.written_offset;
        self.written_offset += frame.len() as u64;
        self.footer.record_batch(batch);
        Ok(offset)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub(crate) fn close(mut self, close_timestamp_micros: u64) -> Result<SegmentFooter> {
        self.footer.close_timestamp_micros = Some(close_timestamp_micros);
        let encoded = self.footer.to_pb().encode_pb();
        let mut buf = BytesMut::with_capacity(encoded.len() + FOOTER_TRAILER_LEN as usize);
        buf.put_slice(&encoded);
        buf.put_u32_le(encoded.len() as u32);
        buf.put_slice(FOOTER_MAGIC);
        self.file.write_all(&buf)?;
        self.file.sync_all()?;
        Ok(self.footer)
    }
}

/// Read-only view of a segment. The active segment is readable up to the last appended frame.
pub(crate) struct ReadableSegment {
    path: PathBuf,
    file: File,
    header: LogSegmentHeaderPb,
    first_entry_offset: u64,
    footer: Option<SegmentFooter>,
    footer_was_rebuilt: bool,
    readable_to: AtomicU64,
    file_size: AtomicU64,
}

impl ReadableSegment {
    /// Opens a segment that is not being written to. A missing footer is rebuilt by scanning.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let (header, first_entry_offset) = read_header(&file, path, file_len)?;

        let mut segment = ReadableSegment {
            path: path.to_path_buf(),
            file,
            header,
            first_entry_offset,
            footer: None,
            footer_was_rebuilt: false,
            readable_to: AtomicU64::new(first_entry_offset),
            file_size: AtomicU64::new(file_len),
        };

        match segment.read_footer(file_len)? {
            Some((footer, entries_end)) => {
                segment.footer = Some(footer);
                segment.readable_to.store(entries_end, Ordering::Release);
            }
            None => {
                let (footer, entries_end) = segment.rebuild_footer(file_len)?;
                segment.footer = Some(footer);
                segment.footer_was_rebuilt = true;
                segment.readable_to.store(entries_end, Ordering::Release);
            }
        }

        Ok(segment)
    }

    pub(crate) fn open_active(path: &Path, header: LogSegmentHeaderPb, first_entry_offset: u64) -> Result<Self> {
        let file = File::open(path)?;
        Ok(ReadableSegment {
            path: path.to_path_buf(),
            file,
            header,
            first_entry_offset,
            footer: None,
            footer_was_rebuilt: false,
            readable_to: AtomicU64::new(first_entry_offset),
            file_size: AtomicU64::new(first_entry_offset),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn sequence_number(&self) -> u64 {
        self.header.sequence_number as u64
    }

    pub(crate) fn header(&self) -> &LogSegmentHeaderPb {
        &self.header
    }

    pub(crate) fn footer(&self) -> Option<&SegmentFooter> {
        self.footer.as_ref()
    }

    pub(crate) fn has_footer(&self) -> bool {
        self.footer.is_some()
    }

    pub(crate) fn footer_was_rebuilt(&self) -> bool {
        self.footer_was_rebuilt
    }

    pub(crate) fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    pub(crate) fn update_readable_to(&self, offset: u64) {
        self.readable_to.store(offset, Ordering::Release);
        self.file_size.store(offset, Ordering::Release);
    }

    pub(crate) fn read_batch_at(&self, offset: u64) -> Result<LogEntryBatchPb> {
        let end = self.readable_to.load(Ordering::Acquire);
        match self.read_frame(offset, end)? {
            Some((batch, _)) => Ok(batch),
            None => Err(ReplicationError::Corruption(format!(
                "No complete entry at offset {} of {}",
                offset,
                self.path.display()
            ))),
        }
    }

    /// Every batch in the segment with the offset it starts at.
    pub(crate) fn read_all_batches(&self) -> Result<Vec<(u64, LogEntryBatchPb)>> {
        let end = self.readable_to.load(Ordering::Acquire);
        let mut batches = Vec::new();
        let mut offset = self.first_entry_offset;
        while let Some((batch, next)) = self.read_frame(offset, end)? {
            batches.push((offset, batch));
            offset = next;
        }
        Ok(batches)
    }

    fn read_footer(&self, file_len: u64) -> Result<Option<(SegmentFooter, u64)>> {
        if file_len < self.first_entry_offset + FOOTER_TRAILER_LEN {
            return Ok(None);
        }
        let mut trailer = [0u8; FOOTER_TRAILER_LEN as usize];
        self.file.read_exact_at(&mut trailer, file_len - FOOTER_TRAILER_LEN)?;
        if &trailer[4..] != FOOTER_MAGIC {
            return Ok(None);
        }
        let footer_len = (&trailer[..4]).get_u32_le() as u64;
        if file_len < self.first_entry_offset + FOOTER_TRAILER_LEN + footer_len {
            return Err(ReplicationError::Corruption(format!(
                "Footer length {} overruns {}",
                footer_len,
                self.path.display()
            )));
        }
        let footer_start = file_len - FOOTER_TRAILER_LEN - footer_len;
        let mut encoded = vec![0u8; footer_len as usize];
        self.file.read_exact_at(&mut encoded, footer_start)?;
        let pb = LogSegmentFooterPb::decode(encoded.as_slice())?;

        Ok(Some((SegmentFooter::from_pb(pb), footer_start)))
    }

    fn rebuild_footer(&self, file_len: u64) -> Result<(SegmentFooter, u64)> {
        let mut footer = SegmentFooter::default();
        let mut offset = self.first_entry_offset;
        while let Some((batch, next)) = self.read_frame(offset, file_len)? {
            footer.record_batch(&batch);
            offset = next;
        }
        Ok((footer, offset))
    }

    /// `None` when the frame at `offset` is cut short by `end`, which is how a torn tail looks.
    fn read_frame(&self, offset: u64, end: u64) -> Result<Option<(LogEntryBatchPb, u64)>> {
        if offset + FRAME_HEADER_LEN > end {
            return Ok(None);
        }
        let mut frame_header = [0u8; FRAME_HEADER_LEN as usize];
        self.file.read_exact_at(&mut frame_header, offset)?;
        let mut header_buf = &frame_header[..];
        let len = header_buf.get_u32_le() as u64;
        let expected_crc = header_buf.get_u32_le();

        let body_start = offset + FRAME_HEADER_LEN;
        if body_start + len > end {
            return Ok(None);
        }
        let mut body = vec![0u8; len as usize];
        self.file.read_exact_at(&mut body, body_start)?;
        if crc32c::crc32c(&body) != expected_crc {
            return Err(ReplicationError::Corruption(format!(
                "Checksum mismatch at offset {} of {}",
                offset,
                self.path.display()
            )));
        }

        let batch = LogEntryBatchPb::decode(body.as_slice())?;
        Ok(Some((batch, body_start + len)))
    }
}

fn read_header(file: &File, path: &Path, file_len: u64) -> Result<(LogSegmentHeaderPb, u64)> {
    if file_len < HEADER_PREFIX_LEN {
        return Err(ReplicationError::Corruption(format!(
            "Segment {} is too short to hold a header",
            path.display()
        )));
    }
    let mut prefix = [0u8; HEADER_PREFIX_LEN as usize];
    file.read_exact_at(&mut prefix, 0)?;
    if &prefix[..8] != HEADER_MAGIC {
        return Err(ReplicationError::Corruption(format!("Bad header magic in {}", path.display())));
    }
    let header_len = (&prefix[8..]).get_u32_le() as u64;
    if file_len < HEADER_PREFIX_LEN + header_len {
        return Err(ReplicationError::Corruption(format!(
            "Header length {} overruns {}",
            header_len,
            path.display()
        )));
    }
    let mut encoded = vec![0u8; header_len as usize];
    file.read_exact_at(&mut encoded, HEADER_PREFIX_LEN)?;
    let header = LogSegmentHeaderPb::decode(encoded.as_slice())?;
    if header.major_version != MAJOR_VERSION {
        return Err(ReplicationError::Corruption(format!(
            "Unsupported segment version {}.{} in {}",
            header.major_version,
            header.minor_version,
            path.display()
        )));
    }

    Ok((header, HEADER_PREFIX_LEN + header_len))
}

trait EncodePb {
    fn encode_pb(&self) -> Vec<u8>;
}

impl<M: Message> EncodePb for M {
    fn encode_pb(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        // Writing into a Vec only fails when capacity is short, which `encoded_len` rules out.
        let _ = self.encode(&mut buf);
        buf
    }
}

pub(crate) fn encode_batch(batch: &LogEntryBatchPb) -> Vec<u8> {
    batch.encode_pb()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{HybridTime, OpId};
    use crate::grpc::{LogEntryPb, OpIdPb};
    use crate::wal::{LogRecord, Payload};
    use std::io::Write;

    fn header(sequence_number: i64) -> LogSegmentHeaderPb {
        LogSegmentHeaderPb {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            sequence_number,
            tablet_id: "tablet-1".to_string(),
            schema: vec![],
            schema_version: 0,
        }
    }

    fn batch(indexes: &[i64]) -> LogEntryBatchPb {
        LogEntryBatchPb {
            entry: indexes
                .iter()
                .map(|i| LogEntryPb {
                    r#type: LogEntryType::Replicate as i32,
                    replicate: Some(LogRecord::new(OpId::new(1, *i), HybridTime::MIN, Payload::NoOp).to_pb()),
                })
                .collect(),
            committed_op_id: Some(OpIdPb { term: 0, index: 0 }),
            mono_time: 0,
        }
    }

    #[test]
    fn segment_file_names() {
        assert_eq!(segment_file_name(7), "wal-000000007");
        assert_eq!(parse_segment_file_name("wal-000000007"), Some(7));
        assert_eq!(parse_segment_file_name("wal-"), None);
        assert_eq!(parse_segment_file_name(".tmp.newsegment1234"), None);
        assert!(is_placeholder_file_name(&placeholder_file_name()));
    }

    #[test]
    fn closed_segment_has_footer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));

        let mut writable = WritableSegment::create(&path, &header(1)).unwrap();
        for indexes in &[vec![1, 2], vec![3]] {
            let b = batch(indexes);
            writable.append(&b, &encode_batch(&b)).unwrap();
        }
        writable.close(1234).unwrap();

        let readable = ReadableSegment::open(&path).unwrap();
        assert!(!readable.footer_was_rebuilt());
        let footer = readable.footer().unwrap();
        assert_eq!(footer.num_entries, 3);
        assert_eq!(footer.min_replicate_index, Some(1));
        assert_eq!(footer.max_replicate_index, Some(3));
        assert_eq!(footer.close_timestamp_micros, Some(1234));
        assert_eq!(readable.read_all_batches().unwrap().len(), 2);
    }

    #[test]
    fn torn_tail_is_end_of_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));

        let mut writable = WritableSegment::create(&path, &header(1)).unwrap();
        let b = batch(&[1, 2]);
        writable.append(&b, &encode_batch(&b)).unwrap();
        drop(writable);

        // Half a frame header from a crash mid-write.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0, 0]).unwrap();

        let readable = ReadableSegment::open(&path).unwrap();
        assert!(readable.footer_was_rebuilt());
        let footer = readable.footer().unwrap();
        assert_eq!(footer.max_replicate_index, Some(2));
        assert_eq!(footer.close_timestamp_micros, None);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(segment_file_name(1));

        let mut writable = WritableSegment::create(&path, &header(1)).unwrap();
        let b = batch(&[1]);
        let offset = writable.append(&b, &encode_batch(&b)).unwrap();
        drop(writable);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xff], offset + FRAME_HEADER_LEN + 2).unwrap();

        assert!(matches!(
            ReadableSegment::open(&path),
            Err(ReplicationError::Corruption(_))
        ));
    }
}
