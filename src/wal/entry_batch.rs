use crate::common::{OpId, ReplicationError, Result};
use crate::grpc::{LogEntryBatchPb, LogEntryPb, LogEntryType, OpIdPb};
use crate::wal::LogRecord;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Fired exactly once when a batch is durable per the durability policy, or has failed.
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Adapts a [`StatusCallback`] into a future the caller can await.
pub fn append_completion() -> (StatusCallback, oneshot::Receiver<Result<()>>) {
    let (tx, rx) = oneshot::channel();
    let callback: StatusCallback = Box::new(move |result| {
        // Receiver may have stopped caring.
        let _ = tx.send(result);
    });
    (callback, rx)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryType {
    Replicate,
    FlushMarker,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BatchState {
    Reserved,
    Ready,
}

/// A group of log entries written to the log with a single frame.
pub struct LogEntryBatch {
    entry_type: EntryType,
    records: Vec<Arc<LogRecord>>,
    committed_op_id: OpId,
    mono_time_micros: u64,
    state: BatchState,
    callback: Option<StatusCallback>,
}

impl LogEntryBatch {
    pub(crate) fn reserve(
        entry_type: EntryType,
        records: Vec<Arc<LogRecord>>,
        committed_op_id: OpId,
        mono_time_micros: u64,
    ) -> Result<Self> {
        match entry_type {
            EntryType::Replicate if records.is_empty() => {
                return Err(ReplicationError::InvalidArgument(
                    "A replicate batch needs at least one record".to_string(),
                ));
            }
            EntryType::FlushMarker if !records.is_empty() => {
                return Err(ReplicationError::InvalidArgument(
                    "A flush marker batch cannot carry records".to_string(),
                ));
            }
            _ => {}
        }

        Ok(LogEntryBatch {
            entry_type,
            records,
            committed_op_id,
            mono_time_micros,
            state: BatchState::Reserved,
            callback: None,
        })
    }

    pub(crate) fn mark_ready(&mut self, callback: StatusCallback) {
        self.callback = Some(callback);
        self.state = BatchState::Ready;
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn records(&self) -> &[Arc<LogRecord>] {
        &self.records
    }

    pub(crate) fn state(&self) -> BatchState {
        self.state
    }

    pub(crate) fn is_flush_marker(&self) -> bool {
        self.entry_type == EntryType::FlushMarker
    }

    pub(crate) fn max_replicate_op_id(&self) -> Option<OpId> {
        self.records.last().map(|r| r.op_id)
    }

    pub(crate) fn to_pb(&self) -> LogEntryBatchPb {
        let entry = match self.entry_type {
            EntryType::Replicate => self
                .records
                .iter()
                .map(|record| LogEntryPb {
                    r#type: LogEntryType::Replicate as i32,
                    replicate: Some(record.to_pb()),
                })
                .collect(),
            EntryType::FlushMarker => vec![LogEntryPb {
                r#type: LogEntryType::FlushMarker as i32,
                replicate: None,
            }],
        };

        LogEntryBatchPb {
            entry,
            committed_op_id: Some(OpIdPb::from(self.committed_op_id)),
            mono_time: self.mono_time_micros,
        }
    }

    pub(crate) fn complete(&mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl fmt::Debug for LogEntryBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEntryBatch")
            .field("entry_type", &self.entry_type)
            .field("num_records", &self.records.len())
            .field("last", &self.max_replicate_op_id())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HybridTime;
    use crate::wal::Payload;

    #[test]
    fn reserve_rejects_mixed_up_contents() {
        let record = Arc::new(LogRecord::new(OpId::new(1, 1), HybridTime::MIN, Payload::NoOp));

        assert!(LogEntryBatch::reserve(EntryType::Replicate, vec![], OpId::MIN, 0).is_err());
        assert!(LogEntryBatch::reserve(EntryType::FlushMarker, vec![record.clone()], OpId::MIN, 0).is_err());

        let batch = LogEntryBatch::reserve(EntryType::Replicate, vec![record], OpId::MIN, 0).unwrap();
        assert_eq!(batch.state(), BatchState::Reserved);
        assert_eq!(batch.max_replicate_op_id(), Some(OpId::new(1, 1)));
    }

    #[tokio::test]
    async fn completion_fires_once() {
        let (callback, rx) = append_completion();
        let mut batch = LogEntryBatch::reserve(EntryType::FlushMarker, vec![], OpId::MIN, 0).unwrap();
        batch.mark_ready(callback);

        batch.complete(Ok(()));
        batch.complete(Err(ReplicationError::shutting_down()));

        assert!(rx.await.unwrap().is_ok());
    }
}
