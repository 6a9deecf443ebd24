use crate::common::{ReplicationError, Result};
use crate::wal::log::LogCore;
use crate::wal::LogEntryBatch;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where the append pipeline writes its groups.
pub(crate) trait BatchWriter: Send + 'static {
    fn append(&self, batch: &LogEntryBatch) -> Result<()>;

    fn sync(&self) -> Result<()>;

    /// Called once the pipeline has drained.
    fn close(&self) -> Result<()>;

    fn logger(&self) -> &slog::Logger;
}

impl BatchWriter for Arc<LogCore> {
    fn append(&self, batch: &LogEntryBatch) -> Result<()> {
        self.do_append(batch)
    }

    fn sync(&self) -> Result<()> {
        LogCore::sync(self)
    }

    fn close(&self) -> Result<()> {
        self.close_active_segment()
    }

    fn logger(&self) -> &slog::Logger {
        LogCore::logger(self)
    }
}

/// Appender is the tablet's serial append pipeline. Batches are written in submission order, then
/// the whole group that was queued at that point is synced once and completed in order.
pub(crate) struct Appender {
    sender: mpsc::UnboundedSender<LogEntryBatch>,
    join_handle: JoinHandle<Result<()>>,
}

impl Appender {
    pub(crate) fn spawn<W: BatchWriter>(writer: W) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let join_handle = tokio::task::spawn_blocking(move || run(writer, rx));

        Appender {
            sender: tx,
            join_handle,
        }
    }

    /// Hands the batch back if the pipeline has already stopped.
    pub(crate) fn submit(&self, batch: LogEntryBatch) -> std::result::Result<(), LogEntryBatch> {
        self.sender.send(batch).map_err(|e| e.0)
    }

    /// Drains everything already submitted, then closes the active segment.
    pub(crate) async fn shutdown(self) -> Result<()> {
        drop(self.sender);
        match self.join_handle.await {
            Ok(result) => result,
            Err(e) => Err(ReplicationError::Internal(format!("Log appender task failed: {}", e))),
        }
    }
}

fn run<W: BatchWriter>(writer: W, mut receiver: mpsc::UnboundedReceiver<LogEntryBatch>) -> Result<()> {
    while let Some(first) = receiver.blocking_recv() {
        let mut group = vec![append_one(&writer, first)];
        while let Ok(next) = receiver.try_recv() {
            group.push(append_one(&writer, next));
        }

        let result = writer.sync();
        if let Err(e) = &result {
            slog::error!(writer.logger(), "Failed to sync log: {}", e);
        }
        // Failed appends complete in their place, never ahead of earlier batches.
        for (mut batch, appended) in group {
            batch.complete(appended.and_then(|()| result.clone()));
        }
    }

    writer.close()
}

fn append_one<W: BatchWriter>(writer: &W, batch: LogEntryBatch) -> (LogEntryBatch, Result<()>) {
    let appended = writer.append(&batch);
    if let Err(e) = &appended {
        slog::error!(writer.logger(), "Failed to append {:?}: {}", batch, e);
    }
    (batch, appended)
}
