use crate::common::{OpId, Result};
use crate::wal::LogRecord;

/// TabletStorage is the storage engine a tablet's committed records are applied to.
pub trait TabletStorage: Send + Sync + 'static {
    /// Called once per committed record, in op id order.
    fn apply_committed_record(&self, record: &LogRecord) -> Result<()>;

    /// Flushed files currently making up the tablet.
    fn num_sst_files(&self) -> u64;

    /// The last record applied, as of open. `OpId::MIN` for a new tablet.
    fn last_applied_op_id(&self) -> OpId;
}
