mod appender;
mod entry_batch;
mod index;
mod log;
mod options;
mod reader;
mod record;
mod segment;

pub use self::log::Log;
pub use entry_batch::append_completion;
pub use entry_batch::EntryType;
pub use entry_batch::LogEntryBatch;
pub use entry_batch::StatusCallback;
pub use options::DurabilityPolicy;
pub use options::LogOptions;
pub use reader::LogReader;
pub use record::ClientId;
pub use record::LogRecord;
pub use record::Payload;
pub use record::WriteRequest;
