mod error;
mod hybrid_time;
mod mem_tracker;
mod op_id;
mod time;

pub use error::ReplicationError;
pub use error::Result;
pub use hybrid_time::HybridTime;
pub use mem_tracker::MemTracker;
pub use op_id::OpId;
pub(crate) use op_id::op_id_or_min;
pub use time::mocked_clock;
pub use time::Clock;
pub use time::MockClock;
pub use time::MockClockController;
pub use time::RealClock;
pub(crate) use time::wall_clock_micros;
