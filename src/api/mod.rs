//! Assembles a tablet's replication stack and is the entry point for embedding it.
mod options;
mod storage;
mod wiring;

pub use options::ReplicationOptions;
pub use storage::TabletStorage;
pub use wiring::TabletReplication;
pub use wiring::TabletReplicationConfig;
pub use wiring::TabletReplicationError;
