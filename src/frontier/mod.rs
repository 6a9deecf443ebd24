mod consensus_frontier;
mod flushed;

pub use consensus_frontier::ConsensusFrontier;
pub use consensus_frontier::UpdateDirection;
pub use flushed::FlushedFrontierTracker;
