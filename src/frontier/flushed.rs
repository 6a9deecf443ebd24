use crate::common::{ReplicationError, Result};
use crate::frontier::{ConsensusFrontier, UpdateDirection};
use parking_lot::Mutex;

/// Validates the frontiers storage reports after each flush. Replicated state reflected in
/// flushed files must never move backwards.
pub struct FlushedFrontierTracker {
    logger: slog::Logger,
    flushed: Mutex<Option<ConsensusFrontier>>,
}

impl FlushedFrontierTracker {
    pub fn new(logger: slog::Logger) -> Self {
        FlushedFrontierTracker {
            logger,
            flushed: Mutex::new(None),
        }
    }

    pub fn notify_flushed_frontier(&self, frontier: ConsensusFrontier) -> Result<()> {
        let mut flushed = self.flushed.lock();
        match flushed.as_mut() {
            None => {
                *flushed = Some(frontier);
            }
            Some(current) => {
                if !current.is_update_valid(&frontier, UpdateDirection::Largest) {
                    slog::error!(
                        self.logger,
                        "Flushed frontier regressed: current {}, new {}",
                        current,
                        frontier
                    );
                    return Err(ReplicationError::IllegalState(format!(
                        "Flushed frontier {} is behind {}",
                        frontier, current
                    )));
                }
                current.update(&frontier, UpdateDirection::Largest);
            }
        }

        Ok(())
    }

    pub fn flushed_frontier(&self) -> Option<ConsensusFrontier> {
        *self.flushed.lock()
    }
}
