use crate::common::HybridTime;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Clock is the only source of "now" for lease bookkeeping, retention windows and peer heartbeats.
#[async_trait::async_trait]
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Physical wall time as a hybrid time with a zero logical component.
    fn hybrid_now(&self) -> HybridTime;

    async fn sleep_until(&mut self, deadline: Instant);

    async fn sleep(&mut self, duration: Duration) {
        let deadline = self.now() + duration;
        self.sleep_until(deadline).await;
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RealClock;

#[async_trait::async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now()
    }

    fn hybrid_now(&self) -> HybridTime {
        HybridTime::from_micros(wall_clock_micros())
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

pub(crate) fn wall_clock_micros() -> u64 {
    let now = Utc::now();
    let micros = now.timestamp() * 1_000_000 + i64::from(now.timestamp_subsec_micros());
    if micros < 0 {
        0
    } else {
        micros as u64
    }
}

pub fn mocked_clock() -> (MockClock, MockClockController) {
    let now = Instant::now();
    let wall_micros_at_instantiation = wall_clock_micros();
    let (tx, rx) = watch::channel(now);
    let clock = MockClock {
        current_time: rx,
        time_of_instantiation: now,
        wall_micros_at_instantiation,
    };
    let controller = MockClockController {
        current_time: tx,
        time_of_instantiation: now,
    };

    (clock, controller)
}

/// A clock that only moves when its controller advances it. Wall time moves in lockstep with the
/// monotonic time.
#[derive(Clone)]
pub struct MockClock {
    current_time: watch::Receiver<Instant>,
    time_of_instantiation: Instant,
    wall_micros_at_instantiation: u64,
}

#[async_trait::async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        *self.current_time.borrow()
    }

    fn hybrid_now(&self) -> HybridTime {
        let elapsed = self.now() - self.time_of_instantiation;
        HybridTime::from_micros(self.wall_micros_at_instantiation + elapsed.as_micros() as u64)
    }

    async fn sleep_until(&mut self, deadline: Instant) {
        loop {
            if *self.current_time.borrow() >= deadline {
                return;
            }

            if self.current_time.changed().await.is_err() {
                // Controller dropped, time will never move again.
                futures_pending().await;
            }
        }
    }
}

async fn futures_pending() {
    std::future::pending::<()>().await
}

pub struct MockClockController {
    current_time: watch::Sender<Instant>,
    time_of_instantiation: Instant,
}

impl MockClockController {
    pub fn current_time(&self) -> Instant {
        *self.current_time.borrow()
    }

    pub fn elapsed_time(&self) -> Duration {
        self.current_time() - self.time_of_instantiation
    }

    /// Advancing by large steps can surprise `sleep_until()` users: the only promise is that a
    /// sleeper wakes once `now` is at or past its deadline, possibly long past it.
    pub fn advance(&mut self, duration: Duration) {
        let new_now = self.current_time() + duration;
        // Fails only when every clock has been dropped; nobody is left to observe time.
        let _ = self.current_time.send(new_now);
    }
}
