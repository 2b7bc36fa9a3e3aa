//! Time source abstraction.
//!
//! Every component that reads time or sleeps does so through [`Clock`] so the
//! restart governor, circuit breaker, playout timeline and throttler can run
//! deterministically under test.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Monotonic + wall-clock time source with schedulable sleeps.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant, used for intervals and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for anchors and EPG timestamps.
    fn wall_now(&self) -> DateTime<Utc>;

    /// Cooperative sleep; cancelled with the calling task.
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by the OS.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Create the default production clock.
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Manually stepped clock for deterministic tests.
///
/// `sleep` returns immediately after registering the requested duration, so
/// tests can assert on scheduled waits without real time passing. Monotonic
/// and wall time advance only via [`ManualClock::advance`].
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_wall: DateTime<Utc>,
    offset: parking_lot::Mutex<Duration>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall: start,
            offset: parking_lot::Mutex::new(Duration::ZERO),
        }
    }

    /// Advance both monotonic and wall time.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Current offset from the construction instant.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base_instant + *self.offset.lock()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.base_wall
            + chrono::Duration::from_std(*self.offset.lock())
                .unwrap_or_else(|_| chrono::Duration::zero())
    }

    async fn sleep(&self, _duration: Duration) {
        // Deterministic tests drive time via advance(); a sleeping task
        // yields once so other tasks can interleave.
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn manual_clock_advances_monotonic_and_wall_together() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);

        let t0 = clock.now();
        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(t0), Duration::from_secs(90));
        assert_eq!(clock.wall_now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn system_clock_wall_time_is_recent() {
        let clock = SystemClock;
        let wall = clock.wall_now();
        let delta = (Utc::now() - wall).num_seconds().abs();
        assert!(delta < 5);
    }
}
