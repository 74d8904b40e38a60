use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::time::Instant;

/// Injectable time source so the health/adaptive/admission state machines can
/// be driven deterministically in tests without real sleeps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn system_now(&self) -> SystemTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A manually-advanced clock for unit tests. `Instant` cannot be constructed
/// from an arbitrary offset outside of `tokio::time::pause`, so this tracks a
/// base instant plus an advance in milliseconds and adds that to every read.
#[derive(Debug)]
pub struct TestClock {
    base: Instant,
    base_system: SystemTime,
    advance_ms: AtomicU64,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_system: SystemTime::now(),
            advance_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.advance_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.advance_ms.load(Ordering::SeqCst))
    }

    fn system_now(&self) -> SystemTime {
        self.base_system + Duration::from_millis(self.advance_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert!(t1 >= t0 + Duration::from_secs(5));
    }
}
