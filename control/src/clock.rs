use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Time source for the admission components.
///
/// Claims expiry, rate-limit windows and circuit timeouts all read time
/// through this trait so tests can drive it directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    fn unix_seconds(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Settable clock shared across test components.
#[derive(Clone, Debug)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn at_unix(secs: u64) -> Self {
        ManualClock {
            millis: Arc::new(AtomicU64::new(secs * 1000)),
        }
    }

    pub fn set_unix(&self, secs: u64) {
        self.millis.store(secs * 1000, Ordering::SeqCst);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::at_unix(1000);
        assert_eq!(clock.unix_seconds(), 1000);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.unix_seconds(), 1090);

        clock.set_unix(50);
        assert_eq!(clock.unix_seconds(), 50);
    }
}
