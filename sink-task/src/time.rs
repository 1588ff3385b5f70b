use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Milliseconds on a monotonic clock. Both the commit schedule and the commit
/// timeout read from the same source so tests can drive them together.
pub trait TimeSource: Send + Sync {
    fn milliseconds(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct SystemTime {
    origin: Instant,
}

impl Default for SystemTime {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl TimeSource for SystemTime {
    fn milliseconds(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct MockTime {
    now: AtomicU64,
}

impl MockTime {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn sleep(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for MockTime {
    fn milliseconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_time_only_moves_when_slept() {
        let time = MockTime::new(1_000);
        assert_eq!(time.milliseconds(), 1_000);
        time.sleep(Duration::from_secs(30));
        assert_eq!(time.milliseconds(), 31_000);
    }

    #[test]
    fn system_time_is_monotonic() {
        let time = SystemTime::default();
        let first = time.milliseconds();
        assert!(time.milliseconds() >= first);
    }
}
