use std::time::Instant;

/// Monotonic millisecond tick source used for deadline bookkeeping.
pub trait MonotonicClock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}


#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::testing::SteppingClock;
    use super::{MonotonicClock, SystemClock};

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let first = clock.now_ms();
        thread::sleep(Duration::from_millis(5));
        let second = clock.now_ms();
        assert!(second >= first + 5);
    }

    #[test]
    fn stepping_clock_advances_per_read() {
        let clock = SteppingClock::new(100, 25);
        assert_eq!(clock.now_ms(), 100);
        assert_eq!(clock.now_ms(), 125);
        assert_eq!(clock.peek_ms(), 150);
    }
}
