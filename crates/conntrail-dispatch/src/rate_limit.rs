//! Rate limiting for repeated warnings about the same sink.

use std::time::{Duration, Instant};

/// Lets a warning through at most once per interval and counts what it held
/// back in between.
#[derive(Debug)]
pub struct WarnLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl WarnLimiter {
    /// Creates a limiter with the given minimum spacing.
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed)` when a warning may be emitted now, with the
    /// number of warnings held back since the previous one.
    pub fn check(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last = Some(now);
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_warning_passes_then_limits() {
        let mut limiter = WarnLimiter::new(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.check(start), Some(0));
        assert_eq!(limiter.check(start + Duration::from_secs(1)), None);
        assert_eq!(limiter.check(start + Duration::from_secs(30)), None);
        assert_eq!(limiter.check(start + Duration::from_secs(60)), Some(2));
        assert_eq!(limiter.check(start + Duration::from_secs(61)), None);
    }
}
