//! Rate-limited logging.
//!
//! A [`Throttle`] guards one log call site: [`Throttle::check`] lets at most
//! one message through per period and counts the ones it swallowed, so the
//! next message that does get through can report how many were suppressed.
//!
//! ```rust
//! use std::time::Duration;
//! use tagframe_runtime::throttle::Throttle;
//!
//! let throttle = Throttle::new(Duration::from_secs(10));
//! assert_eq!(throttle.check(), Some(0));
//! assert_eq!(throttle.check(), None);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Period used for the detector's recurring warnings.
pub const DEFAULT_WARN_PERIOD: Duration = Duration::from_secs(10);

pub struct Throttle {
    /// `None` when throttling is disabled.
    limiter: Option<DefaultDirectRateLimiter>,
    suppressed: AtomicU64,
}

impl Throttle {
    /// Allow one message per `period`.  A zero period never throttles.
    pub fn new(period: Duration) -> Self {
        Self {
            limiter: Quota::with_period(period).map(RateLimiter::direct),
            suppressed: AtomicU64::new(0),
        }
    }

    /// `Some(n)` if the caller may log now, where `n` is the number of
    /// messages suppressed since the last one that was let through.
    pub fn check(&self) -> Option<u64> {
        let allowed = self
            .limiter
            .as_ref()
            .is_none_or(|limiter| limiter.check().is_ok());
        if allowed {
            Some(self.suppressed.swap(0, Ordering::AcqRel))
        } else {
            self.suppressed.fetch_add(1, Ordering::AcqRel);
            None
        }
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_PERIOD)
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("suppressed", &self.suppressed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_passes_then_suppressed() {
        let throttle = Throttle::new(Duration::from_secs(60));
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);
    }

    #[test]
    fn suppressed_count_is_reported_after_period() {
        let throttle = Throttle::new(Duration::from_millis(200));
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(throttle.check(), Some(2));
    }

    #[test]
    fn zero_period_never_throttles() {
        let throttle = Throttle::new(Duration::ZERO);
        for _ in 0..100 {
            assert_eq!(throttle.check(), Some(0));
        }
    }
}
