use std::time::Duration;

use tokio::time::Instant;

/// Default progress notification interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Converts a byte count into a percentage in `[0, 100]`.
///
/// An empty transfer counts as complete.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done.min(total) as u128 * 100) / total as u128;
    pct as u8
}

/// Limits how often progress is written to the record store.
///
/// Emits at most once per interval, skips unchanged values, and always lets
/// the first 100% through.
pub struct ProgressThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ProgressThrottle {
    /// Creates a throttle. If `interval` is `None`, defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval: interval.unwrap_or(DEFAULT_INTERVAL),
            last_emit: None,
            last_percent: None,
        }
    }

    /// Returns `true` if `percent` should be reported now.
    pub fn should_emit(&mut self, percent: u8) -> bool {
        if self.last_percent == Some(percent) {
            return false;
        }
        let now = Instant::now();
        let due = percent >= 100
            || self
                .last_emit
                .is_none_or(|last| now.duration_since(last) >= self.interval);
        if due {
            self.last_emit = Some(now);
            self.last_percent = Some(percent);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_of_bounds() {
        assert_eq!(percent_of(0, 100), 0);
        assert_eq!(percent_of(50, 200), 25);
        assert_eq!(percent_of(300, 200), 100);
        assert_eq!(percent_of(0, 0), 100);
        assert_eq!(percent_of(u64::MAX / 2, u64::MAX), 49);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_limits_rate() {
        let mut t = ProgressThrottle::new(Some(Duration::from_millis(500)));
        assert!(t.should_emit(1));
        assert!(!t.should_emit(2));
        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(!t.should_emit(3));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(t.should_emit(4));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_always_emits_first_completion() {
        let mut t = ProgressThrottle::new(None);
        assert!(t.should_emit(10));
        assert!(t.should_emit(100));
        assert!(!t.should_emit(100));
    }
}
