//! Sleep-polling with a deadline.

use std::thread;
use std::time::{Duration, Instant};

/// Evaluate `condition` every `interval` until it holds or `timeout` passes.
///
/// Returns whether the condition was observed to hold. The condition is
/// checked at least once when `timeout` is non-zero, and the call returns
/// no later than roughly `timeout + interval`.
pub fn poll_until(timeout: Duration, interval: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(interval);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_on_first_success() {
        let mut calls = 0;
        let start = Instant::now();
        assert!(poll_until(Duration::from_secs(5), Duration::from_millis(50), || {
            calls += 1;
            true
        }));
        assert_eq!(calls, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_succeeds_after_a_few_checks() {
        let mut calls = 0;
        assert!(poll_until(Duration::from_secs(5), Duration::from_millis(5), || {
            calls += 1;
            calls == 3
        }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_never_true_is_bounded() {
        let timeout = Duration::from_millis(200);
        let interval = Duration::from_millis(20);
        let start = Instant::now();
        assert!(!poll_until(timeout, interval, || false));
        let elapsed = start.elapsed();
        assert!(elapsed >= timeout, "{elapsed:?}");
        assert!(elapsed < timeout + interval + Duration::from_millis(200), "{elapsed:?}");
    }

    #[test]
    fn test_zero_timeout_never_checks() {
        let mut calls = 0;
        assert!(!poll_until(Duration::ZERO, Duration::from_millis(5), || {
            calls += 1;
            true
        }));
        assert_eq!(calls, 0);
    }
}
