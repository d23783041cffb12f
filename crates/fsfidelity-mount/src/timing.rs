//! Wait and grace periods for mount synchronization.

use std::sync::LazyLock;
use std::time::Duration;

/// Default time to wait for a mount state change (5 seconds).
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between mount-state checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default pause after removing the mountpoint, giving the daemon time to exit.
pub const DEFAULT_UNMOUNT_GRACE: Duration = Duration::from_millis(200);

/// Environment variable overriding [`DEFAULT_MOUNT_TIMEOUT`], in milliseconds.
pub const TIMEOUT_ENV_VAR: &str = "FSFIDELITY_MOUNT_TIMEOUT_MS";

/// Read once per process; unparsable values fall back to the default.
static ENV_TIMEOUT: LazyLock<Duration> = LazyLock::new(|| {
    std::env::var(TIMEOUT_ENV_VAR)
        .ok()
        .and_then(|s| s.parse().ok())
        .map_or(DEFAULT_MOUNT_TIMEOUT, Duration::from_millis)
});

/// Timing knobs for [`MountSynchronizer`](crate::MountSynchronizer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountTiming {
    /// How long to wait for the mount point to reach a state.
    ///
    /// Default: 5 seconds, or `FSFIDELITY_MOUNT_TIMEOUT_MS` when set.
    pub timeout: Duration,

    /// Sleep between mount-state checks. Default: 100ms.
    pub interval: Duration,

    /// Sleep after teardown before returning. Default: 200ms.
    pub grace: Duration,
}

impl Default for MountTiming {
    fn default() -> Self {
        Self {
            timeout: *ENV_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
            grace: DEFAULT_UNMOUNT_GRACE,
        }
    }
}

impl MountTiming {
    /// Sets the mount-state timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the polling interval.
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the post-teardown grace period.
    #[must_use]
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let timing = MountTiming::default()
            .timeout(Duration::from_secs(1))
            .interval(Duration::from_millis(10))
            .grace(Duration::ZERO);
        assert_eq!(timing.timeout, Duration::from_secs(1));
        assert_eq!(timing.interval, Duration::from_millis(10));
        assert_eq!(timing.grace, Duration::ZERO);
    }

    #[test]
    fn test_defaults() {
        let timing = MountTiming::default();
        assert_eq!(timing.interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(timing.grace, DEFAULT_UNMOUNT_GRACE);
        if std::env::var_os(TIMEOUT_ENV_VAR).is_none() {
            assert_eq!(timing.timeout, DEFAULT_MOUNT_TIMEOUT);
        }
    }
}
