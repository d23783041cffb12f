//! Modification-time rounding granularity.
//!
//! Timestamps are compared in nanoseconds after rounding both sides to the
//! precision the platform can actually set and read back. The precision is
//! an exponent of ten applied to nanoseconds: `0` keeps nanoseconds, `-3`
//! rounds to microseconds, `-9` to whole seconds.

use std::fmt;
use std::sync::LazyLock;

use crate::platform::{PlatformProfile, TimeSetApi};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Rounding exponent for nanosecond timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimestampPrecision(i32);

static CURRENT: LazyLock<TimestampPrecision> =
    LazyLock::new(|| TimestampPrecision::for_profile(PlatformProfile::current()));

impl TimestampPrecision {
    /// 1ns resolution.
    pub const NANOSECOND: Self = Self(0);
    /// 1us resolution.
    pub const MICROSECOND: Self = Self(-3);
    /// 10us resolution.
    pub const TEN_MICROSECONDS: Self = Self(-4);
    /// 1s resolution.
    pub const SECOND: Self = Self(-9);
    /// Fixed rounding for mounted views that do not carry nanosecond mtimes.
    pub const MOUNT_COARSE: Self = Self::TEN_MICROSECONDS;

    /// Build a precision from a raw exponent in `-9..=0`.
    pub fn from_exponent(exponent: i32) -> Option<Self> {
        (-9..=0).contains(&exponent).then_some(Self(exponent))
    }

    /// Precision implied by a time-setting primitive, with an optional
    /// platform override taking priority.
    pub fn resolve(api: TimeSetApi, platform_override: Option<Self>) -> Self {
        if let Some(precision) = platform_override {
            return precision;
        }
        match api {
            TimeSetApi::Nanosecond => Self::NANOSECOND,
            TimeSetApi::Microsecond => Self::MICROSECOND,
            TimeSetApi::Second => Self::SECOND,
        }
    }

    /// Precision for a capability-table row.
    pub fn for_profile(profile: &PlatformProfile) -> Self {
        Self::resolve(profile.time_api, profile.precision_override)
    }

    /// Process-wide precision, selected once.
    pub fn current() -> Self {
        *CURRENT
    }

    /// The raw exponent.
    pub fn exponent(self) -> i32 {
        self.0
    }

    /// Size of one rounding unit in nanoseconds.
    pub fn granularity_ns(self) -> i64 {
        10_i64.pow(self.0.unsigned_abs())
    }

    /// Round `ts_ns` to the nearest unit, ties away from zero.
    ///
    /// Symmetric around zero, so pre-epoch timestamps round the same way as
    /// their positive counterparts. This is not banker's rounding: an exact
    /// half unit always moves outward, so `2.5` units becomes `3` where
    /// round-half-to-even would give `2`.
    pub fn round_ns(self, ts_ns: i64) -> i64 {
        let unit = self.granularity_ns();
        if unit == 1 {
            return ts_ns;
        }
        let quotient = ts_ns / unit;
        let remainder = ts_ns % unit;
        let quotient = if remainder.unsigned_abs() * 2 >= unit.unsigned_abs() {
            quotient + ts_ns.signum()
        } else {
            quotient
        };
        quotient.saturating_mul(unit)
    }

    /// Whether two timestamps are within one unit of each other.
    pub fn same_ts_ns(self, a_ns: i64, b_ns: i64) -> bool {
        a_ns.abs_diff(b_ns) <= self.granularity_ns().unsigned_abs()
    }
}

/// Truncate a nanosecond timestamp to whole seconds (toward zero).
pub fn whole_seconds(ts_ns: i64) -> i64 {
    ts_ns / NANOS_PER_SEC
}

impl fmt::Display for TimestampPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("1ns"),
            -1 => f.write_str("10ns"),
            -2 => f.write_str("100ns"),
            -3 => f.write_str("1us"),
            -4 => f.write_str("10us"),
            -5 => f.write_str("100us"),
            -6 => f.write_str("1ms"),
            -7 => f.write_str("10ms"),
            -8 => f.write_str("100ms"),
            _ => f.write_str("1s"),
        }
    }
}
