//! Platform capability table.
//!
//! Every OS-dependent behavior that the probes, the comparator and the
//! fixtures depend on is declared once in [`PROFILES`], keyed by [`Platform`].
//! The table is resolved into a [`PlatformProfile`] the first time it is
//! needed and never consulted by platform name again.

use std::fmt;
use std::sync::LazyLock;

use crate::precision::TimestampPrecision;

/// Operating system families with distinct filesystem behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Linux and Android
    Linux,
    /// macOS and iOS
    MacOs,
    /// FreeBSD
    FreeBsd,
    /// NetBSD
    NetBsd,
    /// OpenBSD
    OpenBsd,
    /// illumos / Solaris (OpenIndiana)
    Illumos,
    /// Windows
    Windows,
    /// WASI targets
    Wasi,
    /// Anything not listed above
    Other,
}

impl Platform {
    /// The platform this process was compiled for.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    /// Map an `std::env::consts::OS` identifier onto a platform family.
    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" | "android" => Self::Linux,
            "macos" | "ios" => Self::MacOs,
            "freebsd" => Self::FreeBsd,
            "netbsd" => Self::NetBsd,
            "openbsd" => Self::OpenBsd,
            "illumos" | "solaris" => Self::Illumos,
            "windows" => Self::Windows,
            "wasi" => Self::Wasi,
            _ => Self::Other,
        }
    }

    /// Short lowercase identifier, used in log fields and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::FreeBsd => "freebsd",
            Self::NetBsd => "netbsd",
            Self::OpenBsd => "openbsd",
            Self::Illumos => "illumos",
            Self::Windows => "windows",
            Self::Wasi => "wasi",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finest-resolution timestamp-setting primitive the OS exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSetApi {
    /// `utimensat` / `futimens`
    Nanosecond,
    /// `utimes`
    Microsecond,
    /// `utime` only
    Second,
}

/// How per-entry platform flags are read and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagsPrimitive {
    /// No flags support; flag attributes compare as zero.
    None,
    /// `FS_IOC_GETFLAGS` / `FS_IOC_SETFLAGS` ioctls (Linux)
    Ioctl,
    /// `st_flags` and `chflags` / `lchflags` (BSD family, macOS)
    Chflags,
}

/// External command pair that toggles the immutable bit on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmutableCommand {
    /// Program to run (`chattr`, `chflags`, `chmod`)
    pub program: &'static str,
    /// Argument that sets the immutable bit
    pub set: &'static str,
    /// Argument that clears the immutable bit
    pub clear: &'static str,
}

const CHATTR: ImmutableCommand = ImmutableCommand {
    program: "chattr",
    set: "+i",
    clear: "-i",
};

const CHFLAGS: ImmutableCommand = ImmutableCommand {
    program: "chflags",
    set: "uchg",
    clear: "nouchg",
};

const SOLARIS_CHMOD: ImmutableCommand = ImmutableCommand {
    program: "chmod",
    set: "S+vimmutable",
    clear: "S-vimmutable",
};

/// Resolved filesystem behavior for one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformProfile {
    /// Platform this row describes
    pub platform: Platform,
    /// Timestamp-setting primitive used to derive the default precision
    pub time_api: TimeSetApi,
    /// Observed quirk that overrides the precision derived from `time_api`
    pub precision_override: Option<TimestampPrecision>,
    /// Whether a hard-link primitive exists at all
    pub link_primitive: bool,
    /// Whether the stat structure carries a birth time field
    pub birthtime_field: bool,
    /// Flags primitive (the `has_lchflags` candidate)
    pub flags: FlagsPrimitive,
    /// Command used to simulate a read-only directory, if any
    pub immutable: Option<ImmutableCommand>,
}

const fn row(
    platform: Platform,
    time_api: TimeSetApi,
    birthtime_field: bool,
    flags: FlagsPrimitive,
    immutable: Option<ImmutableCommand>,
) -> PlatformProfile {
    PlatformProfile {
        platform,
        time_api,
        precision_override: None,
        link_primitive: true,
        birthtime_field,
        flags,
        immutable,
    }
}

/// The capability table.
pub const PROFILES: &[PlatformProfile] = &[
    row(Platform::Linux, TimeSetApi::Nanosecond, false, FlagsPrimitive::Ioctl, Some(CHATTR)),
    row(Platform::MacOs, TimeSetApi::Nanosecond, true, FlagsPrimitive::Chflags, Some(CHFLAGS)),
    row(Platform::FreeBsd, TimeSetApi::Nanosecond, true, FlagsPrimitive::Chflags, Some(CHFLAGS)),
    // utimensat is accepted but anything finer than 10us is not honored
    PlatformProfile {
        precision_override: Some(TimestampPrecision::TEN_MICROSECONDS),
        ..row(Platform::NetBsd, TimeSetApi::Nanosecond, true, FlagsPrimitive::Chflags, Some(CHFLAGS))
    },
    row(Platform::OpenBsd, TimeSetApi::Nanosecond, true, FlagsPrimitive::Chflags, Some(CHFLAGS)),
    row(Platform::Illumos, TimeSetApi::Nanosecond, false, FlagsPrimitive::None, Some(SOLARIS_CHMOD)),
    row(Platform::Windows, TimeSetApi::Second, true, FlagsPrimitive::None, None),
    PlatformProfile {
        link_primitive: false,
        ..row(Platform::Wasi, TimeSetApi::Second, false, FlagsPrimitive::None, None)
    },
    row(Platform::Other, TimeSetApi::Microsecond, false, FlagsPrimitive::None, None),
];

static CURRENT: LazyLock<&'static PlatformProfile> =
    LazyLock::new(|| PlatformProfile::for_platform(Platform::current()));

impl PlatformProfile {
    /// Look up the table row for `platform`.
    ///
    /// Platforms without a dedicated row get the conservative `Other` row.
    pub fn for_platform(platform: Platform) -> &'static Self {
        PROFILES
            .iter()
            .find(|p| p.platform == platform)
            .or_else(|| PROFILES.iter().find(|p| p.platform == Platform::Other))
            .unwrap_or(&PROFILES[PROFILES.len() - 1])
    }

    /// Profile of the running platform, resolved once per process.
    pub fn current() -> &'static Self {
        *CURRENT
    }

    /// Whether an `lchflags`-equivalent is available on this platform.
    ///
    /// This only says the primitive exists; see
    /// [`CapabilityProbe::lchflags_supported`](crate::probe::CapabilityProbe::lchflags_supported)
    /// for whether the filesystem actually accepts it.
    pub fn has_flags_primitive(&self) -> bool {
        self.flags != FlagsPrimitive::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_os_maps_known_identifiers() {
        assert_eq!(Platform::from_os("linux"), Platform::Linux);
        assert_eq!(Platform::from_os("android"), Platform::Linux);
        assert_eq!(Platform::from_os("macos"), Platform::MacOs);
        assert_eq!(Platform::from_os("netbsd"), Platform::NetBsd);
        assert_eq!(Platform::from_os("solaris"), Platform::Illumos);
        assert_eq!(Platform::from_os("haiku"), Platform::Other);
    }

    #[test]
    fn test_every_platform_has_a_row() {
        for platform in [
            Platform::Linux,
            Platform::MacOs,
            Platform::FreeBsd,
            Platform::NetBsd,
            Platform::OpenBsd,
            Platform::Illumos,
            Platform::Windows,
            Platform::Wasi,
            Platform::Other,
        ] {
            assert_eq!(PlatformProfile::for_platform(platform).platform, platform);
        }
    }

    #[test]
    fn test_only_netbsd_overrides_precision() {
        let overridden: Vec<_> = PROFILES
            .iter()
            .filter(|p| p.precision_override.is_some())
            .map(|p| p.platform)
            .collect();
        assert_eq!(overridden, vec![Platform::NetBsd]);
    }

    #[test]
    fn test_immutable_commands() {
        let linux = PlatformProfile::for_platform(Platform::Linux);
        assert_eq!(linux.immutable.map(|c| c.program), Some("chattr"));
        let illumos = PlatformProfile::for_platform(Platform::Illumos);
        assert_eq!(illumos.immutable.map(|c| c.set), Some("S+vimmutable"));
        assert!(PlatformProfile::for_platform(Platform::Windows).immutable.is_none());
    }

    #[test]
    fn test_current_matches_build_target() {
        assert_eq!(PlatformProfile::current().platform, Platform::current());
    }
}
