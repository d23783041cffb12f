//! Empirical filesystem capability probes.
//!
//! Platform names are not enough to know what a filesystem can do: tmpfs,
//! SSHFS and a FUSE mount on the same kernel all differ. Each probe here
//! performs the real operation in a scratch location and only reports
//! support if the effect reads back exactly. Errors mean "not supported"
//! and never escape.
//!
//! Results are memoized per [`CapabilityProbe`]; the process-wide probe
//! behind [`capabilities()`] therefore touches the filesystem at most once
//! per capability.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use nix::sys::stat::Mode;
use tracing::debug;

use crate::platform::PlatformProfile;
use crate::precision::TimestampPrecision;
use crate::scoped::unopened_tempfile;

const NANOS_PER_SEC: i64 = 1_000_000_000;

const UTIME_ATIME: i64 = 1000;
const UTIME_MTIME: i64 = 2000;

// 1999-12-31, 2000-01-01, 2000-01-02 (UTC midnight)
const BIRTH_BIRTHTIME: i64 = 946598400;
const BIRTH_MTIME: i64 = 946684800;
const BIRTH_ATIME: i64 = 946771200;

/// Filesystem features that are probed rather than assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Symbolic links round-trip their target
    Symlinks,
    /// Hard links share an inode and bump the link count
    Hardlinks,
    /// Named pipes can be created
    Fifos,
    /// atime/mtime can be set exactly on a symlink without following it
    UtimeOnSymlinks,
    /// Birth time is tracked separately from mtime
    Birthtime,
    /// Per-entry platform flags can be set
    Lchflags,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Symlinks => "symlinks",
            Self::Hardlinks => "hardlinks",
            Self::Fifos => "fifos",
            Self::UtimeOnSymlinks => "utime",
            Self::Birthtime => "birthtime",
            Self::Lchflags => "lchflags",
        };
        f.write_str(name)
    }
}

/// Stat fields the probes need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStat {
    /// Inode number
    pub ino: u64,
    /// Link count
    pub nlink: u64,
    /// Access time in nanoseconds
    pub atime_ns: i64,
    /// Modification time in nanoseconds
    pub mtime_ns: i64,
    /// Birth time in nanoseconds, when the platform reports one
    pub birthtime_ns: Option<i64>,
}

impl ProbeStat {
    /// Extract probe fields from `std` metadata.
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        Self {
            ino: meta.ino(),
            nlink: meta.nlink(),
            atime_ns: meta
                .atime()
                .saturating_mul(NANOS_PER_SEC)
                .saturating_add(meta.atime_nsec()),
            mtime_ns: meta
                .mtime()
                .saturating_mul(NANOS_PER_SEC)
                .saturating_add(meta.mtime_nsec()),
            birthtime_ns: meta.created().ok().map(system_time_ns),
        }
    }
}

fn system_time_ns(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos()).map_or(i64::MIN, |ns| -ns),
    }
}

fn secs_to_ns(secs: i64) -> i64 {
    secs * NANOS_PER_SEC
}

/// Filesystem primitives used by the probes.
///
/// [`OsProbeFs`] performs the real syscalls. Tests substitute
/// implementations that fail, count calls or fake partial support.
pub trait ProbeFs {
    /// Whether a hard-link primitive exists at all.
    fn has_link_primitive(&self) -> bool;
    /// Whether the stat structure carries a birth time field.
    fn has_birthtime_field(&self) -> bool;
    /// Whether a platform-flags primitive exists.
    fn has_flags_primitive(&self) -> bool;
    /// Create a symlink at `link` pointing to `target`.
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;
    /// Read a symlink's target.
    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;
    /// Create an empty regular file.
    fn create_file(&self, path: &Path) -> io::Result<()>;
    /// Create a hard link.
    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()>;
    /// Create a named pipe.
    fn mkfifo(&self, path: &Path) -> io::Result<()>;
    /// Stat without following symlinks.
    fn lstat(&self, path: &Path) -> io::Result<ProbeStat>;
    /// Stat following symlinks.
    fn stat(&self, path: &Path) -> io::Result<ProbeStat>;
    /// Set atime and mtime (whole seconds) without following symlinks.
    fn set_times_nofollow(&self, path: &Path, atime_secs: i64, mtime_secs: i64) -> io::Result<()>;
    /// Set the "no dump" platform flag.
    fn set_nodump(&self, path: &Path) -> io::Result<()>;
}

/// [`ProbeFs`] backed by the running OS.
#[derive(Debug, Clone, Copy)]
pub struct OsProbeFs {
    profile: &'static PlatformProfile,
}

impl OsProbeFs {
    /// Probe primitives gated by an explicit capability-table row.
    pub fn for_profile(profile: &'static PlatformProfile) -> Self {
        Self { profile }
    }
}

impl Default for OsProbeFs {
    fn default() -> Self {
        Self::for_profile(PlatformProfile::current())
    }
}

impl ProbeFs for OsProbeFs {
    fn has_link_primitive(&self) -> bool {
        self.profile.link_primitive
    }

    fn has_birthtime_field(&self) -> bool {
        self.profile.birthtime_field
    }

    fn has_flags_primitive(&self) -> bool {
        self.profile.has_flags_primitive()
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        fs::read_link(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        fs::File::create(path).map(drop)
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(original, link)
    }

    fn mkfifo(&self, path: &Path) -> io::Result<()> {
        nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
    }

    fn lstat(&self, path: &Path) -> io::Result<ProbeStat> {
        fs::symlink_metadata(path).map(|m| ProbeStat::from_metadata(&m))
    }

    fn stat(&self, path: &Path) -> io::Result<ProbeStat> {
        fs::metadata(path).map(|m| ProbeStat::from_metadata(&m))
    }

    fn set_times_nofollow(&self, path: &Path, atime_secs: i64, mtime_secs: i64) -> io::Result<()> {
        filetime::set_symlink_file_times(
            path,
            FileTime::from_unix_time(atime_secs, 0),
            FileTime::from_unix_time(mtime_secs, 0),
        )
    }

    fn set_nodump(&self, path: &Path) -> io::Result<()> {
        crate::inspect::set_nodump(path)
    }
}

/// Every capability flag plus the timestamp precision, resolved together.
///
/// Holding one of these proves every probe has already run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// See [`CapabilityProbe::symlinks_supported`]
    pub symlinks: bool,
    /// See [`CapabilityProbe::hardlinks_supported`]
    pub hardlinks: bool,
    /// See [`CapabilityProbe::fifos_supported`]
    pub fifos: bool,
    /// See [`CapabilityProbe::utime_fully_supported`]
    pub utime: bool,
    /// See [`CapabilityProbe::birthtime_fully_supported`]
    pub birthtime: bool,
    /// See [`CapabilityProbe::lchflags_supported`]
    pub lchflags: bool,
    /// Process-wide mtime rounding
    pub precision: TimestampPrecision,
}

impl Capabilities {
    /// Look up one flag.
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Symlinks => self.symlinks,
            Capability::Hardlinks => self.hardlinks,
            Capability::Fifos => self.fifos,
            Capability::UtimeOnSymlinks => self.utime,
            Capability::Birthtime => self.birthtime,
            Capability::Lchflags => self.lchflags,
        }
    }
}

/// Memoizing capability prober.
pub struct CapabilityProbe<F = OsProbeFs> {
    fs: F,
    precision: TimestampPrecision,
    symlinks: OnceLock<bool>,
    hardlinks: OnceLock<bool>,
    fifos: OnceLock<bool>,
    utime: OnceLock<bool>,
    birthtime: OnceLock<bool>,
    lchflags: OnceLock<bool>,
}

impl<F: ProbeFs> CapabilityProbe<F> {
    /// Probe through `fs`, using the process-wide timestamp precision.
    pub fn new(fs: F) -> Self {
        Self::with_precision(fs, TimestampPrecision::current())
    }

    /// Probe through `fs` with an explicit precision.
    pub fn with_precision(fs: F, precision: TimestampPrecision) -> Self {
        Self {
            fs,
            precision,
            symlinks: OnceLock::new(),
            hardlinks: OnceLock::new(),
            fifos: OnceLock::new(),
            utime: OnceLock::new(),
            birthtime: OnceLock::new(),
            lchflags: OnceLock::new(),
        }
    }

    /// The primitives this probe runs against.
    pub fn fs(&self) -> &F {
        &self.fs
    }

    fn cached(
        &self,
        cell: &OnceLock<bool>,
        capability: Capability,
        probe: impl FnOnce(&F) -> io::Result<bool>,
    ) -> bool {
        *cell.get_or_init(|| {
            let supported = probe(&self.fs).unwrap_or_else(|e| {
                debug!(%capability, error = %e, "probe operation failed");
                false
            });
            debug!(%capability, supported, "capability probed");
            supported
        })
    }

    /// Symlinks can be created and read back without following them.
    pub fn symlinks_supported(&self) -> bool {
        self.cached(&self.symlinks, Capability::Symlinks, |fs| {
            let target = Path::new("somewhere");
            let scratch = unopened_tempfile()?;
            fs.symlink(target, scratch.path())?;
            fs.lstat(scratch.path())?;
            Ok(fs.read_link(scratch.path())? == target)
        })
    }

    /// Hard links share an inode and report a link count of two.
    pub fn hardlinks_supported(&self) -> bool {
        self.cached(&self.hardlinks, Capability::Hardlinks, |fs| {
            if !fs.has_link_primitive() {
                return Ok(false);
            }
            let first = unopened_tempfile()?;
            let second = unopened_tempfile()?;
            fs.create_file(first.path())?;
            fs.hard_link(first.path(), second.path())?;
            let a = fs.stat(first.path())?;
            let b = fs.stat(second.path())?;
            Ok(a.nlink == 2 && b.nlink == 2 && a.ino == b.ino)
        })
    }

    /// Named pipes can be created.
    pub fn fifos_supported(&self) -> bool {
        self.cached(&self.fifos, Capability::Fifos, |fs| {
            let scratch = unopened_tempfile()?;
            fs.mkfifo(scratch.path())?;
            Ok(true)
        })
    }

    /// Symlink-aware timestamp updates read back exactly.
    ///
    /// Some filesystems (SSHFS) accept the call but drop or approximate the
    /// values, which this detects.
    pub fn utime_fully_supported(&self) -> bool {
        self.cached(&self.utime, Capability::UtimeOnSymlinks, |fs| {
            let scratch = unopened_tempfile()?;
            self.create_probe_entry(fs, scratch.path())?;
            fs.set_times_nofollow(scratch.path(), UTIME_ATIME, UTIME_MTIME)?;
            let st = fs.lstat(scratch.path())?;
            Ok(st.atime_ns == secs_to_ns(UTIME_ATIME) && st.mtime_ns == secs_to_ns(UTIME_MTIME))
        })
    }

    /// Birth time is tracked on its own.
    ///
    /// Sets an early mtime (which a birth-time-tracking filesystem pulls
    /// birth time back to), then a later mtime with the same atime. Only a
    /// filesystem that kept the early value as birth time passes; one that
    /// mirrors mtime, or keeps the creation instant, does not.
    pub fn birthtime_fully_supported(&self) -> bool {
        self.cached(&self.birthtime, Capability::Birthtime, |fs| {
            if !fs.has_birthtime_field() {
                return Ok(false);
            }
            let scratch = unopened_tempfile()?;
            self.create_probe_entry(fs, scratch.path())?;
            fs.set_times_nofollow(scratch.path(), BIRTH_ATIME, BIRTH_BIRTHTIME)?;
            fs.set_times_nofollow(scratch.path(), BIRTH_ATIME, BIRTH_MTIME)?;
            let st = fs.lstat(scratch.path())?;
            Ok(st.birthtime_ns == Some(secs_to_ns(BIRTH_BIRTHTIME))
                && st.mtime_ns == secs_to_ns(BIRTH_MTIME)
                && st.atime_ns == secs_to_ns(BIRTH_ATIME))
        })
    }

    /// Platform flags can be set on a regular file.
    pub fn lchflags_supported(&self) -> bool {
        self.cached(&self.lchflags, Capability::Lchflags, |fs| {
            if !fs.has_flags_primitive() {
                return Ok(false);
            }
            let scratch = unopened_tempfile()?;
            fs.create_file(scratch.path())?;
            fs.set_nodump(scratch.path())?;
            Ok(true)
        })
    }

    /// Query one capability by name.
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Symlinks => self.symlinks_supported(),
            Capability::Hardlinks => self.hardlinks_supported(),
            Capability::Fifos => self.fifos_supported(),
            Capability::UtimeOnSymlinks => self.utime_fully_supported(),
            Capability::Birthtime => self.birthtime_fully_supported(),
            Capability::Lchflags => self.lchflags_supported(),
        }
    }

    /// Run every probe (or reuse cached results) and return the lot.
    pub fn snapshot(&self) -> Capabilities {
        Capabilities {
            symlinks: self.symlinks_supported(),
            hardlinks: self.hardlinks_supported(),
            fifos: self.fifos_supported(),
            utime: self.utime_fully_supported(),
            birthtime: self.birthtime_fully_supported(),
            lchflags: self.lchflags_supported(),
            precision: self.precision,
        }
    }

    // SSHFS and friends reject utime on symlinks, so fall back to a file there
    fn create_probe_entry(&self, fs: &F, path: &Path) -> io::Result<()> {
        if self.symlinks_supported() {
            fs.symlink(Path::new("something"), path)
        } else {
            fs.create_file(path)
        }
    }
}

static OS_PROBE: LazyLock<CapabilityProbe<OsProbeFs>> =
    LazyLock::new(|| CapabilityProbe::new(OsProbeFs::default()));

/// The process-wide probe against the real filesystem.
pub fn os_probe() -> &'static CapabilityProbe<OsProbeFs> {
    &OS_PROBE
}

/// Process-wide capability snapshot (probes on first call).
pub fn capabilities() -> Capabilities {
    OS_PROBE.snapshot()
}

/// Process-wide [`CapabilityProbe::symlinks_supported`].
pub fn symlinks_supported() -> bool {
    OS_PROBE.symlinks_supported()
}

/// Process-wide [`CapabilityProbe::hardlinks_supported`].
pub fn hardlinks_supported() -> bool {
    OS_PROBE.hardlinks_supported()
}

/// Process-wide [`CapabilityProbe::fifos_supported`].
pub fn fifos_supported() -> bool {
    OS_PROBE.fifos_supported()
}

/// Process-wide [`CapabilityProbe::utime_fully_supported`].
pub fn utime_fully_supported() -> bool {
    OS_PROBE.utime_fully_supported()
}

/// Process-wide [`CapabilityProbe::birthtime_fully_supported`].
pub fn birthtime_fully_supported() -> bool {
    OS_PROBE.birthtime_fully_supported()
}

/// Process-wide [`CapabilityProbe::lchflags_supported`].
pub fn lchflags_supported() -> bool {
    OS_PROBE.lchflags_supported()
}
