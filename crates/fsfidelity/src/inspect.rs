//! Per-entry metadata that `std::fs::Metadata` does not expose.
//!
//! Extended attributes and platform flags are read through the
//! [`EntryInspector`] seam so comparisons can run against stubbed metadata.
//! [`OsInspector`] is the thin OS-backed default: it never follows symlinks
//! and reports "nothing" (empty map, zero flags) where the filesystem or
//! platform has no support.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Extended attributes keyed by name, values as raw bytes.
pub type XattrMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Subset of `lstat` fields the comparator looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// `st_mode`, including the file type bits
    pub mode: u32,
    /// `st_uid`
    pub uid: u32,
    /// `st_gid`
    pub gid: u32,
    /// `st_dev` of the containing filesystem
    pub dev: u64,
    /// `st_rdev`
    pub rdev: u64,
    /// `st_nlink`
    pub nlink: u64,
    /// `st_mtime` in nanoseconds since the epoch
    pub mtime_ns: i64,
}

const S_IFMT: u32 = libc::S_IFMT as u32;
const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFCHR: u32 = libc::S_IFCHR as u32;
const S_IFBLK: u32 = libc::S_IFBLK as u32;
const S_IFLNK: u32 = libc::S_IFLNK as u32;

impl EntryMeta {
    /// Extract the compared fields from `lstat` metadata.
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            dev: meta.dev(),
            rdev: meta.rdev(),
            nlink: meta.nlink(),
            mtime_ns: meta
                .mtime()
                .saturating_mul(1_000_000_000)
                .saturating_add(meta.mtime_nsec()),
        }
    }

    /// `lstat` a path.
    pub fn lstat(path: &Path) -> io::Result<Self> {
        std::fs::symlink_metadata(path).map(|m| Self::from_metadata(&m))
    }

    /// File type bits of `mode`.
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    /// Whether the entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    /// Whether the entry is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }

    /// Whether the entry is a character or block special file.
    pub fn is_device(&self) -> bool {
        matches!(self.file_type(), S_IFCHR | S_IFBLK)
    }
}

/// Source of extended attributes and platform flags.
pub trait EntryInspector {
    /// All extended attributes of `path`, without following symlinks.
    fn xattrs(&self, path: &Path) -> io::Result<XattrMap>;

    /// Platform flags of `path` as an opaque comparable value.
    fn flags(&self, path: &Path, meta: &EntryMeta) -> u64;
}

/// OS-backed [`EntryInspector`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OsInspector;

impl EntryInspector for OsInspector {
    fn xattrs(&self, path: &Path) -> io::Result<XattrMap> {
        if !xattr::SUPPORTED_PLATFORM {
            return Ok(XattrMap::new());
        }
        let names = match xattr::list(path) {
            Ok(names) => names,
            Err(e) if is_unsupported(&e) => return Ok(XattrMap::new()),
            Err(e) => return Err(e),
        };
        let mut attrs = XattrMap::new();
        for name in names {
            // None: removed between list and get
            if let Some(value) = xattr::get(path, &name)? {
                attrs.insert(name.as_bytes().to_vec(), value);
            }
        }
        Ok(attrs)
    }

    fn flags(&self, path: &Path, meta: &EntryMeta) -> u64 {
        sys::get_flags(path, meta)
    }
}

fn is_unsupported(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOTSUP | libc::EPERM | libc::ENOSYS)
    ) || e.kind() == io::ErrorKind::Unsupported
}

/// Set the "no dump" flag on a regular file.
///
/// Used to check whether the filesystem accepts platform flags at all.
pub fn set_nodump(path: &Path) -> io::Result<()> {
    sys::set_nodump(path)
}

#[cfg(target_os = "linux")]
mod sys {
    use super::EntryMeta;
    use std::fs::OpenOptions;
    use std::io;
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;

    const FS_NODUMP_FL: libc::c_int = 0x0000_0040;

    pub(super) fn get_flags(path: &Path, meta: &EntryMeta) -> u64 {
        // opening device nodes can stall on absent hardware; symlinks can't be opened
        if meta.is_device() || meta.is_symlink() {
            return 0;
        }
        let Ok(file) = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOFOLLOW)
            .open(path)
        else {
            return 0;
        };
        let mut flags: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), libc::FS_IOC_GETFLAGS, &raw mut flags) };
        if rc == -1 {
            return 0;
        }
        u64::from(flags.cast_unsigned())
    }

    pub(super) fn set_nodump(path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_NOFOLLOW)
            .open(path)?;
        let fd = file.as_raw_fd();
        let mut flags: libc::c_int = 0;
        if unsafe { libc::ioctl(fd, libc::FS_IOC_GETFLAGS, &raw mut flags) } == -1 {
            return Err(io::Error::last_os_error());
        }
        flags |= FS_NODUMP_FL;
        if unsafe { libc::ioctl(fd, libc::FS_IOC_SETFLAGS, &raw const flags) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::EntryMeta;
    use std::ffi::CString;
    use std::io;
    use std::os::macos::fs::MetadataExt;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    const UF_NODUMP: libc::c_uint = 0x0000_0001;

    pub(super) fn get_flags(path: &Path, _meta: &EntryMeta) -> u64 {
        std::fs::symlink_metadata(path).map_or(0, |m| u64::from(m.st_flags()))
    }

    pub(super) fn set_nodump(path: &Path) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        if unsafe { libc::lchflags(c_path.as_ptr(), UF_NODUMP.into()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(any(target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
mod sys {
    use super::EntryMeta;
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    #[cfg(target_os = "freebsd")]
    use std::os::freebsd::fs::MetadataExt;
    #[cfg(target_os = "netbsd")]
    use std::os::netbsd::fs::MetadataExt;
    #[cfg(target_os = "openbsd")]
    use std::os::openbsd::fs::MetadataExt;

    const UF_NODUMP: u32 = 0x0000_0001;

    pub(super) fn get_flags(path: &Path, _meta: &EntryMeta) -> u64 {
        std::fs::symlink_metadata(path).map_or(0, |m| u64::from(m.st_flags()))
    }

    pub(super) fn set_nodump(path: &Path) -> io::Result<()> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
        if unsafe { libc::chflags(c_path.as_ptr(), UF_NODUMP.into()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
mod sys {
    use super::EntryMeta;
    use std::io;
    use std::path::Path;

    pub(super) fn get_flags(_path: &Path, _meta: &EntryMeta) -> u64 {
        0
    }

    pub(super) fn set_nodump(_path: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "platform flags are not supported on this platform",
        ))
    }
}
