//! Directory-tree equivalence checking.
//!
//! [`DirectoryComparator::compare`] walks two trees level by level. Each
//! level first gets a structural diff ([`dircmp`]); only if both sides hold
//! the same names with the same contents are per-entry [`AttrVector`]s
//! built and compared. The first mismatch, depth-first in name order, is
//! returned.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

use crate::inspect::{EntryInspector, EntryMeta, OsInspector, XattrMap};
use crate::precision::{TimestampPrecision, whole_seconds};
use crate::probe::{self, Capabilities};
use crate::xattrs::StripSecurityLabel;

const COMPARE_BUF_SIZE: usize = 8 * 1024;

/// How to decide whether the right-hand tree is a mounted view.
///
/// A mounted view reports a synthetic link count for directories, so
/// directory link counts are not compared against one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountedView {
    /// Infer per entry: the two sides live on different devices.
    ///
    /// This also fires for two unrelated trees on different real
    /// filesystems; use [`MountedView::Never`] there.
    #[default]
    Detect,
    /// The right-hand tree is always a mounted view.
    Right,
    /// Neither side is a mounted view.
    Never,
}

impl MountedView {
    fn applies(self, left: &EntryMeta, right: &EntryMeta) -> bool {
        match self {
            Self::Detect => left.dev != right.dev,
            Self::Right => true,
            Self::Never => false,
        }
    }
}

/// Options for [`DirectoryComparator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompareOptions {
    /// Do not compare platform flags.
    pub ignore_flags: bool,
    /// Do not compare extended attributes.
    pub ignore_xattrs: bool,
    /// Compare mtimes in whole seconds only.
    pub ignore_ns: bool,
    /// Mounted-view detection policy.
    pub mounted_view: MountedView,
    /// Whether the mounted view carries nanosecond mtimes.
    ///
    /// When false, mtimes on a mounted view are rounded to
    /// [`TimestampPrecision::MOUNT_COARSE`].
    pub mount_has_ns_mtime: bool,
}

impl Default for CompareOptions {
    fn default() -> Self {
        Self {
            ignore_flags: false,
            ignore_xattrs: false,
            ignore_ns: false,
            mounted_view: MountedView::Detect,
            mount_has_ns_mtime: true,
        }
    }
}

impl CompareOptions {
    /// Sets whether platform flags are ignored.
    #[must_use]
    pub fn ignore_flags(mut self, ignore: bool) -> Self {
        self.ignore_flags = ignore;
        self
    }

    /// Sets whether extended attributes are ignored.
    #[must_use]
    pub fn ignore_xattrs(mut self, ignore: bool) -> Self {
        self.ignore_xattrs = ignore;
        self
    }

    /// Sets whole-second mtime comparison.
    #[must_use]
    pub fn ignore_ns(mut self, ignore: bool) -> Self {
        self.ignore_ns = ignore;
        self
    }

    /// Sets the mounted-view policy.
    #[must_use]
    pub fn mounted_view(mut self, view: MountedView) -> Self {
        self.mounted_view = view;
        self
    }

    /// Sets whether the mounted view carries nanosecond mtimes.
    #[must_use]
    pub fn mount_has_ns_mtime(mut self, has_ns: bool) -> Self {
        self.mount_has_ns_mtime = has_ns;
        self
    }
}

/// Ordered metadata compared per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrVector {
    /// Entry name
    pub name: OsString,
    /// `st_mode` as an octal string (`0o100644`)
    pub mode: String,
    /// Owner id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Device id, only kept for character and block devices
    pub rdev: Option<u64>,
    /// Link count, dropped for directories on a mounted view
    pub nlink: Option<u64>,
    /// Platform flags
    pub flags: Option<u64>,
    /// Rounded mtime in nanoseconds
    pub mtime_ns: Option<i64>,
    /// Extended attributes without the security label
    pub xattrs: Option<XattrMap>,
}

impl AttrVector {
    /// The fields every comparison includes.
    ///
    /// `rdev` is nulled unless `meta` is a character or block device; it is
    /// meaningless (and differs between filesystems) for anything else.
    pub fn base(name: OsString, meta: &EntryMeta, include_nlink: bool) -> Self {
        Self {
            name,
            mode: format!("{:#o}", meta.mode),
            uid: meta.uid,
            gid: meta.gid,
            rdev: meta.is_device().then_some(meta.rdev),
            nlink: include_nlink.then_some(meta.nlink),
            flags: None,
            mtime_ns: None,
            xattrs: None,
        }
    }
}

fn fmt_opt<T: fmt::Display>(f: &mut fmt::Formatter<'_>, value: Option<&T>) -> fmt::Result {
    match value {
        Some(v) => write!(f, ", {v}"),
        None => f.write_str(", None"),
    }
}

impl fmt::Display for AttrVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}",
            self.name.to_string_lossy(),
            self.mode,
            self.uid,
            self.gid
        )?;
        fmt_opt(f, self.rdev.as_ref())?;
        fmt_opt(f, self.nlink.as_ref())?;
        fmt_opt(f, self.flags.as_ref())?;
        fmt_opt(f, self.mtime_ns.as_ref())?;
        if let Some(xattrs) = &self.xattrs {
            f.write_str(", {")?;
            for (i, (k, v)) in xattrs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: {}", String::from_utf8_lossy(k), v.escape_ascii())?;
            }
            f.write_str("}")?;
        }
        f.write_str("]")
    }
}

/// Why two trees are not equivalent.
#[derive(Debug, Error)]
pub enum ComparisonFailure {
    /// The two directories do not hold the same names and contents.
    #[error(
        "{} and {} differ: left only {:?}, right only {:?}, differing {:?}, funny {:?}",
        left.display(),
        right.display(),
        left_only,
        right_only,
        diff_files,
        funny_files
    )]
    Structure {
        /// Left directory
        left: PathBuf,
        /// Right directory
        right: PathBuf,
        /// Names only on the left
        left_only: Vec<OsString>,
        /// Names only on the right
        right_only: Vec<OsString>,
        /// Regular files whose bytes differ
        diff_files: Vec<OsString>,
        /// Entries that could not be classified
        funny_files: Vec<OsString>,
    },

    /// A common entry has different metadata.
    #[error(
        "attributes of {} and {} differ\n  left:  {left}\n  right: {right}",
        left_path.display(),
        right_path.display()
    )]
    Attributes {
        /// Entry on the left
        left_path: PathBuf,
        /// Entry on the right
        right_path: PathBuf,
        /// Left attribute vector
        left: Box<AttrVector>,
        /// Right attribute vector
        right: Box<AttrVector>,
    },

    /// A directory could not be listed or an entry could not be inspected.
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
}

fn unreadable(path: &Path) -> impl FnOnce(io::Error) -> ComparisonFailure + '_ {
    move |source| ComparisonFailure::Unreadable {
        path: path.to_path_buf(),
        source,
    }
}

/// Single-level structural diff of two directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirDiff {
    /// Names only on the left
    pub left_only: Vec<OsString>,
    /// Names only on the right
    pub right_only: Vec<OsString>,
    /// Names on both sides
    pub common: Vec<OsString>,
    /// Common regular files whose bytes differ
    pub diff_files: Vec<OsString>,
    /// Common entries that could not be classified
    pub funny_files: Vec<OsString>,
    /// Common names that are real (non-symlink) directories on both sides
    pub subdirs: Vec<OsString>,
}

impl DirDiff {
    /// No one-sided, differing or funny entries.
    pub fn is_clean(&self) -> bool {
        self.left_only.is_empty()
            && self.right_only.is_empty()
            && self.diff_files.is_empty()
            && self.funny_files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Other,
}

fn kind_following_links(path: &Path) -> Option<Kind> {
    let meta = fs::metadata(path).ok()?;
    Some(if meta.is_dir() {
        Kind::Dir
    } else if meta.is_file() {
        Kind::File
    } else {
        Kind::Other
    })
}

fn list_names(dir: &Path) -> Result<BTreeSet<OsString>, ComparisonFailure> {
    fs::read_dir(dir)
        .and_then(|entries| {
            entries
                .map(|entry| entry.map(|e| e.file_name()))
                .collect::<io::Result<BTreeSet<_>>>()
        })
        .map_err(unreadable(dir))
}

fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut ra = BufReader::with_capacity(COMPARE_BUF_SIZE, File::open(a)?);
    let mut rb = BufReader::with_capacity(COMPARE_BUF_SIZE, File::open(b)?);
    let mut buf_a = [0u8; COMPARE_BUF_SIZE];
    let mut buf_b = [0u8; COMPARE_BUF_SIZE];
    loop {
        let n = ra.read(&mut buf_a)?;
        if n == 0 {
            // sizes matched, so the right side must be exhausted too
            return Ok(rb.read(&mut buf_b[..1])? == 0);
        }
        rb.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Structural diff of one directory level.
///
/// Common names are classified by following symlinks: both directories are
/// fine here (recursion decides later), both regular files are compared
/// byte for byte, matching special files are left to attribute comparison,
/// and a type mismatch or a read error makes the entry funny.
pub fn dircmp(left: &Path, right: &Path) -> Result<DirDiff, ComparisonFailure> {
    let left_names = list_names(left)?;
    let right_names = list_names(right)?;

    let mut diff = DirDiff {
        left_only: left_names.difference(&right_names).cloned().collect(),
        right_only: right_names.difference(&left_names).cloned().collect(),
        common: left_names.intersection(&right_names).cloned().collect(),
        ..DirDiff::default()
    };

    for name in &diff.common {
        let a = left.join(name);
        let b = right.join(name);
        match (kind_following_links(&a), kind_following_links(&b)) {
            (Some(Kind::File), Some(Kind::File)) => match files_equal(&a, &b) {
                Ok(true) => {}
                Ok(false) => diff.diff_files.push(name.clone()),
                Err(e) => {
                    trace!(path = %a.display(), error = %e, "content comparison failed");
                    diff.funny_files.push(name.clone());
                }
            },
            (Some(x), Some(y)) if x == y => {}
            // dangling on both sides: attribute comparison covers it
            (None, None) => {}
            _ => diff.funny_files.push(name.clone()),
        }
        let real_dir = |p: &Path| fs::symlink_metadata(p).is_ok_and(|m| m.is_dir());
        if real_dir(&a) && real_dir(&b) {
            diff.subdirs.push(name.clone());
        }
    }
    Ok(diff)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MtimeRounding {
    WholeSeconds,
    Precision(TimestampPrecision),
}

impl MtimeRounding {
    fn apply(self, mtime_ns: i64) -> i64 {
        match self {
            Self::WholeSeconds => whole_seconds(mtime_ns),
            Self::Precision(p) => p.round_ns(mtime_ns),
        }
    }
}

/// Recursive directory comparator.
pub struct DirectoryComparator<I = OsInspector> {
    options: CompareOptions,
    capabilities: Capabilities,
    inspector: I,
}

impl DirectoryComparator<OsInspector> {
    /// Comparator using the process-wide capabilities and OS metadata.
    ///
    /// Probes the filesystem on first use in the process.
    pub fn new(options: CompareOptions) -> Self {
        Self::with_parts(options, probe::capabilities(), OsInspector)
    }
}

impl<I: EntryInspector> DirectoryComparator<I> {
    /// Comparator with explicit capabilities and metadata source.
    pub fn with_parts(options: CompareOptions, capabilities: Capabilities, inspector: I) -> Self {
        Self {
            options,
            capabilities,
            inspector,
        }
    }

    /// The options this comparator was built with.
    pub fn options(&self) -> &CompareOptions {
        &self.options
    }

    /// Compare two trees; the first difference found is returned.
    pub fn compare(&self, left: &Path, right: &Path) -> Result<(), ComparisonFailure> {
        debug!(left = %left.display(), right = %right.display(), "comparing directories");
        let diff = dircmp(left, right)?;
        if !diff.is_clean() {
            return Err(ComparisonFailure::Structure {
                left: left.to_path_buf(),
                right: right.to_path_buf(),
                left_only: diff.left_only,
                right_only: diff.right_only,
                diff_files: diff.diff_files,
                funny_files: diff.funny_files,
            });
        }
        for name in &diff.common {
            self.compare_entry(left, right, name)?;
        }
        for name in &diff.subdirs {
            self.compare(&left.join(name), &right.join(name))?;
        }
        Ok(())
    }

    fn compare_entry(&self, left: &Path, right: &Path, name: &OsString) -> Result<(), ComparisonFailure> {
        let left_path = left.join(name);
        let right_path = right.join(name);
        let left_meta = EntryMeta::lstat(&left_path).map_err(unreadable(&left_path))?;
        let right_meta = EntryMeta::lstat(&right_path).map_err(unreadable(&right_path))?;
        let mounted = self.options.mounted_view.applies(&left_meta, &right_meta);

        let left_vec = self.attr_vector(name, &left_path, &left_meta, mounted)?;
        let right_vec = self.attr_vector(name, &right_path, &right_meta, mounted)?;
        if left_vec != right_vec {
            return Err(ComparisonFailure::Attributes {
                left_path,
                right_path,
                left: Box::new(left_vec),
                right: Box::new(right_vec),
            });
        }
        trace!(entry = %left_path.display(), "attributes match");
        Ok(())
    }

    /// Mtime policy for an entry pair.
    ///
    /// `None` when utime is not fully supported: the restore side cannot
    /// have set mtimes exactly, so they are not compared at all.
    fn mtime_rounding(&self, mounted: bool) -> Option<MtimeRounding> {
        if !self.capabilities.utime {
            return None;
        }
        Some(if self.options.ignore_ns {
            MtimeRounding::WholeSeconds
        } else if mounted && !self.options.mount_has_ns_mtime {
            MtimeRounding::Precision(TimestampPrecision::MOUNT_COARSE)
        } else {
            MtimeRounding::Precision(self.capabilities.precision)
        })
    }

    /// Build the normalized attribute vector of one side of an entry pair.
    pub fn attr_vector(
        &self,
        name: &OsString,
        path: &Path,
        meta: &EntryMeta,
        mounted: bool,
    ) -> Result<AttrVector, ComparisonFailure> {
        let include_nlink = !(mounted && meta.is_dir());
        let mut vector = AttrVector::base(name.clone(), meta, include_nlink);
        if !self.options.ignore_flags {
            vector.flags = Some(self.inspector.flags(path, meta));
        }
        vector.mtime_ns = self.mtime_rounding(mounted).map(|r| r.apply(meta.mtime_ns));
        if !self.options.ignore_xattrs {
            let xattrs = self.inspector.xattrs(path).map_err(unreadable(path))?;
            vector.xattrs = Some(xattrs.without_security_label());
        }
        Ok(vector)
    }
}

/// Compare two trees with the process-wide comparator.
pub fn compare_dirs(left: &Path, right: &Path, options: CompareOptions) -> Result<(), ComparisonFailure> {
    DirectoryComparator::new(options).compare(left, right)
}

/// Panic with the first difference between two trees.
#[track_caller]
pub fn assert_dirs_equal(left: &Path, right: &Path, options: CompareOptions) {
    if let Err(failure) = compare_dirs(left, right, options) {
        panic!("directory trees differ: {failure}");
    }
}
