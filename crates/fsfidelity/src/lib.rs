//! Filesystem fidelity checks for backup/restore test suites.
//!
//! A restore is only as good as the metadata it brings back, and what "the
//! same metadata" means depends on what the filesystem can store. This crate
//! answers both questions.
//!
//! # Components
//!
//! ## Capabilities
//!
//! - [`CapabilityProbe`] - Memoized probes for symlinks, hardlinks, FIFOs,
//!   symlink utime, birth time and `lchflags`
//! - [`TimestampPrecision`] - Granularity at which timestamps survive a
//!   round trip on this platform
//! - [`PlatformProfile`] - Per-platform capability table
//!
//! ## Comparison
//!
//! - [`DirectoryComparator`] - Recursive tree equivalence with per-entry
//!   attribute vectors
//! - [`StripSecurityLabel`] - Drops `security.selinux` noise from xattrs
//!
//! ## Fixtures
//!
//! - [`Scoped`] - Acquire/release guard
//! - [`unopened_tempfile`], [`change_dir`], [`set_env_vars`], [`read_only`]
//!
//! # Example
//!
//! ```no_run
//! use fsfidelity::{CompareOptions, DirectoryComparator, MountedView};
//! use std::path::Path;
//!
//! let options = CompareOptions::default()
//!     .ignore_flags(true)
//!     .mounted_view(MountedView::Never);
//! DirectoryComparator::new(options)
//!     .compare(Path::new("input"), Path::new("output"))
//!     .expect("restored tree differs");
//! ```

#![cfg(unix)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compare;
pub mod fixtures;
pub mod inspect;
pub mod platform;
pub mod precision;
pub mod probe;
pub mod scoped;
pub mod xattrs;

pub use compare::{
    AttrVector, CompareOptions, ComparisonFailure, DirDiff, DirectoryComparator, MountedView,
    assert_dirs_equal, compare_dirs, dircmp,
};
pub use fixtures::{FixtureError, ReadOnlyGuard, read_only};
pub use inspect::{EntryInspector, EntryMeta, OsInspector, XattrMap};
pub use platform::{FlagsPrimitive, Platform, PlatformProfile, TimeSetApi};
pub use precision::TimestampPrecision;
pub use probe::{Capabilities, Capability, CapabilityProbe, OsProbeFs, ProbeFs, capabilities};
pub use scoped::{Scoped, UnopenedTempFile, change_dir, set_env_vars, unopened_tempfile};
pub use xattrs::{SECURITY_LABEL_KEY, StripSecurityLabel, no_selinux};
