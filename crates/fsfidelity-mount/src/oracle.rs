//! Mount-point detection.

use std::path::Path;

/// Answers whether a path is currently a mount point.
pub trait MountOracle {
    /// Whether `path` is a mount point right now.
    fn is_mount(&self, path: &Path) -> bool;
}

impl<F: Fn(&Path) -> bool> MountOracle for F {
    fn is_mount(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Device/inode based detection against the real filesystem.
///
/// A path is a mount point when it is not a symlink and either lives on a
/// different device than `path/..`, or shares its inode (the root of a
/// filesystem is its own parent). Any stat failure means "not mounted".
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct OsMountOracle;

#[cfg(unix)]
impl MountOracle for OsMountOracle {
    fn is_mount(&self, path: &Path) -> bool {
        use std::os::unix::fs::MetadataExt;

        let Ok(meta) = std::fs::symlink_metadata(path) else {
            return false;
        };
        if meta.file_type().is_symlink() {
            return false;
        }
        let Ok(parent) = std::fs::symlink_metadata(path.join("..")) else {
            return false;
        };
        meta.dev() != parent.dev() || meta.ino() == parent.ino()
    }
}
