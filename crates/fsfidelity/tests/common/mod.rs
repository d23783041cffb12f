//! Shared helpers for fsfidelity integration tests.

// Not every test file uses every helper
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::Path;

use filetime::FileTime;
use nix::sys::stat::Mode;
use tracing_subscriber::EnvFilter;

/// Route `tracing` output through the test writer; honors `RUST_LOG`.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fixed mtime with a non-zero sub-second part.
pub fn fixed_mtime(offset_secs: i64) -> FileTime {
    FileTime::from_unix_time(1_600_000_000 + offset_secs, 123_456_789)
}

/// Populate `root` with a small tree of regular files, a subdirectory, a
/// symlink and (when `with_fifo`) a FIFO.
pub fn build_sample_tree(root: &Path, with_fifo: bool) {
    fs::create_dir_all(root.join("dir2")).unwrap();
    fs::write(root.join("file1"), b"foo").unwrap();
    fs::write(root.join("dir2").join("file2"), vec![b'X'; 10_000]).unwrap();
    fs::set_permissions(root.join("file1"), fs::Permissions::from_mode(0o640)).unwrap();
    symlink("file1", root.join("link1")).unwrap();
    if with_fifo {
        nix::unistd::mkfifo(&root.join("fifo1"), Mode::S_IRUSR | Mode::S_IWUSR).unwrap();
    }
    stamp_tree(root);
}

/// Give every entry below `root` (and `root` itself) a deterministic mtime.
///
/// Directories are stamped after their children so creating entries does
/// not disturb the stamp.
pub fn stamp_tree(root: &Path) {
    let mut entries: Vec<_> = walk(root);
    entries.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for (i, path) in entries.iter().enumerate() {
        let t = fixed_mtime(i64::try_from(i).unwrap());
        filetime::set_symlink_file_times(path, t, t).unwrap();
    }
}

/// Copy `src` into the new directory `dst`, preserving modes and mtimes.
pub fn copy_tree(src: &Path, dst: &Path) {
    fs::create_dir(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from).unwrap();
        let file_type = meta.file_type();
        if file_type.is_dir() {
            copy_tree(&from, &to);
        } else if file_type.is_symlink() {
            symlink(fs::read_link(&from).unwrap(), &to).unwrap();
        } else if file_type.is_file() {
            fs::copy(&from, &to).unwrap();
        } else {
            nix::unistd::mkfifo(&to, Mode::from_bits_truncate(meta.permissions().mode())).unwrap();
        }
        if !file_type.is_symlink() {
            fs::set_permissions(&to, meta.permissions()).unwrap();
        }
        let mtime = FileTime::from_last_modification_time(&meta);
        filetime::set_symlink_file_times(&to, mtime, mtime).unwrap();
    }
    let meta = fs::metadata(src).unwrap();
    fs::set_permissions(dst, meta.permissions()).unwrap();
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_mtime(dst, mtime).unwrap();
}

fn walk(root: &Path) -> Vec<std::path::PathBuf> {
    let mut out = vec![root.to_path_buf()];
    let meta = fs::symlink_metadata(root).unwrap();
    if meta.is_dir() {
        for entry in fs::read_dir(root).unwrap() {
            out.extend(walk(&entry.unwrap().path()));
        }
    }
    out
}
