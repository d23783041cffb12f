//! Acquire/release guards.
//!
//! Scratch paths, working-directory switches and environment overrides all
//! follow the same shape: acquire something, run the body, always restore.
//! [`Scoped`] is that shape; the functions below are its instances.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A value whose release function runs exactly once when the guard drops,
/// including during unwinding.
pub struct Scoped<T, R: FnOnce(T)> {
    inner: Option<(T, R)>,
}

impl<T, R: FnOnce(T)> Scoped<T, R> {
    /// Wrap an already-acquired value.
    pub fn new(value: T, release: R) -> Self {
        Self {
            inner: Some((value, release)),
        }
    }

    /// Run `acquire`; on success the result is released by `release` later.
    ///
    /// If `acquire` fails nothing was taken, so `release` never runs.
    pub fn acquire<E>(acquire: impl FnOnce() -> Result<T, E>, release: R) -> Result<Self, E> {
        acquire().map(|value| Self::new(value, release))
    }

    /// Release now instead of at end of scope.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some((value, release)) = self.inner.take() {
            release(value);
        }
    }
}

impl<T, R: FnOnce(T)> Deref for Scoped<T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            Some((value, _)) => value,
            None => unreachable!("released guard is consumed by release()"),
        }
    }
}

impl<T: fmt::Debug, R: FnOnce(T)> fmt::Debug for Scoped<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.inner.as_ref().map(|(value, _)| value);
        f.debug_tuple("Scoped").field(&value).finish()
    }
}

impl<T, R: FnOnce(T)> Drop for Scoped<T, R> {
    fn drop(&mut self) {
        self.run_release();
    }
}

/// A path inside a private temporary directory that has not been created.
#[derive(Debug)]
pub struct ScratchPath {
    dir: TempDir,
    path: PathBuf,
}

impl ScratchPath {
    /// The unopened path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory holding the path.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Guard returned by [`unopened_tempfile`].
pub type UnopenedTempFile = Scoped<ScratchPath, fn(ScratchPath)>;

fn close_scratch(scratch: ScratchPath) {
    let dir = scratch.dir.path().to_path_buf();
    if let Err(e) = scratch.dir.close() {
        tracing::warn!(dir = %dir.display(), error = %e, "failed to remove scratch directory");
    }
}

/// Reserve a fresh path named `file` in a new temporary directory.
///
/// Nothing exists at the path yet; the whole directory is removed when the
/// guard drops.
pub fn unopened_tempfile() -> io::Result<UnopenedTempFile> {
    Scoped::acquire(
        || {
            let dir = tempfile::Builder::new().prefix("fsfidelity-").tempdir()?;
            let path = dir.path().join("file");
            Ok(ScratchPath { dir, path })
        },
        close_scratch as fn(ScratchPath),
    )
}

/// Switch the working directory until the guard drops.
///
/// The guard derefs to the directory that was current before the switch.
pub fn change_dir(dir: &Path) -> io::Result<Scoped<PathBuf, impl FnOnce(PathBuf) + use<>>> {
    Scoped::acquire(
        || {
            let previous = std::env::current_dir()?;
            std::env::set_current_dir(dir)?;
            Ok(previous)
        },
        |previous: PathBuf| {
            if let Err(e) = std::env::set_current_dir(&previous) {
                tracing::warn!(dir = %previous.display(), error = %e, "failed to restore working directory");
            }
        },
    )
}

/// Previous values of overridden environment variables, `None` when unset.
pub type SavedEnv = Vec<(OsString, Option<OsString>)>;

/// Override environment variables until the guard drops.
///
/// A `None` value removes the variable for the duration of the scope.
/// Variables are restored to their previous value, or removed if they were
/// unset before. A key listed twice ends up in its state from before the
/// first override.
pub fn set_env_vars(
    vars: &[(&str, Option<&str>)],
) -> Scoped<SavedEnv, impl FnOnce(SavedEnv) + use<>> {
    let mut saved = Vec::with_capacity(vars.len());
    for (key, value) in vars {
        saved.push((OsString::from(key), std::env::var_os(key)));
        // SAFETY: callers use this from single-threaded test scenarios; no
        // other thread reads the environment while the override is applied.
        unsafe {
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
        }
    }
    Scoped::new(saved, |saved: SavedEnv| {
        for (key, previous) in saved.into_iter().rev() {
            // SAFETY: see above.
            unsafe {
                match previous {
                    Some(v) => std::env::set_var(&key, v),
                    None => std::env::remove_var(&key),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::cell::Cell;

    #[test]
    fn test_release_runs_once_on_drop() {
        let count = Cell::new(0);
        {
            let guard = Scoped::new(5, |_| count.set(count.get() + 1));
            assert_eq!(*guard, 5);
        }
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_explicit_release() {
        let count = Cell::new(0);
        let guard = Scoped::new((), |()| count.set(count.get() + 1));
        guard.release();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_failed_acquire_skips_release() {
        let count = Cell::new(0);
        let result = Scoped::acquire(|| Err::<u8, _>("nope"), |_| count.set(count.get() + 1));
        assert!(result.is_err());
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn test_release_runs_during_unwind() {
        let count = Cell::new(0);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = Scoped::new((), |()| count.set(count.get() + 1));
            panic!("scenario failed");
        }));
        assert!(outcome.is_err());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_unopened_tempfile_is_removed() {
        let dir;
        {
            let scratch = unopened_tempfile().unwrap();
            assert!(!scratch.path().exists());
            assert!(scratch.dir().is_dir());
            std::fs::write(scratch.path(), b"x").unwrap();
            dir = scratch.dir().to_path_buf();
        }
        assert!(!dir.exists());
    }

    #[test]
    #[serial]
    fn test_env_override_restores() {
        let key = "FSFIDELITY_SCOPED_TEST_VAR";
        {
            let _guard = set_env_vars(&[(key, Some("inner"))]);
            assert_eq!(std::env::var(key).unwrap(), "inner");
        }
        assert!(std::env::var_os(key).is_none());
    }

    #[test]
    #[serial]
    fn test_env_removal_restores() {
        let key = "FSFIDELITY_SCOPED_REMOVED_VAR";
        // SAFETY: env-touching tests are serialized.
        unsafe { std::env::set_var(key, "outer") };
        {
            let _guard = set_env_vars(&[(key, None)]);
            assert!(std::env::var_os(key).is_none());
        }
        assert_eq!(std::env::var(key).unwrap(), "outer");
        // SAFETY: as above.
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    #[serial]
    fn test_env_repeated_key_restores_original() {
        let key = "FSFIDELITY_SCOPED_REPEATED_VAR";
        {
            let _guard = set_env_vars(&[(key, Some("a")), (key, Some("b"))]);
            assert_eq!(std::env::var(key).unwrap(), "b");
        }
        assert!(std::env::var_os(key).is_none());
    }

    #[test]
    #[serial]
    fn test_change_dir_restores() {
        let temp = TempDir::new().unwrap();
        let before = std::env::current_dir().unwrap();
        {
            let guard = change_dir(temp.path()).unwrap();
            assert_eq!(*guard, before);
            assert_eq!(
                std::env::current_dir().unwrap(),
                temp.path().canonicalize().unwrap()
            );
        }
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_change_dir_to_missing_dir_fails() {
        let temp = TempDir::new().unwrap();
        let before = std::env::current_dir().unwrap();
        assert!(change_dir(&temp.path().join("missing")).is_err());
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn test_debug_shows_value() {
        let guard = Scoped::new(7, |_| {});
        assert_eq!(format!("{guard:?}"), "Scoped(Some(7))");
    }
}
