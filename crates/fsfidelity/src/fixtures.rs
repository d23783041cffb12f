//! Test fixtures that need more than a temp directory.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, warn};

use crate::platform::{ImmutableCommand, Platform, PlatformProfile};
use crate::scoped::Scoped;

/// Errors from fixture setup.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The fixture cannot be built on this platform.
    #[error("{operation} is not supported on platform {platform}")]
    Unsupported {
        /// Fixture that was requested
        operation: &'static str,
        /// Platform it was requested on
        platform: Platform,
    },
}

impl FixtureError {
    /// Whether the calling test should be skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }
}

/// Unwrap a fixture result, or return early from the test when the fixture
/// is unsupported here.
///
/// Any other error panics.
#[macro_export]
macro_rules! skip_unsupported {
    ($fixture:expr) => {
        match $fixture {
            Ok(value) => value,
            Err(e) if $crate::fixtures::FixtureError::is_skip(&e) => {
                eprintln!("Skipping test: {e}");
                return;
            }
            Err(e) => panic!("fixture setup failed: {e}"),
        }
    };
}

/// Target of a [`read_only`] guard.
#[derive(Debug)]
pub struct ReadOnlyPath {
    path: PathBuf,
    immutable: ImmutableCommand,
}

impl ReadOnlyPath {
    /// The protected path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Guard returned by [`read_only`].
pub type ReadOnlyGuard = Scoped<ReadOnlyPath, fn(ReadOnlyPath)>;

/// Run a fixture command; failures are logged, never fatal.
///
/// `LD_PRELOAD` is cleared so a fakeroot session cannot swallow the change.
fn run_quietly(program: &str, args: &[&str], path: &Path) {
    let status = Command::new(program)
        .args(args)
        .arg(path)
        .env("LD_PRELOAD", "")
        .status();
    match status {
        Ok(status) if status.success() => {
            debug!(program, ?args, path = %path.display(), "fixture command succeeded");
        }
        Ok(status) => {
            warn!(program, ?args, path = %path.display(), %status, "fixture command failed");
        }
        Err(e) => {
            warn!(program, ?args, path = %path.display(), error = %e, "fixture command could not run");
        }
    }
}

fn restore_writable(target: ReadOnlyPath) {
    run_quietly(target.immutable.program, &[target.immutable.clear], &target.path);
    run_quietly("chmod", &["-R", "ugo+w"], &target.path);
}

/// Make `path` read-only until the guard drops.
///
/// Write permission is removed recursively, then the path is marked
/// immutable so the restriction also holds for root. Release clears the
/// immutable bit first and restores write permission afterwards.
pub fn read_only(path: &Path) -> Result<ReadOnlyGuard, FixtureError> {
    read_only_with(path, PlatformProfile::current())
}

/// [`read_only`] for an explicit platform profile.
pub fn read_only_with(path: &Path, profile: &PlatformProfile) -> Result<ReadOnlyGuard, FixtureError> {
    let immutable = profile.immutable.ok_or(FixtureError::Unsupported {
        operation: "read-only directories",
        platform: profile.platform,
    })?;
    run_quietly("chmod", &["-R", "ugo-w"], path);
    run_quietly(immutable.program, &[immutable.set], path);
    Ok(Scoped::new(
        ReadOnlyPath {
            path: path.to_path_buf(),
            immutable,
        },
        restore_writable as fn(ReadOnlyPath),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode()
    }

    #[test]
    fn test_unsupported_platform_is_skip() {
        let temp = TempDir::new().unwrap();
        let profile = PlatformProfile::for_platform(Platform::Windows);
        let err = read_only_with(temp.path(), profile).unwrap_err();
        assert!(err.is_skip());
        assert!(err.to_string().contains("windows"), "{err}");
    }

    fn skipping_scenario(profile: &PlatformProfile, reached: &mut bool) {
        let temp = TempDir::new().unwrap();
        let _guard = crate::skip_unsupported!(read_only_with(temp.path(), profile));
        *reached = true;
    }

    #[test]
    fn test_skip_macro_returns_early() {
        let mut reached = false;
        skipping_scenario(PlatformProfile::for_platform(Platform::Windows), &mut reached);
        assert!(!reached);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_only_removes_and_restores_write_bits() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        std::fs::create_dir(&repo).unwrap();
        std::fs::write(repo.join("data"), b"x").unwrap();
        {
            let guard = skip_unsupported!(read_only(&repo));
            assert_eq!(guard.path(), repo);
            assert_eq!(mode(&repo.join("data")) & 0o222, 0);
            assert_eq!(mode(&repo) & 0o222, 0);
        }
        assert_ne!(mode(&repo.join("data")) & 0o200, 0);
        assert_ne!(mode(&repo) & 0o200, 0);
    }
}
