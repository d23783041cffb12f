//! Mount lifecycle around an external mount command.
//!
//! [`MountSynchronizer::mount`] prepares a mountpoint, launches
//! `<program> [base args] --repo=<location> mount <mountpoint> [options]`,
//! and blocks until the mountpoint is actually mounted. The returned
//! [`MountGuard`] reverses all of it: unmount, wait until unmounted, remove
//! the mountpoint, then pause briefly so the daemon can exit.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::oracle::MountOracle;
use crate::poll::poll_until;
use crate::supervisor::{Invocation, LaunchError, Launched, SpawnMode};
use crate::timing::MountTiming;
use crate::unmount::Unmounter;

/// Exit status of the mount command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitCode {
    /// Exit code 0
    #[default]
    Success,
    /// Exit code 1
    Warning,
    /// Exit code 2; no mount is expected to exist afterwards
    Error,
}

impl ExitCode {
    /// Numeric exit code.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Which state a timed-out wait was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountDirection {
    /// Waiting for the mountpoint to become mounted.
    Mount,
    /// Waiting for the mountpoint to be released.
    Unmount,
}

impl fmt::Display for MountDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mount => "mount",
            Self::Unmount => "umount",
        })
    }
}

/// Errors from mount synchronization.
#[derive(Debug, Error)]
pub enum MountError {
    /// The mountpoint could not be created.
    #[error("cannot create mountpoint {}: {source}", path.display())]
    Mountpoint {
        /// Requested mountpoint
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The mount command could not be started.
    #[error("cannot launch mount command: {0}")]
    Launch(#[from] LaunchError),

    /// The mount command exited with a code other than the expected one.
    #[error("mount command exited with {}, expected {expected}", describe_code(*actual))]
    UnexpectedExit {
        /// Expected exit status
        expected: ExitCode,
        /// Actual exit code, `None` if killed by a signal
        actual: Option<i32>,
    },

    /// The mountpoint did not reach the wanted state in time.
    #[error("Waiting for {direction} of {} timed out after {waited:?}", mountpoint.display())]
    Timeout {
        /// State that was waited for
        direction: MountDirection,
        /// Mountpoint being watched
        mountpoint: PathBuf,
        /// How long the wait lasted
        waited: Duration,
    },

    /// The unmount command failed.
    #[error("cannot unmount {}: {source}", mountpoint.display())]
    Unmount {
        /// Mountpoint
        mountpoint: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The mountpoint directory could not be removed after unmounting.
    #[error("cannot remove mountpoint {}: {source}", mountpoint.display())]
    Cleanup {
        /// Mountpoint
        mountpoint: PathBuf,
        /// Underlying error
        source: io::Error,
    },
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
}

/// Block until `oracle` reports `mounted` for `mountpoint`.
pub fn wait_for_mountstate(
    oracle: &impl MountOracle,
    mountpoint: &Path,
    mounted: bool,
    timing: &MountTiming,
) -> Result<(), MountError> {
    if poll_until(timing.timeout, timing.interval, || {
        oracle.is_mount(mountpoint) == mounted
    }) {
        return Ok(());
    }
    Err(MountError::Timeout {
        direction: if mounted {
            MountDirection::Mount
        } else {
            MountDirection::Unmount
        },
        mountpoint: mountpoint.to_path_buf(),
        waited: timing.timeout,
    })
}

/// The mount tool and the arguments that precede `--repo=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCommand {
    program: OsString,
    base_args: Vec<OsString>,
}

impl MountCommand {
    /// Command running `program` with no leading arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Appends a leading argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.base_args.push(arg.into());
        self
    }

    /// Appends leading arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.base_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Full invocation for mounting `location` at `mountpoint`.
    pub fn invocation(&self, location: &str, mountpoint: &Path, options: &[&str]) -> Invocation {
        let mut args = self.base_args.clone();
        args.push(format!("--repo={location}").into());
        args.push("mount".into());
        args.push(mountpoint.as_os_str().to_owned());
        args.extend(options.iter().map(OsString::from));
        Invocation::new(self.program.clone(), args)
    }
}

/// Per-call mount expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountRequest {
    /// Exit status the command must return (supervised mode only).
    pub expected_exit: ExitCode,
    /// How the command is started.
    pub spawn: SpawnMode,
}

impl MountRequest {
    /// Sets the expected exit status.
    #[must_use]
    pub fn expect_exit(mut self, code: ExitCode) -> Self {
        self.expected_exit = code;
        self
    }

    /// Sets the spawn mode.
    #[must_use]
    pub fn spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn = mode;
        self
    }
}

/// Mounts through an external command and waits for mount-state changes.
#[derive(Debug, Clone)]
pub struct MountSynchronizer<O, U> {
    command: MountCommand,
    timing: MountTiming,
    oracle: O,
    unmounter: U,
}

#[cfg(unix)]
impl MountSynchronizer<crate::oracle::OsMountOracle, crate::unmount::CommandUnmounter> {
    /// Synchronizer using real mount detection and the platform unmount command.
    pub fn new(command: MountCommand) -> Self {
        Self::with_parts(
            command,
            MountTiming::default(),
            crate::oracle::OsMountOracle,
            crate::unmount::CommandUnmounter,
        )
    }
}

impl<O: MountOracle, U: Unmounter> MountSynchronizer<O, U> {
    /// Synchronizer with explicit parts.
    pub fn with_parts(command: MountCommand, timing: MountTiming, oracle: O, unmounter: U) -> Self {
        Self {
            command,
            timing,
            oracle,
            unmounter,
        }
    }

    /// Replaces the timing.
    #[must_use]
    pub fn timing(mut self, timing: MountTiming) -> Self {
        self.timing = timing;
        self
    }

    /// The oracle used for mount-state checks.
    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// The unmounter used on teardown.
    pub fn unmounter(&self) -> &U {
        &self.unmounter
    }

    /// Mount `location` and wait until it is visible.
    ///
    /// With `mountpoint` unset, a fresh temporary directory is used (and
    /// removed on teardown). A given mountpoint must not exist yet.
    ///
    /// On any error the freshly created mountpoint is removed again, unless
    /// something is still mounted on it.
    ///
    /// When the request expects [`ExitCode::Error`], the command's failure
    /// is the whole point: the returned guard is inert and the mountpoint is
    /// left for the caller to clean up.
    pub fn mount(
        &self,
        location: &str,
        mountpoint: Option<&Path>,
        options: &[&str],
        request: MountRequest,
    ) -> Result<MountGuard<'_, O, U>, MountError> {
        let mountpoint = prepare_mountpoint(mountpoint)?;
        let invocation = self.command.invocation(location, &mountpoint, options);
        info!(mountpoint = %mountpoint.display(), mode = ?request.spawn, "mounting");

        let launched = match request.spawn.supervisor().launch(&invocation) {
            Ok(launched) => launched,
            Err(e) => {
                discard_mountpoint(&mountpoint);
                return Err(e.into());
            }
        };
        match launched {
            Launched::Exited(code) if code != Some(request.expected_exit.code()) => {
                discard_mountpoint(&mountpoint);
                return Err(MountError::UnexpectedExit {
                    expected: request.expected_exit,
                    actual: code,
                });
            }
            Launched::Exited(_) if request.expected_exit == ExitCode::Error => {
                info!(mountpoint = %mountpoint.display(), "mount failed as expected");
                return Ok(MountGuard {
                    synchronizer: self,
                    mountpoint,
                    state: GuardState::Failed,
                });
            }
            Launched::Exited(_) | Launched::Detached => {}
        }

        if let Err(e) = wait_for_mountstate(&self.oracle, &mountpoint, true, &self.timing) {
            discard_mountpoint(&mountpoint);
            return Err(e);
        }
        info!(mountpoint = %mountpoint.display(), "mounted");
        Ok(MountGuard {
            synchronizer: self,
            mountpoint,
            state: GuardState::Mounted,
        })
    }

    /// Mount, run `f` with the mountpoint, then tear down.
    ///
    /// The result of `f` is returned only if teardown also succeeds.
    pub fn with_mount<R>(
        &self,
        location: &str,
        mountpoint: Option<&Path>,
        options: &[&str],
        request: MountRequest,
        f: impl FnOnce(&Path) -> R,
    ) -> Result<R, MountError> {
        let guard = self.mount(location, mountpoint, options, request)?;
        let result = f(guard.mountpoint());
        guard.finish()?;
        Ok(result)
    }

    fn teardown(&self, mountpoint: &Path) -> Result<(), MountError> {
        self.unmounter
            .unmount(mountpoint)
            .map_err(|source| MountError::Unmount {
                mountpoint: mountpoint.to_path_buf(),
                source,
            })?;
        wait_for_mountstate(&self.oracle, mountpoint, false, &self.timing)?;
        fs::remove_dir(mountpoint).map_err(|source| MountError::Cleanup {
            mountpoint: mountpoint.to_path_buf(),
            source,
        })?;
        info!(mountpoint = %mountpoint.display(), "unmounted");
        thread::sleep(self.timing.grace);
        Ok(())
    }
}

fn prepare_mountpoint(requested: Option<&Path>) -> Result<PathBuf, MountError> {
    match requested {
        Some(path) => fs::create_dir(path)
            .map(|()| path.to_path_buf())
            .map_err(|source| MountError::Mountpoint {
                path: path.to_path_buf(),
                source,
            }),
        None => tempfile::Builder::new()
            .prefix("fsfidelity-mnt-")
            .tempdir()
            .map(tempfile::TempDir::keep)
            .map_err(|source| MountError::Mountpoint {
                path: std::env::temp_dir(),
                source,
            }),
    }
}

/// Best-effort removal of a mountpoint after a failed mount.
fn discard_mountpoint(mountpoint: &Path) {
    if let Err(e) = fs::remove_dir(mountpoint) {
        warn!(mountpoint = %mountpoint.display(), error = %e, "failed to remove mountpoint");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Mounted,
    Failed,
    Finished,
}

/// A live mount; tears it down on [`finish`](Self::finish) or drop.
pub struct MountGuard<'s, O: MountOracle, U: Unmounter> {
    synchronizer: &'s MountSynchronizer<O, U>,
    mountpoint: PathBuf,
    state: GuardState,
}

impl<O: MountOracle, U: Unmounter> MountGuard<'_, O, U> {
    /// The mountpoint.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Whether a mount is held (false for an expected failure).
    pub fn is_mounted(&self) -> bool {
        self.state == GuardState::Mounted
    }

    /// Unmount, wait, remove the mountpoint and pause for the grace period.
    ///
    /// Does nothing for a guard from an expected failure.
    pub fn finish(mut self) -> Result<(), MountError> {
        if self.state != GuardState::Mounted {
            return Ok(());
        }
        self.state = GuardState::Finished;
        self.synchronizer.teardown(&self.mountpoint)
    }
}

impl<O: MountOracle, U: Unmounter> Drop for MountGuard<'_, O, U> {
    fn drop(&mut self) {
        if self.state != GuardState::Mounted {
            return;
        }
        self.state = GuardState::Finished;
        if let Err(e) = self.synchronizer.teardown(&self.mountpoint) {
            error!(mountpoint = %self.mountpoint.display(), error = %e, "mount teardown failed");
        }
    }
}

impl<O: MountOracle, U: Unmounter> fmt::Debug for MountGuard<'_, O, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountGuard")
            .field("mountpoint", &self.mountpoint)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
