//! Mount-state synchronization for tests that drive an external mount tool.
//!
//! Mount tools usually daemonize: the command returns as soon as the daemon
//! is forked, well before the kernel shows the mount. Tests that read the
//! mountpoint straight away race the daemon. This crate closes the gap by
//! polling the mountpoint until it is (or is no longer) a mount.
//!
//! # Components
//!
//! - [`MountSynchronizer`] - Launches the mount command and waits for the
//!   mount to appear; [`MountGuard`] tears it down again
//! - [`poll_until`] / [`wait_for_mountstate`] - Deadline-bounded polling
//! - [`ProcessSupervisor`] - How the command is started
//!   ([`Supervised`] or [`DoubleFork`])
//! - [`MountOracle`] - Mount-point detection ([`OsMountOracle`])
//! - [`Unmounter`] - Unmount runner ([`CommandUnmounter`])
//!
//! # Example
//!
//! ```no_run
//! use fsfidelity_mount::{MountCommand, MountRequest, MountSynchronizer};
//!
//! let sync = MountSynchronizer::new(MountCommand::new("borg"));
//! let listing = sync
//!     .with_mount("/backups/repo", None, &[], MountRequest::default(), |mnt| {
//!         std::fs::read_dir(mnt).map(Iterator::count)
//!     })
//!     .expect("mount failed");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod oracle;
mod poll;
mod supervisor;
mod synchronizer;
mod timing;
mod unmount;

#[cfg(unix)]
pub use oracle::OsMountOracle;
pub use oracle::MountOracle;
pub use poll::poll_until;
pub use supervisor::{
    DoubleFork, Invocation, LaunchError, Launched, ProcessSupervisor, SpawnMode, Supervised,
    SupervisorStage,
};
pub use synchronizer::{
    ExitCode, MountCommand, MountDirection, MountError, MountGuard, MountRequest,
    MountSynchronizer, wait_for_mountstate,
};
pub use timing::{
    DEFAULT_MOUNT_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_UNMOUNT_GRACE, MountTiming,
    TIMEOUT_ENV_VAR,
};
pub use unmount::{CommandUnmounter, Unmounter};
