//! Launching the mount command.
//!
//! Two strategies, selected by [`SpawnMode`]:
//!
//! - [`Supervised`] runs the command as a child and waits for it. The mount
//!   tool is expected to daemonize itself, so the child exits once the mount
//!   is up (or has failed).
//! - [`DoubleFork`] forks, detaches with `setsid()`, forks again and execs
//!   the command in the grandchild. Nobody waits for the grandchild; the
//!   intermediate child exits at once so it never lingers as a zombie.
//!
//! # Safety
//!
//! Between `fork()` and `exec` the child only makes async-signal-safe calls.
//! Everything that allocates (argument conversion, error messages) happens
//! before the first fork.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io;
use std::process::{Command, Stdio};

use tracing::debug;

/// Point in a launch at which something failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorStage {
    /// Creating the first process.
    Spawn,
    /// Detaching from the session (intermediate child).
    Detach,
    /// Replacing the final process image.
    ///
    /// In double-fork mode this failure is only visible on the grandchild's
    /// stderr.
    ExecFinal,
}

impl fmt::Display for SupervisorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Spawn => "spawn",
            Self::Detach => "detach",
            Self::ExecFinal => "exec",
        })
    }
}

/// A launch failure and the stage it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct LaunchError {
    /// Where it failed
    pub stage: SupervisorStage,
    /// Underlying error
    #[source]
    pub source: io::Error,
}

impl LaunchError {
    fn new(stage: SupervisorStage, source: impl Into<io::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

/// Result of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launched {
    /// The command ran to completion with this exit code (`None` if it was
    /// killed by a signal).
    Exited(Option<i32>),
    /// The command was started and left running on its own.
    Detached,
}

/// Program plus full argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
}

impl Invocation {
    /// Invocation of `program` with `args`.
    pub fn new<I, S>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The program.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Arguments after the program name.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// As a [`Command`].
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }

    /// Program and `argv` as C strings (`argv[0]` is the program).
    ///
    /// Fails with `InvalidInput` if any of them contains a NUL byte.
    #[cfg(unix)]
    fn to_exec_args(&self) -> io::Result<(std::ffi::CString, Vec<std::ffi::CString>)> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let to_c = |s: &OsStr| {
            CString::new(s.as_bytes())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
        };
        let program = to_c(&self.program)?;
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(program.clone());
        for arg in &self.args {
            argv.push(to_c(arg)?);
        }
        Ok((program, argv))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// A strategy for starting the mount command.
pub trait ProcessSupervisor {
    /// Start `invocation`.
    fn launch(&self, invocation: &Invocation) -> Result<Launched, LaunchError>;
}

/// Run as a child and wait for it to exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Supervised;

impl ProcessSupervisor for Supervised {
    fn launch(&self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        debug!(%invocation, "running mount command");
        let status = invocation
            .command()
            .stdin(Stdio::null())
            .status()
            .map_err(|e| {
                // std reports a failed exec through the spawn error
                let stage = match e.kind() {
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => SupervisorStage::ExecFinal,
                    _ => SupervisorStage::Spawn,
                };
                LaunchError::new(stage, e)
            })?;
        Ok(Launched::Exited(status.code()))
    }
}

/// Fork twice and exec in a detached grandchild.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleFork;

/// Written to stderr by the grandchild if exec returns.
#[cfg(unix)]
const EXEC_FAILED_MESSAGE: &[u8] = b"Fatal: mount command did not daemonize properly. Force exiting.\n";

#[cfg(unix)]
impl ProcessSupervisor for DoubleFork {
    fn launch(&self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        use nix::sys::wait::{WaitStatus, waitpid};
        use nix::unistd::{ForkResult, fork, setsid};

        let (program, argv) = invocation
            .to_exec_args()
            .map_err(|e| LaunchError::new(SupervisorStage::Spawn, e))?;
        let argv_ptrs: Vec<*const libc::c_char> = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        debug!(%invocation, "double-forking mount command");
        // SAFETY: the child below only calls async-signal-safe functions
        // (setsid, fork, execvp, write, _exit) on data prepared before the
        // fork; `argv` outlives every use of `argv_ptrs`.
        match unsafe { fork() }.map_err(|e| LaunchError::new(SupervisorStage::Spawn, e))? {
            ForkResult::Parent { child } => {
                match waitpid(child, None).map_err(|e| LaunchError::new(SupervisorStage::Detach, e))? {
                    WaitStatus::Exited(_, 0) => Ok(Launched::Detached),
                    status => Err(LaunchError::new(
                        SupervisorStage::Detach,
                        io::Error::other(format!("intermediate child ended with {status:?}")),
                    )),
                }
            }
            ForkResult::Child => {
                if setsid().is_err() {
                    // SAFETY: terminating the forked child without unwinding.
                    unsafe { libc::_exit(1) }
                }
                // SAFETY: same constraints as the first fork.
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                    Ok(ForkResult::Child) => {}
                    Err(_) => unsafe { libc::_exit(1) },
                }
                // SAFETY: `argv_ptrs` is a null-terminated array of pointers
                // into live C strings. On success this never returns. The
                // message is a static byte string and the grandchild has
                // nothing to clean up.
                unsafe {
                    libc::execvp(program.as_ptr(), argv_ptrs.as_ptr());
                    libc::write(
                        libc::STDERR_FILENO,
                        EXEC_FAILED_MESSAGE.as_ptr().cast(),
                        EXEC_FAILED_MESSAGE.len(),
                    );
                    libc::_exit(0)
                }
            }
        }
    }
}

/// Non-unix fallback: a plain spawn that is never waited on.
#[cfg(not(unix))]
impl ProcessSupervisor for DoubleFork {
    fn launch(&self, invocation: &Invocation) -> Result<Launched, LaunchError> {
        invocation
            .command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::new(SupervisorStage::Spawn, e))?;
        Ok(Launched::Detached)
    }
}

/// How the mount command is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpawnMode {
    /// See [`Supervised`].
    #[default]
    Supervised,
    /// See [`DoubleFork`].
    DoubleFork,
}

impl SpawnMode {
    /// The supervisor implementing this mode.
    pub fn supervisor(self) -> &'static dyn ProcessSupervisor {
        match self {
            Self::Supervised => &Supervised,
            Self::DoubleFork => &DoubleFork,
        }
    }
}
