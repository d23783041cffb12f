//! Unmount runners.
//!
//! - **Linux**: `fusermount -u`, falling back to `umount`
//! - **Other**: `umount`

use std::io;
use std::path::Path;
use std::process::Command;

use tracing::debug;

/// Releases a mount point.
pub trait Unmounter {
    /// Unmount `mountpoint`; returning does not mean the kernel is done yet.
    fn unmount(&self, mountpoint: &Path) -> io::Result<()>;
}

/// Runs the platform's unmount command.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandUnmounter;

impl Unmounter for CommandUnmounter {
    fn unmount(&self, mountpoint: &Path) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        {
            match run_unmount("fusermount", &["-u"], mountpoint) {
                Ok(()) => Ok(()),
                Err(e) => {
                    debug!(mountpoint = %mountpoint.display(), error = %e, "fusermount failed, trying umount");
                    run_unmount("umount", &[], mountpoint)
                }
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            run_unmount("umount", &[], mountpoint)
        }
    }
}

fn run_unmount(program: &str, args: &[&str], mountpoint: &Path) -> io::Result<()> {
    let output = Command::new(program).args(args).arg(mountpoint).output()?;
    if output.status.success() {
        debug!(program, mountpoint = %mountpoint.display(), "unmount command succeeded");
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(io::Error::other(format!(
        "{program} failed for {} ({}): {}",
        mountpoint.display(),
        output.status,
        stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unmounting_plain_directory_fails() {
        let temp = TempDir::new().unwrap();
        assert!(CommandUnmounter.unmount(temp.path()).is_err());
        assert!(temp.path().is_dir());
    }
}
