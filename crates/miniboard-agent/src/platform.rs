//! Process signalling, selected once per host.
//!
//! The supervisor never branches on the operating system itself: it asks
//! [`detect`] for a [`ProcessControl`] at construction and fails right there
//! when the host has none.

use std::{io, path::Path, sync::Arc};

use crate::error::SupervisorError;

pub trait ProcessControl: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Adjust the launch command, e.g. to put the child in its own process group.
    fn configure(&self, cmd: &mut tokio::process::Command);

    /// Ctrl-C equivalent for a single, possibly foreign, pid.
    fn interrupt(&self, pid: u32) -> io::Result<()>;

    /// Ctrl-C equivalent for the process group led by one of our children.
    fn interrupt_group(&self, pid: u32) -> io::Result<()>;

    fn kill_group(&self, pid: u32) -> io::Result<()>;

    fn is_alive(&self, pid: u32) -> bool;
}

pub fn detect() -> Result<Arc<dyn ProcessControl>, SupervisorError> {
    #[cfg(unix)]
    {
        Ok(Arc::new(UnixControl))
    }

    #[cfg(not(unix))]
    {
        Err(SupervisorError::UnsupportedPlatform {
            reason: format!("no process control for {}", std::env::consts::OS),
        })
    }
}

/// The binary must exist and be executable before anything is spawned.
pub async fn check_binary(path: &Path) -> Result<(), SupervisorError> {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return Err(SupervisorError::UnsupportedPlatform {
            reason: format!("server binary not found at {}", path.display()),
        });
    };
    if !meta.is_file() {
        return Err(SupervisorError::UnsupportedPlatform {
            reason: format!("server binary is not a file: {}", path.display()),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(SupervisorError::UnsupportedPlatform {
                reason: format!("server binary is not executable: {}", path.display()),
            });
        }
    }

    Ok(())
}

// pid 0 and 1 (and anything negative once cast) address whole groups or init.
#[cfg(unix)]
fn signal_target(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(p) if p > 1 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

#[cfg(unix)]
fn send(target: libc::pid_t, sig: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(target, sig) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixControl;

#[cfg(unix)]
impl ProcessControl for UnixControl {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn configure(&self, cmd: &mut tokio::process::Command) {
        unsafe {
            cmd.pre_exec(|| {
                // New session so the whole server tree can be signalled at once.
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    fn interrupt(&self, pid: u32) -> io::Result<()> {
        send(signal_target(pid)?, libc::SIGINT)
    }

    fn interrupt_group(&self, pid: u32) -> io::Result<()> {
        send(-signal_target(pid)?, libc::SIGINT)
    }

    fn kill_group(&self, pid: u32) -> io::Result<()> {
        send(-signal_target(pid)?, libc::SIGKILL)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(target) = signal_target(pid) else {
            return false;
        };
        match send(target, 0) {
            Ok(()) => true,
            // Exists, but belongs to someone else.
            Err(e) => e.raw_os_error() == Some(libc::EPERM),
        }
    }
}
