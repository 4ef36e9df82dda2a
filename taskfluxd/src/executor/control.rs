use crate::types::Pid;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SignalError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("permission denied")]
    PermissionDenied,
    #[error("{0}")]
    Other(String),
}

/// OS process-control primitives used by the executor.
pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit.
    fn terminate(&self, pid: Pid) -> Result<(), SignalError>;
    /// Kill the process outright.
    fn force_kill(&self, pid: Pid) -> Result<(), SignalError>;
    /// Whether the process still runs. Zombies count as gone.
    fn is_alive(&self, pid: Pid) -> bool;
}

/// Signals through `libc::kill`: SIGTERM, then SIGKILL.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalControl;

#[cfg(unix)]
impl SignalControl {
    fn send(pid: Pid, signal: libc::c_int) -> Result<(), SignalError> {
        let raw = libc::pid_t::try_from(pid)
            .map_err(|_| SignalError::Other(format!("pid {pid} out of range")))?;
        // SAFETY: kill(2) takes plain integers and has no memory-safety
        // preconditions.
        let rc = unsafe { libc::kill(raw, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Err(SignalError::NoSuchProcess),
            Some(libc::EPERM) => Err(SignalError::PermissionDenied),
            _ => Err(SignalError::Other(err.to_string())),
        }
    }
}

#[cfg(unix)]
impl ProcessControl for SignalControl {
    fn terminate(&self, pid: Pid) -> Result<(), SignalError> {
        Self::send(pid, libc::SIGTERM)
    }

    fn force_kill(&self, pid: Pid) -> Result<(), SignalError> {
        Self::send(pid, libc::SIGKILL)
    }

    fn is_alive(&self, pid: Pid) -> bool {
        match Self::send(pid, 0) {
            Ok(()) | Err(SignalError::PermissionDenied) => !is_zombie(pid),
            Err(_) => false,
        }
    }
}

#[cfg(not(unix))]
impl ProcessControl for SignalControl {
    fn terminate(&self, _pid: Pid) -> Result<(), SignalError> {
        Err(SignalError::Other("signals are not supported on this platform".into()))
    }

    fn force_kill(&self, _pid: Pid) -> Result<(), SignalError> {
        Err(SignalError::Other("signals are not supported on this platform".into()))
    }

    fn is_alive(&self, _pid: Pid) -> bool {
        false
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    i32::try_from(pid)
        .ok()
        .and_then(|pid| procfs::process::Process::new(pid).ok())
        .and_then(|p| p.stat().ok())
        .is_some_and(|stat| stat.state == 'Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: Pid) -> bool {
    false
}
