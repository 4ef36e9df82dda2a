use crate::error::ActionError;
use crate::types::{IDLE_PID, KERNEL_PID, Pid};

pub struct SafetyGuard {
    own_pid: Pid,
}

impl SafetyGuard {
    pub fn new(own_pid: Pid) -> Self {
        Self { own_pid }
    }

    pub fn for_current_process() -> Self {
        Self::new(std::process::id())
    }

    /// Refuse PIDs whose termination would take the host or the daemon
    /// down with it.
    pub fn check(&self, pid: Pid) -> Result<(), ActionError> {
        let reason = match pid {
            IDLE_PID => "idle placeholder",
            1 => "init process",
            KERNEL_PID => "kernel process",
            p if p == self.own_pid => "monitor's own process",
            _ => return Ok(()),
        };
        Err(ActionError::Refused {
            pid,
            reason: reason.to_string(),
        })
    }
}
