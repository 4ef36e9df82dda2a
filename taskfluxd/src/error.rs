use crate::types::Pid;
use thiserror::Error;

/// One cycle's OS query failed as a whole; the cycle is skipped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SampleError {
    #[error("process enumeration unavailable: {0}")]
    Unavailable(String),
    #[error("system metrics read failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActionError {
    #[error("process {0} is not in the current snapshot")]
    NotFound(Pid),
    #[error("permission denied for process {0}")]
    PermissionDenied(Pid),
    #[error("refusing to act on process {pid}: {reason}")]
    Refused { pid: Pid, reason: String },
    #[error("process {0} survived forceful termination")]
    EscalationExhausted(Pid),
    #[error("process tree {pid}: {terminated} terminated, {} failed", failed.len())]
    PartialFailure {
        pid: Pid,
        terminated: usize,
        failed: Vec<(Pid, String)>,
    },
    #[error("executable path of process {0} is unavailable")]
    PathUnavailable(Pid),
    #[error("signal to process {pid} failed: {message}")]
    Os { pid: Pid, message: String },
}

impl ActionError {
    /// Stable short code recorded in log payloads and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ActionError::NotFound(_) => "not_found",
            ActionError::PermissionDenied(_) => "permission_denied",
            ActionError::Refused { .. } => "refused",
            ActionError::EscalationExhausted(_) => "escalation_exhausted",
            ActionError::PartialFailure { .. } => "partial_failure",
            ActionError::PathUnavailable(_) => "path_unavailable",
            ActionError::Os { .. } => "os_error",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sampling failed {failures} consecutive times, last error: {last}")]
    Fatal { failures: u32, last: SampleError },
    #[error("pipeline worker stopped: {0}")]
    Worker(String),
}
