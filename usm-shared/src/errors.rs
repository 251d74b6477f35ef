//! Error taxonomy for the service manager.
//!
//! Process adapter failures have their own small types so they can be stored
//! as an instance's failure cause; everything a caller can observe is folded
//! into [`UsmError`].

use serde::Serialize;
use thiserror::Error;

/// Result type used across the USM crates.
pub type UsmResult<T> = Result<T, UsmError>;

/// Failure to launch a service process.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SpawnError {
    /// The launch command does not resolve to an executable.
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// The OS refused to execute the command or enter its working directory.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Something outside the manager already listens on the port.
    #[error("port {0} is already bound on this host")]
    PortInUse(u16),

    /// Any other OS-level spawn failure.
    #[error("spawn failed: {0}")]
    Io(String),
}

/// Failure to deliver a stop signal or to reap the process afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{0}")]
pub struct SignalError(pub String);

/// Failure to observe a process (liveness or resource usage).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{0}")]
pub struct ProbeError(pub String);

#[derive(Debug, Clone, Error)]
pub enum UsmError {
    /// Bad templates or an unreadable configuration source.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),

    #[error("instance '{0}' is not running")]
    NotRunning(String),

    /// Another command is mid-flight on this instance; retry later.
    #[error("instance '{id}' is {status}; retry once the transition completes")]
    TransitionInProgress { id: String, status: String },

    /// Another managed instance already holds the port.
    #[error("port {port} is already bound by instance '{holder}'")]
    PortInUse { port: u16, holder: String },

    /// The template allows one live instance and `holder` is it.
    #[error("template '{template}' allows a single instance and '{holder}' is live")]
    SingleInstance { template: String, holder: String },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("signal failed: {0}")]
    Signal(#[from] SignalError),

    #[error("probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// A handle that was never issued or has already been destroyed.
    #[error("invalid or destroyed handle")]
    InvalidHandle,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UsmError {
    /// Whether the caller is expected to recover by retrying or polling status.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UsmError::TransitionInProgress { .. }
                | UsmError::AlreadyRunning(_)
                | UsmError::NotRunning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_converts_transparently() {
        let err: UsmError = SpawnError::ExecutableNotFound("nope".into()).into();
        assert_eq!(err.to_string(), "executable not found: nope");
        assert!(matches!(err, UsmError::Spawn(SpawnError::ExecutableNotFound(_))));
    }

    #[test]
    fn test_retryable_conditions() {
        assert!(
            UsmError::TransitionInProgress {
                id: "web-1".into(),
                status: "starting".into(),
            }
            .is_retryable()
        );
        assert!(UsmError::AlreadyRunning("web-1".into()).is_retryable());
        assert!(UsmError::NotRunning("web-1".into()).is_retryable());
        assert!(!UsmError::InvalidHandle.is_retryable());
        assert!(!UsmError::Signal(SignalError("kill failed".into())).is_retryable());
    }

    #[test]
    fn test_port_in_use_message_names_holder() {
        let err = UsmError::PortInUse {
            port: 9000,
            holder: "a".into(),
        };
        assert_eq!(err.to_string(), "port 9000 is already bound by instance 'a'");
    }

    #[test]
    fn test_single_instance_message_names_holder() {
        let err = UsmError::SingleInstance {
            template: "postgres".into(),
            holder: "db-1".into(),
        };
        assert_eq!(
            err.to_string(),
            "template 'postgres' allows a single instance and 'db-1' is live"
        );
        assert!(!err.is_retryable());
    }
}
