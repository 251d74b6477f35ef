//! Instance status, failure causes and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use usm_shared::errors::SpawnError;

/// Lifecycle status of a service instance.
///
/// ```text
/// Stopped/Error/Unknown --start--> Starting --> Running | Error
/// Running --stop--> Stopping --> Stopped | Error
/// Running --probe--> Error (exited) | Unknown (probe failed)
/// Stopping --restart--> Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Running,
    /// Last transition or probe failed; see the instance's failure cause.
    Error,
    Starting,
    Stopping,
    /// The process could not be probed.
    Unknown,
}

impl ServiceStatus {
    /// Whether an instance in this status owns a process handle.
    pub fn holds_process(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Running | ServiceStatus::Stopping
        )
    }

    /// A transition is in flight; new commands are rejected.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Stopping)
    }

    /// No process attached; the instance may be started, edited or removed.
    pub fn is_idle(&self) -> bool {
        !self.holds_process()
    }

    pub fn can_transition_to(&self, target: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, target),
            (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopped)
                | (Unknown, Starting)
                | (Unknown, Stopped)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Stopping)
                | (Running, Error)
                | (Running, Unknown)
                | (Stopping, Stopped)
                | (Stopping, Error)
                // restart keeps its claim across the two halves
                | (Stopping, Starting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Running => "running",
            ServiceStatus::Error => "error",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(ServiceStatus::Stopped),
            "running" => Ok(ServiceStatus::Running),
            "error" => Ok(ServiceStatus::Error),
            "starting" => Ok(ServiceStatus::Starting),
            "stopping" => Ok(ServiceStatus::Stopping),
            "unknown" => Ok(ServiceStatus::Unknown),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which half of a restart failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartStage {
    Stop,
    Start,
}

/// Why an instance ended up in `Error` or `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum FailureCause {
    Spawn(SpawnError),
    PortInUse(u16),
    Signal(String),
    UnexpectedExit(Option<i32>),
    Probe(String),
    Restart {
        stage: RestartStage,
        cause: Box<FailureCause>,
    },
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Spawn(e) => write!(f, "{}", e),
            FailureCause::PortInUse(port) => write!(f, "port {} is already in use", port),
            FailureCause::Signal(msg) => write!(f, "failed to stop process: {}", msg),
            FailureCause::UnexpectedExit(Some(code)) => {
                write!(f, "process exited unexpectedly with code {}", code)
            }
            FailureCause::UnexpectedExit(None) => {
                write!(f, "process was terminated by a signal")
            }
            FailureCause::Probe(msg) => write!(f, "failed to probe process: {}", msg),
            FailureCause::Restart { stage, cause } => {
                let stage = match stage {
                    RestartStage::Stop => "stop",
                    RestartStage::Start => "start",
                };
                write!(f, "restart failed during {}: {}", stage, cause)
            }
        }
    }
}

/// Point-in-time copy of an instance, detached from the table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub template_id: String,
    pub display_name: String,
    pub port: u16,
    pub status: ServiceStatus,
    /// Whether a process handle is attached.
    pub has_process: bool,
    pub pid: Option<u32>,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub last_error: Option<FailureCause>,
    /// Template health URL rendered for this instance's port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    pub tags: Vec<String>,
    pub auto_start: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl ServiceInstance {
    /// Time since the current process was started, while it is running.
    pub fn uptime(&self) -> Option<chrono::Duration> {
        match (self.status, self.started_at) {
            (ServiceStatus::Running, Some(started)) => Some(Utc::now() - started),
            _ => None,
        }
    }
}
