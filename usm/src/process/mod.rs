//! Process adapter.
//!
//! The lifecycle controller never touches OS primitives directly. It asks a
//! [`ProcessController`] to spawn a service and then drives the returned
//! [`ProcessHandler`] to probe, sample and terminate it.

mod native;

pub use native::{NativeController, NativeHandler};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use usm_shared::errors::{ProbeError, SignalError, SpawnError};

/// Fully rendered launch parameters for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub instance_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Port the service is expected to bind.
    pub port: u16,
    /// stdout and stderr are appended here when set, discarded otherwise.
    pub log_file: Option<PathBuf>,
}

/// How to stop a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM, then SIGKILL once the timeout elapses.
    Graceful(Duration),
    /// SIGKILL right away.
    Forced,
}

/// How a terminated process actually went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Graceful,
    Forced,
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Exit code, `None` when the process was killed by a signal.
    Exited(Option<i32>),
}

/// Point-in-time resource usage of a process.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: u64,
}

/// Launches service processes.
#[async_trait]
pub trait ProcessController: Send + Sync {
    async fn spawn(&self, request: LaunchRequest) -> Result<Arc<dyn ProcessHandler>, SpawnError>;
}

/// Handle to one spawned process.
///
/// Implementations must tolerate calls after the process has exited.
#[async_trait]
pub trait ProcessHandler: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Stop the process, waiting until it has actually exited.
    async fn terminate(&self, mode: Termination) -> Result<TerminateOutcome, SignalError>;

    async fn poll(&self) -> Result<ProcessState, ProbeError>;

    async fn sample(&self) -> Result<ResourceSample, ProbeError>;
}
