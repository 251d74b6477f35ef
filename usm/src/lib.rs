//! USM - service lifecycle manager.
//!
//! Tracks locally run service instances derived from templates, starts, stops
//! and restarts them, and samples their CPU and memory usage. The C SDK
//! (`usm-c`) exposes this crate across a C ABI.
//!
//! ```no_run
//! # async fn demo() -> usm::UsmResult<()> {
//! use usm::{ConfigSource, ServiceManager};
//!
//! let manager = ServiceManager::from_source(&ConfigSource::Default)?;
//! manager.start("ollama-primary").await?;
//! for instance in manager.list() {
//!     println!("{} {} {}", instance.instance_id, instance.port, instance.status);
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod instance;
pub mod lifecycle;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod process;
pub mod sampler;
pub mod template;

pub use config::{ConfigSource, InstanceConfig, ManagerSettings, UsmConfig};
pub use instance::{
    FailureCause, InstanceTable, RestartStage, ServiceInstance, ServiceStatus, StatusCounts,
};
pub use lifecycle::StartOptions;
pub use manager::ServiceManager;
pub use metrics::ManagerMetrics;
pub use process::{
    LaunchRequest, ProcessController, ProcessHandler, ProcessState, ResourceSample,
    TerminateOutcome, Termination,
};
pub use sampler::{RefreshOutcome, RefreshReport};
pub use template::{ServiceTemplate, TemplateCategory, TemplateRegistry};
pub use usm_shared::errors::{ProbeError, SignalError, SpawnError, UsmError, UsmResult};
