//! `ServiceManager`: the facade hosts embed.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use usm_shared::errors::{UsmError, UsmResult};

use crate::config::{ConfigSource, InstanceConfig, ManagerSettings, UsmConfig};
use crate::instance::{InstanceTable, ServiceInstance, StatusCounts};
use crate::lifecycle::{LifecycleController, LifecycleSettings, StartOptions};
use crate::logging;
use crate::metrics::{ManagerMetrics, ManagerMetricsStorage};
use crate::process::{NativeController, ProcessController};
use crate::sampler::{RefreshOutcome, RefreshReport, StatusSampler};
use crate::template::{ServiceTemplate, TemplateRegistry};

struct SamplerTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the templates, the instance table and everything that acts on them.
///
/// All control methods are async and must run on a tokio runtime; query
/// methods are synchronous and never wait on an in-flight transition.
pub struct ServiceManager {
    settings: ManagerSettings,
    templates: Arc<TemplateRegistry>,
    table: Arc<InstanceTable>,
    lifecycle: LifecycleController,
    sampler: StatusSampler,
    metrics: ManagerMetricsStorage,
    sampler_task: Mutex<Option<SamplerTask>>,
}

impl ServiceManager {
    /// Load configuration from `source` and manage native processes.
    ///
    /// Installs file logging when the configuration names a `log_dir`.
    pub fn from_source(source: &ConfigSource) -> UsmResult<Self> {
        let config = UsmConfig::load(source)?;
        if let Some(dir) = config.manager.log_dir_path() {
            logging::init_file_logging(&dir)?;
        }
        Self::new(config, Arc::new(NativeController::new()))
    }

    /// Build a manager over an arbitrary process adapter.
    pub fn new(config: UsmConfig, controller: Arc<dyn ProcessController>) -> UsmResult<Self> {
        config.validate()?;

        let templates = Arc::new(TemplateRegistry::from_templates(config.templates)?);
        let table = Arc::new(InstanceTable::new());
        let metrics = ManagerMetricsStorage::new();
        let lifecycle = LifecycleController::new(
            Arc::clone(&table),
            Arc::clone(&templates),
            controller,
            LifecycleSettings {
                grace_timeout: config.manager.grace_timeout(),
                log_dir: config.manager.log_dir_path(),
            },
            metrics.clone(),
        );
        let sampler = StatusSampler::new(Arc::clone(&table), metrics.clone());

        for instance in config.instances {
            let id = instance.id.clone();
            lifecycle
                .register(instance)
                .map_err(|e| UsmError::Config(format!("instance '{}': {}", id, e)))?;
        }

        tracing::info!(
            templates = templates.len(),
            instances = table.len(),
            "Service manager initialized"
        );

        Ok(Self {
            settings: config.manager,
            templates,
            table,
            lifecycle,
            sampler,
            metrics,
            sampler_task: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn templates(&self) -> Vec<Arc<ServiceTemplate>> {
        self.templates.list()
    }

    pub fn template(&self, id: &str) -> Option<Arc<ServiceTemplate>> {
        self.templates.get(id)
    }

    /// Snapshots of all instances in insertion order.
    pub fn list(&self) -> Vec<ServiceInstance> {
        self.table.list()
    }

    pub fn get(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        self.table.get(instance_id)
    }

    pub fn status_counts(&self) -> StatusCounts {
        self.table.status_counts()
    }

    pub fn metrics(&self) -> ManagerMetrics {
        self.metrics.snapshot(self.table.status_counts())
    }

    pub fn register(&self, config: InstanceConfig) -> UsmResult<ServiceInstance> {
        self.lifecycle.register(config)
    }

    pub fn deregister(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        self.lifecycle.deregister(instance_id)
    }

    pub async fn start(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        self.lifecycle.start(instance_id).await
    }

    pub async fn start_with(
        &self,
        instance_id: &str,
        options: StartOptions,
    ) -> UsmResult<ServiceInstance> {
        self.lifecycle.start_with(instance_id, options).await
    }

    pub async fn stop(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        self.lifecycle.stop(instance_id).await
    }

    pub async fn restart(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        self.lifecycle.restart(instance_id).await
    }

    pub async fn start_auto(&self) -> Vec<(String, UsmResult<ServiceInstance>)> {
        self.lifecycle.start_auto().await
    }

    pub async fn refresh(&self, instance_id: &str) -> UsmResult<RefreshOutcome> {
        self.sampler.refresh(instance_id).await
    }

    pub async fn refresh_all(&self) -> RefreshReport {
        self.sampler.refresh_all().await
    }

    /// Start background sampling at the configured interval.
    ///
    /// Must be called from within a tokio runtime. Returns `false` if the
    /// sampler is already running.
    pub fn start_sampler(&self) -> bool {
        let mut task = self.sampler_task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }
        let token = CancellationToken::new();
        let handle = self
            .sampler
            .spawn_periodic(self.settings.sample_interval(), token.clone());
        *task = Some(SamplerTask { token, handle });
        true
    }

    /// Cancel background sampling. The task exits at its next poll.
    pub fn stop_sampler(&self) {
        if let Some(task) = self.sampler_task.lock().take() {
            task.token.cancel();
        }
    }

    /// Stop sampling and every instance holding a process.
    pub async fn shutdown(&self) -> Vec<(String, UsmError)> {
        let task = self.sampler_task.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "Sampler task ended abnormally");
            }
        }

        let failures = self.lifecycle.shutdown().await;
        tracing::info!(failures = failures.len(), "Service manager shut down");
        failures
    }
}

impl Drop for ServiceManager {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}
