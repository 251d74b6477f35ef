//! Lifecycle controller: start, stop and restart with one in-flight
//! transition per instance.
//!
//! Every command claims the instance under its slot lock, releases the lock
//! for the slow part (spawn or terminate), then re-locks to publish the
//! outcome. A claimed instance is `Starting` or `Stopping`, which rejects any
//! other command with `TransitionInProgress`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{Instant, sleep};
use usm_shared::errors::{SpawnError, UsmError, UsmResult};

use crate::config::InstanceConfig;
use crate::instance::{
    FailureCause, InstanceDescriptor, InstanceSlot, InstanceState, InstanceTable, RestartStage,
    ServiceInstance, ServiceStatus,
};
use crate::metrics::ManagerMetricsStorage;
use crate::process::{
    LaunchRequest, ProcessController, ProcessHandler, TerminateOutcome, Termination,
};
use crate::template::{LaunchOverrides, ServiceTemplate, TemplateRegistry};

const SHUTDOWN_RETRY_INTERVAL: Duration = Duration::from_millis(50);
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Optional parameters for [`LifecycleController::start_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Template for a new instance id instead of prefix resolution.
    pub template_id: Option<String>,
    /// Port to bind instead of the instance's configured one.
    pub port: Option<u16>,
}

impl StartOptions {
    pub fn on_port(port: u16) -> Self {
        Self {
            template_id: None,
            port: Some(port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub grace_timeout: Duration,
    /// Per-instance `<id>.log` files are written here when set.
    pub log_dir: Option<PathBuf>,
}

enum RestartPlan {
    Launch(LaunchRequest),
    Cycle(Arc<dyn ProcessHandler>),
}

#[derive(Clone)]
pub struct LifecycleController {
    table: Arc<InstanceTable>,
    templates: Arc<TemplateRegistry>,
    controller: Arc<dyn ProcessController>,
    settings: LifecycleSettings,
    metrics: ManagerMetricsStorage,
}

impl LifecycleController {
    pub fn new(
        table: Arc<InstanceTable>,
        templates: Arc<TemplateRegistry>,
        controller: Arc<dyn ProcessController>,
        settings: LifecycleSettings,
        metrics: ManagerMetricsStorage,
    ) -> Self {
        Self {
            table,
            templates,
            controller,
            settings,
            metrics,
        }
    }

    /// Add an instance from configuration, or update an idle one.
    pub fn register(&self, config: InstanceConfig) -> UsmResult<ServiceInstance> {
        if config.id.trim().is_empty() {
            return Err(UsmError::InvalidArgument(
                "instance id must not be empty".into(),
            ));
        }
        let template = self.templates.get(&config.template).ok_or_else(|| {
            UsmError::NotFound(format!("template '{}'", config.template))
        })?;
        let port = config.port.unwrap_or(template.default_port);
        if !template.is_port_valid(port) {
            return Err(UsmError::InvalidArgument(format!(
                "port {} is not valid for template '{}'",
                port, template.id
            )));
        }

        self.table.upsert(InstanceDescriptor {
            instance_id: config.id.clone(),
            template,
            port,
            tags: config.tags,
            auto_start: config.auto_start,
            overrides: LaunchOverrides {
                working_dir: config.working_dir,
                env: config.env,
                log_file: None,
            },
        })?;
        self.table.get(&config.id)
    }

    /// Remove an idle instance from the table.
    pub fn deregister(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        let removed = self.table.remove(instance_id)?;
        tracing::info!(instance_id, "Deregistered instance");
        Ok(removed)
    }

    pub async fn start(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        self.start_with(instance_id, StartOptions::default()).await
    }

    /// Start an instance, creating it from a template if the id is new.
    pub async fn start_with(
        &self,
        instance_id: &str,
        options: StartOptions,
    ) -> UsmResult<ServiceInstance> {
        let (slot, request) = self.claim_start(instance_id, &options)?;
        self.launch(&slot, request, None).await
    }

    pub async fn stop(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        let slot = self.slot(instance_id)?;
        let handler = {
            let mut state = slot.lock();
            check_present(&state)?;
            match state.status {
                ServiceStatus::Stopped => {
                    return Err(UsmError::NotRunning(instance_id.to_string()));
                }
                ServiceStatus::Starting | ServiceStatus::Stopping => {
                    return Err(in_progress(&state));
                }
                ServiceStatus::Error | ServiceStatus::Unknown => {
                    // Nothing to signal.
                    state.mark_stopped();
                    tracing::info!(instance_id, "Cleared failed instance");
                    return Ok(state.snapshot());
                }
                ServiceStatus::Running => {
                    let handler = state.handler().ok_or_else(|| {
                        UsmError::Internal(format!("running instance '{}' has no process", instance_id))
                    })?;
                    state.begin_stop();
                    handler
                }
            }
        };

        tracing::info!(instance_id, pid = ?handler.pid(), "Stopping instance");
        let result = handler
            .terminate(Termination::Graceful(self.settings.grace_timeout))
            .await;

        let mut state = slot.lock();
        let port = state.descriptor.port;
        match result {
            Ok(outcome) => {
                self.record_termination(instance_id, outcome);
                state.mark_stopped();
                self.table.release_port(port, instance_id);
                Ok(state.snapshot())
            }
            Err(e) => {
                state.mark_failed(ServiceStatus::Error, FailureCause::Signal(e.0.clone()));
                self.table.release_port(port, instance_id);
                Err(UsmError::Signal(e))
            }
        }
    }

    /// Stop then start on the same id and port, holding the claim throughout.
    pub async fn restart(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        let slot = self.slot(instance_id)?;
        let plan = {
            let mut state = slot.lock();
            check_present(&state)?;
            match state.status {
                ServiceStatus::Starting | ServiceStatus::Stopping => {
                    return Err(in_progress(&state));
                }
                ServiceStatus::Running => {
                    let handler = state.handler().ok_or_else(|| {
                        UsmError::Internal(format!("running instance '{}' has no process", instance_id))
                    })?;
                    state.begin_stop();
                    RestartPlan::Cycle(handler)
                }
                _ => {
                    let port = state.descriptor.port;
                    self.table
                        .reserve_port(port, instance_id, &state.descriptor.template)?;
                    state.begin_start();
                    RestartPlan::Launch(self.render(&state))
                }
            }
        };
        ManagerMetricsStorage::incr(&self.metrics.restarts);
        tracing::info!(instance_id, "Restarting instance");

        let request = match plan {
            RestartPlan::Launch(request) => request,
            RestartPlan::Cycle(handler) => {
                let result = handler
                    .terminate(Termination::Graceful(self.settings.grace_timeout))
                    .await;

                let mut state = slot.lock();
                match result {
                    Ok(outcome) => {
                        self.record_termination(instance_id, outcome);
                        // Stopping → Starting keeps the port reservation.
                        state.begin_start();
                        self.render(&state)
                    }
                    Err(e) => {
                        let port = state.descriptor.port;
                        state.mark_failed(
                            ServiceStatus::Error,
                            FailureCause::Restart {
                                stage: RestartStage::Stop,
                                cause: Box::new(FailureCause::Signal(e.0.clone())),
                            },
                        );
                        self.table.release_port(port, instance_id);
                        return Err(UsmError::Signal(e));
                    }
                }
            }
        };

        self.launch(&slot, request, Some(RestartStage::Start)).await
    }

    /// Start every idle `auto_start` instance; failures do not affect others.
    pub async fn start_auto(&self) -> Vec<(String, UsmResult<ServiceInstance>)> {
        let ids: Vec<String> = self
            .table
            .slots()
            .into_iter()
            .filter(|(_, slot)| {
                let state = slot.lock();
                state.descriptor.auto_start && state.status.is_idle()
            })
            .map(|(id, _)| id)
            .collect();

        let results = join_all(ids.iter().map(|id| self.start(id))).await;
        for (id, result) in ids.iter().zip(&results) {
            if let Err(e) = result {
                tracing::warn!(instance_id = %id, error = %e, "Auto-start failed");
            }
        }
        ids.into_iter().zip(results).collect()
    }

    /// Stop every instance that holds a process.
    ///
    /// Instances mid-transition are retried until they settle or the grace
    /// timeout (plus slack) runs out. Returns the instances that failed.
    pub async fn shutdown(&self) -> Vec<(String, UsmError)> {
        let deadline = Instant::now() + self.settings.grace_timeout + SHUTDOWN_SLACK;
        let mut failures = Vec::new();

        loop {
            let busy: Vec<String> = self
                .table
                .slots()
                .into_iter()
                .filter(|(_, slot)| slot.lock().status.holds_process())
                .map(|(id, _)| id)
                .collect();
            if busy.is_empty() {
                break;
            }

            let results = join_all(busy.iter().map(|id| self.stop(id))).await;
            let mut pending = false;
            for (id, result) in busy.into_iter().zip(results) {
                match result {
                    Ok(_) | Err(UsmError::NotRunning(_)) | Err(UsmError::NotFound(_)) => {}
                    Err(UsmError::TransitionInProgress { .. }) => pending = true,
                    Err(e) => {
                        tracing::warn!(instance_id = %id, error = %e, "Failed to stop instance during shutdown");
                        failures.push((id, e));
                    }
                }
            }

            if !pending {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("Shutdown deadline reached with transitions still in flight");
                break;
            }
            sleep(SHUTDOWN_RETRY_INTERVAL).await;
        }

        failures
    }

    fn slot(&self, instance_id: &str) -> UsmResult<Arc<InstanceSlot>> {
        self.table
            .slot(instance_id)
            .ok_or_else(|| UsmError::NotFound(format!("instance '{}'", instance_id)))
    }

    fn claim_start(
        &self,
        instance_id: &str,
        options: &StartOptions,
    ) -> UsmResult<(Arc<InstanceSlot>, LaunchRequest)> {
        if let Some(slot) = self.table.slot(instance_id) {
            let request = self.claim_existing(&slot, options)?;
            return Ok((slot, request));
        }

        let mut request = None;
        let inserted = self.table.insert_with(instance_id, || {
            let (state, launch) = self.build_new(instance_id, options)?;
            request = Some(launch);
            Ok(state)
        })?;

        match (inserted, request) {
            (Some(slot), Some(request)) => Ok((slot, request)),
            // Registered concurrently; treat it as an existing instance.
            _ => {
                let slot = self.slot(instance_id)?;
                let request = self.claim_existing(&slot, options)?;
                Ok((slot, request))
            }
        }
    }

    fn claim_existing(
        &self,
        slot: &InstanceSlot,
        options: &StartOptions,
    ) -> UsmResult<LaunchRequest> {
        let mut state = slot.lock();
        check_present(&state)?;
        match state.status {
            ServiceStatus::Running => {
                return Err(UsmError::AlreadyRunning(state.id().to_string()));
            }
            ServiceStatus::Starting | ServiceStatus::Stopping => {
                return Err(in_progress(&state));
            }
            _ => {}
        }

        if let Some(template_id) = &options.template_id
            && *template_id != state.descriptor.template.id
        {
            return Err(UsmError::InvalidArgument(format!(
                "instance '{}' uses template '{}', not '{}'",
                state.id(),
                state.descriptor.template.id,
                template_id
            )));
        }

        let port = options.port.unwrap_or(state.descriptor.port);
        check_port(&state.descriptor.template, port)?;
        let id = state.id().to_string();
        self.table
            .reserve_port(port, &id, &state.descriptor.template)?;

        state.descriptor.port = port;
        state.begin_start();
        Ok(self.render(&state))
    }

    /// Build the state of a new instance; runs under the membership lock.
    fn build_new(
        &self,
        instance_id: &str,
        options: &StartOptions,
    ) -> UsmResult<(InstanceState, LaunchRequest)> {
        let template = match &options.template_id {
            Some(template_id) => self.templates.get(template_id),
            None => self.templates.resolve_for_instance(instance_id),
        }
        .ok_or_else(|| {
            UsmError::NotFound(format!("no template matches instance '{}'", instance_id))
        })?;

        let port = match options.port {
            Some(port) => {
                check_port(&template, port)?;
                port
            }
            None => self.pick_port(&template),
        };
        self.table.reserve_port(port, instance_id, &template)?;

        let mut state = InstanceState::new(InstanceDescriptor {
            instance_id: instance_id.to_string(),
            template,
            port,
            tags: Vec::new(),
            auto_start: false,
            overrides: LaunchOverrides::default(),
        });
        state.begin_start();
        let request = self.render(&state);
        Ok((state, request))
    }

    /// Template default, or the next unreserved port when it is taken.
    fn pick_port(&self, template: &ServiceTemplate) -> u16 {
        if self.table.port_holder(template.default_port).is_none() {
            return template.default_port;
        }
        // Falls back to the default so the reservation reports the holder.
        template
            .next_available_port(|port| self.table.port_holder(port).is_some())
            .unwrap_or(template.default_port)
    }

    fn render(&self, state: &InstanceState) -> LaunchRequest {
        let descriptor = &state.descriptor;
        let mut overrides = descriptor.overrides.clone();
        overrides.log_file = self
            .settings
            .log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", descriptor.instance_id)));
        descriptor
            .template
            .launch_request(&descriptor.instance_id, descriptor.port, &overrides)
    }

    /// Spawn a claimed instance and publish the outcome.
    async fn launch(
        &self,
        slot: &InstanceSlot,
        request: LaunchRequest,
        restart: Option<RestartStage>,
    ) -> UsmResult<ServiceInstance> {
        let instance_id = request.instance_id.clone();
        let port = request.port;
        tracing::info!(instance_id = %instance_id, port, "Starting instance");

        let result = self.controller.spawn(request).await;

        let mut state = slot.lock();
        match result {
            Ok(handler) => {
                state.mark_running(handler);
                ManagerMetricsStorage::incr(&self.metrics.starts);
                tracing::info!(instance_id = %instance_id, pid = ?state.pid, port, "Instance running");
                Ok(state.snapshot())
            }
            Err(e) => {
                let mut cause = match &e {
                    SpawnError::PortInUse(port) => FailureCause::PortInUse(*port),
                    other => FailureCause::Spawn(other.clone()),
                };
                if let Some(stage) = restart {
                    cause = FailureCause::Restart {
                        stage,
                        cause: Box::new(cause),
                    };
                }
                state.mark_failed(ServiceStatus::Error, cause);
                self.table.release_port(port, &instance_id);
                ManagerMetricsStorage::incr(&self.metrics.start_failures);
                Err(UsmError::Spawn(e))
            }
        }
    }

    fn record_termination(&self, instance_id: &str, outcome: TerminateOutcome) {
        ManagerMetricsStorage::incr(&self.metrics.stops);
        match outcome {
            TerminateOutcome::Graceful => tracing::info!(instance_id, "Instance stopped"),
            TerminateOutcome::Forced => {
                ManagerMetricsStorage::incr(&self.metrics.forced_kills);
                tracing::warn!(instance_id, "Instance did not exit in time and was killed");
            }
        }
    }
}

fn check_present(state: &InstanceState) -> UsmResult<()> {
    if state.removed {
        return Err(UsmError::NotFound(format!("instance '{}'", state.id())));
    }
    Ok(())
}

fn check_port(template: &ServiceTemplate, port: u16) -> UsmResult<()> {
    if !template.is_port_valid(port) {
        return Err(UsmError::InvalidArgument(format!(
            "port {} is not valid for template '{}'",
            port, template.id
        )));
    }
    Ok(())
}

fn in_progress(state: &InstanceState) -> UsmError {
    UsmError::TransitionInProgress {
        id: state.id().to_string(),
        status: state.status.to_string(),
    }
}
