//! Status sampler: liveness probes and CPU/memory accounting for running
//! instances.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use usm_shared::errors::{ProbeError, UsmError, UsmResult};

use crate::instance::{FailureCause, InstanceSlot, InstanceTable, ServiceStatus};
use crate::metrics::ManagerMetricsStorage;
use crate::process::{ProcessHandler, ProcessState, ResourceSample, Termination};

/// What a single refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Metrics updated.
    Sampled(ResourceSample),
    /// The process was gone; the instance is now `Error`.
    Exited { code: Option<i32> },
    /// Not running, nothing to probe.
    Skipped { status: ServiceStatus },
    /// A concurrent transition won; the result was dropped.
    Discarded,
}

/// Summary of a [`StatusSampler::refresh_all`] pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub sampled: Vec<String>,
    pub exited: Vec<String>,
    pub discarded: Vec<String>,
    /// Instances whose probe failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.exited.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct StatusSampler {
    table: Arc<InstanceTable>,
    metrics: ManagerMetricsStorage,
}

impl StatusSampler {
    pub fn new(table: Arc<InstanceTable>, metrics: ManagerMetricsStorage) -> Self {
        Self { table, metrics }
    }

    /// Probe one instance and fold the result into the table.
    pub async fn refresh(&self, instance_id: &str) -> UsmResult<RefreshOutcome> {
        let slot = self
            .table
            .slot(instance_id)
            .ok_or_else(|| UsmError::NotFound(format!("instance '{}'", instance_id)))?;

        let handler = {
            let state = slot.lock();
            if state.status != ServiceStatus::Running {
                return Ok(RefreshOutcome::Skipped {
                    status: state.status,
                });
            }
            match state.handler() {
                Some(handler) => handler,
                None => return Ok(RefreshOutcome::Discarded),
            }
        };

        match handler.poll().await {
            Ok(ProcessState::Alive) => {}
            Ok(ProcessState::Exited(code)) => {
                return Ok(self.apply_exit(instance_id, &slot, &handler, code));
            }
            Err(e) => return self.apply_probe_failure(instance_id, &slot, handler, e).await,
        }

        match handler.sample().await {
            Ok(sample) => {
                let mut state = slot.lock();
                if state.status != ServiceStatus::Running || !state.is_attached(&handler) {
                    return Ok(RefreshOutcome::Discarded);
                }
                state.record_sample(sample);
                tracing::trace!(
                    instance_id,
                    cpu_percent = sample.cpu_percent,
                    memory_mb = sample.memory_mb,
                    "Sampled instance"
                );
                Ok(RefreshOutcome::Sampled(sample))
            }
            // The process may have exited after the liveness check.
            Err(e) => match handler.poll().await {
                Ok(ProcessState::Exited(code)) => {
                    Ok(self.apply_exit(instance_id, &slot, &handler, code))
                }
                _ => self.apply_probe_failure(instance_id, &slot, handler, e).await,
            },
        }
    }

    /// Refresh every running instance concurrently.
    pub async fn refresh_all(&self) -> RefreshReport {
        let running: Vec<String> = self
            .table
            .slots()
            .into_iter()
            .filter(|(_, slot)| slot.lock().status == ServiceStatus::Running)
            .map(|(id, _)| id)
            .collect();

        let results = join_all(running.iter().map(|id| self.refresh(id))).await;

        let mut report = RefreshReport::default();
        for (id, result) in running.into_iter().zip(results) {
            match result {
                Ok(RefreshOutcome::Sampled(_)) => report.sampled.push(id),
                Ok(RefreshOutcome::Exited { .. }) => report.exited.push(id),
                Ok(RefreshOutcome::Skipped { .. } | RefreshOutcome::Discarded) => {
                    report.discarded.push(id)
                }
                // Deregistered between listing and probing.
                Err(UsmError::NotFound(_)) => report.discarded.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        report
    }

    /// Run [`refresh_all`](Self::refresh_all) every `period` until `token`
    /// is cancelled. Must be called from within a tokio runtime.
    pub fn spawn_periodic(&self, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let sampler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(period_ms = period.as_millis() as u64, "Sampler started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = sampler.refresh_all().await;
                        if !report.is_clean() {
                            tracing::debug!(
                                exited = report.exited.len(),
                                failed = report.failed.len(),
                                "Sampler pass found failing instances"
                            );
                        }
                    }
                }
            }
            tracing::debug!("Sampler stopped");
        })
    }

    fn apply_exit(
        &self,
        instance_id: &str,
        slot: &InstanceSlot,
        handler: &Arc<dyn ProcessHandler>,
        code: Option<i32>,
    ) -> RefreshOutcome {
        let mut state = slot.lock();
        if state.status != ServiceStatus::Running || !state.is_attached(handler) {
            return RefreshOutcome::Discarded;
        }
        let port = state.descriptor.port;
        state.mark_failed(ServiceStatus::Error, FailureCause::UnexpectedExit(code));
        self.table.release_port(port, instance_id);
        ManagerMetricsStorage::incr(&self.metrics.unexpected_exits);
        RefreshOutcome::Exited { code }
    }

    async fn apply_probe_failure(
        &self,
        instance_id: &str,
        slot: &InstanceSlot,
        handler: Arc<dyn ProcessHandler>,
        error: ProbeError,
    ) -> UsmResult<RefreshOutcome> {
        {
            let mut state = slot.lock();
            if state.status != ServiceStatus::Running || !state.is_attached(&handler) {
                return Ok(RefreshOutcome::Discarded);
            }
            let port = state.descriptor.port;
            state.mark_failed(ServiceStatus::Unknown, FailureCause::Probe(error.0.clone()));
            self.table.release_port(port, instance_id);
        }
        ManagerMetricsStorage::incr(&self.metrics.probe_failures);

        // The handle is released; do not leave an unreachable process behind.
        if let Err(e) = handler.terminate(Termination::Forced).await {
            tracing::warn!(instance_id, error = %e, "Failed to kill unprobeable process");
        }
        Err(UsmError::Probe(error))
    }
}
