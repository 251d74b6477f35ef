//! Instance table.
//!
//! Lock order: table membership (`RwLock`) → instance slot (`Mutex`) → port
//! map (`Mutex`). None of these locks is ever held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use usm_shared::errors::{UsmError, UsmResult};

use super::state::{FailureCause, ServiceInstance, ServiceStatus};
use crate::process::{ProcessHandler, ResourceSample};
use crate::template::{LaunchOverrides, ServiceTemplate};

/// What an instance is, independent of what it is doing.
#[derive(Debug, Clone)]
pub struct InstanceDescriptor {
    pub instance_id: String,
    pub template: Arc<ServiceTemplate>,
    pub port: u16,
    pub tags: Vec<String>,
    pub auto_start: bool,
    pub overrides: LaunchOverrides,
}

/// Process ownership of an instance.
#[derive(Clone, Default)]
pub(crate) enum ProcessSlot {
    #[default]
    Empty,
    /// Claimed by an in-flight start; the handle is not known yet.
    Spawning,
    Attached(Arc<dyn ProcessHandler>),
}

pub(crate) struct InstanceState {
    pub descriptor: InstanceDescriptor,
    pub status: ServiceStatus,
    pub process: ProcessSlot,
    pub pid: Option<u32>,
    pub sample: ResourceSample,
    pub last_error: Option<FailureCause>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Set once deregistered so holders of a stale slot see it as gone.
    pub removed: bool,
}

pub(crate) type InstanceSlot = Mutex<InstanceState>;

impl InstanceState {
    pub fn new(descriptor: InstanceDescriptor) -> Self {
        let now = Utc::now();
        Self {
            descriptor,
            status: ServiceStatus::Stopped,
            process: ProcessSlot::Empty,
            pid: None,
            sample: ResourceSample::default(),
            last_error: None,
            created_at: now,
            started_at: None,
            last_updated: now,
            removed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.instance_id
    }

    pub fn handler(&self) -> Option<Arc<dyn ProcessHandler>> {
        match &self.process {
            ProcessSlot::Attached(handler) => Some(Arc::clone(handler)),
            _ => None,
        }
    }

    /// Whether `handler` is the process currently attached.
    pub fn is_attached(&self, handler: &Arc<dyn ProcessHandler>) -> bool {
        match &self.process {
            ProcessSlot::Attached(current) => Arc::ptr_eq(current, handler),
            _ => false,
        }
    }

    fn transition(&mut self, to: ServiceStatus) {
        debug_assert!(
            self.status.can_transition_to(to),
            "invalid transition {} -> {}",
            self.status,
            to
        );
        tracing::debug!(
            instance_id = %self.descriptor.instance_id,
            from = %self.status,
            to = %to,
            "Instance transition"
        );
        self.status = to;
        self.last_updated = Utc::now();
    }

    pub fn begin_start(&mut self) {
        self.transition(ServiceStatus::Starting);
        self.process = ProcessSlot::Spawning;
        self.pid = None;
        self.started_at = None;
        self.last_error = None;
        self.sample = ResourceSample::default();
    }

    pub fn mark_running(&mut self, handler: Arc<dyn ProcessHandler>) {
        self.transition(ServiceStatus::Running);
        self.pid = handler.pid();
        self.process = ProcessSlot::Attached(handler);
        self.started_at = Some(Utc::now());
    }

    pub fn begin_stop(&mut self) {
        self.transition(ServiceStatus::Stopping);
    }

    pub fn mark_stopped(&mut self) -> Option<Arc<dyn ProcessHandler>> {
        self.transition(ServiceStatus::Stopped);
        self.sample = ResourceSample::default();
        self.last_error = None;
        self.release()
    }

    /// Enter `Error` or `Unknown`, detaching any process.
    ///
    /// Metrics are kept so hosts can still see the last known usage.
    pub fn mark_failed(
        &mut self,
        status: ServiceStatus,
        cause: FailureCause,
    ) -> Option<Arc<dyn ProcessHandler>> {
        debug_assert!(matches!(status, ServiceStatus::Error | ServiceStatus::Unknown));
        tracing::warn!(
            instance_id = %self.descriptor.instance_id,
            status = %status,
            cause = %cause,
            "Instance failed"
        );
        self.transition(status);
        self.last_error = Some(cause);
        self.release()
    }

    pub fn record_sample(&mut self, sample: ResourceSample) {
        self.sample = sample;
        self.last_updated = Utc::now();
    }

    fn release(&mut self) -> Option<Arc<dyn ProcessHandler>> {
        self.pid = None;
        self.started_at = None;
        match std::mem::take(&mut self.process) {
            ProcessSlot::Attached(handler) => Some(handler),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ServiceInstance {
        let descriptor = &self.descriptor;
        ServiceInstance {
            instance_id: descriptor.instance_id.clone(),
            template_id: descriptor.template.id.clone(),
            display_name: descriptor.template.display_name.clone(),
            port: descriptor.port,
            status: self.status,
            has_process: !matches!(self.process, ProcessSlot::Empty),
            pid: self.pid,
            cpu_percent: self.sample.cpu_percent,
            memory_mb: self.sample.memory_mb,
            last_error: self.last_error.clone(),
            health_endpoint: descriptor.template.build_health_endpoint(descriptor.port),
            tags: descriptor.tags.clone(),
            auto_start: descriptor.auto_start,
            created_at: self.created_at,
            started_at: self.started_at,
            last_updated: self.last_updated,
        }
    }
}

/// Number of instances in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub stopped: usize,
    pub running: usize,
    pub error: usize,
    pub starting: usize,
    pub stopping: usize,
    pub unknown: usize,
}

impl StatusCounts {
    fn add(&mut self, status: ServiceStatus) {
        let counter = match status {
            ServiceStatus::Stopped => &mut self.stopped,
            ServiceStatus::Running => &mut self.running,
            ServiceStatus::Error => &mut self.error,
            ServiceStatus::Starting => &mut self.starting,
            ServiceStatus::Stopping => &mut self.stopping,
            ServiceStatus::Unknown => &mut self.unknown,
        };
        *counter += 1;
    }

    pub fn total(&self) -> usize {
        self.stopped + self.running + self.error + self.starting + self.stopping + self.unknown
    }
}

#[derive(Default)]
struct TableInner {
    /// Insertion order, stable for the session.
    order: Vec<String>,
    slots: HashMap<String, Arc<InstanceSlot>>,
}

/// Holder of a reserved port.
struct PortClaim {
    instance_id: String,
    template_id: String,
}

/// All known instances plus the ports they currently hold.
#[derive(Default)]
pub struct InstanceTable {
    inner: RwLock<TableInner>,
    /// Held only while a process is claimed.
    ports: Mutex<HashMap<u16, PortClaim>>,
}

impl InstanceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        let slot = self
            .slot(instance_id)
            .ok_or_else(|| UsmError::NotFound(format!("instance '{}'", instance_id)))?;
        let state = slot.lock();
        Ok(state.snapshot())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.inner.read().slots.contains_key(instance_id)
    }

    /// Snapshots of every instance in insertion order.
    pub fn list(&self) -> Vec<ServiceInstance> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.slots.get(id))
            .map(|slot| slot.lock().snapshot())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new instance, or replace the descriptor of an idle one.
    ///
    /// Status, timestamps and the last failure of an existing instance are
    /// kept.
    pub fn upsert(&self, descriptor: InstanceDescriptor) -> UsmResult<()> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.slots.get(&descriptor.instance_id) {
            let mut state = slot.lock();
            ensure_idle(&state)?;
            tracing::debug!(instance_id = %descriptor.instance_id, "Updating instance descriptor");
            state.descriptor = descriptor;
            state.last_updated = Utc::now();
            return Ok(());
        }

        tracing::debug!(
            instance_id = %descriptor.instance_id,
            template_id = %descriptor.template.id,
            port = descriptor.port,
            "Registering instance"
        );
        let id = descriptor.instance_id.clone();
        inner
            .slots
            .insert(id.clone(), Arc::new(Mutex::new(InstanceState::new(descriptor))));
        inner.order.push(id);
        Ok(())
    }

    /// Remove an idle instance, returning its final snapshot.
    pub fn remove(&self, instance_id: &str) -> UsmResult<ServiceInstance> {
        let mut inner = self.inner.write();
        let slot = inner
            .slots
            .get(instance_id)
            .cloned()
            .ok_or_else(|| UsmError::NotFound(format!("instance '{}'", instance_id)))?;

        let mut state = slot.lock();
        ensure_idle(&state)?;
        state.removed = true;
        inner.slots.remove(instance_id);
        inner.order.retain(|id| id != instance_id);

        tracing::debug!(instance_id, "Removed instance");
        Ok(state.snapshot())
    }

    /// Claim `port` for `instance_id`. Re-claiming an owned port succeeds.
    ///
    /// A template without `supports_multiple` admits one claim at a time.
    pub fn reserve_port(
        &self,
        port: u16,
        instance_id: &str,
        template: &ServiceTemplate,
    ) -> UsmResult<()> {
        let mut ports = self.ports.lock();
        if let Some(claim) = ports.get(&port) {
            if claim.instance_id != instance_id {
                return Err(UsmError::PortInUse {
                    port,
                    holder: claim.instance_id.clone(),
                });
            }
            return Ok(());
        }
        if !template.supports_multiple
            && let Some(claim) = ports
                .values()
                .find(|c| c.template_id == template.id && c.instance_id != instance_id)
        {
            return Err(UsmError::SingleInstance {
                template: template.id.clone(),
                holder: claim.instance_id.clone(),
            });
        }
        ports.insert(
            port,
            PortClaim {
                instance_id: instance_id.to_string(),
                template_id: template.id.clone(),
            },
        );
        Ok(())
    }

    /// Release `port` if `instance_id` holds it.
    pub fn release_port(&self, port: u16, instance_id: &str) {
        let mut ports = self.ports.lock();
        if ports.get(&port).is_some_and(|claim| claim.instance_id == instance_id) {
            ports.remove(&port);
        }
    }

    pub fn port_holder(&self, port: u16) -> Option<String> {
        self.ports.lock().get(&port).map(|claim| claim.instance_id.clone())
    }

    pub fn status_counts(&self) -> StatusCounts {
        let inner = self.inner.read();
        let mut counts = StatusCounts::default();
        for slot in inner.slots.values() {
            counts.add(slot.lock().status);
        }
        counts
    }

    pub(crate) fn slot(&self, instance_id: &str) -> Option<Arc<InstanceSlot>> {
        self.inner.read().slots.get(instance_id).cloned()
    }

    /// Every slot in insertion order.
    pub(crate) fn slots(&self) -> Vec<(String, Arc<InstanceSlot>)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.slots.get(id).map(|slot| (id.clone(), Arc::clone(slot))))
            .collect()
    }

    /// Insert a slot built under the membership lock.
    ///
    /// `build` runs with the write lock held, so it may reserve ports; if it
    /// fails nothing is inserted. Returns `None` without calling `build` when
    /// the id is already present.
    pub(crate) fn insert_with<F>(
        &self,
        instance_id: &str,
        build: F,
    ) -> UsmResult<Option<Arc<InstanceSlot>>>
    where
        F: FnOnce() -> UsmResult<InstanceState>,
    {
        let mut inner = self.inner.write();
        if inner.slots.contains_key(instance_id) {
            return Ok(None);
        }
        let slot = Arc::new(Mutex::new(build()?));
        inner.slots.insert(instance_id.to_string(), Arc::clone(&slot));
        inner.order.push(instance_id.to_string());
        Ok(Some(slot))
    }
}

fn ensure_idle(state: &InstanceState) -> UsmResult<()> {
    match state.status {
        ServiceStatus::Running => Err(UsmError::AlreadyRunning(state.id().to_string())),
        status if status.is_transient() => Err(UsmError::TransitionInProgress {
            id: state.id().to_string(),
            status: status.to_string(),
        }),
        _ => Ok(()),
    }
}
