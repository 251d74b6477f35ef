//! Test helpers for USM: a scriptable in-memory process adapter and config
//! fixtures.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;
use usm::{
    LaunchRequest, ProcessController, ProcessHandler, ProcessState, ResourceSample,
    ServiceManager, ServiceStatus, ServiceTemplate, TemplateCategory, TerminateOutcome,
    Termination, UsmConfig,
};
use usm_shared::errors::{ProbeError, SignalError, SpawnError};

const FIRST_FAKE_PID: u32 = 40_000;
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const WAIT_LIMIT: Duration = Duration::from_secs(5);

// ============================================================================
// GATE
// ============================================================================

/// Blocks fake operations until opened, so tests can observe transient states.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
    entered: Arc<AtomicUsize>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Number of operations that reached the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` operations are blocked on (or passed) the gate.
    pub async fn wait_entered(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while self.entered() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "gate never reached by {} operations",
                n
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

// ============================================================================
// FAKE HANDLER
// ============================================================================

#[derive(Default)]
struct HandlerState {
    exit: Option<Option<i32>>,
    sample: ResourceSample,
    fail_probes: bool,
    exit_on_sample: Option<Option<i32>>,
    ignore_graceful: bool,
    fail_kill: bool,
    terminations: Vec<Termination>,
}

/// In-memory stand-in for a spawned process.
pub struct FakeHandler {
    pid: u32,
    request: LaunchRequest,
    state: Mutex<HandlerState>,
    terminate_gate: Mutex<Option<Gate>>,
}

impl FakeHandler {
    fn new(pid: u32, request: LaunchRequest) -> Self {
        Self {
            pid,
            request,
            state: Mutex::new(HandlerState::default()),
            terminate_gate: Mutex::new(None),
        }
    }

    pub fn request(&self) -> &LaunchRequest {
        &self.request
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().exit.is_none()
    }

    /// Make the process exit on its own.
    pub fn exit(&self, code: Option<i32>) {
        self.state.lock().exit = Some(code);
    }

    pub fn set_sample(&self, cpu_percent: f64, memory_mb: u64) {
        self.state.lock().sample = ResourceSample {
            cpu_percent,
            memory_mb,
        };
    }

    /// Fail `poll` and `sample` from now on.
    pub fn fail_probes(&self) {
        self.state.lock().fail_probes = true;
    }

    /// Exit with `code` during the next `sample`, after `poll` saw it alive.
    pub fn exit_on_sample(&self, code: Option<i32>) {
        self.state.lock().exit_on_sample = Some(code);
    }

    /// Survive SIGTERM so graceful termination escalates.
    pub fn ignore_graceful(&self) {
        self.state.lock().ignore_graceful = true;
    }

    /// Survive SIGKILL too.
    pub fn fail_kill(&self) {
        self.state.lock().fail_kill = true;
    }

    /// Block `terminate` until the returned gate is opened.
    pub fn gate_terminate(&self) -> Gate {
        let gate = Gate::new();
        *self.terminate_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn terminations(&self) -> Vec<Termination> {
        self.state.lock().terminations.clone()
    }
}

#[async_trait]
impl ProcessHandler for FakeHandler {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn terminate(&self, mode: Termination) -> Result<TerminateOutcome, SignalError> {
        self.state.lock().terminations.push(mode);

        let gate = self.terminate_gate.lock().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let mut state = self.state.lock();
        if state.exit.is_some() {
            return Ok(TerminateOutcome::Graceful);
        }
        match mode {
            Termination::Graceful(_) if !state.ignore_graceful => {
                state.exit = Some(Some(0));
                Ok(TerminateOutcome::Graceful)
            }
            _ if state.fail_kill => Err(SignalError(format!(
                "pid {} survived SIGKILL",
                self.pid
            ))),
            _ => {
                state.exit = Some(None);
                Ok(TerminateOutcome::Forced)
            }
        }
    }

    async fn poll(&self) -> Result<ProcessState, ProbeError> {
        let state = self.state.lock();
        if state.fail_probes {
            return Err(ProbeError(format!("cannot inspect pid {}", self.pid)));
        }
        Ok(match state.exit {
            Some(code) => ProcessState::Exited(code),
            None => ProcessState::Alive,
        })
    }

    async fn sample(&self) -> Result<ResourceSample, ProbeError> {
        let mut state = self.state.lock();
        if let Some(code) = state.exit_on_sample.take() {
            state.exit = Some(code);
        }
        if state.fail_probes || state.exit.is_some() {
            return Err(ProbeError(format!("process {} not found", self.pid)));
        }
        Ok(state.sample)
    }
}

// ============================================================================
// FAKE CONTROLLER
// ============================================================================

#[derive(Default)]
struct ControllerState {
    requests: Vec<LaunchRequest>,
    failures: HashMap<String, VecDeque<SpawnError>>,
    handlers: HashMap<String, Arc<FakeHandler>>,
    spawn_gate: Option<Gate>,
}

/// Process controller that never touches the OS.
pub struct FakeController {
    state: Mutex<ControllerState>,
    next_pid: AtomicU32,
}

impl Default for FakeController {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ControllerState::default()),
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
        }
    }

    /// Make the next spawn of `instance_id` fail with `error`.
    pub fn fail_next_spawn(&self, instance_id: &str, error: SpawnError) {
        self.state
            .lock()
            .failures
            .entry(instance_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Block every spawn until the returned gate is opened.
    pub fn gate_spawns(&self) -> Gate {
        let gate = Gate::new();
        self.state.lock().spawn_gate = Some(gate.clone());
        gate
    }

    /// Spawn attempts for `instance_id`, successful or not.
    pub fn spawn_count(&self, instance_id: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .count()
    }

    pub fn total_spawns(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.state.lock().requests.clone()
    }

    /// Most recent handler spawned for `instance_id`.
    pub fn handler(&self, instance_id: &str) -> Option<Arc<FakeHandler>> {
        self.state.lock().handlers.get(instance_id).cloned()
    }
}

#[async_trait]
impl ProcessController for FakeController {
    async fn spawn(&self, request: LaunchRequest) -> Result<Arc<dyn ProcessHandler>, SpawnError> {
        let gate = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            state.spawn_gate.clone()
        };
        if let Some(gate) = gate {
            gate.pass().await;
        }

        let mut state = self.state.lock();
        if let Some(error) = state
            .failures
            .get_mut(&request.instance_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::new(FakeHandler::new(pid, request));
        state
            .handlers
            .insert(handler.request.instance_id.clone(), Arc::clone(&handler));
        Ok(handler as Arc<dyn ProcessHandler>)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Template that runs `sleep 30`, with no port range.
pub fn template(id: &str, default_port: u16) -> ServiceTemplate {
    ServiceTemplate {
        id: id.to_string(),
        display_name: format!("{} service", id),
        description: None,
        category: TemplateCategory::Custom,
        command: "sleep".to_string(),
        args: vec!["30".to_string()],
        working_dir: None,
        env: BTreeMap::new(),
        default_port,
        port_range: None,
        supports_multiple: true,
        health_endpoint: None,
        health_timeout_ms: 5_000,
    }
}

pub fn config_with(templates: Vec<ServiceTemplate>) -> UsmConfig {
    let mut config = UsmConfig {
        templates,
        ..Default::default()
    };
    config.manager.grace_timeout_ms = 200;
    config.manager.sample_interval_ms = 20;
    config
}

/// Manager over a fresh [`FakeController`].
pub fn fake_manager(config: UsmConfig) -> (ServiceManager, Arc<FakeController>) {
    let controller = Arc::new(FakeController::new());
    let manager = ServiceManager::new(config, controller.clone()).expect("valid test config");
    (manager, controller)
}

/// Write `yaml` to a temporary `services.yaml`.
pub fn config_file(yaml: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("services.yaml");
    std::fs::write(&path, yaml).expect("write config");
    (dir, path)
}

/// Poll until `instance_id` reaches `status`.
pub async fn wait_for_status(manager: &ServiceManager, instance_id: &str, status: ServiceStatus) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let current = manager.get(instance_id).map(|i| i.status).ok();
        if current == Some(status) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{} never reached {} (last: {:?})",
            instance_id,
            status,
            current
        );
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
