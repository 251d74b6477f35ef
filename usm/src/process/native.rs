//! Native process adapter backed by `std::process`, `libc` and `sysinfo`.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use usm_shared::errors::{ProbeError, SignalError, SpawnError};

use super::{
    LaunchRequest, ProcessController, ProcessHandler, ProcessState, ResourceSample,
    TerminateOutcome, Termination,
};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const FORCED_REAP_TIMEOUT: Duration = Duration::from_secs(2);
const BYTES_PER_MB: u64 = 1024 * 1024;

/// Spawns services as child processes in their own process group.
#[derive(Debug, Default, Clone)]
pub struct NativeController;

impl NativeController {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessController for NativeController {
    async fn spawn(&self, request: LaunchRequest) -> Result<Arc<dyn ProcessHandler>, SpawnError> {
        probe_port(request.port)?;

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).envs(&request.env).stdin(Stdio::null());

        if let Some(dir) = &request.working_dir {
            if !dir.is_dir() {
                return Err(SpawnError::Io(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
            cmd.current_dir(dir);
        }

        match &request.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        SpawnError::Io(format!("failed to create {}: {}", parent.display(), e))
                    })?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        SpawnError::Io(format!("failed to open {}: {}", path.display(), e))
                    })?;
                let stderr = file
                    .try_clone()
                    .map_err(|e| SpawnError::Io(format!("failed to clone log handle: {}", e)))?;
                cmd.stdout(file).stderr(stderr);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // Own process group so a stop signal reaches the whole tree.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| classify_spawn_error(&request.program, e))?;

        tracing::info!(
            instance_id = %request.instance_id,
            pid = child.id(),
            port = request.port,
            program = %request.program,
            "Spawned service process"
        );

        Ok(Arc::new(NativeHandler::new(child)) as Arc<dyn ProcessHandler>)
    }
}

/// Handle to a child process spawned by [`NativeController`].
pub struct NativeHandler {
    pid: u32,
    child: Mutex<Child>,
    /// Exit code once the child has been reaped.
    exit: Mutex<Option<Option<i32>>>,
    /// CPU usage is a delta between refreshes, so the `System` must persist.
    metrics_sys: Mutex<sysinfo::System>,
}

impl NativeHandler {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
            exit: Mutex::new(None),
            metrics_sys: Mutex::new(sysinfo::System::new()),
        }
    }

    fn try_reap(&self) -> std::io::Result<Option<Option<i32>>> {
        let mut exit = self.exit.lock();
        if exit.is_some() {
            return Ok(*exit);
        }
        if let Some(status) = self.child.lock().try_wait()? {
            *exit = Some(status.code());
        }
        Ok(*exit)
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Result<bool, SignalError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_reap() {
                Ok(Some(_)) => return Ok(true),
                Ok(None) => {}
                Err(e) => {
                    return Err(SignalError(format!(
                        "failed to reap pid {}: {}",
                        self.pid, e
                    )));
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(REAP_POLL_INTERVAL).await;
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> Result<(), SignalError> {
        let pgid = libc::pid_t::try_from(self.pid)
            .map_err(|_| SignalError(format!("pid {} out of range", self.pid)))?;
        let rc = unsafe { libc::killpg(pgid, signal) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            // Group already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(SignalError(format!(
                "failed to signal process group {}: {}",
                pgid, err
            )));
        }
        Ok(())
    }

    async fn kill(&self) -> Result<(), SignalError> {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL)?;

        #[cfg(not(unix))]
        if let Err(e) = self.child.lock().kill()
            && e.kind() != ErrorKind::InvalidInput
        {
            return Err(SignalError(format!("failed to kill pid {}: {}", self.pid, e)));
        }

        if self.wait_for_exit(FORCED_REAP_TIMEOUT).await? {
            Ok(())
        } else {
            Err(SignalError(format!(
                "pid {} still running after SIGKILL",
                self.pid
            )))
        }
    }
}

#[async_trait]
impl ProcessHandler for NativeHandler {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn terminate(&self, mode: Termination) -> Result<TerminateOutcome, SignalError> {
        if matches!(self.try_reap(), Ok(Some(_))) {
            return Ok(TerminateOutcome::Graceful);
        }

        match mode {
            Termination::Graceful(timeout) => {
                #[cfg(unix)]
                {
                    self.signal_group(libc::SIGTERM)?;
                    if self.wait_for_exit(timeout).await? {
                        tracing::debug!(pid = self.pid, "Process exited after SIGTERM");
                        return Ok(TerminateOutcome::Graceful);
                    }
                    tracing::warn!(
                        pid = self.pid,
                        timeout_ms = timeout.as_millis() as u64,
                        "Process ignored SIGTERM, escalating to SIGKILL"
                    );
                }
                #[cfg(not(unix))]
                let _ = timeout;

                self.kill().await?;
                Ok(TerminateOutcome::Forced)
            }
            Termination::Forced => {
                self.kill().await?;
                Ok(TerminateOutcome::Forced)
            }
        }
    }

    async fn poll(&self) -> Result<ProcessState, ProbeError> {
        match self.try_reap() {
            Ok(Some(code)) => Ok(ProcessState::Exited(code)),
            Ok(None) => Ok(ProcessState::Alive),
            Err(e) => Err(ProbeError(format!("failed to poll pid {}: {}", self.pid, e))),
        }
    }

    async fn sample(&self) -> Result<ResourceSample, ProbeError> {
        let pid = sysinfo::Pid::from_u32(self.pid);
        let mut sys = self.metrics_sys.lock();
        sys.refresh_process(pid);

        let process = sys
            .process(pid)
            .ok_or_else(|| ProbeError(format!("process {} not found", self.pid)))?;
        Ok(ResourceSample {
            cpu_percent: f64::from(process.cpu_usage()),
            memory_mb: process.memory() / BYTES_PER_MB,
        })
    }
}

/// Fail early when something outside the manager already holds the port.
fn probe_port(port: u16) -> Result<(), SpawnError> {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(SpawnError::PortInUse(port)),
        // Privileged ports and similar are the service's problem, not ours.
        Err(_) => Ok(()),
    }
}

fn classify_spawn_error(program: &str, err: std::io::Error) -> SpawnError {
    match err.kind() {
        ErrorKind::NotFound => SpawnError::ExecutableNotFound(program.to_string()),
        ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_string()),
        _ => SpawnError::Io(format!("{}: {}", program, err)),
    }
}
