#![allow(dead_code)]

use assert_cmd::Command;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

/// A `usm` command bound to a throwaway configuration file.
pub struct TestContext {
    pub cmd: Command,
    pub config: PathBuf,
    // Keeps the config directory alive for the test
    pub _dir: TempDir,
}

impl TestContext {
    /// Another command against the same configuration
    pub fn new_cmd(&self) -> Command {
        command(&self.config)
    }
}

/// `usm --config <config>` with a clean environment.
pub fn command(config: &Path) -> Command {
    let bin_path = env!("CARGO_BIN_EXE_usm");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(60));
    cmd.env_remove("USM_CONFIG").env_remove("RUST_LOG");
    cmd.arg("--config").arg(config);
    cmd
}

pub fn usm(yaml: &str) -> TestContext {
    let (dir, config) = usm_test_utils::config_file(yaml);
    TestContext {
        cmd: command(&config),
        config,
        _dir: dir,
    }
}

pub fn free_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Two templates, one pre-declared instance.
pub const BASIC_CONFIG: &str = r#"
manager:
  grace_timeout_ms: 1000
  sample_interval_ms: 200
templates:
  - id: web
    display_name: Web Server
    category: development
    command: python3
    args: ["-m", "http.server", "{port}"]
    default_port: 8080
    port_range: [8080, 8099]
  - id: cache
    display_name: Cache
    command: redis-server
    args: ["--port", "{port}"]
    default_port: 6379
instances:
  - id: web-primary
    template: web
    port: 8081
    tags: [core, http]
    auto_start: true
"#;

/// A `sleep` template on a free port.
pub fn sleeper_config(auto_start: bool) -> String {
    format!(
        r#"
manager:
  grace_timeout_ms: 2000
  sample_interval_ms: 200
templates:
  - id: sleeper
    display_name: Sleeper
    command: sleep
    args: ["30"]
    default_port: {port}
instances:
  - id: sleeper-main
    template: sleeper
    auto_start: {auto_start}
"#,
        port = free_port(),
        auto_start = auto_start
    )
}
