//! Service templates.
//!
//! A template describes how to launch one kind of service. Instances are
//! rendered from a template at start time, substituting `{port}`,
//! `{instance_id}` and `{working_dir}` in arguments and environment values.

mod registry;

pub use registry::TemplateRegistry;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use usm_shared::constants::supervision::{HEALTH_TIMEOUT_MS, PORT_SEARCH_SPAN};
use usm_shared::errors::{UsmError, UsmResult};

use crate::config::expand_home;
use crate::process::LaunchRequest;

/// Grouping used by hosts to organize templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    #[default]
    Core,
    Development,
    Database,
    Infrastructure,
    Custom,
}

impl TemplateCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateCategory::Core => "core",
            TemplateCategory::Development => "development",
            TemplateCategory::Database => "database",
            TemplateCategory::Infrastructure => "infrastructure",
            TemplateCategory::Custom => "custom",
        }
    }
}

impl std::fmt::Display for TemplateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable description of a launchable service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTemplate {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub category: TemplateCategory,
    /// Program to execute, resolved through `PATH` when not absolute.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; a leading `~` expands to the home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub default_port: u16,
    /// Inclusive port range instances of this template may bind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_range: Option<(u16, u16)>,
    /// When false, at most one instance of this template may hold a port.
    #[serde(default = "default_supports_multiple")]
    pub supports_multiple: bool,
    /// Health check URL; `{port}` is replaced with the instance port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_endpoint: Option<String>,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u32,
}

fn default_supports_multiple() -> bool {
    true
}

fn default_health_timeout() -> u32 {
    HEALTH_TIMEOUT_MS
}

/// Per-instance values layered over the template at launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOverrides {
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
}

impl ServiceTemplate {
    /// Check required fields and the port range.
    pub fn validate(&self) -> UsmResult<()> {
        if self.id.trim().is_empty() {
            return Err(UsmError::Config("template id must not be empty".into()));
        }
        if self.display_name.trim().is_empty() {
            return Err(UsmError::Config(format!(
                "template '{}': display_name must not be empty",
                self.id
            )));
        }
        if self.command.trim().is_empty() {
            return Err(UsmError::Config(format!(
                "template '{}': command must not be empty",
                self.id
            )));
        }
        if self.default_port == 0 {
            return Err(UsmError::Config(format!(
                "template '{}': default_port must be non-zero",
                self.id
            )));
        }
        if let Some((min, max)) = self.port_range
            && (min == 0 || min > max)
        {
            return Err(UsmError::Config(format!(
                "template '{}': invalid port_range [{}, {}]",
                self.id, min, max
            )));
        }
        if self.health_endpoint.is_some() && self.health_timeout_ms == 0 {
            return Err(UsmError::Config(format!(
                "template '{}': health_timeout_ms must be non-zero",
                self.id
            )));
        }
        Ok(())
    }

    /// Whether an instance of this template may bind `port`.
    ///
    /// Without a configured range any non-zero port is accepted.
    pub fn is_port_valid(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        match self.port_range {
            Some((min, max)) => (min..=max).contains(&port),
            None => true,
        }
    }

    /// First port in the template's range for which `is_taken` is false.
    pub fn next_available_port(&self, is_taken: impl Fn(u16) -> bool) -> Option<u16> {
        let (min, max) = self.port_range.unwrap_or((
            self.default_port,
            self.default_port.saturating_add(PORT_SEARCH_SPAN),
        ));
        (min..=max).find(|port| !is_taken(*port))
    }

    /// Health check URL for an instance bound to `port`.
    pub fn build_health_endpoint(&self, port: u16) -> Option<String> {
        self.health_endpoint
            .as_ref()
            .map(|endpoint| endpoint.replace("{port}", &port.to_string()))
    }

    /// Render the launch request for one instance.
    pub fn launch_request(
        &self,
        instance_id: &str,
        port: u16,
        overrides: &LaunchOverrides,
    ) -> LaunchRequest {
        let working_dir = overrides
            .working_dir
            .as_deref()
            .or(self.working_dir.as_deref())
            .map(expand_home);
        let working_dir_text = working_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());

        let render = |value: &str| {
            value
                .replace("{port}", &port.to_string())
                .replace("{instance_id}", instance_id)
                .replace("{working_dir}", &working_dir_text)
        };

        let mut env: BTreeMap<String, String> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), render(v)))
            .collect();
        for (k, v) in &overrides.env {
            env.insert(k.clone(), render(v));
        }

        LaunchRequest {
            instance_id: instance_id.to_string(),
            program: self.command.clone(),
            args: self.args.iter().map(|a| render(a)).collect(),
            working_dir,
            env,
            port,
            log_file: overrides.log_file.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_template(id: &str, default_port: u16) -> ServiceTemplate {
    ServiceTemplate {
        id: id.to_string(),
        display_name: format!("{} service", id),
        description: None,
        category: TemplateCategory::Core,
        command: "sleep".to_string(),
        args: vec!["30".to_string()],
        working_dir: None,
        env: BTreeMap::new(),
        default_port,
        port_range: None,
        supports_multiple: true,
        health_endpoint: None,
        health_timeout_ms: HEALTH_TIMEOUT_MS,
    }
}
