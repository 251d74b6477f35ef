//! Configuration loading.
//!
//! The configuration is a YAML document with three sections: manager
//! settings, service templates and pre-declared instances. JSON documents are
//! accepted as well since they are valid YAML.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use usm_shared::constants::{config as config_consts, supervision};
use usm_shared::errors::{UsmError, UsmResult};

use crate::template::{ServiceTemplate, TemplateRegistry};

/// Written to the default location the first time it is used.
pub const DEFAULT_CONFIG: &str = r#"# USM configuration
manager:
  grace_timeout_ms: 5000
  sample_interval_ms: 2000
  # log_dir: ~/.usm/logs

templates:
  - id: management
    display_name: Management Console
    description: Web console and management API
    category: core
    command: python3
    args: ["{working_dir}/management/server.py", "--port", "{port}"]
    working_dir: ~/unamentis/server
    default_port: 8766
    port_range: [8766, 8799]
    health_endpoint: http://localhost:{port}/health

  - id: ollama
    display_name: Ollama
    description: Local LLM inference server
    category: infrastructure
    command: ollama
    args: ["serve"]
    env:
      OLLAMA_HOST: "0.0.0.0:{port}"
    default_port: 11434
    port_range: [11434, 11450]
    health_endpoint: http://localhost:{port}/api/tags

instances:
  - id: management-primary
    template: management
    port: 8766
    tags: [core]

  - id: ollama-primary
    template: ollama
    port: 11434
    tags: [llm]
"#;

/// Where to read the configuration from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// `$USM_CONFIG`, or `~/.usm/services.yaml` created with defaults if missing.
    Default,
    /// An existing file.
    Path(PathBuf),
    /// Configuration text held in memory.
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// How long a service gets between SIGTERM and SIGKILL.
    pub grace_timeout_ms: u64,
    /// Background sampling period.
    pub sample_interval_ms: u64,
    /// Service output and the manager's own log go here when set.
    pub log_dir: Option<String>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            grace_timeout_ms: supervision::GRACE_TIMEOUT_MS,
            sample_interval_ms: supervision::SAMPLE_INTERVAL_MS,
            log_dir: None,
        }
    }
}

impl ManagerSettings {
    pub fn grace_timeout(&self) -> Duration {
        Duration::from_millis(self.grace_timeout_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn log_dir_path(&self) -> Option<PathBuf> {
        self.log_dir.as_deref().map(expand_home)
    }
}

/// A pre-declared or explicitly registered instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    /// Template id this instance is rendered from.
    pub template: String,
    /// Port to bind; the template default (or next free) when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            template: template.into(),
            port: None,
            tags: Vec::new(),
            auto_start: false,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsmConfig {
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub templates: Vec<ServiceTemplate>,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl UsmConfig {
    /// Read, parse and validate configuration from `source`.
    pub fn load(source: &ConfigSource) -> UsmResult<Self> {
        let text = match source {
            ConfigSource::Default => read_or_create_default(&default_path()?)?,
            ConfigSource::Path(path) => std::fs::read_to_string(path).map_err(|e| {
                UsmError::Config(format!("failed to read {}: {}", path.display(), e))
            })?,
            ConfigSource::Inline(text) => text.clone(),
        };
        let config = Self::parse(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating cross references.
    pub fn parse(text: &str) -> UsmResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| UsmError::Config(e.to_string()))
    }

    /// Check templates, instance references and manager settings.
    pub fn validate(&self) -> UsmResult<()> {
        if self.manager.sample_interval_ms == 0 {
            return Err(UsmError::Config(
                "manager.sample_interval_ms must be non-zero".into(),
            ));
        }

        let registry = TemplateRegistry::from_templates(self.templates.clone())?;
        let mut seen = HashSet::new();
        for instance in &self.instances {
            if instance.id.trim().is_empty() {
                return Err(UsmError::Config("instance id must not be empty".into()));
            }
            if !seen.insert(instance.id.as_str()) {
                return Err(UsmError::Config(format!(
                    "duplicate instance id '{}'",
                    instance.id
                )));
            }
            let template = registry.get(&instance.template).ok_or_else(|| {
                UsmError::Config(format!(
                    "instance '{}' references unknown template '{}'",
                    instance.id, instance.template
                ))
            })?;
            if let Some(port) = instance.port
                && !template.is_port_valid(port)
            {
                return Err(UsmError::Config(format!(
                    "instance '{}': port {} is outside the range of template '{}'",
                    instance.id, port, template.id
                )));
            }
        }
        Ok(())
    }
}

/// Default configuration path: `$USM_CONFIG`, else `~/.usm/services.yaml`.
pub fn default_path() -> UsmResult<PathBuf> {
    if let Ok(path) = std::env::var(config_consts::ENV_VAR)
        && !path.is_empty()
    {
        return Ok(expand_home(&path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| UsmError::Config("cannot determine home directory".into()))?;
    Ok(home
        .join(config_consts::HOME_DIR)
        .join(config_consts::FILE_NAME))
}

fn read_or_create_default(path: &Path) -> UsmResult<String> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "Creating default config file");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UsmError::Config(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, DEFAULT_CONFIG).map_err(|e| {
            UsmError::Config(format!("failed to write {}: {}", path.display(), e))
        })?;
    }
    std::fs::read_to_string(path)
        .map_err(|e| UsmError::Config(format!("failed to read {}: {}", path.display(), e)))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };
    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
manager:
  grace_timeout_ms: 250
templates:
  - id: web
    display_name: Web Server
    command: python3
    args: ["-m", "http.server", "{port}"]
    default_port: 8080
    port_range: [8080, 8099]
instances:
  - id: web-primary
    template: web
    port: 8081
    tags: [core]
    auto_start: true
"#;

    #[test]
    fn test_parse_sample() {
        let config = UsmConfig::parse(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.manager.grace_timeout(), Duration::from_millis(250));
        assert_eq!(
            config.manager.sample_interval_ms,
            supervision::SAMPLE_INTERVAL_MS
        );
        assert_eq!(config.templates.len(), 1);
        assert_eq!(config.templates[0].port_range, Some((8080, 8099)));
        assert_eq!(config.instances[0].port, Some(8081));
        assert!(config.instances[0].auto_start);
        assert_eq!(config.instances[0].tags, vec!["core"]);
    }

    #[test]
    fn test_json_is_accepted() {
        let json = r#"{"templates":[{"id":"db","display_name":"DB","command":"postgres","default_port":5432}]}"#;
        let config = UsmConfig::load(&ConfigSource::Inline(json.into())).unwrap();
        assert_eq!(config.templates[0].id, "db");
        assert!(config.instances.is_empty());
    }

    #[test]
    fn test_missing_required_field_is_config_error() {
        let text = "templates:\n  - id: web\n    display_name: Web\n    default_port: 8080\n";
        let err = UsmConfig::load(&ConfigSource::Inline(text.into())).unwrap_err();
        assert!(matches!(err, UsmError::Config(_)));
    }

    #[test]
    fn test_unknown_template_reference_rejected() {
        let text = SAMPLE.replace("template: web", "template: nope");
        let err = UsmConfig::load(&ConfigSource::Inline(text)).unwrap_err();
        assert!(err.to_string().contains("unknown template"));
    }

    #[test]
    fn test_port_outside_range_rejected() {
        let text = SAMPLE.replace("port: 8081", "port: 9000");
        assert!(UsmConfig::load(&ConfigSource::Inline(text)).is_err());
    }

    #[test]
    fn test_zero_sample_interval_rejected() {
        let text = "manager:\n  sample_interval_ms: 0\n";
        assert!(UsmConfig::load(&ConfigSource::Inline(text.into())).is_err());
    }

    #[test]
    fn test_empty_document_is_empty_config() {
        let config = UsmConfig::load(&ConfigSource::Inline("  \n".into())).unwrap();
        assert!(config.templates.is_empty());
        assert_eq!(config.manager, ManagerSettings::default());
    }

    #[test]
    fn test_missing_explicit_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = UsmConfig::load(&ConfigSource::Path(path.clone())).unwrap_err();
        assert!(matches!(err, UsmError::Config(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_default_file_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("services.yaml");

        let text = read_or_create_default(&path).unwrap();
        assert!(path.exists());
        assert_eq!(text, DEFAULT_CONFIG);

        let config = UsmConfig::parse(&text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.templates.len(), 2);
        assert_eq!(
            config.templates[1].build_health_endpoint(11434).as_deref(),
            Some("http://localhost:11434/api/tags")
        );
        assert!(config.instances.iter().all(|i| !i.auto_start));
    }

    #[test]
    fn test_existing_default_file_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        std::fs::write(&path, "templates: []\n").unwrap();

        let text = read_or_create_default(&path).unwrap();
        assert_eq!(text, "templates: []\n");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("rel"), PathBuf::from("rel"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~"), home);
            assert_eq!(expand_home("~/logs"), home.join("logs"));
        }
    }
}
