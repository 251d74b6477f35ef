use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use usm::process::NativeController;
use usm::{ConfigSource, ServiceManager, UsmConfig};

use crate::commands::{check::CheckArgs, templates::TemplatesArgs, up::UpArgs};

/// USM - supervise local service processes
#[derive(Parser, Debug)]
#[command(name = "usm", version, about = "Local service manager")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and summarize it
    Check(CheckArgs),

    /// List service templates
    Templates(TemplatesArgs),

    /// Start instances and watch them until interrupted
    Up(UpArgs),
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Configuration file (default: ~/.usm/services.yaml, created if missing)
    #[arg(long, global = true, env = "USM_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "usm=trace" (overrides RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,
}

impl GlobalFlags {
    pub fn config_source(&self) -> ConfigSource {
        match &self.config {
            Some(path) => ConfigSource::Path(path.clone()),
            None => ConfigSource::Default,
        }
    }

    /// Human-readable name of the configuration in use.
    pub fn config_label(&self) -> String {
        match &self.config {
            Some(path) => path.display().to_string(),
            None => usm::config::default_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "<default>".to_string()),
        }
    }

    pub fn load_config(&self) -> anyhow::Result<UsmConfig> {
        UsmConfig::load(&self.config_source())
            .with_context(|| format!("failed to load {}", self.config_label()))
    }

    pub fn create_manager(&self) -> anyhow::Result<ServiceManager> {
        let config = self.load_config()?;
        if let Some(dir) = config.manager.log_dir_path() {
            usm::logging::init_file_logging(&dir)?;
        }
        Ok(ServiceManager::new(config, Arc::new(NativeController::new()))?)
    }
}
