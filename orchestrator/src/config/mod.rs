//! Configuration module for the HistomicsTK deployer
//!
//! Supports configuration via:
//! - TOML/YAML config files (`config/histomicstk`, `/etc/histomicstk/config`)
//! - Environment variables (e.g. `HISTOMICSTK__NETWORK_NAME`)
//!
//! Per-run choices (ports, dependency modes, host paths) come from the command
//! line and are not part of this file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::container::{default_provision_command, ReconcilerSettings};
use crate::services::ServiceTable;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Network shared by the service containers
    #[serde(default = "default_network_name")]
    pub network_name: String,

    /// Directory holding the Dockerfiles
    #[serde(default = "default_build_context")]
    pub build_context: PathBuf,

    /// Command run inside the application container to provision it
    #[serde(default = "default_provision_command")]
    pub provision_command: Vec<String>,

    /// Grace period given to containers on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,

    /// Service descriptors
    #[serde(default)]
    pub services: ServiceTable,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_network_name() -> String {
    "histomicstk".to_string()
}

fn default_build_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            network_name: default_network_name(),
            build_context: default_build_context(),
            provision_command: default_provision_command(),
            stop_timeout_seconds: default_stop_timeout(),
            services: ServiceTable::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/histomicstk").required(false))
            .add_source(config::File::with_name("/etc/histomicstk/config").required(false))
            .add_source(
                config::Environment::with_prefix("HISTOMICSTK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values. The service table validates itself on
    /// deserialization.
    fn validate(&self) -> Result<()> {
        if self.network_name.trim().is_empty() {
            anyhow::bail!("Network name cannot be empty");
        }

        if self.provision_command.is_empty() {
            anyhow::bail!("Provision command cannot be empty");
        }

        Ok(())
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            network_name: self.network_name.clone(),
            build_context: self.build_context.clone(),
            provision_command: self.provision_command.clone(),
        }
    }
}
