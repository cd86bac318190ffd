//! # Schemaflow Configuration System
//!
//! Typed configuration for the migration engine, driver construction and
//! logging, loaded from a YAML or TOML file with `SCHEMAFLOW__` environment
//! overrides.
//!
//! ## Usage
//!
//! ```rust
//! use schemaflow_core::config::{ConfigFormat, ConfigManager};
//!
//! let manager = ConfigManager::from_str(
//!     "execution:\n  max_concurrent_tasks: 8\n",
//!     ConfigFormat::Yaml,
//! )
//! .unwrap();
//! assert_eq!(manager.config().execution.max_concurrent_tasks, 8);
//! assert_eq!(manager.config().drivers.internal_database, "bytebase");
//! ```

pub mod error;
pub mod loader;

use crate::db::{DriverConfig, TlsConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::{ConfigFormat, ConfigManager};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaflowConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub drivers: DriverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named TLS settings connections may refer to by profile name
    #[serde(default)]
    pub tls_profiles: HashMap<String, TlsConfig>,
}

impl SchemaflowConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.execution.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_tasks",
                "0",
                "must be greater than 0",
            ));
        }

        if self.execution.task_timeout_seconds == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "execution.task_timeout_seconds",
                "0",
                "omit the field to disable the timeout",
            ));
        }

        if self.drivers.internal_database.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "drivers.internal_database",
                "driver configuration",
            ));
        }

        if self.drivers.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "drivers.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }

        for (name, profile) in self.tls_profiles.iter().chain(&self.drivers.tls_profiles) {
            if profile.profile.is_some() {
                return Err(ConfigurationError::invalid_value(
                    format!("tls_profiles.{name}.profile"),
                    profile.profile.clone().unwrap_or_default(),
                    "a TLS profile cannot refer to another profile",
                ));
            }
        }

        Ok(())
    }

    /// Driver settings with the top-level TLS profiles merged in
    pub fn driver_config(&self) -> DriverConfig {
        let mut config = self.drivers.clone();
        for (name, profile) in &self.tls_profiles {
            config
                .tls_profiles
                .entry(name.clone())
                .or_insert_with(|| profile.clone());
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Upper bound on migration tasks running at once
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Per-task deadline; none when absent
    #[serde(default)]
    pub task_timeout_seconds: Option<u64>,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_environment() -> String {
    "development".to_string()
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_seconds: None,
            environment: default_environment(),
        }
    }
}

impl ExecutionConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_seconds.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; environment default when absent
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            ansi: default_ansi(),
        }
    }
}
