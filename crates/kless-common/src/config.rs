//! ---
//! kless_section: "01-core-functionality"
//! kless_subsection: "module"
//! kless_type: "source"
//! kless_scope: "code"
//! kless_description: "Shared primitives and utilities for wallet contexts."
//! kless_version: "v0.0.0-prealpha"
//! kless_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_call_timeout() -> Duration {
    Duration::from_millis(5_000)
}

fn default_settled_history() -> usize {
    1024
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for Kless messaging binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "KLESS_CONFIG";

    /// Load configuration from disk, respecting the `KLESS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Load a specific configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.messaging.validate()?;
        for (index, seed) in self.permissions.seed.iter().enumerate() {
            seed.validate()
                .with_context(|| format!("invalid permissions.seed[{index}]"))?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Channel implementation linking two wallet contexts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    InMemory,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Deadline applied to calls that do not pass their own.
    #[serde(rename = "default_timeout_ms", default = "default_call_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_timeout: Duration,
    /// Terminal call ids remembered for late and duplicate reply detection.
    #[serde(default = "default_settled_history")]
    pub settled_history: usize,
    #[serde(default)]
    pub transport: TransportKind,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_call_timeout(),
            settled_history: default_settled_history(),
            transport: TransportKind::default(),
        }
    }
}

impl MessagingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout.is_zero() {
            return Err(anyhow!("messaging.default_timeout_ms must be greater than zero"));
        }
        if self.settled_history == 0 {
            return Err(anyhow!("messaging.settled_history must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Also write a daily rolling JSON log file under `directory`.
    #[serde(default)]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: false,
        }
    }
}

/// Permission requests preloaded into the background store by the CLI demo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub seed: Vec<PermissionSeed>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSeed {
    pub origin: String,
    #[serde(default)]
    pub fav_icon: Option<String>,
    /// camelCase permission names, e.g. `viewAccount`.
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl PermissionSeed {
    pub fn validate(&self) -> Result<()> {
        if self.origin.trim().is_empty() {
            return Err(anyhow!("origin must not be empty"));
        }
        if self.permissions.is_empty() {
            return Err(anyhow!(
                "origin '{}' must request at least one permission",
                self.origin
            ));
        }
        Ok(())
    }
}
