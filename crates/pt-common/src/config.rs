//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Configuration model and loader for transport hosts."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_backend() -> String {
    "in-memory".to_owned()
}

fn default_network() -> String {
    "default".to_owned()
}

fn default_reply_capacity() -> usize {
    16
}

fn default_thread_count() -> usize {
    1
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for a transport host process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "PT_CONFIG";

    /// Load configuration from disk, respecting the `PT_CONFIG` override.
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

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.workers.validate()?;
        self.rpc.validate()?;
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

/// Session start document. Selects the substrate backend and carries the
/// options the backend needs to establish its connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Logical network name; sessions on the same network reach each other.
    #[serde(default = "default_network")]
    pub network: String,
    /// Capacity of the per-call RPC reply channel.
    #[serde(default = "default_reply_capacity")]
    pub reply_capacity: usize,
}

impl SessionConfig {
    /// Parse a start document. An empty document yields the defaults.
    pub fn from_start_doc(start_doc: &str) -> Result<Self> {
        start_doc.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(anyhow!("session backend cannot be empty"));
        }
        if self.network.trim().is_empty() {
            return Err(anyhow!("session network cannot be empty"));
        }
        if self.reply_capacity == 0 {
            return Err(anyhow!("session reply_capacity must be at least 1"));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            network: default_network(),
            reply_capacity: default_reply_capacity(),
        }
    }
}

impl std::str::FromStr for SessionConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: SessionConfig =
            toml::from_str(content).with_context(|| "failed to parse session start document")?;
        config.validate()?;
        Ok(config)
    }
}

/// What a bounded queue does when a push arrives while it is full.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Hand the new item back to the producer.
    #[default]
    Reject,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!("unknown overflow policy: {}", other)),
        }
    }
}

/// Defaults for subscriber and RPC server worker pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    /// `None` keeps the fan-in queue unbounded so nothing is ever dropped.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(anyhow!("workers.thread_count must be at least 1"));
        }
        if self.queue_capacity == Some(0) {
            return Err(anyhow!(
                "workers.queue_capacity must be at least 1 (omit it for an unbounded queue)"
            ));
        }
        Ok(())
    }

    /// Same settings with a different thread count.
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_count: default_thread_count(),
            queue_capacity: None,
            overflow: OverflowPolicy::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl RpcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(anyhow!("rpc.timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: default_rpc_timeout(),
        }
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
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
