//! Configuration file support for snat-orchagent.
//!
//! Loads and validates daemon configuration from TOML files. Every section
//! and field is optional; missing values take the defaults below.
//! Default location: /etc/sonic/snat-orchagent.toml

use serde::{Deserialize, Serialize};
use snat_orch_common::JobQueueConfig;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::flows::{FlowOrchConfig, NaptMode};
use crate::ha::{NaptHaConfig, NoSwitchAction};
use crate::selector::SelectionStrategy;
use crate::services::TunnelType;
use crate::session::SessionConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/snat-orchagent.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Per-router job queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Jobs running at once across all routers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retries of a job failing with a retryable error
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// NAPT switch election
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

/// Tunnel preference between ordinary and NAPT switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_primary_tunnel")]
    pub primary_type: TunnelType,

    #[serde(default = "default_fallback_tunnel")]
    pub fallback_type: TunnelType,
}

/// Session translation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaptConfig {
    #[serde(default)]
    pub mode: NaptMode,

    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Idle timeout of learned session flows
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u16,
}

/// Failover behaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaConfig {
    #[serde(default)]
    pub no_switch_action: NoSwitchAction,
}

/// Complete snat-orchagent configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnatOrchConfig {
    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub election: ElectionConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub napt: NaptConfig,

    #[serde(default)]
    pub ha: HaConfig,
}

fn default_workers() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_primary_tunnel() -> TunnelType {
    TunnelType::Vxlan
}

fn default_fallback_tunnel() -> TunnelType {
    TunnelType::Gre
}

fn default_port_range_start() -> u16 {
    49152
}

fn default_port_range_end() -> u16 {
    65535
}

fn default_session_idle_timeout() -> u16 {
    300
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            primary_type: default_primary_tunnel(),
            fallback_type: default_fallback_tunnel(),
        }
    }
}

impl Default for NaptConfig {
    fn default() -> Self {
        Self {
            mode: NaptMode::default(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            session_idle_timeout_secs: default_session_idle_timeout(),
        }
    }
}

impl SnatOrchConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "snat-orchagent: config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Load configuration from file; a missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.jobs.workers == 0 {
            return Err(ConfigError::Invalid("jobs.workers must be > 0".to_string()));
        }
        if self.napt.port_range_start > self.napt.port_range_end {
            return Err(ConfigError::Invalid(format!(
                "napt.port_range_start ({}) exceeds napt.port_range_end ({})",
                self.napt.port_range_start, self.napt.port_range_end
            )));
        }
        if self.napt.mode == NaptMode::Learn && self.napt.session_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "napt.session_idle_timeout_secs must be > 0 in learn mode".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.jobs.retry_backoff_ms)
    }

    pub fn job_queue_config(&self) -> JobQueueConfig {
        JobQueueConfig::default()
            .with_workers(self.jobs.workers)
            .with_max_retries(self.jobs.max_retries)
            .with_retry_backoff(self.retry_backoff())
    }

    pub fn flow_orch_config(&self) -> FlowOrchConfig {
        FlowOrchConfig::default()
            .with_tunnels(self.tunnel.primary_type, self.tunnel.fallback_type)
            .with_napt_mode(self.napt.mode)
            .with_session_idle_timeout(self.napt.session_idle_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default().with_port_range(self.napt.port_range_start, self.napt.port_range_end)
    }

    pub fn ha_config(&self) -> NaptHaConfig {
        NaptHaConfig::default().with_no_switch_action(self.ha.no_switch_action)
    }
}
