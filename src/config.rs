//! Configuration for both binaries.
//!
//! JSON, read from the file passed on the command line, else from the
//! `CTRLPLANE_CONFIG` environment variable, else built from defaults.
//! `CTRLPLANE_AGENT_ID` and `CTRLPLANE_SERVER` override single fields.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::client::ClientConfig;
use crate::registry::{PrincipalRecord, RegistryConfig};

pub const CONFIG_ENV: &str = "CTRLPLANE_CONFIG";
pub const AGENT_ID_ENV: &str = "CTRLPLANE_AGENT_ID";
pub const SERVER_ENV: &str = "CTRLPLANE_SERVER";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Address the controller listens on.
    #[serde(default = "default_address")]
    pub listen: String,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,

    /// Agents allowed to connect.
    #[serde(default)]
    pub principals: Vec<PrincipalRecord>,

    /// Prefix for exported metric names.
    #[serde(default = "default_namespace")]
    pub metrics_namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Agent identity. Empty means unconfigured; the agent will not dial.
    #[serde(default)]
    pub id: String,

    /// Controller address.
    #[serde(default = "default_address")]
    pub server: String,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_seconds: u64,

    #[serde(default = "default_backoff_min")]
    pub backoff_min_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_drift_warning")]
    pub clock_drift_warning_seconds: u64,

    /// Concurrent tasks across both runners. 0 selects the built-in default.
    #[serde(default)]
    pub total_capacity: usize,

    /// Concurrent tasks per resource key. 0 selects the built-in default.
    #[serde(default)]
    pub resource_capacity: usize,

    /// Prefix for exported metric names.
    #[serde(default = "default_namespace")]
    pub metrics_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen: default_address(),
            ping_interval_seconds: default_ping_interval(),
            handshake_timeout_seconds: default_handshake_timeout(),
            principals: Vec::new(),
            metrics_namespace: default_namespace(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            server: default_address(),
            dial_timeout_seconds: default_dial_timeout(),
            backoff_min_ms: default_backoff_min(),
            backoff_max_ms: default_backoff_max(),
            clock_drift_warning_seconds: default_drift_warning(),
            total_capacity: 0,
            resource_capacity: 0,
            metrics_namespace: default_namespace(),
        }
    }
}

impl Config {
    /// Load from `path`, else from `CTRLPLANE_CONFIG`, else defaults; then
    /// apply the single-field environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var(CONFIG_ENV) {
                Ok(json) => {
                    Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}"))?
                }
                Err(_) => {
                    debug!("No configuration given, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Apply `CTRLPLANE_AGENT_ID` and `CTRLPLANE_SERVER` as read by `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(AGENT_ID_ENV) {
            self.agent.id = id;
        }
        if let Some(server) = lookup(SERVER_ENV) {
            self.agent.server = server;
        }
    }
}

impl RegistryConfig {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_seconds),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_seconds),
            ..Self::default()
        }
    }
}

impl ClientConfig {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            agent_id: config.id.clone(),
            dial_timeout: Duration::from_secs(config.dial_timeout_seconds),
            backoff_min: Duration::from_millis(config.backoff_min_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            clock_drift_warning: Duration::from_secs(config.clock_drift_warning_seconds),
            total_capacity: config.total_capacity,
            resource_capacity: config.resource_capacity,
            ..Self::default()
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:7771".into()
}

fn default_namespace() -> String {
    "ctrlplane".into()
}

const fn default_ping_interval() -> u64 {
    10
}

const fn default_handshake_timeout() -> u64 {
    10
}

const fn default_dial_timeout() -> u64 {
    5
}

const fn default_backoff_min() -> u64 {
    1000
}

const fn default_backoff_max() -> u64 {
    15_000
}

const fn default_drift_warning() -> u64 {
    5
}
