//! Configuration parsing for fast-sandbox.toml files.
//!
//! `toml`+`serde`, loaded via `from_file`/`from_str`; every section uses
//! `#[serde(default = "fn_name")]` per field with a named default function
//! so a partial document still resolves to sane values everywhere else.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Root configuration structure matching the `fast-sandbox.toml` schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSurfaceConfig,
    #[serde(default)]
    pub fastpath: FastPathConfigSection,
    #[serde(default)]
    pub agent_control: AgentControlConfigSection,
    #[serde(default)]
    pub janitor: JanitorConfigSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The TCP port every agent pod exposes its RPC surface on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSurfaceConfig {
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
}

impl Default for AgentSurfaceConfig {
    fn default() -> Self {
        AgentSurfaceConfig { agent_port: default_agent_port() }
    }
}

fn default_agent_port() -> u16 {
    8081
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastPathConfigSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Default mode when a client omits `ConsistencyMode` on `CreateSandbox`.
    #[serde(default = "default_consistency_mode")]
    pub fastpath_consistency_mode: String,
    /// Janitor grace window; bounds FAST-mode durable-write latency.
    #[serde(default = "default_fastpath_orphan_timeout_secs")]
    pub fastpath_orphan_timeout_secs: u64,
}

impl Default for FastPathConfigSection {
    fn default() -> Self {
        FastPathConfigSection {
            listen_addr: default_listen_addr(),
            fastpath_consistency_mode: default_consistency_mode(),
            fastpath_orphan_timeout_secs: default_fastpath_orphan_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_consistency_mode() -> String {
    "FAST".to_string()
}

fn default_fastpath_orphan_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentControlConfigSection {
    /// Agent-Control Loop tick.
    #[serde(default = "default_agent_control_interval_secs")]
    pub agent_control_interval_secs: u64,
    /// Bound for each status probe.
    #[serde(default = "default_per_agent_timeout_secs")]
    pub per_agent_timeout_secs: u64,
    /// Heartbeat staleness bound; Registry GC threshold.
    #[serde(default = "default_stale_agent_timeout_secs")]
    pub stale_agent_timeout_secs: u64,
    /// Default `RecoveryTimeoutSeconds` on sandboxes.
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u32,
}

impl Default for AgentControlConfigSection {
    fn default() -> Self {
        AgentControlConfigSection {
            agent_control_interval_secs: default_agent_control_interval_secs(),
            per_agent_timeout_secs: default_per_agent_timeout_secs(),
            stale_agent_timeout_secs: default_stale_agent_timeout_secs(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
        }
    }
}

fn default_agent_control_interval_secs() -> u64 {
    2
}

fn default_per_agent_timeout_secs() -> u64 {
    2
}

fn default_stale_agent_timeout_secs() -> u64 {
    5 * 60
}

fn default_recovery_timeout_seconds() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorConfigSection {
    /// Janitor scan cadence.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_container_runtime_bin")]
    pub container_runtime_bin: String,
}

impl Default for JanitorConfigSection {
    fn default() -> Self {
        JanitorConfigSection {
            scan_interval_secs: default_scan_interval_secs(),
            container_runtime_bin: default_container_runtime_bin(),
        }
    }
}

fn default_scan_interval_secs() -> u64 {
    2 * 60
}

fn default_container_runtime_bin() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { filter: default_log_filter() }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML configuration")
    }
}
