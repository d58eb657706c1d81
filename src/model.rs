//! Core data model: agents, sandbox records, pools, and slots.
//!
//! `Agent` is the Registry's own in-memory notion of a data-plane worker; it
//! is never persisted and is rebuilt entirely from the Agent-Control Loop's
//! probe cycle. `SandboxRecord`/`PoolRecord` mirror the durable CRDs defined
//! in [`crate::cluster`] but are the plain-data shape the Registry, Scheduler,
//! and reconcilers operate on internally.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque, cluster-wide unique identifier for an agent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        AgentId(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        AgentId(s)
    }
}

/// 128-bit sandbox identifier, printed as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema))]
#[serde(transparent)]
pub struct SandboxId(pub u128);

impl SandboxId {
    /// `hash128(Name‖Namespace‖now_nanos)`, per the Fast-Path `CreateSandbox`
    /// algorithm. Not cryptographic — collision resistance only needs to hold
    /// within one cluster's lifetime, and the nanosecond timestamp component
    /// makes repeat calls with the same name/namespace diverge.
    pub fn derive(name: &str, namespace: &str, creation_timestamp_nanos: u128) -> Self {
        let mut lo = std::collections::hash_map::DefaultHasher::new();
        name.hash(&mut lo);
        namespace.hash(&mut lo);
        creation_timestamp_nanos.hash(&mut lo);
        let lo = lo.finish() as u128;

        let mut hi = std::collections::hash_map::DefaultHasher::new();
        namespace.hash(&mut hi);
        name.hash(&mut hi);
        (creation_timestamp_nanos ^ 0x9E37_79B9_7F4A_7C15).hash(&mut hi);
        let hi = hi.finish() as u128;

        SandboxId((hi << 64) | lo)
    }

    /// First 8 hex characters, used to synthesise `sb-<first-8-hex>` names
    /// when the caller omits `Name`.
    pub fn short_hex(&self) -> String {
        format!("{:032x}", self.0)[..8].to_string()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Current wall-clock time in nanoseconds since the epoch.
pub fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// A liveness snapshot for one sandbox as reported by an agent's `/status`
/// probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatusSnapshot {
    pub sandbox_id: SandboxId,
    pub phase: Phase,
    pub endpoints: Vec<String>,
}

/// A data-plane worker tracked by the Registry. Created on first successful
/// probe; updated on every probe/allocation/release; destroyed on explicit
/// removal or heartbeat-staleness GC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub pool_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub node_name: String,
    pub endpoint: String,
    pub capacity: u32,
    pub allocated: u32,
    pub images: BTreeSet<String>,
    pub port_reservations: BTreeSet<i32>,
    pub sandbox_statuses: BTreeMap<SandboxId, SandboxStatusSnapshot>,
    /// Monotonic milliseconds since an arbitrary epoch (the control process's
    /// own clock), not wall time — only used for staleness comparisons.
    pub last_heartbeat_millis: u64,
    pub ready: bool,
}

impl Agent {
    /// Slots free for new allocations.
    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated)
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.contains(image)
    }

    pub fn ports_free(&self, requested: &[i32]) -> bool {
        requested.iter().all(|p| !self.port_reservations.contains(p))
    }
}

/// Lifecycle phase of a sandbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum Phase {
    #[default]
    Pending,
    Scheduled,
    Running,
    Terminating,
    Failed,
    Lost,
    Gone,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Gone)
    }
}

/// What happens to a sandbox whose assigned agent has gone missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum FailurePolicy {
    #[default]
    Manual,
    AutoRecreate,
}

/// Consistency mode requested on `CreateSandbox`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsistencyMode {
    #[default]
    Fast,
    Strong,
}

/// A single environment variable, kept as an ordered pair rather than a map
/// so callers may rely on definition order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema))]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Validate that a port lies in the admissible range (1..=65535). Boundary
/// cases: `0` and `65536` are rejected, `1` and `65535` accepted.
pub fn validate_port(port: i32) -> std::result::Result<u16, String> {
    if !(1..=65535).contains(&port) {
        return Err(format!("port {port} out of range 1..65535"));
    }
    Ok(port as u16)
}

pub fn validate_ports(ports: &[i32]) -> std::result::Result<(), String> {
    for p in ports {
        validate_port(*p)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_id_diverges_on_timestamp() {
        let a = SandboxId::derive("foo", "ns", 1);
        let b = SandboxId::derive("foo", "ns", 2);
        assert_ne!(a, b);
    }

    #[test]
    fn sandbox_id_short_hex_is_eight_chars() {
        let id = SandboxId::derive("foo", "ns", 42);
        assert_eq!(id.short_hex().len(), 8);
    }

    #[test]
    fn port_boundaries() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
        assert!(validate_port(1).is_ok());
        assert!(validate_port(65535).is_ok());
    }

    #[test]
    fn agent_free_slots() {
        let agent = Agent {
            id: "a1".into(),
            pool_name: "pool".into(),
            namespace: "default".into(),
            pod_name: "pod-1".into(),
            node_name: "node-1".into(),
            endpoint: "10.0.0.1:8081".into(),
            capacity: 5,
            allocated: 3,
            images: BTreeSet::new(),
            port_reservations: BTreeSet::new(),
            sandbox_statuses: BTreeMap::new(),
            last_heartbeat_millis: 0,
            ready: true,
        };
        assert_eq!(agent.free_slots(), 2);
        assert!(agent.ports_free(&[80]));
    }
}
