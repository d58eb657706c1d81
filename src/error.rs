//! Error taxonomy for the control-plane nucleus.
//!
//! Each variant has a single surfaced cause. Fast-Path propagates the first
//! blocking error verbatim to the client, reconcilers swallow transient
//! errors and backoff, and the Janitor logs and continues.

use thiserror::Error;

/// The crate-wide error type for the Registry, Fast-Path, and reconcilers.
#[derive(Debug, Error)]
pub enum FastSandboxError {
    /// The Registry could not satisfy an allocation request.
    #[error("no capacity available in pool {pool}")]
    NoCapacity {
        pool: String,
        /// Set when the only blocker was a port reservation overlap.
        port_conflict: bool,
    },

    /// An RPC to an agent failed or timed out.
    #[error("agent {agent} unreachable: {reason}")]
    AgentUnreachable { agent: String, reason: String },

    /// An agent acknowledged a request but refused it.
    #[error("agent {agent} rejected request: {reason}")]
    AgentRejected { agent: String, reason: String },

    /// An optimistic-concurrency miss on a durable-store patch.
    #[error("durable store conflict on {key}")]
    DurableStoreConflict { key: String },

    /// The durable store could not be reached.
    #[error("durable store unavailable: {0}")]
    DurableStoreUnavailable(String),

    /// The sandbox's assigned agent diverged from its heartbeat/registry state.
    #[error("sandbox {0} lost")]
    Lost(String),

    /// The caller or the process is shutting down.
    #[error("operation cancelled")]
    Cancelled,

    /// An admission-time validation failure (port range, expired `ExpireTime`, ...).
    #[error("invalid sandbox request: {0}")]
    InvalidRequest(String),
}

impl FastSandboxError {
    /// Specialized constructor for the `PortConflict` diagnostic case: a
    /// `NoCapacity` whose only blocker was a reserved-port overlap.
    pub fn port_conflict(pool: impl Into<String>) -> Self {
        FastSandboxError::NoCapacity {
            pool: pool.into(),
            port_conflict: true,
        }
    }

    pub fn no_capacity(pool: impl Into<String>) -> Self {
        FastSandboxError::NoCapacity {
            pool: pool.into(),
            port_conflict: false,
        }
    }

    /// True for errors the caller may retry after backoff without changing
    /// the request.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FastSandboxError::NoCapacity { .. }
                | FastSandboxError::AgentUnreachable { .. }
                | FastSandboxError::DurableStoreConflict { .. }
                | FastSandboxError::DurableStoreUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FastSandboxError>;
