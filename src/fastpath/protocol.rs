//! Wire types for the Fast-Path/Strong-Path request-reply surface.
//!
//! Plain serde structs, one per RPC, JSON over HTTP.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ConsistencyMode, EnvVar, FailurePolicy, Phase, SandboxId};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CreateSandboxRequest {
    pub image: String,
    pub pool_ref: String,
    pub exposed_ports: Vec<i32>,
    pub namespace: String,
    pub name: Option<String>,
    pub consistency_mode: Option<ConsistencyMode>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub envs: Vec<EnvVar>,
    pub working_dir: Option<String>,
    pub expire_time: Option<i64>,
    pub failure_policy: Option<FailurePolicy>,
}

impl Default for CreateSandboxRequest {
    fn default() -> Self {
        CreateSandboxRequest {
            image: String::new(),
            pool_ref: String::new(),
            exposed_ports: Vec::new(),
            namespace: "default".to_string(),
            name: None,
            consistency_mode: None,
            command: Vec::new(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
            expire_time: None,
            failure_policy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxResponse {
    pub sandbox_id: SandboxId,
    pub agent_pod: String,
    pub endpoints: Vec<String>,
    pub duration_nanos: u128,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteSandboxRequest {
    pub sandbox_id: SandboxId,
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpdateSandboxRequest {
    pub sandbox_id: SandboxId,
    pub namespace: String,
    pub expire_time: Option<i64>,
    pub reset_revision: Option<i64>,
    pub failure_policy: Option<FailurePolicy>,
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Ack { ok: true, message: None }
    }
}

/// Read-path view of a sandbox: durable fields plus whatever the Registry
/// overlay knows right now.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxView {
    pub namespace: String,
    pub name: String,
    pub sandbox_id: Option<SandboxId>,
    pub phase: Phase,
    pub assigned_pod: Option<String>,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}
