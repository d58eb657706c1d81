//! The node-local container runtime surface the Janitor sweeps.
//!
//! `DockerContainerRuntime` drives the runtime as a subprocess
//! (`Command::new("docker")`) rather than linking a client library, listing
//! and removing containers keyed by the labels this control plane stamps
//! onto every sandbox container.

use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{FastSandboxError, Result};
use crate::model::SandboxId;

pub const LABEL_SANDBOX_ID: &str = "fastsandbox.io/sandbox-id";
pub const LABEL_POD_UID: &str = "fastsandbox.io/pod-uid";
pub const LABEL_POD_NAME: &str = "fastsandbox.io/pod-name";
pub const LABEL_MANAGED: &str = "fastsandbox.io/managed";
/// Unix epoch milliseconds the container was created, stamped by whatever
/// starts it. `docker`'s own `CreatedAt` is a human date string, not a
/// number, so the orphan grace window reads this label instead.
pub const LABEL_CREATED_AT: &str = "fastsandbox.io/created-at";

/// One container the runtime reports, with whatever orchestrator labels it
/// carries parsed out. A container missing `sandbox_id` or `pod_uid` is
/// itself grounds for the Janitor to treat it as orphaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub sandbox_id: Option<SandboxId>,
    pub pod_uid: Option<String>,
    pub pod_name: Option<String>,
    pub created_at_millis: i64,
}

/// The container-runtime surface the Janitor depends on: list what's
/// labelled as ours, stop and remove what's orphaned.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_managed_containers(&self) -> Result<Vec<ContainerInfo>>;
    async fn stop_and_remove(&self, container_id: &str) -> Result<()>;
}

/// Shells out to `docker` (or a compatible CLI) rather than linking against
/// its client library.
pub struct DockerContainerRuntime {
    binary: String,
}

impl Default for DockerContainerRuntime {
    fn default() -> Self {
        DockerContainerRuntime { binary: "docker".to_string() }
    }
}

impl DockerContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        DockerContainerRuntime { binary: binary.into() }
    }

    fn parse_ps_line(line: &str) -> Option<ContainerInfo> {
        // `docker ps --format '{{.ID}}\t{{.Label "..."}}\t...\t{{.Label "fastsandbox.io/created-at"}}'`
        let mut fields = line.split('\t');
        let id = fields.next()?.to_string();
        let sandbox_id = fields.next().filter(|s| !s.is_empty()).and_then(|s| s.parse::<u128>().ok()).map(SandboxId);
        let pod_uid = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
        let pod_name = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
        let created_at_millis = fields.next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        Some(ContainerInfo { id, sandbox_id, pod_uid, pod_name, created_at_millis })
    }
}

#[async_trait]
impl ContainerRuntime for DockerContainerRuntime {
    async fn list_managed_containers(&self) -> Result<Vec<ContainerInfo>> {
        let format = format!(
            "{{{{.ID}}}}\\t{{{{.Label \"{LABEL_SANDBOX_ID}\"}}}}\\t{{{{.Label \"{LABEL_POD_UID}\"}}}}\\t{{{{.Label \"{LABEL_POD_NAME}\"}}}}\\t{{{{.Label \"{LABEL_CREATED_AT}\"}}}}"
        );
        let output = Command::new(&self.binary)
            .args(["ps", "-a", "--filter", &format!("label={LABEL_MANAGED}=true"), "--format", &format])
            .output()
            .map_err(|e| FastSandboxError::DurableStoreUnavailable(format!("docker ps: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FastSandboxError::DurableStoreUnavailable(format!("docker ps failed: {stderr}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(Self::parse_ps_line).collect())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["rm", "-f", container_id])
            .output()
            .map_err(|e| FastSandboxError::DurableStoreUnavailable(format!("docker rm: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(container = %container_id, error = %stderr, "docker rm -f failed");
        }
        Ok(())
    }
}

/// In-memory double for Janitor tests.
#[derive(Default)]
pub struct FakeContainerRuntime {
    pub containers: tokio::sync::Mutex<Vec<ContainerInfo>>,
    pub removed: tokio::sync::Mutex<Vec<String>>,
}

impl FakeContainerRuntime {
    pub async fn seed(&self, containers: Vec<ContainerInfo>) {
        *self.containers.lock().await = containers;
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn list_managed_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.containers.lock().await.clone())
    }

    async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        self.containers.lock().await.retain(|c| c.id != container_id);
        self.removed.lock().await.push(container_id.to_string());
        Ok(())
    }
}

/// Default per-scan RPC deadline; not currently exposed as a config knob
/// since the runtime calls are local-subprocess, not network.
pub const DEFAULT_RUNTIME_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_ps_line() {
        let id = SandboxId::derive("s", "ns", 1);
        let line = format!("abc123\t{}\tpod-uid-1\tpod-1\t1700000000000", id.0);
        let info = DockerContainerRuntime::parse_ps_line(&line).unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.sandbox_id, Some(id));
        assert_eq!(info.pod_uid.as_deref(), Some("pod-uid-1"));
    }

    #[test]
    fn missing_labels_parse_as_none() {
        let line = "abc123\t\t\t\t1700000000000";
        let info = DockerContainerRuntime::parse_ps_line(line).unwrap();
        assert!(info.sandbox_id.is_none());
        assert!(info.pod_uid.is_none());
    }

    #[test]
    fn created_at_label_parses_as_epoch_millis() {
        let line = "abc123\t\t\t\t1700000000000";
        let info = DockerContainerRuntime::parse_ps_line(line).unwrap();
        assert_eq!(info.created_at_millis, 1700000000000);
    }

    #[test]
    fn missing_created_at_label_falls_back_to_zero_not_a_parse_of_a_date_string() {
        let line = "abc123\t\t\t\t";
        let info = DockerContainerRuntime::parse_ps_line(line).unwrap();
        assert_eq!(info.created_at_millis, 0);
    }
}
