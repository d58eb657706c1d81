//! The Agent surface consumed by the control plane: `POST /sandbox/create`,
//! `POST /sandbox/delete`, `GET /status`, `GET /logs`.
//!
//! `HttpAgentRpc` is a thin hyper client against those routes; tests talk to
//! [`FakeAgentRpc`] instead so reconciler and Fast-Path logic never needs a
//! live agent process.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FastSandboxError, Result};
use crate::model::{EnvVar, SandboxId, SandboxStatusSnapshot};

#[derive(Debug, Clone, Serialize)]
pub struct CreateSandboxRequest {
    pub sandbox_id: SandboxId,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub envs: Vec<EnvVar>,
    pub working_dir: Option<String>,
    pub exposed_ports: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSandboxResponse {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteSandboxRequest {
    pub sandbox_id: SandboxId,
    pub grace_period_seconds: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentStatus {
    pub capacity: u32,
    pub images: BTreeSet<String>,
    pub port_reservations: BTreeSet<i32>,
    pub sandbox_statuses: BTreeMap<SandboxId, SandboxStatusSnapshot>,
}

/// The Agent surface, abstracted so the Fast-Path server and reconcilers
/// never depend on the transport directly (tests substitute `FakeAgentRpc`).
#[async_trait]
pub trait AgentRpc: Send + Sync {
    async fn create(&self, endpoint: &str, req: &CreateSandboxRequest, timeout: Duration) -> Result<CreateSandboxResponse>;
    async fn delete(&self, endpoint: &str, req: &DeleteSandboxRequest, timeout: Duration) -> Result<()>;
    async fn status(&self, endpoint: &str, timeout: Duration) -> Result<AgentStatus>;
    async fn logs(&self, endpoint: &str, sandbox_id: SandboxId, timeout: Duration) -> Result<Vec<u8>>;
}

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn json_body<T: Serialize>(value: &T) -> std::result::Result<BoxBody, FastSandboxError> {
    let bytes = serde_json::to_vec(value).map_err(|e| FastSandboxError::InvalidRequest(e.to_string()))?;
    Ok(Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed())
}

/// hyper-based implementation of [`AgentRpc`] talking plain HTTP+JSON.
pub struct HttpAgentRpc {
    client: LegacyClient<HttpConnector, BoxBody>,
}

impl Default for HttpAgentRpc {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentRpc {
    pub fn new() -> Self {
        HttpAgentRpc {
            client: LegacyClient::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    async fn send(
        &self,
        method: hyper::Method,
        url: &str,
        body: BoxBody,
        timeout: Duration,
        agent: &str,
    ) -> Result<Bytes> {
        let req = Request::builder()
            .method(method)
            .uri(url)
            .header("content-type", "application/json")
            .body(body)
            .map_err(|e| FastSandboxError::InvalidRequest(e.to_string()))?;

        let call = self.client.request(req);
        let resp = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return Err(FastSandboxError::AgentUnreachable {
                    agent: agent.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(FastSandboxError::AgentUnreachable {
                    agent: agent.to_string(),
                    reason: "request timed out".to_string(),
                })
            }
        };

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| FastSandboxError::AgentUnreachable {
                agent: agent.to_string(),
                reason: e.to_string(),
            })?
            .to_bytes();

        if !status.is_success() {
            let reason = String::from_utf8_lossy(&bytes).to_string();
            return Err(FastSandboxError::AgentRejected {
                agent: agent.to_string(),
                reason,
            });
        }
        Ok(bytes)
    }
}

#[async_trait]
impl AgentRpc for HttpAgentRpc {
    async fn create(&self, endpoint: &str, req: &CreateSandboxRequest, timeout: Duration) -> Result<CreateSandboxResponse> {
        let url = format!("http://{endpoint}/sandbox/create");
        let body = json_body(req)?;
        let bytes = self.send(hyper::Method::POST, &url, body, timeout, endpoint).await?;
        serde_json::from_slice(&bytes).map_err(|e| FastSandboxError::AgentRejected {
            agent: endpoint.to_string(),
            reason: format!("malformed response: {e}"),
        })
    }

    async fn delete(&self, endpoint: &str, req: &DeleteSandboxRequest, timeout: Duration) -> Result<()> {
        let url = format!("http://{endpoint}/sandbox/delete");
        let body = json_body(req)?;
        self.send(hyper::Method::POST, &url, body, timeout, endpoint).await?;
        Ok(())
    }

    async fn status(&self, endpoint: &str, timeout: Duration) -> Result<AgentStatus> {
        let url = format!("http://{endpoint}/status");
        let empty = Full::new(Bytes::new()).map_err(|never| match never {}).boxed();
        let bytes = self.send(hyper::Method::GET, &url, empty, timeout, endpoint).await?;
        serde_json::from_slice(&bytes).map_err(|e| FastSandboxError::AgentRejected {
            agent: endpoint.to_string(),
            reason: format!("malformed status response: {e}"),
        })
    }

    async fn logs(&self, endpoint: &str, sandbox_id: SandboxId, timeout: Duration) -> Result<Vec<u8>> {
        let url = format!("http://{endpoint}/logs?sandboxId={sandbox_id}");
        let empty = Full::new(Bytes::new()).map_err(|never| match never {}).boxed();
        let bytes = self.send(hyper::Method::GET, &url, empty, timeout, endpoint).await?;
        Ok(bytes.to_vec())
    }
}

/// In-memory double for tests: records calls, answers from a scripted table.
#[derive(Default)]
pub struct FakeAgentRpc {
    pub created: tokio::sync::Mutex<Vec<(String, SandboxId)>>,
    pub deleted: tokio::sync::Mutex<Vec<(String, SandboxId)>>,
    pub fail_create: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl AgentRpc for FakeAgentRpc {
    async fn create(&self, endpoint: &str, req: &CreateSandboxRequest, _timeout: Duration) -> Result<CreateSandboxResponse> {
        if self.fail_create.load(std::sync::atomic::Ordering::SeqCst) {
            warn!(%endpoint, "fake agent rejecting create");
            return Err(FastSandboxError::AgentRejected {
                agent: endpoint.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        self.created.lock().await.push((endpoint.to_string(), req.sandbox_id));
        let port = req.exposed_ports.first().copied().unwrap_or(0);
        Ok(CreateSandboxResponse {
            endpoints: vec![format!("{endpoint}:{port}")],
        })
    }

    async fn delete(&self, endpoint: &str, req: &DeleteSandboxRequest, _timeout: Duration) -> Result<()> {
        self.deleted.lock().await.push((endpoint.to_string(), req.sandbox_id));
        Ok(())
    }

    async fn status(&self, _endpoint: &str, _timeout: Duration) -> Result<AgentStatus> {
        Ok(AgentStatus {
            capacity: 0,
            images: BTreeSet::new(),
            port_reservations: BTreeSet::new(),
            sandbox_statuses: BTreeMap::new(),
        })
    }

    async fn logs(&self, _endpoint: &str, _sandbox_id: SandboxId, _timeout: Duration) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_create_records_call_and_builds_endpoint() {
        let rpc = FakeAgentRpc::default();
        let req = CreateSandboxRequest {
            sandbox_id: SandboxId::derive("s", "ns", 1),
            image: "img".into(),
            command: vec![],
            args: vec![],
            envs: vec![],
            working_dir: None,
            exposed_ports: vec![8080],
        };
        let resp = rpc.create("10.0.0.1:9000", &req, Duration::from_secs(1)).await.unwrap();
        assert_eq!(resp.endpoints[0], "10.0.0.1:9000:8080");
        assert_eq!(rpc.created.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn fake_create_honors_scripted_failure() {
        let rpc = FakeAgentRpc::default();
        rpc.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
        let req = CreateSandboxRequest {
            sandbox_id: SandboxId::derive("s", "ns", 1),
            image: "img".into(),
            command: vec![],
            args: vec![],
            envs: vec![],
            working_dir: None,
            exposed_ports: vec![],
        };
        let err = rpc.create("10.0.0.1:9000", &req, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FastSandboxError::AgentRejected { .. }));
    }
}
