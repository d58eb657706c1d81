//! Fast-Path / Strong-Path request-reply server.
//!
//! The business logic (`create_sandbox`, `delete_sandbox`, ...) is kept
//! transport-free so it can be unit-tested directly against a
//! [`FakeClusterApi`](crate::cluster::FakeClusterApi) and
//! [`FakeAgentRpc`](crate::agent_rpc::FakeAgentRpc); `serve()` is the thin
//! `hyper` listen loop around it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent_rpc::{self, AgentRpc};
use crate::cluster::{ClusterApi, SandboxRecord, SandboxSpecPatch, SandboxStatus, SANDBOX_FINALIZER};
use crate::error::{FastSandboxError, Result};
use crate::model::{self, ConsistencyMode, Phase, SandboxId};
use crate::registry::{AllocateRequest, Registry};

use super::protocol::*;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Clone)]
pub struct FastPathConfig {
    pub default_consistency_mode: ConsistencyMode,
    pub agent_timeout: Duration,
    /// Window after an async (FAST-mode) durable write is enqueued before
    /// it is considered overdue and logged.
    pub durable_write_window: Duration,
    /// `RecoveryTimeoutSeconds` stamped onto a sandbox's spec at admission
    /// when the request doesn't carry its own.
    pub default_recovery_timeout_seconds: u32,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        FastPathConfig {
            default_consistency_mode: ConsistencyMode::Fast,
            agent_timeout: Duration::from_secs(5),
            durable_write_window: Duration::from_secs(10),
            default_recovery_timeout_seconds: 60,
        }
    }
}

/// An in-flight or just-completed FAST-mode create, visible to `Get`/`List`
/// before the durable record exists. Cleared once the background task that
/// writes the durable record finishes (success or not — a lingering overlay
/// entry is less harmful than losing read-your-writes).
#[derive(Debug, Clone)]
struct OverlayEntry {
    view: SandboxView,
}

pub struct FastPathServer {
    registry: Arc<Registry>,
    cluster: Arc<dyn ClusterApi>,
    agent_rpc: Arc<dyn AgentRpc>,
    config: FastPathConfig,
    overlay: Mutex<HashMap<(String, String), OverlayEntry>>,
}

impl FastPathServer {
    pub fn new(registry: Arc<Registry>, cluster: Arc<dyn ClusterApi>, agent_rpc: Arc<dyn AgentRpc>, config: FastPathConfig) -> Self {
        FastPathServer {
            registry,
            cluster,
            agent_rpc,
            config,
            overlay: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<CreateSandboxResponse> {
        let start = Instant::now();
        let now_nanos = model::now_nanos();
        let name = req.name.clone().unwrap_or_default();

        if let Some(expire) = req.expire_time {
            let now_millis = (now_nanos / 1_000_000) as i64;
            if expire <= now_millis {
                return Err(FastSandboxError::InvalidRequest(
                    "expire_time already elapsed at creation".to_string(),
                ));
            }
        }
        model::validate_ports(&req.exposed_ports).map_err(FastSandboxError::InvalidRequest)?;

        let sandbox_id = SandboxId::derive(&name, &req.namespace, now_nanos);
        let name = if name.is_empty() { format!("sb-{}", sandbox_id.short_hex()) } else { name };

        let mode = req.consistency_mode.unwrap_or(self.config.default_consistency_mode);
        match mode {
            ConsistencyMode::Fast => self.create_fast(req, name, sandbox_id, start).await,
            ConsistencyMode::Strong => self.create_strong(req, name, sandbox_id, start).await,
        }
    }

    async fn create_fast(
        &self,
        req: CreateSandboxRequest,
        name: String,
        sandbox_id: SandboxId,
        start: Instant,
    ) -> Result<CreateSandboxResponse> {
        let agent_id = self
            .registry
            .allocate(AllocateRequest {
                pool_ref: req.pool_ref.clone(),
                image: req.image.clone(),
                exposed_ports: req.exposed_ports.clone(),
                sandbox_id,
            })
            .await?;

        let agent = self
            .registry
            .get_agent(&agent_id)
            .await
            .ok_or_else(|| FastSandboxError::AgentUnreachable {
                agent: agent_id.to_string(),
                reason: "vanished immediately after allocation".to_string(),
            })?;

        let create_req = agent_rpc::CreateSandboxRequest {
            sandbox_id,
            image: req.image.clone(),
            command: req.command.clone(),
            args: req.args.clone(),
            envs: req.envs.clone(),
            working_dir: req.working_dir.clone(),
            exposed_ports: req.exposed_ports.clone(),
        };

        let agent_result = self.agent_rpc.create(&agent.endpoint, &create_req, self.config.agent_timeout).await;

        let resp = match agent_result {
            Ok(resp) => resp,
            Err(e) => {
                self.registry.release(&agent_id, &sandbox_id, &req.exposed_ports).await;
                return Err(e);
            }
        };

        let view = SandboxView {
            namespace: req.namespace.clone(),
            name: name.clone(),
            sandbox_id: Some(sandbox_id),
            phase: Phase::Running,
            assigned_pod: Some(agent.pod_name.clone()),
            endpoints: resp.endpoints.clone(),
        };
        self.overlay
            .lock()
            .await
            .insert((req.namespace.clone(), name.clone()), OverlayEntry { view });

        let agent_pod = agent.pod_name.clone();
        self.spawn_durable_write(req, name.clone(), sandbox_id, agent, resp.endpoints.clone());

        Ok(CreateSandboxResponse {
            sandbox_id,
            agent_pod,
            endpoints: resp.endpoints,
            duration_nanos: start.elapsed().as_nanos(),
        })
    }

    fn spawn_durable_write(
        &self,
        req: CreateSandboxRequest,
        name: String,
        sandbox_id: SandboxId,
        agent: crate::model::Agent,
        endpoints: Vec<String>,
    ) {
        let cluster = self.cluster.clone();
        let window = self.config.durable_write_window;
        tokio::spawn(async move {
            let deadline = Instant::now() + window;
            let record = SandboxRecord {
                namespace: req.namespace.clone(),
                name: name.clone(),
                uid: sandbox_id.to_string(),
                finalizers: vec![SANDBOX_FINALIZER.to_string()],
                labels: Default::default(),
                deletion_timestamp: None,
                spec: crate::cluster::SandboxSpec {
                    image: req.image,
                    command: req.command,
                    args: req.args,
                    envs: req.envs,
                    working_dir: req.working_dir,
                    exposed_ports: req.exposed_ports,
                    pool_ref: req.pool_ref,
                    expire_time: req.expire_time,
                    failure_policy: req.failure_policy.unwrap_or_default(),
                    recovery_timeout_seconds: self.config.default_recovery_timeout_seconds,
                    reset_revision: 0,
                },
                status: SandboxStatus {
                    phase: Phase::Running,
                    assigned_pod: Some(agent.pod_name),
                    node_name: Some(agent.node_name),
                    sandbox_id: Some(sandbox_id),
                    endpoints,
                    accepted_reset_revision: 0,
                    message: None,
                    last_reconciled: None,
                },
            };
            if let Err(e) = cluster.create_sandbox_record(record).await {
                warn!(namespace = %req.namespace, name = %name, error = %e, "durable write for FAST-mode create failed");
            }
            if Instant::now() > deadline {
                warn!(namespace = %req.namespace, name = %name, "durable write exceeded consistency window");
            }
        });
    }

    async fn create_strong(
        &self,
        req: CreateSandboxRequest,
        name: String,
        sandbox_id: SandboxId,
        start: Instant,
    ) -> Result<CreateSandboxResponse> {
        let pending = SandboxRecord {
            namespace: req.namespace.clone(),
            name: name.clone(),
            uid: sandbox_id.to_string(),
            finalizers: vec![SANDBOX_FINALIZER.to_string()],
            labels: Default::default(),
            deletion_timestamp: None,
            spec: crate::cluster::SandboxSpec {
                image: req.image.clone(),
                command: req.command.clone(),
                args: req.args.clone(),
                envs: req.envs.clone(),
                working_dir: req.working_dir.clone(),
                exposed_ports: req.exposed_ports.clone(),
                pool_ref: req.pool_ref.clone(),
                expire_time: req.expire_time,
                failure_policy: req.failure_policy.unwrap_or_default(),
                recovery_timeout_seconds: self.config.default_recovery_timeout_seconds,
                reset_revision: 0,
            },
            status: SandboxStatus {
                phase: Phase::Pending,
                ..Default::default()
            },
        };
        self.cluster.create_sandbox_record(pending).await?;

        let agent_id = match self
            .registry
            .allocate(AllocateRequest {
                pool_ref: req.pool_ref.clone(),
                image: req.image.clone(),
                exposed_ports: req.exposed_ports.clone(),
                sandbox_id,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let _ = self
                    .cluster
                    .patch_sandbox_status(
                        &req.namespace,
                        &name,
                        &SandboxStatus { phase: Phase::Failed, message: Some(e.to_string()), ..Default::default() },
                    )
                    .await;
                return Err(e);
            }
        };
        let agent = self.registry.get_agent(&agent_id).await.ok_or_else(|| FastSandboxError::AgentUnreachable {
            agent: agent_id.to_string(),
            reason: "vanished immediately after allocation".to_string(),
        })?;

        let create_req = agent_rpc::CreateSandboxRequest {
            sandbox_id,
            image: req.image.clone(),
            command: req.command.clone(),
            args: req.args.clone(),
            envs: req.envs.clone(),
            working_dir: req.working_dir.clone(),
            exposed_ports: req.exposed_ports.clone(),
        };
        let agent_resp = match self.agent_rpc.create(&agent.endpoint, &create_req, self.config.agent_timeout).await {
            Ok(r) => r,
            Err(e) => {
                self.registry.release(&agent_id, &sandbox_id, &req.exposed_ports).await;
                let _ = self
                    .cluster
                    .patch_sandbox_status(
                        &req.namespace,
                        &name,
                        &SandboxStatus { phase: Phase::Failed, message: Some(e.to_string()), ..Default::default() },
                    )
                    .await;
                return Err(e);
            }
        };

        let final_status = SandboxStatus {
            phase: Phase::Running,
            assigned_pod: Some(agent.pod_name.clone()),
            node_name: Some(agent.node_name.clone()),
            sandbox_id: Some(sandbox_id),
            endpoints: agent_resp.endpoints.clone(),
            accepted_reset_revision: 0,
            message: None,
            last_reconciled: None,
        };
        self.cluster.patch_sandbox_status(&req.namespace, &name, &final_status).await?;

        Ok(CreateSandboxResponse {
            sandbox_id,
            agent_pod: agent.pod_name,
            endpoints: agent_resp.endpoints,
            duration_nanos: start.elapsed().as_nanos(),
        })
    }

    /// Looks the record up by `SandboxID` since that, not `Name`, is what
    /// the caller supplies. Idempotent: a missing record is success.
    pub async fn delete_sandbox(&self, req: DeleteSandboxRequest) -> Result<Ack> {
        let all = self.cluster.list_sandboxes().await?;
        let Some(record) = all.into_iter().find(|r| r.namespace == req.namespace && r.status.sandbox_id == Some(req.sandbox_id)) else {
            return Ok(Ack::ok());
        };

        if let Some(pod) = &record.status.assigned_pod {
            if let Some(agent) = self
                .registry
                .get_all_agents()
                .await
                .into_iter()
                .find(|a| &a.pod_name == pod)
            {
                let delete_req = agent_rpc::DeleteSandboxRequest { sandbox_id: req.sandbox_id, grace_period_seconds: 10 };
                if let Err(e) = self.agent_rpc.delete(&agent.endpoint, &delete_req, self.config.agent_timeout).await {
                    warn!(sandbox = %req.sandbox_id, error = %e, "best-effort agent delete failed");
                }
                self.registry.release(&agent.id, &req.sandbox_id, &record.spec.exposed_ports).await;
            }
        }

        self.overlay.lock().await.remove(&(req.namespace.clone(), record.name.clone()));
        self.cluster.delete_sandbox_record(&req.namespace, &record.name).await?;
        Ok(Ack::ok())
    }

    pub async fn update_sandbox(&self, req: UpdateSandboxRequest) -> Result<Ack> {
        let all = self.cluster.list_sandboxes().await?;
        let Some(record) = all.into_iter().find(|r| r.namespace == req.namespace && r.status.sandbox_id == Some(req.sandbox_id)) else {
            return Err(FastSandboxError::InvalidRequest(format!("unknown sandbox {}", req.sandbox_id)));
        };

        let patch = SandboxSpecPatch {
            expire_time: req.expire_time.map(Some),
            reset_revision: req.reset_revision,
            failure_policy: req.failure_policy,
            labels: req.labels,
        };
        self.cluster.patch_sandbox_spec(&req.namespace, &record.name, &patch).await?;
        Ok(Ack::ok())
    }

    pub async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Option<SandboxView>> {
        if let Some(entry) = self.overlay.lock().await.get(&(namespace.to_string(), name.to_string())) {
            return Ok(Some(entry.view.clone()));
        }
        let record = self.cluster.get_sandbox(namespace, name).await?;
        Ok(record.map(Self::record_to_view))
    }

    pub async fn list_sandboxes(&self, namespace: Option<&str>) -> Result<Vec<SandboxView>> {
        let durable = self.cluster.list_sandboxes().await?;
        let mut by_key: HashMap<(String, String), SandboxView> = durable
            .into_iter()
            .filter(|r| namespace.map(|ns| ns == r.namespace).unwrap_or(true))
            .map(|r| ((r.namespace.clone(), r.name.clone()), Self::record_to_view(r)))
            .collect();

        for (key, entry) in self.overlay.lock().await.iter() {
            if namespace.map(|ns| ns == key.0).unwrap_or(true) {
                by_key.insert(key.clone(), entry.view.clone());
            }
        }
        Ok(by_key.into_values().collect())
    }

    fn record_to_view(r: SandboxRecord) -> SandboxView {
        SandboxView {
            namespace: r.namespace,
            name: r.name,
            sandbox_id: r.status.sandbox_id,
            phase: r.status.phase,
            assigned_pod: r.status.assigned_pod,
            endpoints: r.status.endpoints,
        }
    }
}

// ---------------------------------------------------------------------
// HTTP wiring
// ---------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        ApiResponse { success: true, data: Some(data), error: None }
    }
}

fn err_response<T: Serialize>(status: StatusCode, msg: impl Into<String>) -> Response<BoxBody> {
    let body = ApiResponse::<T> { success: false, data: None, error: Some(msg.into()) };
    json_response(status, &body)
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(body))
        .unwrap()
}

fn status_for(err: &FastSandboxError) -> StatusCode {
    match err {
        FastSandboxError::NoCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FastSandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        FastSandboxError::AgentUnreachable { .. } | FastSandboxError::DurableStoreUnavailable(_) => StatusCode::BAD_GATEWAY,
        FastSandboxError::AgentRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        FastSandboxError::DurableStoreConflict { .. } => StatusCode::CONFLICT,
        FastSandboxError::Lost(_) => StatusCode::GONE,
        FastSandboxError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> std::result::Result<T, Response<BoxBody>> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| err_response::<()>(StatusCode::BAD_REQUEST, e.to_string()))?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| err_response::<()>(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")))
}

async fn route(req: Request<Incoming>, server: Arc<FastPathServer>) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| {
            q.split('&')
                .filter_map(|kv| kv.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &ApiResponse::ok("ok")),

        (Method::POST, ["v1", "sandboxes"]) => {
            let body: CreateSandboxRequest = match read_json_body(req).await {
                Ok(b) => b,
                Err(resp) => return Ok(resp),
            };
            match server.create_sandbox(body).await {
                Ok(resp) => json_response(StatusCode::CREATED, &ApiResponse::ok(resp)),
                Err(e) => err_response::<()>(status_for(&e), e.to_string()),
            }
        }

        (Method::DELETE, ["v1", "namespaces", ns, "sandboxes", sandbox_id]) => {
            let id: u128 = match sandbox_id.parse_hex() {
                Ok(v) => v,
                Err(_) => return Ok(err_response::<()>(StatusCode::BAD_REQUEST, "invalid sandboxId")),
            };
            match server.delete_sandbox(DeleteSandboxRequest { sandbox_id: SandboxId(id), namespace: ns.to_string() }).await {
                Ok(ack) => json_response(StatusCode::OK, &ApiResponse::ok(ack)),
                Err(e) => err_response::<()>(status_for(&e), e.to_string()),
            }
        }

        (Method::PATCH, ["v1", "namespaces", ns, "sandboxes", sandbox_id]) => {
            let id: u128 = match sandbox_id.parse_hex() {
                Ok(v) => v,
                Err(_) => return Ok(err_response::<()>(StatusCode::BAD_REQUEST, "invalid sandboxId")),
            };
            #[derive(Deserialize, Default)]
            struct PatchBody {
                expire_time: Option<i64>,
                reset_revision: Option<i64>,
                failure_policy: Option<crate::model::FailurePolicy>,
                labels: Option<std::collections::BTreeMap<String, String>>,
            }
            let body: PatchBody = match read_json_body(req).await {
                Ok(b) => b,
                Err(resp) => return Ok(resp),
            };
            let update = UpdateSandboxRequest {
                sandbox_id: SandboxId(id),
                namespace: ns.to_string(),
                expire_time: body.expire_time,
                reset_revision: body.reset_revision,
                failure_policy: body.failure_policy,
                labels: body.labels,
            };
            match server.update_sandbox(update).await {
                Ok(ack) => json_response(StatusCode::OK, &ApiResponse::ok(ack)),
                Err(e) => err_response::<()>(status_for(&e), e.to_string()),
            }
        }

        (Method::GET, ["v1", "namespaces", ns, "sandboxes", name]) => match server.get_sandbox(ns, name).await {
            Ok(Some(view)) => json_response(StatusCode::OK, &ApiResponse::ok(view)),
            Ok(None) => err_response::<()>(StatusCode::NOT_FOUND, "not found"),
            Err(e) => err_response::<()>(status_for(&e), e.to_string()),
        },

        (Method::GET, ["v1", "sandboxes"]) => {
            let ns = query.get("namespace").map(|s| s.as_str());
            match server.list_sandboxes(ns).await {
                Ok(views) => json_response(StatusCode::OK, &ApiResponse::ok(views)),
                Err(e) => err_response::<()>(status_for(&e), e.to_string()),
            }
        }

        _ => err_response::<()>(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

trait ParseHex {
    fn parse_hex(&self) -> std::result::Result<u128, std::num::ParseIntError>;
}
impl ParseHex for str {
    fn parse_hex(&self) -> std::result::Result<u128, std::num::ParseIntError> {
        u128::from_str_radix(self, 16)
    }
}

/// Bind and serve the Fast-Path HTTP API until `shutdown` is cancelled.
pub async fn serve(addr: SocketAddr, server: Arc<FastPathServer>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "fast-path server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("fast-path server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted?;
                let io = TokioIo::new(stream);
                let server = server.clone();
                let conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let conn = http1::Builder::new().serve_connection(io, service_fn(move |req| route(req, server.clone())));
                    tokio::select! {
                        res = conn => {
                            if let Err(e) = res {
                                error!(error = %e, "fast-path connection error");
                            }
                        }
                        _ = conn_shutdown.cancelled() => {}
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_rpc::FakeAgentRpc;
    use crate::cluster::FakeClusterApi;
    use crate::registry::AgentProbe;
    use std::collections::BTreeSet;

    async fn test_server() -> (Arc<FastPathServer>, Arc<Registry>, Arc<FakeClusterApi>, Arc<FakeAgentRpc>) {
        let registry = Arc::new(Registry::new());
        registry
            .register_or_update(AgentProbe {
                id: "agent-1".into(),
                pool_name: "pool-a".into(),
                namespace: "default".into(),
                pod_name: "pod-1".into(),
                node_name: "node-1".into(),
                endpoint: "127.0.0.1:9000".into(),
                capacity: 5,
                images: BTreeSet::new(),
                port_reservations: BTreeSet::new(),
                sandbox_statuses: None,
                ready: true,
            })
            .await;
        let cluster = Arc::new(FakeClusterApi::new());
        let agent_rpc = Arc::new(FakeAgentRpc::default());
        let server = Arc::new(FastPathServer::new(
            registry.clone(),
            cluster.clone() as Arc<dyn ClusterApi>,
            agent_rpc.clone() as Arc<dyn AgentRpc>,
            FastPathConfig::default(),
        ));
        (server, registry, cluster, agent_rpc)
    }

    #[tokio::test]
    async fn fast_create_is_read_your_writes_before_durable_write_lands() {
        let (server, _registry, _cluster, _agent) = test_server().await;
        let resp = server
            .create_sandbox(CreateSandboxRequest {
                image: "img".into(),
                pool_ref: "pool-a".into(),
                exposed_ports: vec![8080],
                namespace: "default".into(),
                name: Some("s1".into()),
                consistency_mode: Some(ConsistencyMode::Fast),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.endpoints[0], "127.0.0.1:9000:8080");

        let view = server.get_sandbox("default", "s1").await.unwrap().unwrap();
        assert_eq!(view.phase, Phase::Running);
    }

    #[tokio::test]
    async fn omitted_consistency_mode_falls_back_to_configured_default() {
        let registry = Arc::new(Registry::new());
        registry
            .register_or_update(AgentProbe {
                id: "agent-1".into(),
                pool_name: "pool-a".into(),
                namespace: "default".into(),
                pod_name: "pod-1".into(),
                node_name: "node-1".into(),
                endpoint: "127.0.0.1:9000".into(),
                capacity: 5,
                images: BTreeSet::new(),
                port_reservations: BTreeSet::new(),
                sandbox_statuses: None,
                ready: true,
            })
            .await;
        let cluster = Arc::new(FakeClusterApi::new());
        let agent_rpc = Arc::new(FakeAgentRpc::default());
        let config = FastPathConfig { default_consistency_mode: ConsistencyMode::Strong, ..FastPathConfig::default() };
        let server = FastPathServer::new(registry, cluster.clone() as Arc<dyn ClusterApi>, agent_rpc as Arc<dyn AgentRpc>, config);

        server
            .create_sandbox(CreateSandboxRequest {
                image: "img".into(),
                pool_ref: "pool-a".into(),
                exposed_ports: vec![],
                namespace: "default".into(),
                name: Some("s-default-mode".into()),
                consistency_mode: None,
                ..Default::default()
            })
            .await
            .unwrap();

        // Strong mode persists the durable record before the call returns.
        let record = cluster.get_sandbox("default", "s-default-mode").await.unwrap().unwrap();
        assert_eq!(record.status.phase, Phase::Running);
    }

    #[tokio::test]
    async fn strong_create_is_durable_before_replying() {
        let (server, _registry, cluster, _agent) = test_server().await;
        server
            .create_sandbox(CreateSandboxRequest {
                image: "img".into(),
                pool_ref: "pool-a".into(),
                exposed_ports: vec![9090],
                namespace: "default".into(),
                name: Some("s2".into()),
                consistency_mode: Some(ConsistencyMode::Strong),
                ..Default::default()
            })
            .await
            .unwrap();

        let record = cluster.get_sandbox("default", "s2").await.unwrap().unwrap();
        assert_eq!(record.status.phase, Phase::Running);
    }

    #[tokio::test]
    async fn create_fails_fast_on_no_capacity_and_releases_nothing() {
        let (server, _registry, _cluster, _agent) = test_server().await;
        let err = server
            .create_sandbox(CreateSandboxRequest {
                image: "img".into(),
                pool_ref: "nonexistent-pool".into(),
                exposed_ports: vec![],
                namespace: "default".into(),
                name: Some("s3".into()),
                consistency_mode: Some(ConsistencyMode::Fast),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FastSandboxError::NoCapacity { .. }));
    }

    #[tokio::test]
    async fn expired_sandbox_is_rejected_at_admission() {
        let (server, _registry, _cluster, _agent) = test_server().await;
        let err = server
            .create_sandbox(CreateSandboxRequest {
                image: "img".into(),
                pool_ref: "pool-a".into(),
                exposed_ports: vec![],
                namespace: "default".into(),
                name: Some("s4".into()),
                consistency_mode: Some(ConsistencyMode::Fast),
                expire_time: Some(1),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FastSandboxError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (server, _registry, _cluster, _agent) = test_server().await;
        let resp = server
            .create_sandbox(CreateSandboxRequest {
                image: "img".into(),
                pool_ref: "pool-a".into(),
                exposed_ports: vec![],
                namespace: "default".into(),
                name: Some("s5".into()),
                consistency_mode: Some(ConsistencyMode::Strong),
                ..Default::default()
            })
            .await
            .unwrap();

        let req = DeleteSandboxRequest { sandbox_id: resp.sandbox_id, namespace: "default".into() };
        let first = server.delete_sandbox(req.clone()).await.unwrap();
        let second = server.delete_sandbox(req).await.unwrap();
        assert!(first.ok);
        assert!(second.ok);
    }
}
