//! The cluster-scheduler surface: CRD shapes and the `ClusterApi` trait that
//! abstracts List/Watch/Get/Patch/Create/Delete plus finalizer semantics.
//!
//! The reconcilers and the Pool autoscaler never touch `kube` directly —
//! they hold a `dyn ClusterApi` so tests can run against [`FakeClusterApi`]
//! and production wires up [`KubeClusterApi`]. The trait stays one level
//! above `kube::Api`, so the reconcile logic itself stays agnostic to which
//! cluster scheduler is behind it: a generic list/get/patch/finalizer
//! surface, not a `kube`-specific one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FastSandboxError, Result};
use crate::model::{EnvVar, FailurePolicy, Phase, SandboxId};

/// Finalizer string the Sandbox Reconciler attaches before it will let a
/// deletion proceed.
pub const SANDBOX_FINALIZER: &str = "fastsandbox.io/cleanup";

// ---------------------------------------------------------------------
// Plain-data record shapes. These are what the reconcilers operate on;
// the kube::CustomResource types below exist only to move them in and out
// of the API server.
// ---------------------------------------------------------------------

/// Desired state of a sandbox, mirrored 1:1 from the durable CRD spec.
///
/// Doubles as the `kube::CustomResource` spec type under the `kubernetes`
/// feature (generating a `Sandbox` object type with `.spec`/`.status`)
/// rather than wrapping a separate type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema, kube::CustomResource))]
#[cfg_attr(
    feature = "kubernetes",
    kube(
        group = "fastsandbox.io",
        version = "v1alpha1",
        kind = "Sandbox",
        plural = "sandboxes",
        shortname = "sbx",
        status = "SandboxStatus",
        namespaced
    )
)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxSpec {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub envs: Vec<EnvVar>,
    pub working_dir: Option<String>,
    pub exposed_ports: Vec<i32>,
    pub pool_ref: String,
    /// Absolute unix-millis deadline; `None` means no expiry.
    pub expire_time: Option<i64>,
    pub failure_policy: FailurePolicy,
    pub recovery_timeout_seconds: u32,
    /// Opaque monotone token; advancing it past `status.accepted_reset_revision`
    /// forces delete-then-recreate in place.
    pub reset_revision: i64,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        SandboxSpec {
            image: String::new(),
            command: Vec::new(),
            args: Vec::new(),
            envs: Vec::new(),
            working_dir: None,
            exposed_ports: Vec::new(),
            pool_ref: String::new(),
            expire_time: None,
            failure_policy: FailurePolicy::default(),
            recovery_timeout_seconds: 60,
            reset_revision: 0,
        }
    }
}

/// Observed state of a sandbox, owned exclusively by the Sandbox Reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema))]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxStatus {
    pub phase: Phase,
    pub assigned_pod: Option<String>,
    pub node_name: Option<String>,
    pub sandbox_id: Option<SandboxId>,
    pub endpoints: Vec<String>,
    pub accepted_reset_revision: i64,
    pub message: Option<String>,
    pub last_reconciled: Option<String>,
}

/// A sandbox record as read back from the durable store: identity, spec,
/// status, and the bookkeeping the reconciler needs (finalizers, deletion
/// timestamp) that lives outside `spec`/`status` in the real API object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub finalizers: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Unix millis; `Some` once the object has been marked for deletion.
    pub deletion_timestamp: Option<i64>,
    pub spec: SandboxSpec,
    pub status: SandboxStatus,
}

impl SandboxRecord {
    pub fn has_finalizer(&self, f: &str) -> bool {
        self.finalizers.iter().any(|x| x == f)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A partial update to a sandbox's spec fields, as accepted by `UpdateSandbox`.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpecPatch {
    pub expire_time: Option<Option<i64>>,
    pub reset_revision: Option<i64>,
    pub failure_policy: Option<FailurePolicy>,
    pub labels: Option<BTreeMap<String, String>>,
}

/// Desired shape of an agent fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema, kube::CustomResource))]
#[cfg_attr(
    feature = "kubernetes",
    kube(
        group = "fastsandbox.io",
        version = "v1alpha1",
        kind = "Pool",
        plural = "pools",
        shortname = "fsp",
        status = "PoolStatus",
        namespaced
    )
)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolSpec {
    pub pool_min: u32,
    pub pool_max: u32,
    pub buffer_min: u32,
    pub buffer_max: u32,
    pub max_sandboxes_per_pod: u32,
    pub image: String,
    /// Opaque pod spec template, kept as a JSON blob rather than a typed
    /// `PodSpec` — the runtime integration owns its exact shape.
    pub agent_template: serde_json::Value,
}

impl Default for PoolSpec {
    fn default() -> Self {
        PoolSpec {
            pool_min: 0,
            pool_max: 0,
            buffer_min: 0,
            buffer_max: 0,
            max_sandboxes_per_pod: 1,
            image: String::new(),
            agent_template: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "kubernetes", derive(schemars::JsonSchema))]
#[serde(default, rename_all = "camelCase")]
pub struct PoolStatus {
    pub ready_pods: u32,
    pub unready_pods: u32,
    pub total_pods: u32,
    pub last_reconciled: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub namespace: String,
    pub name: String,
    pub spec: PoolSpec,
    pub status: PoolStatus,
}

/// A running agent pod, as seen by the Pool Reconciler and the
/// Agent-Control Loop. Deliberately thinner than a full `k8s_openapi::Pod`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub pool_name: String,
    pub ip: Option<String>,
    pub node_name: Option<String>,
    pub ready: bool,
    pub labels: BTreeMap<String, String>,
    pub created_at_millis: i64,
}

/// Label applied to every agent pod this control plane manages.
pub const POOL_LABEL: &str = "fast-sandbox.io/pool";

// ---------------------------------------------------------------------
// ClusterApi: the abstracted List/Watch/Get/Patch/Create/Delete surface.
// ---------------------------------------------------------------------

/// The cluster-scheduler surface consumed by the reconcilers and the Pool
/// autoscaler. One trait covers both CRD kinds and the raw pod objects they
/// drive, since in practice all three travel over the same API-server
/// connection and the same finalizer semantics.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Option<SandboxRecord>>;
    async fn list_sandboxes(&self) -> Result<Vec<SandboxRecord>>;
    /// Create a brand-new sandbox record (Fast-Path `STRONG` mode creates
    /// this before touching the Registry; `FAST` mode creates it from the
    /// asynchronous durable-write task after the agent has already acked).
    async fn create_sandbox_record(&self, record: SandboxRecord) -> Result<()>;
    async fn patch_sandbox_status(&self, namespace: &str, name: &str, status: &SandboxStatus) -> Result<()>;
    async fn patch_sandbox_spec(&self, namespace: &str, name: &str, patch: &SandboxSpecPatch) -> Result<()>;
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;
    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()>;
    /// Request deletion. If the record still carries finalizers this only
    /// sets `deletion_timestamp` (standard API-server finalizer-blocking
    /// semantics — `kube`'s own `delete()` does this automatically); the
    /// record is only actually removed once its finalizer list is empty.
    async fn delete_sandbox_record(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_pools(&self) -> Result<Vec<PoolRecord>>;
    async fn patch_pool_status(&self, namespace: &str, name: &str, status: &PoolStatus) -> Result<()>;

    async fn list_agent_pods(&self, pool_name: &str) -> Result<Vec<PodInfo>>;
    /// Create a pod from `pool.spec.agent_template` with the mandatory
    /// injections (pool label, downward-API env vars). Returns the created
    /// pod's name.
    async fn create_agent_pod(&self, pool: &PoolRecord) -> Result<String>;
    async fn delete_agent_pod(&self, namespace: &str, pod_name: &str) -> Result<()>;
}

#[cfg(feature = "kubernetes")]
pub mod kube_backend {
    //! `kube`-backed `ClusterApi`, plus the `kube::CustomResource` derives
    //! for `Sandbox` and `Pool`. Standard `Api<T>`/`Patch::Merge`/
    //! owner-reference idioms throughout.

    use super::*;
    use k8s_openapi::api::core::v1::{EnvVar as K8sEnvVar, EnvVarSource, ObjectFieldSelector, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::{Client, Resource, ResourceExt};

    fn to_record(s: &Sandbox) -> SandboxRecord {
        SandboxRecord {
            namespace: s.namespace().unwrap_or_default(),
            name: s.name_any(),
            uid: s.uid().unwrap_or_default(),
            finalizers: s.meta().finalizers.clone().unwrap_or_default(),
            deletion_timestamp: s
                .meta()
                .deletion_timestamp
                .as_ref()
                .map(|t| t.0.timestamp_millis()),
            spec: s.spec.clone(),
            status: s.status.clone().unwrap_or_default(),
        }
    }

    fn pool_to_record(p: &Pool) -> PoolRecord {
        PoolRecord {
            namespace: p.namespace().unwrap_or_default(),
            name: p.name_any(),
            spec: p.spec.clone(),
            status: p.status.clone().unwrap_or_default(),
        }
    }

    pub struct KubeClusterApi {
        client: Client,
    }

    impl KubeClusterApi {
        pub fn new(client: Client) -> Self {
            KubeClusterApi { client }
        }

        fn sandboxes(&self, ns: &str) -> Api<Sandbox> {
            Api::namespaced(self.client.clone(), ns)
        }

        fn pools(&self) -> Api<Pool> {
            Api::all(self.client.clone())
        }

        fn pods(&self, ns: &str) -> Api<Pod> {
            Api::namespaced(self.client.clone(), ns)
        }
    }

    #[async_trait]
    impl ClusterApi for KubeClusterApi {
        async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Option<SandboxRecord>> {
            self.sandboxes(namespace)
                .get_opt(name)
                .await
                .map(|opt| opt.as_ref().map(to_record))
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))
        }

        async fn list_sandboxes(&self) -> Result<Vec<SandboxRecord>> {
            let all: Api<Sandbox> = Api::all(self.client.clone());
            let list = all
                .list(&Default::default())
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(list.items.iter().map(to_record).collect())
        }

        async fn create_sandbox_record(&self, record: SandboxRecord) -> Result<()> {
            let sandbox = Sandbox {
                metadata: ObjectMeta {
                    name: Some(record.name.clone()),
                    namespace: Some(record.namespace.clone()),
                    finalizers: if record.finalizers.is_empty() { None } else { Some(record.finalizers.clone()) },
                    labels: if record.labels.is_empty() {
                        None
                    } else {
                        Some(record.labels.clone().into_iter().collect())
                    },
                    ..Default::default()
                },
                spec: record.spec,
                status: Some(record.status),
            };
            self.sandboxes(&record.namespace)
                .create(&PostParams::default(), &sandbox)
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(())
        }

        async fn patch_sandbox_status(&self, namespace: &str, name: &str, status: &SandboxStatus) -> Result<()> {
            let patch = serde_json::json!({ "status": status });
            self.sandboxes(namespace)
                .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| FastSandboxError::DurableStoreConflict { key: format!("{e}") })?;
            Ok(())
        }

        async fn patch_sandbox_spec(&self, namespace: &str, name: &str, patch: &SandboxSpecPatch) -> Result<()> {
            let mut spec_patch = serde_json::Map::new();
            if let Some(expire) = &patch.expire_time {
                spec_patch.insert("expireTime".to_string(), serde_json::json!(expire));
            }
            if let Some(rev) = patch.reset_revision {
                spec_patch.insert("resetRevision".to_string(), serde_json::json!(rev));
            }
            if let Some(fp) = patch.failure_policy {
                spec_patch.insert("failurePolicy".to_string(), serde_json::json!(fp));
            }
            let mut body = serde_json::json!({ "spec": spec_patch });
            if let Some(labels) = &patch.labels {
                body["metadata"] = serde_json::json!({ "labels": labels });
            }
            self.sandboxes(namespace)
                .patch(name, &PatchParams::default(), &Patch::Merge(&body))
                .await
                .map_err(|e| FastSandboxError::DurableStoreConflict { key: format!("{e}") })?;
            Ok(())
        }

        async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
            let patch = serde_json::json!({ "metadata": { "finalizers": [finalizer] } });
            self.sandboxes(namespace)
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| FastSandboxError::DurableStoreConflict { key: format!("{e}") })?;
            Ok(())
        }

        async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
            let existing = self.get_sandbox(namespace, name).await?;
            let Some(mut rec) = existing else { return Ok(()) };
            rec.finalizers.retain(|f| f != finalizer);
            let patch = serde_json::json!({ "metadata": { "finalizers": rec.finalizers } });
            self.sandboxes(namespace)
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| FastSandboxError::DurableStoreConflict { key: format!("{e}") })?;
            Ok(())
        }

        async fn delete_sandbox_record(&self, namespace: &str, name: &str) -> Result<()> {
            self.sandboxes(namespace)
                .delete(name, &Default::default())
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(())
        }

        async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
            let list = self
                .pools()
                .list(&Default::default())
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(list.items.iter().map(pool_to_record).collect())
        }

        async fn patch_pool_status(&self, namespace: &str, name: &str, status: &PoolStatus) -> Result<()> {
            let patch = serde_json::json!({ "status": status });
            let api: Api<Pool> = Api::namespaced(self.client.clone(), namespace);
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| FastSandboxError::DurableStoreConflict { key: format!("{e}") })?;
            Ok(())
        }

        async fn list_agent_pods(&self, pool_name: &str) -> Result<Vec<PodInfo>> {
            let all: Api<Pod> = Api::all(self.client.clone());
            let selector = format!("{POOL_LABEL}={pool_name}");
            let params = kube::api::ListParams::default().labels(&selector);
            let list = all
                .list(&params)
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(list
                .items
                .iter()
                .map(|p| PodInfo {
                    name: p.name_any(),
                    namespace: p.namespace().unwrap_or_default(),
                    uid: p.uid().unwrap_or_default(),
                    pool_name: pool_name.to_string(),
                    ip: p.status.as_ref().and_then(|s| s.pod_ip.clone()),
                    node_name: p.spec.as_ref().and_then(|s| s.node_name.clone()),
                    ready: p
                        .status
                        .as_ref()
                        .and_then(|s| s.conditions.as_ref())
                        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
                        .unwrap_or(false),
                    labels: p.labels().clone().into_iter().collect(),
                    created_at_millis: p
                        .meta()
                        .creation_timestamp
                        .as_ref()
                        .map(|t| t.0.timestamp_millis())
                        .unwrap_or(0),
                })
                .collect())
        }

        async fn create_agent_pod(&self, pool: &PoolRecord) -> Result<String> {
            let mut pod: Pod = serde_json::from_value(pool.spec.agent_template.clone())
                .map_err(|e| FastSandboxError::InvalidRequest(format!("invalid agent_template: {e}")))?;

            let meta = pod.metadata.clone();
            let mut labels = meta.labels.unwrap_or_default();
            labels.insert(POOL_LABEL.to_string(), pool.name.clone());
            pod.metadata = ObjectMeta {
                generate_name: Some(format!("{}-", pool.name)),
                namespace: Some(pool.namespace.clone()),
                labels: Some(labels),
                ..meta
            };

            let per_slot_cpu_millis = 1000 / pool.spec.max_sandboxes_per_pod.max(1);
            let downward = |field: &str| K8sEnvVar {
                name: String::new(),
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: field.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                value: None,
            };
            let injected = vec![
                K8sEnvVar { name: "FASTSANDBOX_POD_NAME".into(), ..downward("metadata.name") },
                K8sEnvVar { name: "FASTSANDBOX_POD_IP".into(), ..downward("status.podIP") },
                K8sEnvVar { name: "FASTSANDBOX_NODE_NAME".into(), ..downward("spec.nodeName") },
                K8sEnvVar {
                    name: "FASTSANDBOX_NAMESPACE".into(),
                    value: Some(pool.namespace.clone()),
                    value_from: None,
                },
                K8sEnvVar {
                    name: "FASTSANDBOX_POOL".into(),
                    value: Some(pool.name.clone()),
                    value_from: None,
                },
                K8sEnvVar {
                    name: "FASTSANDBOX_SLOT_CPU_MILLIS".into(),
                    value: Some(per_slot_cpu_millis.to_string()),
                    value_from: None,
                },
            ];

            if let Some(spec) = pod.spec.as_mut() {
                for container in &mut spec.containers {
                    let env = container.env.get_or_insert_with(Vec::new);
                    env.extend(injected.iter().cloned());
                }
            }

            let created = self
                .pods(&pool.namespace)
                .create(&PostParams::default(), &pod)
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(created.name_any())
        }

        async fn delete_agent_pod(&self, namespace: &str, pod_name: &str) -> Result<()> {
            self.pods(namespace)
                .delete(pod_name, &Default::default())
                .await
                .map_err(|e| FastSandboxError::DurableStoreUnavailable(e.to_string()))?;
            Ok(())
        }
    }

    /// Render both CRDs as installable YAML manifests.
    pub fn generate_crd_manifests() -> anyhow::Result<(String, String)> {
        let sandbox = serde_yaml::to_string(&Sandbox::crd())?;
        let pool = serde_yaml::to_string(&Pool::crd())?;
        Ok((sandbox, pool))
    }
}

#[cfg(feature = "kubernetes")]
pub use kube_backend::{generate_crd_manifests, KubeClusterApi};

/// In-memory `ClusterApi` for tests and for running without a real cluster.
/// Always compiled: reconciler tests depend on it directly.
pub struct FakeClusterApi {
    state: tokio::sync::Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    sandboxes: BTreeMap<(String, String), SandboxRecord>,
    pools: BTreeMap<(String, String), PoolRecord>,
    pods: BTreeMap<(String, String), PodInfo>,
    next_pod_seq: u64,
}

impl Default for FakeClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClusterApi {
    pub fn new() -> Self {
        FakeClusterApi {
            state: tokio::sync::Mutex::new(FakeState::default()),
        }
    }

    pub async fn put_sandbox(&self, record: SandboxRecord) {
        let mut s = self.state.lock().await;
        s.sandboxes.insert((record.namespace.clone(), record.name.clone()), record);
    }

    pub async fn put_pool(&self, record: PoolRecord) {
        let mut s = self.state.lock().await;
        s.pools.insert((record.namespace.clone(), record.name.clone()), record);
    }

    pub async fn put_pod(&self, pod: PodInfo) {
        let mut s = self.state.lock().await;
        s.pods.insert((pod.namespace.clone(), pod.name.clone()), pod);
    }

    pub async fn mark_deleting(&self, namespace: &str, name: &str, deletion_timestamp_millis: i64) {
        let mut s = self.state.lock().await;
        if let Some(r) = s.sandboxes.get_mut(&(namespace.to_string(), name.to_string())) {
            r.deletion_timestamp = Some(deletion_timestamp_millis);
        }
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn get_sandbox(&self, namespace: &str, name: &str) -> Result<Option<SandboxRecord>> {
        let s = self.state.lock().await;
        Ok(s.sandboxes.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn list_sandboxes(&self) -> Result<Vec<SandboxRecord>> {
        let s = self.state.lock().await;
        Ok(s.sandboxes.values().cloned().collect())
    }

    async fn create_sandbox_record(&self, record: SandboxRecord) -> Result<()> {
        let mut s = self.state.lock().await;
        let key = (record.namespace.clone(), record.name.clone());
        if s.sandboxes.contains_key(&key) {
            return Err(FastSandboxError::DurableStoreConflict { key: record.name });
        }
        s.sandboxes.insert(key, record);
        Ok(())
    }

    async fn patch_sandbox_status(&self, namespace: &str, name: &str, status: &SandboxStatus) -> Result<()> {
        let mut s = self.state.lock().await;
        let key = (namespace.to_string(), name.to_string());
        let rec = s
            .sandboxes
            .get_mut(&key)
            .ok_or_else(|| FastSandboxError::DurableStoreConflict { key: name.to_string() })?;
        rec.status = status.clone();
        Ok(())
    }

    async fn patch_sandbox_spec(&self, namespace: &str, name: &str, patch: &SandboxSpecPatch) -> Result<()> {
        let mut s = self.state.lock().await;
        let key = (namespace.to_string(), name.to_string());
        let rec = s
            .sandboxes
            .get_mut(&key)
            .ok_or_else(|| FastSandboxError::DurableStoreConflict { key: name.to_string() })?;
        if let Some(expire) = patch.expire_time {
            rec.spec.expire_time = expire;
        }
        if let Some(rev) = patch.reset_revision {
            rec.spec.reset_revision = rev;
        }
        if let Some(fp) = patch.failure_policy {
            rec.spec.failure_policy = fp;
        }
        if let Some(labels) = &patch.labels {
            rec.labels = labels.clone();
        }
        Ok(())
    }

    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        let key = (namespace.to_string(), name.to_string());
        let rec = s
            .sandboxes
            .get_mut(&key)
            .ok_or_else(|| FastSandboxError::DurableStoreConflict { key: name.to_string() })?;
        if !rec.has_finalizer(finalizer) {
            rec.finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str, finalizer: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        if let Some(rec) = s.sandboxes.get_mut(&(namespace.to_string(), name.to_string())) {
            rec.finalizers.retain(|f| f != finalizer);
        }
        Ok(())
    }

    async fn delete_sandbox_record(&self, namespace: &str, name: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        let key = (namespace.to_string(), name.to_string());
        match s.sandboxes.get_mut(&key) {
            Some(rec) if !rec.finalizers.is_empty() => {
                rec.deletion_timestamp = Some(rec.deletion_timestamp.unwrap_or(0));
            }
            _ => {
                s.sandboxes.remove(&key);
            }
        }
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolRecord>> {
        let s = self.state.lock().await;
        Ok(s.pools.values().cloned().collect())
    }

    async fn patch_pool_status(&self, namespace: &str, name: &str, status: &PoolStatus) -> Result<()> {
        let mut s = self.state.lock().await;
        if let Some(rec) = s.pools.get_mut(&(namespace.to_string(), name.to_string())) {
            rec.status = status.clone();
        }
        Ok(())
    }

    async fn list_agent_pods(&self, pool_name: &str) -> Result<Vec<PodInfo>> {
        let s = self.state.lock().await;
        Ok(s.pods.values().filter(|p| p.pool_name == pool_name).cloned().collect())
    }

    async fn create_agent_pod(&self, pool: &PoolRecord) -> Result<String> {
        let mut s = self.state.lock().await;
        s.next_pod_seq += 1;
        let name = format!("{}-{}", pool.name, s.next_pod_seq);
        let pod = PodInfo {
            name: name.clone(),
            namespace: pool.namespace.clone(),
            uid: name.clone(),
            pool_name: pool.name.clone(),
            ip: Some(format!("10.0.0.{}", s.next_pod_seq % 255)),
            node_name: Some("fake-node".to_string()),
            ready: true,
            labels: BTreeMap::from([(POOL_LABEL.to_string(), pool.name.clone())]),
            created_at_millis: 0,
        };
        s.pods.insert((pod.namespace.clone(), pod.name.clone()), pod);
        Ok(name)
    }

    async fn delete_agent_pod(&self, namespace: &str, pod_name: &str) -> Result<()> {
        let mut s = self.state.lock().await;
        s.pods.remove(&(namespace.to_string(), pod_name.to_string()));
        Ok(())
    }
}
