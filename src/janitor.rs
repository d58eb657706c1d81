//! Node Janitor: the per-node orphan sweeper. Reconciles raw container
//! state against sandbox records, protected by a grace window so it never
//! races an in-flight Fast-Path create that hasn't persisted its record yet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::ClusterApi;
use crate::container_runtime::{ContainerInfo, ContainerRuntime};
use crate::model::SandboxId;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub scan_interval: Duration,
    pub orphan_timeout: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        JanitorConfig {
            scan_interval: Duration::from_secs(2 * 60),
            orphan_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Janitor {
    cluster: Arc<dyn ClusterApi>,
    runtime: Arc<dyn ContainerRuntime>,
    config: JanitorConfig,
}

/// Why a container was deemed orphaned, kept for logging.
#[derive(Debug, PartialEq, Eq)]
enum OrphanReason {
    NoOwningPod,
    NoSandboxRecord,
    PodUidMismatch,
}

impl Janitor {
    pub fn new(cluster: Arc<dyn ClusterApi>, runtime: Arc<dyn ContainerRuntime>, config: JanitorConfig) -> Self {
        Janitor { cluster, runtime, config }
    }

    async fn known_pod_uids(&self) -> Result<HashSet<String>, crate::error::FastSandboxError> {
        let mut uids = HashSet::new();
        for pool in self.cluster.list_pools().await? {
            for pod in self.cluster.list_agent_pods(&pool.name).await? {
                uids.insert(pod.uid);
            }
        }
        Ok(uids)
    }

    async fn sandbox_ids_by_pod_uid(&self) -> Result<HashMap<SandboxId, Option<String>>, crate::error::FastSandboxError> {
        let mut map = HashMap::new();
        for record in self.cluster.list_sandboxes().await? {
            if let Some(id) = record.status.sandbox_id {
                // The durable record tracks its pod by name, not uid; the
                // pod-uid cross-check happens against the live pod list in
                // `classify`, keyed by pod name instead.
                map.insert(id, record.status.assigned_pod.clone());
            }
        }
        Ok(map)
    }

    fn classify(container: &ContainerInfo, known_pod_uids: &HashSet<String>, record_pods: &HashMap<SandboxId, Option<String>>) -> Option<OrphanReason> {
        let Some(pod_uid) = &container.pod_uid else {
            return Some(OrphanReason::NoOwningPod);
        };
        if !known_pod_uids.contains(pod_uid) {
            return Some(OrphanReason::NoOwningPod);
        }

        let Some(sandbox_id) = container.sandbox_id else {
            return Some(OrphanReason::NoSandboxRecord);
        };
        let Some(assigned_pod) = record_pods.get(&sandbox_id) else {
            return Some(OrphanReason::NoSandboxRecord);
        };
        match (assigned_pod, &container.pod_name) {
            (Some(recorded), Some(observed)) if recorded != observed => Some(OrphanReason::PodUidMismatch),
            _ => None,
        }
    }

    /// One sweep: list containers, classify, remove what's both orphaned
    /// and past the grace window.
    pub async fn sweep_once(&self, now_millis: i64) {
        let containers = match self.runtime.list_managed_containers().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "janitor: failed to list containers");
                return;
            }
        };
        if containers.is_empty() {
            return;
        }

        let known_pod_uids = match self.known_pod_uids().await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "janitor: failed to list agent pods");
                return;
            }
        };
        let record_pods = match self.sandbox_ids_by_pod_uid().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "janitor: failed to list sandboxes");
                return;
            }
        };

        for container in &containers {
            let Some(reason) = Self::classify(container, &known_pod_uids, &record_pods) else {
                continue;
            };
            let age = Duration::from_millis((now_millis - container.created_at_millis).max(0) as u64);
            if age < self.config.orphan_timeout {
                continue;
            }
            info!(container = %container.id, reason = ?reason, age_secs = age.as_secs(), "janitor: removing orphaned container");
            if let Err(e) = self.runtime.stop_and_remove(&container.id).await {
                warn!(container = %container.id, error = %e, "janitor: failed to remove orphan");
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("janitor shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let now = crate::model::now_nanos() / 1_000_000;
                    self.sweep_once(now as i64).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeClusterApi, PoolRecord, PoolSpec, PoolStatus, SandboxRecord, SandboxSpec, SandboxStatus};
    use crate::container_runtime::FakeContainerRuntime;
    use crate::model::Phase;
    use std::collections::BTreeMap;

    fn container(id: &str, sandbox_id: Option<SandboxId>, pod_uid: Option<&str>, pod_name: Option<&str>, created_at_millis: i64) -> ContainerInfo {
        ContainerInfo {
            id: id.into(),
            sandbox_id,
            pod_uid: pod_uid.map(str::to_string),
            pod_name: pod_name.map(str::to_string),
            created_at_millis,
        }
    }

    #[tokio::test]
    async fn removes_container_with_no_owning_pod_past_grace_window() {
        let cluster = Arc::new(FakeClusterApi::new());
        let runtime = Arc::new(FakeContainerRuntime::default());
        runtime.seed(vec![container("c1", None, None, None, 0)]).await;

        let janitor = Janitor::new(cluster, runtime.clone(), JanitorConfig { orphan_timeout: Duration::from_secs(10), ..Default::default() });
        janitor.sweep_once(20_000).await;

        assert!(runtime.removed.lock().await.contains(&"c1".to_string()));
    }

    #[tokio::test]
    async fn protects_recent_orphan_within_grace_window() {
        let cluster = Arc::new(FakeClusterApi::new());
        let runtime = Arc::new(FakeContainerRuntime::default());
        runtime.seed(vec![container("c1", None, None, None, 15_000)]).await;

        let janitor = Janitor::new(cluster, runtime.clone(), JanitorConfig { orphan_timeout: Duration::from_secs(10), ..Default::default() });
        janitor.sweep_once(20_000).await;

        assert!(runtime.removed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn never_removes_a_container_with_a_healthy_record() {
        let cluster = Arc::new(FakeClusterApi::new());
        cluster
            .put_pool(PoolRecord {
                namespace: "default".into(),
                name: "pool-a".into(),
                spec: PoolSpec::default(),
                status: PoolStatus::default(),
            })
            .await;
        let pod_name = cluster
            .create_agent_pod(&PoolRecord {
                namespace: "default".into(),
                name: "pool-a".into(),
                spec: PoolSpec::default(),
                status: PoolStatus::default(),
            })
            .await
            .unwrap();
        let pods = cluster.list_agent_pods("pool-a").await.unwrap();
        let pod_uid = pods[0].uid.clone();

        let sandbox_id = SandboxId::derive("s1", "default", 1);
        cluster
            .put_sandbox(SandboxRecord {
                namespace: "default".into(),
                name: "s1".into(),
                uid: "uid-1".into(),
                finalizers: vec![],
                labels: BTreeMap::new(),
                deletion_timestamp: None,
                spec: SandboxSpec::default(),
                status: SandboxStatus { phase: Phase::Running, assigned_pod: Some(pod_name.clone()), sandbox_id: Some(sandbox_id), ..Default::default() },
            })
            .await;

        let runtime = Arc::new(FakeContainerRuntime::default());
        runtime.seed(vec![container("c1", Some(sandbox_id), Some(&pod_uid), Some(&pod_name), 0)]).await;

        let janitor = Janitor::new(cluster, runtime.clone(), JanitorConfig { orphan_timeout: Duration::from_secs(10), ..Default::default() });
        janitor.sweep_once(20_000_000).await;

        assert!(runtime.removed.lock().await.is_empty());
    }
}
