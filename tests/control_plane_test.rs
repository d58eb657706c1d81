//! End-to-end scenarios spanning more than one module, using the in-memory
//! fakes instead of a real cluster or agent fleet.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fast_sandbox::agent_rpc::FakeAgentRpc;
use fast_sandbox::cluster::{FakeClusterApi, PoolRecord, PoolSpec, PoolStatus};
use fast_sandbox::container_runtime::{ContainerInfo, FakeContainerRuntime};
use fast_sandbox::error::FastSandboxError;
use fast_sandbox::fastpath::{CreateSandboxRequest, FastPathConfig, FastPathServer};
use fast_sandbox::janitor::{Janitor, JanitorConfig};
use fast_sandbox::model::{ConsistencyMode, Phase};
use fast_sandbox::reconcile::sandbox::{ReconcileContext, SandboxReconcileConfig};
use fast_sandbox::registry::{AgentProbe, AllocateRequest, Registry};

fn pool_fixture() -> PoolRecord {
    PoolRecord {
        namespace: "default".into(),
        name: "pool-a".into(),
        spec: PoolSpec::default(),
        status: PoolStatus::default(),
    }
}

async fn seed_agent(registry: &Registry, id: &str, capacity: u32) {
    registry
        .register_or_update(AgentProbe {
            id: id.into(),
            pool_name: "pool-a".into(),
            namespace: "default".into(),
            pod_name: format!("pod-{id}"),
            node_name: "node-1".into(),
            endpoint: format!("10.0.0.1:9000-{id}"),
            capacity,
            images: BTreeSet::new(),
            port_reservations: BTreeSet::new(),
            sandbox_statuses: Some(BTreeMap::new()),
            ready: true,
        })
        .await;
}

#[tokio::test]
async fn capacity_cap_rejects_once_every_agent_is_full() {
    let registry = Registry::new();
    seed_agent(&registry, "a1", 1).await;

    let ok = registry
        .allocate(AllocateRequest {
            pool_ref: "pool-a".into(),
            image: "img".into(),
            exposed_ports: vec![],
            sandbox_id: fast_sandbox::model::SandboxId::derive("s1", "default", 1),
        })
        .await;
    assert!(ok.is_ok());

    let full = registry
        .allocate(AllocateRequest {
            pool_ref: "pool-a".into(),
            image: "img".into(),
            exposed_ports: vec![],
            sandbox_id: fast_sandbox::model::SandboxId::derive("s2", "default", 2),
        })
        .await;
    assert!(matches!(full, Err(FastSandboxError::NoCapacity { .. })));
}

#[tokio::test]
async fn port_conflict_is_distinguished_from_plain_capacity_exhaustion() {
    let registry = Registry::new();
    seed_agent(&registry, "a1", 5).await;
    registry
        .allocate(AllocateRequest {
            pool_ref: "pool-a".into(),
            image: "img".into(),
            exposed_ports: vec![8080],
            sandbox_id: fast_sandbox::model::SandboxId::derive("s1", "default", 1),
        })
        .await
        .unwrap();

    let conflict = registry
        .allocate(AllocateRequest {
            pool_ref: "pool-a".into(),
            image: "img".into(),
            exposed_ports: vec![8080],
            sandbox_id: fast_sandbox::model::SandboxId::derive("s2", "default", 2),
        })
        .await;
    assert!(matches!(conflict, Err(FastSandboxError::NoCapacity { port_conflict: true, .. })));
}

#[tokio::test]
async fn fast_mode_create_returns_before_the_durable_record_exists_but_eventually_persists() {
    let registry = Arc::new(Registry::new());
    seed_agent(&registry, "a1", 2).await;
    let cluster = Arc::new(FakeClusterApi::new());
    let agent_rpc = Arc::new(FakeAgentRpc::default());
    let server = FastPathServer::new(registry.clone(), cluster.clone(), agent_rpc.clone(), FastPathConfig::default());

    let resp = server
        .create_sandbox(CreateSandboxRequest {
            pool_ref: "pool-a".into(),
            image: "img".into(),
            namespace: "default".into(),
            name: Some("s1".into()),
            consistency_mode: Some(ConsistencyMode::Fast),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!resp.endpoints.is_empty());

    for _ in 0..20 {
        if cluster.list_sandboxes().await.unwrap().iter().any(|r| r.name == "s1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let records = cluster.list_sandboxes().await.unwrap();
    assert!(records.iter().any(|r| r.name == "s1" && r.status.phase == Phase::Running));
}

#[tokio::test]
async fn strong_mode_create_persists_the_record_before_returning() {
    let registry = Arc::new(Registry::new());
    seed_agent(&registry, "a1", 2).await;
    let cluster = Arc::new(FakeClusterApi::new());
    let agent_rpc = Arc::new(FakeAgentRpc::default());
    let server = FastPathServer::new(registry.clone(), cluster.clone(), agent_rpc.clone(), FastPathConfig::default());

    server
        .create_sandbox(CreateSandboxRequest {
            pool_ref: "pool-a".into(),
            image: "img".into(),
            namespace: "default".into(),
            name: Some("s1".into()),
            consistency_mode: Some(ConsistencyMode::Strong),
            ..Default::default()
        })
        .await
        .unwrap();

    let records = cluster.list_sandboxes().await.unwrap();
    assert!(records.iter().any(|r| r.name == "s1" && r.status.phase == Phase::Running));
}

#[tokio::test]
async fn pending_record_is_scheduled_and_run_by_the_sandbox_reconciler() {
    let registry = Arc::new(Registry::new());
    seed_agent(&registry, "a1", 2).await;
    let cluster = Arc::new(FakeClusterApi::new());
    cluster.put_pool(pool_fixture()).await;

    let sandbox_id = fast_sandbox::model::SandboxId::derive("s1", "default", 1);
    cluster
        .put_sandbox(fast_sandbox::cluster::SandboxRecord {
            namespace: "default".into(),
            name: "s1".into(),
            uid: "uid-1".into(),
            finalizers: vec![],
            labels: BTreeMap::new(),
            deletion_timestamp: None,
            spec: fast_sandbox::cluster::SandboxSpec { pool_ref: "pool-a".into(), image: "img".into(), ..Default::default() },
            status: fast_sandbox::cluster::SandboxStatus::default(),
        })
        .await;

    let ctx = ReconcileContext {
        registry: registry.clone(),
        cluster: cluster.clone(),
        agent_rpc: Arc::new(FakeAgentRpc::default()),
        config: SandboxReconcileConfig::default(),
    };

    let record = cluster.list_sandboxes().await.unwrap().remove(0);
    fast_sandbox::reconcile::sandbox::reconcile_once(&record, &ctx).await.unwrap();
    let record = cluster.get_sandbox("default", "s1").await.unwrap().unwrap();
    assert_eq!(record.finalizers, vec![fast_sandbox::cluster::SANDBOX_FINALIZER.to_string()]);

    fast_sandbox::reconcile::sandbox::reconcile_once(&record, &ctx).await.unwrap();
    let record = cluster.get_sandbox("default", "s1").await.unwrap().unwrap();
    assert_eq!(record.status.phase, Phase::Running);
}

#[tokio::test]
async fn orphaned_container_past_grace_window_is_reclaimed_by_the_janitor() {
    let cluster = Arc::new(FakeClusterApi::new());
    let runtime = Arc::new(FakeContainerRuntime::default());
    runtime
        .seed(vec![ContainerInfo {
            id: "c1".into(),
            sandbox_id: None,
            pod_uid: None,
            pod_name: None,
            created_at_millis: 0,
        }])
        .await;

    let janitor = Janitor::new(cluster, runtime.clone(), JanitorConfig { orphan_timeout: Duration::from_secs(10), ..Default::default() });
    janitor.sweep_once(20_000).await;

    assert_eq!(runtime.removed.lock().await.as_slice(), ["c1".to_string()]);
}
