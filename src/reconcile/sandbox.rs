//! Sandbox Reconciler: drives each sandbox record through
//! Pending → Scheduled → Running → Terminating → (gone).
//!
//! Same create-or-patch-status shape any Kubernetes-style reconciler uses,
//! extended with the extra state this lifecycle needs beyond plain
//! pod-exists/doesn't (finalizers, expiry, reset revisions, failure policy).

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::agent_rpc::{self, AgentRpc};
use crate::cluster::{ClusterApi, SandboxRecord, SandboxStatus, SANDBOX_FINALIZER};
use crate::error::Result;
use crate::model::{FailurePolicy, Phase, SandboxId};
use crate::registry::{AllocateRequest, Registry};

#[derive(Debug, Clone)]
pub struct SandboxReconcileConfig {
    pub agent_timeout: Duration,
    pub requeue_interval: Duration,
}

impl Default for SandboxReconcileConfig {
    fn default() -> Self {
        SandboxReconcileConfig {
            agent_timeout: Duration::from_secs(5),
            requeue_interval: Duration::from_secs(10),
        }
    }
}

pub struct ReconcileContext {
    pub registry: Arc<Registry>,
    pub cluster: Arc<dyn ClusterApi>,
    pub agent_rpc: Arc<dyn AgentRpc>,
    pub config: SandboxReconcileConfig,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Requeue(Duration),
    /// The record was fully removed (finalizer cleared, deleted).
    Gone,
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// One reconcile pass over a single sandbox record. Idempotent: safe to call
/// repeatedly for the same record, including concurrently-duplicated events
/// (callers are expected to serialise per-record).
pub async fn reconcile_once(record: &SandboxRecord, ctx: &ReconcileContext) -> Result<ReconcileOutcome> {
    // 1. Expiry check.
    if let Some(expire) = record.spec.expire_time {
        if expire <= now_millis() && !record.is_deleting() {
            info!(namespace = %record.namespace, name = %record.name, "sandbox expired, deleting");
            ctx.cluster.delete_sandbox_record(&record.namespace, &record.name).await?;
            return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
        }
    }

    // 2. Finalizer attachment.
    if !record.is_deleting() && !record.has_finalizer(SANDBOX_FINALIZER) {
        ctx.cluster.add_finalizer(&record.namespace, &record.name, SANDBOX_FINALIZER).await?;
        return Ok(ReconcileOutcome::Requeue(Duration::from_millis(0)));
    }

    // 3. Deletion path.
    if record.is_deleting() {
        return deletion_path(record, ctx).await;
    }

    // 4. Reset detection.
    if record.spec.reset_revision > record.status.accepted_reset_revision {
        return reset_path(record, ctx).await;
    }

    // 5. Agent-loss detection.
    if let Some(pod) = &record.status.assigned_pod {
        let agent = ctx.registry.get_all_agents().await.into_iter().find(|a| &a.pod_name == pod);
        let sandbox_id = record.status.sandbox_id;
        let live = agent
            .as_ref()
            .zip(sandbox_id)
            .map(|(a, id)| a.sandbox_statuses.contains_key(&id))
            .unwrap_or(false);

        if !live {
            return lost_path(record, ctx).await;
        }
    }

    // 6. Scheduling path.
    if record.status.assigned_pod.is_none() {
        return schedule_path(record, ctx).await;
    }

    // 7. Status sync.
    status_sync(record, ctx).await
}

async fn deletion_path(record: &SandboxRecord, ctx: &ReconcileContext) -> Result<ReconcileOutcome> {
    if let (Some(pod), Some(sandbox_id)) = (&record.status.assigned_pod, record.status.sandbox_id) {
        if let Some(agent) = ctx.registry.get_all_agents().await.into_iter().find(|a| &a.pod_name == pod) {
            let req = agent_rpc::DeleteSandboxRequest { sandbox_id, grace_period_seconds: 10 };
            if let Err(e) = ctx.agent_rpc.delete(&agent.endpoint, &req, ctx.config.agent_timeout).await {
                warn!(namespace = %record.namespace, name = %record.name, error = %e, "best-effort agent delete failed during teardown");
            }
            ctx.registry.release(&agent.id, &sandbox_id, &record.spec.exposed_ports).await;
        }
    }
    ctx.cluster.remove_finalizer(&record.namespace, &record.name, SANDBOX_FINALIZER).await?;
    ctx.cluster.delete_sandbox_record(&record.namespace, &record.name).await?;
    Ok(ReconcileOutcome::Gone)
}

/// Treats `ResetRevision > AcceptedResetRevision` as a synthetic
/// delete-then-recreate: release the old slot, rotate `SandboxID`, and fall
/// through to scheduling on the next pass.
async fn reset_path(record: &SandboxRecord, ctx: &ReconcileContext) -> Result<ReconcileOutcome> {
    if let (Some(pod), Some(sandbox_id)) = (&record.status.assigned_pod, record.status.sandbox_id) {
        if let Some(agent) = ctx.registry.get_all_agents().await.into_iter().find(|a| &a.pod_name == pod) {
            let req = agent_rpc::DeleteSandboxRequest { sandbox_id, grace_period_seconds: 10 };
            let _ = ctx.agent_rpc.delete(&agent.endpoint, &req, ctx.config.agent_timeout).await;
            ctx.registry.release(&agent.id, &sandbox_id, &record.spec.exposed_ports).await;
        }
    }
    let new_sandbox_id = SandboxId::derive(&record.name, &record.namespace, crate::model::now_nanos());
    let status = SandboxStatus {
        phase: Phase::Pending,
        assigned_pod: None,
        node_name: None,
        sandbox_id: Some(new_sandbox_id),
        endpoints: Vec::new(),
        accepted_reset_revision: record.spec.reset_revision,
        message: None,
        last_reconciled: None,
    };
    ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &status).await?;
    Ok(ReconcileOutcome::Requeue(Duration::from_millis(0)))
}

async fn lost_path(record: &SandboxRecord, ctx: &ReconcileContext) -> Result<ReconcileOutcome> {
    let already_lost = record.status.phase == Phase::Lost;
    // `last_reconciled` doubles as the Lost timestamp here: it is only
    // overwritten on the transition into Lost, so AutoRecreate can measure
    // how long the sandbox has been down from it.
    let lost_since = if already_lost {
        record.status.last_reconciled.as_deref().and_then(|s| s.parse::<i64>().ok()).unwrap_or_else(now_millis)
    } else {
        now_millis()
    };
    if !already_lost {
        warn!(namespace = %record.namespace, name = %record.name, pod = ?record.status.assigned_pod, "sandbox's agent lost, marking Lost");
        let status = SandboxStatus {
            phase: Phase::Lost,
            last_reconciled: Some(lost_since.to_string()),
            ..record.status.clone()
        };
        ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &status).await?;
    }

    match record.spec.failure_policy {
        FailurePolicy::Manual => Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval)),
        FailurePolicy::AutoRecreate => {
            let elapsed = Duration::from_millis((now_millis() - lost_since).max(0) as u64);
            if elapsed >= Duration::from_secs(record.spec.recovery_timeout_seconds as u64) {
                let status = SandboxStatus {
                    phase: Phase::Pending,
                    assigned_pod: None,
                    node_name: None,
                    ..record.status.clone()
                };
                ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &status).await?;
                Ok(ReconcileOutcome::Requeue(Duration::from_millis(0)))
            } else {
                Ok(ReconcileOutcome::Requeue(Duration::from_secs(1)))
            }
        }
    }
}

async fn schedule_path(record: &SandboxRecord, ctx: &ReconcileContext) -> Result<ReconcileOutcome> {
    let sandbox_id = record
        .status
        .sandbox_id
        .unwrap_or_else(|| SandboxId::derive(&record.name, &record.namespace, crate::model::now_nanos()));

    let agent_id = match ctx
        .registry
        .allocate(AllocateRequest {
            pool_ref: record.spec.pool_ref.clone(),
            image: record.spec.image.clone(),
            exposed_ports: record.spec.exposed_ports.clone(),
            sandbox_id,
        })
        .await
    {
        Ok(id) => id,
        Err(e) => {
            debug!(namespace = %record.namespace, name = %record.name, error = %e, "scheduling deferred, no capacity");
            return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
        }
    };
    let agent = ctx.registry.get_agent(&agent_id).await;
    let Some(agent) = agent else {
        return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
    };

    let scheduled = SandboxStatus {
        phase: Phase::Scheduled,
        assigned_pod: Some(agent.pod_name.clone()),
        node_name: Some(agent.node_name.clone()),
        sandbox_id: Some(sandbox_id),
        endpoints: Vec::new(),
        accepted_reset_revision: record.status.accepted_reset_revision,
        message: None,
        last_reconciled: None,
    };
    ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &scheduled).await?;

    let create_req = agent_rpc::CreateSandboxRequest {
        sandbox_id,
        image: record.spec.image.clone(),
        command: record.spec.command.clone(),
        args: record.spec.args.clone(),
        envs: record.spec.envs.clone(),
        working_dir: record.spec.working_dir.clone(),
        exposed_ports: record.spec.exposed_ports.clone(),
    };
    match ctx.agent_rpc.create(&agent.endpoint, &create_req, ctx.config.agent_timeout).await {
        Ok(resp) => {
            let running = SandboxStatus {
                phase: Phase::Running,
                endpoints: resp.endpoints,
                ..scheduled
            };
            ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &running).await?;
            Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval))
        }
        Err(e) => {
            ctx.registry.release(&agent_id, &sandbox_id, &record.spec.exposed_ports).await;
            let failed = SandboxStatus { phase: Phase::Failed, message: Some(e.to_string()), ..scheduled };
            ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &failed).await?;
            Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval))
        }
    }
}

/// Mirror the Registry's per-sandbox status into the record.
async fn status_sync(record: &SandboxRecord, ctx: &ReconcileContext) -> Result<ReconcileOutcome> {
    let Some(pod) = &record.status.assigned_pod else {
        return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
    };
    let Some(agent) = ctx.registry.get_all_agents().await.into_iter().find(|a| &a.pod_name == pod) else {
        return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
    };
    let Some(sandbox_id) = record.status.sandbox_id else {
        return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
    };
    let Some(snapshot) = agent.sandbox_statuses.get(&sandbox_id) else {
        return Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval));
    };

    if snapshot.phase != record.status.phase || snapshot.endpoints != record.status.endpoints {
        let synced = SandboxStatus {
            phase: snapshot.phase,
            endpoints: snapshot.endpoints.clone(),
            ..record.status.clone()
        };
        ctx.cluster.patch_sandbox_status(&record.namespace, &record.name, &synced).await?;
    }
    Ok(ReconcileOutcome::Requeue(ctx.config.requeue_interval))
}

/// Poll-based reconcile driver: re-lists every sandbox each tick and
/// reconciles it, in place of a Watch-event framework — a full resync
/// reaches the same fixed point, just with higher latency between a
/// change and its reconcile, which the `requeue_interval`/tick cadence
/// bounds.
pub async fn run(ctx: Arc<ReconcileContext>, tick: Duration, shutdown: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("sandbox reconciler shutting down");
                return;
            }
            _ = interval.tick() => {
                let records = match ctx.cluster.list_sandboxes().await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "failed to list sandboxes for reconcile pass");
                        continue;
                    }
                };
                for record in &records {
                    if let Err(e) = reconcile_once(record, &ctx).await {
                        warn!(namespace = %record.namespace, name = %record.name, error = %e, "sandbox reconcile failed, will retry next tick");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_rpc::FakeAgentRpc;
    use crate::cluster::{FakeClusterApi, SandboxSpec};
    use crate::registry::AgentProbe;
    use std::collections::BTreeSet;

    fn base_record(name: &str) -> SandboxRecord {
        SandboxRecord {
            namespace: "default".into(),
            name: name.into(),
            uid: format!("uid-{name}"),
            finalizers: Vec::new(),
            labels: Default::default(),
            deletion_timestamp: None,
            spec: SandboxSpec {
                image: "img".into(),
                pool_ref: "pool-a".into(),
                recovery_timeout_seconds: 60,
                ..Default::default()
            },
            status: SandboxStatus::default(),
        }
    }

    async fn context_with_agent() -> Arc<ReconcileContext> {
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
        Arc::new(ReconcileContext {
            registry,
            cluster: Arc::new(FakeClusterApi::new()),
            agent_rpc: Arc::new(FakeAgentRpc::default()),
            config: SandboxReconcileConfig::default(),
        })
    }

    #[tokio::test]
    async fn first_pass_attaches_finalizer_then_schedules_then_runs() {
        let ctx = context_with_agent().await;
        let cluster = ctx.cluster.clone();
        cluster.put_sandbox(base_record("s1")).await;

        // Pass 1: attach finalizer.
        let rec = cluster.get_sandbox("default", "s1").await.unwrap().unwrap();
        reconcile_once(&rec, &ctx).await.unwrap();
        let rec = cluster.get_sandbox("default", "s1").await.unwrap().unwrap();
        assert!(rec.has_finalizer(SANDBOX_FINALIZER));

        // Pass 2: schedule + create.
        reconcile_once(&rec, &ctx).await.unwrap();
        let rec = cluster.get_sandbox("default", "s1").await.unwrap().unwrap();
        assert_eq!(rec.status.phase, Phase::Running);
        assert_eq!(rec.status.assigned_pod.as_deref(), Some("pod-1"));
    }

    #[tokio::test]
    async fn deletion_releases_slot_and_removes_finalizer() {
        let ctx = context_with_agent().await;
        let cluster = ctx.cluster.clone();
        let mut rec = base_record("s2");
        rec.finalizers.push(SANDBOX_FINALIZER.to_string());
        rec.status = SandboxStatus {
            phase: Phase::Running,
            assigned_pod: Some("pod-1".into()),
            sandbox_id: Some(SandboxId::derive("s2", "default", 1)),
            ..Default::default()
        };
        cluster.put_sandbox(rec.clone()).await;
        cluster.mark_deleting("default", "s2", 1).await;

        let rec = cluster.get_sandbox("default", "s2").await.unwrap().unwrap();
        let outcome = reconcile_once(&rec, &ctx).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Gone);
        assert!(cluster.get_sandbox("default", "s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_sandbox_is_deleted() {
        let ctx = context_with_agent().await;
        let cluster = ctx.cluster.clone();
        let mut rec = base_record("s3");
        rec.spec.expire_time = Some(1);
        cluster.put_sandbox(rec.clone()).await;

        reconcile_once(&rec, &ctx).await.unwrap();
        assert!(cluster.get_sandbox("default", "s3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn manual_failure_policy_stays_lost() {
        let ctx = context_with_agent().await;
        let cluster = ctx.cluster.clone();
        let mut rec = base_record("s4");
        rec.finalizers.push(SANDBOX_FINALIZER.to_string());
        rec.spec.failure_policy = FailurePolicy::Manual;
        rec.status = SandboxStatus {
            phase: Phase::Running,
            assigned_pod: Some("pod-missing".into()),
            sandbox_id: Some(SandboxId::derive("s4", "default", 1)),
            ..Default::default()
        };
        cluster.put_sandbox(rec.clone()).await;

        reconcile_once(&rec, &ctx).await.unwrap();
        let rec = cluster.get_sandbox("default", "s4").await.unwrap().unwrap();
        assert_eq!(rec.status.phase, Phase::Lost);
    }
}
