//! Pool Reconciler: keeps each pool's pod count at
//! `clamp(Allocated_total + BufferMin, PoolMin, PoolMax)`, never deleting a
//! pod that still holds a live sandbox.
//!
//! Same count-then-create/count-then-delete shape as any warm-pool
//! replenish loop, driven by a demand-based buffer formula instead of a
//! fixed warm target.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, PodInfo, PoolRecord, PoolStatus};
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct PoolReconcileConfig {
    pub requeue_interval: std::time::Duration,
}

impl Default for PoolReconcileConfig {
    fn default() -> Self {
        PoolReconcileConfig { requeue_interval: std::time::Duration::from_secs(15) }
    }
}

pub struct PoolReconcileContext {
    pub registry: Arc<Registry>,
    pub cluster: Arc<dyn ClusterApi>,
    pub config: PoolReconcileConfig,
}

/// Desired pod count for a pool given current demand, per the Pool
/// Reconciler's sizing formula: enough pods to cover what's allocated today
/// plus a buffer, clamped to the operator-declared min/max.
pub fn desired_pod_count(pool: &PoolRecord, allocated_total: u32) -> u32 {
    let target = allocated_total.saturating_add(pool.spec.buffer_min);
    target.clamp(pool.spec.pool_min, pool.spec.pool_max.max(pool.spec.pool_min))
}

fn allocated_in_pool(registry_agents: &[crate::model::Agent], pool_name: &str) -> u32 {
    registry_agents.iter().filter(|a| a.pool_name == pool_name).map(|a| a.allocated).sum()
}

/// One reconcile pass for a single pool: scale up by creating pods, scale
/// down by deleting idle ones, then report status.
pub async fn reconcile_pool_once(pool: &PoolRecord, ctx: &PoolReconcileContext) -> crate::error::Result<()> {
    let agents = ctx.registry.get_all_agents().await;
    let allocated_total = allocated_in_pool(&agents, &pool.name);
    let desired = desired_pod_count(pool, allocated_total);

    let pods = ctx.cluster.list_agent_pods(&pool.name).await?;
    let current = pods.len() as u32;

    if current < desired {
        let to_create = desired - current;
        debug!(pool = %pool.name, current, desired, "scaling up pool");
        for _ in 0..to_create {
            if let Err(e) = ctx.cluster.create_agent_pod(pool).await {
                warn!(pool = %pool.name, error = %e, "failed to create agent pod");
                break;
            }
        }
    } else if current > desired {
        let to_delete = current - desired;
        let victims = scale_in_candidates(&pods, &agents, to_delete as usize);
        if victims.len() < to_delete as usize {
            debug!(
                pool = %pool.name,
                wanted = to_delete,
                found = victims.len(),
                "scale-in capped: not enough idle pods to reach desired count"
            );
        }
        for pod in &victims {
            info!(pool = %pool.name, pod = %pod.name, "scaling down idle agent pod");
            ctx.cluster.delete_agent_pod(&pod.namespace, &pod.name).await?;
        }
    }

    let refreshed = ctx.cluster.list_agent_pods(&pool.name).await?;
    let status = PoolStatus {
        ready_pods: refreshed.iter().filter(|p| p.ready).count() as u32,
        unready_pods: refreshed.iter().filter(|p| !p.ready).count() as u32,
        total_pods: refreshed.len() as u32,
        last_reconciled: Some(crate::model::now_nanos().to_string()),
    };
    ctx.cluster.patch_pool_status(&pool.namespace, &pool.name, &status).await?;
    Ok(())
}

/// Pods eligible for deletion during scale-in: never one the Registry still
/// shows `Allocated > 0` for. Agents the Registry has no record of (e.g. not
/// yet probed) are treated as idle and are the first to go.
fn scale_in_candidates<'a>(pods: &'a [PodInfo], agents: &[crate::model::Agent], want: usize) -> Vec<&'a PodInfo> {
    pods.iter()
        .filter(|p| {
            agents
                .iter()
                .find(|a| a.pod_name == p.name)
                .map(|a| a.allocated == 0)
                .unwrap_or(true)
        })
        .take(want)
        .collect()
}

pub async fn run(ctx: Arc<PoolReconcileContext>, tick: std::time::Duration, shutdown: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("pool reconciler shutting down");
                return;
            }
            _ = interval.tick() => {
                let pools = match ctx.cluster.list_pools().await {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to list pools for reconcile pass");
                        continue;
                    }
                };
                for pool in &pools {
                    if let Err(e) = reconcile_pool_once(pool, &ctx).await {
                        warn!(pool = %pool.name, error = %e, "pool reconcile failed, will retry next tick");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeClusterApi, PoolSpec};
    use crate::registry::AgentProbe;
    use std::collections::BTreeSet;

    fn pool(min: u32, max: u32, buffer: u32) -> PoolRecord {
        PoolRecord {
            namespace: "default".into(),
            name: "pool-a".into(),
            spec: PoolSpec { pool_min: min, pool_max: max, buffer_min: buffer, ..Default::default() },
            status: PoolStatus::default(),
        }
    }

    #[test]
    fn desired_count_clamps_to_min_and_max() {
        assert_eq!(desired_pod_count(&pool(2, 10, 1), 0), 2);
        assert_eq!(desired_pod_count(&pool(2, 10, 1), 5), 6);
        assert_eq!(desired_pod_count(&pool(2, 10, 1), 20), 10);
    }

    async fn context() -> (Arc<PoolReconcileContext>, Arc<FakeClusterApi>) {
        let cluster = Arc::new(FakeClusterApi::new());
        let ctx = Arc::new(PoolReconcileContext {
            registry: Arc::new(Registry::new()),
            cluster: cluster.clone(),
            config: PoolReconcileConfig::default(),
        });
        (ctx, cluster)
    }

    #[tokio::test]
    async fn scales_up_to_pool_min_from_empty() {
        let (ctx, cluster) = context().await;
        let p = pool(3, 10, 0);
        cluster.put_pool(p.clone()).await;

        reconcile_pool_once(&p, &ctx).await.unwrap();
        assert_eq!(cluster.list_agent_pods("pool-a").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn never_deletes_a_pod_with_allocated_sandboxes() {
        let (ctx, cluster) = context().await;
        let p = pool(0, 10, 0);
        cluster.put_pool(p.clone()).await;

        let busy_pod = cluster.create_agent_pod(&p).await.unwrap();
        let idle_pod = cluster.create_agent_pod(&p).await.unwrap();

        ctx.registry
            .register_or_update(AgentProbe {
                id: "busy".into(),
                pool_name: "pool-a".into(),
                namespace: "default".into(),
                pod_name: busy_pod.clone(),
                node_name: "n".into(),
                endpoint: "10.0.0.1:9000".into(),
                capacity: 5,
                images: BTreeSet::new(),
                port_reservations: BTreeSet::new(),
                sandbox_statuses: Some(one_allocated_status()),
                ready: true,
            })
            .await;
        ctx.registry
            .register_or_update(AgentProbe {
                id: "idle".into(),
                pool_name: "pool-a".into(),
                namespace: "default".into(),
                pod_name: idle_pod.clone(),
                node_name: "n".into(),
                endpoint: "10.0.0.2:9000".into(),
                capacity: 5,
                images: BTreeSet::new(),
                port_reservations: BTreeSet::new(),
                sandbox_statuses: Some(Default::default()),
                ready: true,
            })
            .await;

        reconcile_pool_once(&p, &ctx).await.unwrap();
        let remaining = cluster.list_agent_pods("pool-a").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, busy_pod);
    }

    fn one_allocated_status() -> std::collections::BTreeMap<crate::model::SandboxId, crate::model::SandboxStatusSnapshot> {
        let mut m = std::collections::BTreeMap::new();
        let id = crate::model::SandboxId::derive("s", "ns", 1);
        m.insert(
            id,
            crate::model::SandboxStatusSnapshot { sandbox_id: id, phase: crate::model::Phase::Running, endpoints: vec![] },
        );
        m
    }
}
