//! Agent-Control Loop: the periodic prober that rebuilds the Registry from
//! live agents and evicts stale/vanished ones.
//!
//! Each tick: list pods, probe the ready ones over the network via
//! [`AgentRpc::status`], then retain only what answered before replenishing
//! the Registry from the results.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::agent_rpc::AgentRpc;
use crate::cluster::ClusterApi;
use crate::model::AgentId;
use crate::registry::{AgentProbe, Registry};

#[derive(Debug, Clone)]
pub struct AgentControlConfig {
    pub tick: Duration,
    pub per_agent_timeout: Duration,
    pub stale_agent_timeout: Duration,
    /// Port the agent's RPC surface listens on; appended to each pod's bare
    /// IP to build the endpoint the prober and Fast-Path dial.
    pub agent_port: u16,
}

impl Default for AgentControlConfig {
    fn default() -> Self {
        AgentControlConfig {
            tick: Duration::from_secs(2),
            per_agent_timeout: Duration::from_secs(2),
            stale_agent_timeout: Duration::from_secs(5 * 60),
            agent_port: 8081,
        }
    }
}

pub struct AgentControlLoop {
    registry: Arc<Registry>,
    cluster: Arc<dyn ClusterApi>,
    agent_rpc: Arc<dyn AgentRpc>,
    config: AgentControlConfig,
    /// Guards against a slow pass overlapping the next tick: a still-running
    /// tick skips the next one rather than queueing.
    busy: AtomicBool,
}

impl AgentControlLoop {
    pub fn new(registry: Arc<Registry>, cluster: Arc<dyn ClusterApi>, agent_rpc: Arc<dyn AgentRpc>, config: AgentControlConfig) -> Self {
        AgentControlLoop { registry, cluster, agent_rpc, config, busy: AtomicBool::new(false) }
    }

    /// One probe pass: list pods, probe each ready one, reconcile the
    /// Registry against what's still there.
    async fn run_pass(&self) {
        let pools = match self.cluster.list_pools().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "agent-control loop: failed to list pools");
                return;
            }
        };

        let mut seen: Vec<AgentId> = Vec::new();

        for pool in &pools {
            let pods = match self.cluster.list_agent_pods(&pool.name).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(pool = %pool.name, error = %e, "agent-control loop: failed to list pods");
                    continue;
                }
            };

            for pod in pods {
                if !pod.ready || pod.ip.is_none() {
                    continue;
                }
                let Some(ip) = &pod.ip else { continue };
                let endpoint = format!("{ip}:{port}", port = self.config.agent_port);
                let agent_id: AgentId = pod.name.clone().into();

                match self.agent_rpc.status(&endpoint, self.config.per_agent_timeout).await {
                    Ok(status) => {
                        seen.push(agent_id.clone());
                        self.registry
                            .register_or_update(AgentProbe {
                                id: agent_id,
                                pool_name: pool.name.clone(),
                                namespace: pod.namespace.clone(),
                                pod_name: pod.name.clone(),
                                node_name: pod.node_name.clone().unwrap_or_default(),
                                endpoint,
                                capacity: status.capacity,
                                images: status.images,
                                port_reservations: status.port_reservations,
                                sandbox_statuses: Some(status.sandbox_statuses),
                                ready: true,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!(pod = %pod.name, error = %e, "agent-control loop: probe failed");
                    }
                }
            }
        }

        let known: BTreeMap<AgentId, ()> = seen.into_iter().map(|id| (id, ())).collect();
        for agent in self.registry.get_all_agents().await {
            if !known.contains_key(&agent.id) {
                debug!(agent = %agent.id, "agent-control loop: pod gone, removing from registry");
                self.registry.remove(&agent.id).await;
            }
        }

        let evicted = self.registry.cleanup_stale_agents(self.config.stale_agent_timeout).await;
        if evicted > 0 {
            info!(count = evicted, "agent-control loop: evicted stale agents");
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("agent-control loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if self.busy.swap(true, Ordering::SeqCst) {
                        warn!("agent-control loop: previous tick still running, skipping this tick");
                        continue;
                    }
                    let this = self.clone();
                    let deadline = 2 * this.config.tick;
                    tokio::spawn(async move {
                        if tokio::time::timeout(deadline, this.run_pass()).await.is_err() {
                            warn!("agent-control loop: pass exceeded deadline");
                        }
                        this.busy.store(false, Ordering::SeqCst);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{FakeClusterApi, PoolRecord, PoolSpec, PoolStatus};
    use crate::agent_rpc::FakeAgentRpc;

    #[tokio::test]
    async fn probes_ready_pods_and_populates_registry() {
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

        let registry = Arc::new(Registry::new());
        let loop_ = AgentControlLoop::new(registry.clone(), cluster.clone(), Arc::new(FakeAgentRpc::default()), AgentControlConfig::default());
        loop_.run_pass().await;

        let agents = registry.get_all_agents().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].pod_name, pod_name);
    }

    #[tokio::test]
    async fn removes_agents_whose_pods_vanished() {
        let cluster = Arc::new(FakeClusterApi::new());
        cluster
            .put_pool(PoolRecord {
                namespace: "default".into(),
                name: "pool-a".into(),
                spec: PoolSpec::default(),
                status: PoolStatus::default(),
            })
            .await;

        let registry = Arc::new(Registry::new());
        registry
            .register_or_update(AgentProbe {
                id: "ghost-pod".into(),
                pool_name: "pool-a".into(),
                namespace: "default".into(),
                pod_name: "ghost-pod".into(),
                node_name: "n".into(),
                endpoint: "10.0.0.9:9000".into(),
                capacity: 1,
                images: Default::default(),
                port_reservations: Default::default(),
                sandbox_statuses: None,
                ready: true,
            })
            .await;

        let loop_ = AgentControlLoop::new(registry.clone(), cluster.clone(), Arc::new(FakeAgentRpc::default()), AgentControlConfig::default());
        loop_.run_pass().await;

        assert!(registry.get_all_agents().await.is_empty());
    }
}
