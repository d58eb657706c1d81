//! The in-memory Agent Registry: the authoritative index of the fleet and
//! the only place that may perform atomic admission (allocate/release).
//!
//! A single `tokio::sync::Mutex` guards the whole table. Registry operations
//! are microseconds, far below per-request RPC latency, so one lock is
//! sufficient and keeps the invariants easy to see at a glance (every
//! agent's `0 <= Allocated <= Capacity`, and no two sandboxes on one agent
//! share a port). A split-lock warm/in-use design would only pay off if VM
//! boot time were on the hot path; here allocation against an already-warm
//! agent is, so one table wins.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::FastSandboxError;
use crate::model::{Agent, AgentId, SandboxId, SandboxStatusSnapshot};
use crate::scheduler::{self, ScheduleRequest};

/// Input to `RegisterOrUpdate`, as reported by an agent's `/status` probe.
#[derive(Debug, Clone)]
pub struct AgentProbe {
    pub id: AgentId,
    pub pool_name: String,
    pub namespace: String,
    pub pod_name: String,
    pub node_name: String,
    pub endpoint: String,
    pub capacity: u32,
    pub images: BTreeSet<String>,
    pub port_reservations: BTreeSet<i32>,
    /// `None` when the probe does not carry per-sandbox liveness (in which
    /// case `Allocated` is preserved from the existing entry).
    pub sandbox_statuses: Option<BTreeMap<SandboxId, SandboxStatusSnapshot>>,
    pub ready: bool,
}

/// Request to `Allocate` a slot for a new sandbox.
#[derive(Debug, Clone)]
pub struct AllocateRequest {
    pub pool_ref: String,
    pub image: String,
    pub exposed_ports: Vec<i32>,
    pub sandbox_id: SandboxId,
}

struct Entry {
    agent: Agent,
    last_heartbeat: Instant,
}

struct RegistryState {
    agents: HashMap<AgentId, Entry>,
    epoch: Instant,
}

/// Authoritative in-memory snapshot of the fleet.
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            state: Mutex::new(RegistryState {
                agents: HashMap::new(),
                epoch: Instant::now(),
            }),
        }
    }

    /// Insert if absent, else merge. Preserves `Allocated` from the existing
    /// entry unless the probe carries explicit per-sandbox statuses, in which
    /// case `Allocated` is recomputed as the count of live statuses. Sets
    /// `LastHeartbeat = now`.
    pub async fn register_or_update(&self, probe: AgentProbe) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        match state.agents.get_mut(&probe.id) {
            Some(entry) => {
                let allocated = match &probe.sandbox_statuses {
                    Some(statuses) => statuses.len() as u32,
                    None => entry.agent.allocated,
                };
                entry.agent.pool_name = probe.pool_name;
                entry.agent.namespace = probe.namespace;
                entry.agent.pod_name = probe.pod_name;
                entry.agent.node_name = probe.node_name;
                entry.agent.endpoint = probe.endpoint;
                entry.agent.capacity = probe.capacity;
                entry.agent.images = probe.images;
                entry.agent.port_reservations = probe.port_reservations;
                if let Some(statuses) = probe.sandbox_statuses {
                    entry.agent.sandbox_statuses = statuses;
                }
                entry.agent.allocated = allocated;
                entry.agent.ready = probe.ready;
                entry.last_heartbeat = now;
            }
            None => {
                debug!(agent = %probe.id, "registering new agent");
                let allocated = probe
                    .sandbox_statuses
                    .as_ref()
                    .map(|s| s.len() as u32)
                    .unwrap_or(0);
                let agent = Agent {
                    id: probe.id.clone(),
                    pool_name: probe.pool_name,
                    namespace: probe.namespace,
                    pod_name: probe.pod_name,
                    node_name: probe.node_name,
                    endpoint: probe.endpoint,
                    capacity: probe.capacity,
                    allocated,
                    images: probe.images,
                    port_reservations: probe.port_reservations,
                    sandbox_statuses: probe.sandbox_statuses.unwrap_or_default(),
                    last_heartbeat_millis: 0,
                    ready: probe.ready,
                };
                state.agents.insert(probe.id, Entry { agent, last_heartbeat: now });
            }
        }
    }

    /// Drop an agent regardless of slot occupancy (its sandboxes become Lost
    /// from the perspective of whoever reconciles them next).
    pub async fn remove(&self, id: &AgentId) {
        let mut state = self.state.lock().await;
        if state.agents.remove(id).is_some() {
            info!(agent = %id, "removed agent from registry");
        }
    }

    /// Deep snapshot; callers may not mutate the registry through it.
    pub async fn get_all_agents(&self) -> Vec<Agent> {
        let state = self.state.lock().await;
        let epoch = state.epoch;
        state
            .agents
            .values()
            .map(|e| {
                let mut a = e.agent.clone();
                a.last_heartbeat_millis = e.last_heartbeat.saturating_duration_since(epoch).as_millis() as u64;
                a
            })
            .collect()
    }

    pub async fn get_agent(&self, id: &AgentId) -> Option<Agent> {
        let state = self.state.lock().await;
        state.agents.get(id).map(|e| e.agent.clone())
    }

    /// The only operation that may increase `Allocated` or extend
    /// `PortReservations`. Never blocks; fails fast with `NoCapacity`.
    pub async fn allocate(&self, req: AllocateRequest) -> Result<AgentId, FastSandboxError> {
        if let Err(msg) = crate::model::validate_ports(&req.exposed_ports) {
            return Err(FastSandboxError::InvalidRequest(msg));
        }

        let mut state = self.state.lock().await;

        let sched_req = ScheduleRequest {
            pool_name: &req.pool_ref,
            image: &req.image,
            exposed_ports: &req.exposed_ports,
        };
        let agents: Vec<&Agent> = state.agents.values().map(|e| &e.agent).collect();
        let winner_id = match scheduler::schedule(agents.into_iter(), &sched_req) {
            Some(winner) => winner.id.clone(),
            None => {
                // Distinguish "pool has free slots but all are port-blocked"
                // from true exhaustion, for the PortConflict diagnostic.
                let port_conflict = state
                    .agents
                    .values()
                    .any(|e| {
                        e.agent.pool_name == req.pool_ref
                            && e.agent.ready
                            && e.agent.allocated < e.agent.capacity
                            && !e.agent.ports_free(&req.exposed_ports)
                    });
                return Err(if port_conflict {
                    FastSandboxError::port_conflict(req.pool_ref)
                } else {
                    FastSandboxError::no_capacity(req.pool_ref)
                });
            }
        };

        let entry = state.agents.get_mut(&winner_id).expect("winner must exist");
        entry.agent.allocated += 1;
        entry.agent.port_reservations.extend(req.exposed_ports.iter().copied());
        entry.agent.sandbox_statuses.insert(
            req.sandbox_id,
            SandboxStatusSnapshot {
                sandbox_id: req.sandbox_id,
                phase: crate::model::Phase::Scheduled,
                endpoints: Vec::new(),
            },
        );

        debug!(agent = %winner_id, sandbox = %req.sandbox_id, "allocated slot");
        Ok(winner_id)
    }

    /// Symmetric release: decrement `Allocated` (floor 0), remove ports,
    /// delete the per-sandbox status. Idempotent — calling twice for a
    /// sandbox already released is a no-op, not an error.
    pub async fn release(&self, agent_id: &AgentId, sandbox_id: &SandboxId, ports: &[i32]) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.agents.get_mut(agent_id) else {
            return;
        };

        if entry.agent.sandbox_statuses.remove(sandbox_id).is_some() {
            entry.agent.allocated = entry.agent.allocated.saturating_sub(1);
        }
        for p in ports {
            entry.agent.port_reservations.remove(p);
        }
        debug!(agent = %agent_id, sandbox = %sandbox_id, "released slot");
    }

    /// Remove agents whose heartbeat is older than `now - max_age`.
    pub async fn cleanup_stale_agents(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let stale: Vec<AgentId> = state
            .agents
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_heartbeat) > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            state.agents.remove(id);
            warn!(agent = %id, "evicted stale agent (heartbeat exceeded max age)");
        }
        stale.len()
    }
}
