//! Pure filter-and-score scheduling over a Registry snapshot.
//!
//! Kept separate from [`crate::registry::Registry`] so the scoring algorithm
//! can be swapped (bin-packing, GPU-aware scoring, ...) without touching the
//! atomic-mutation path. `Registry::allocate` is the only caller that is
//! allowed to act on the result.

use crate::model::Agent;

/// Score weight applied when the requested image is not cached on a
/// candidate agent. Any value that dominates `Capacity` works; kept as a
/// named constant rather than a two-tier comparator so the scoring stays a
/// single linear pass.
pub const MISSING_IMAGE_PENALTY: u32 = 1000;

/// A candidate allocation request to schedule against a pool's agents.
#[derive(Debug, Clone)]
pub struct ScheduleRequest<'a> {
    pub pool_name: &'a str,
    pub image: &'a str,
    pub exposed_ports: &'a [i32],
}

/// Filter agents eligible for `req`, then score and return the winner.
///
/// Filter: `PoolName == request.PoolRef`, `Ready`, `Allocated < Capacity`,
/// `ExposedPorts ∩ PortReservations == ∅`. Image presence never hard-filters.
///
/// Score: `Allocated * 1 + (image_cached ? 0 : MISSING_IMAGE_PENALTY)`.
/// Lowest score wins; ties broken by lexicographic `AgentId`.
pub fn schedule<'a>(agents: impl Iterator<Item = &'a Agent>, req: &ScheduleRequest) -> Option<&'a Agent> {
    agents
        .filter(|a| {
            a.pool_name == req.pool_name
                && a.ready
                && a.allocated < a.capacity
                && a.ports_free(req.exposed_ports)
        })
        .min_by(|a, b| {
            let score_a = score(a, req.image);
            let score_b = score(b, req.image);
            score_a.cmp(&score_b).then_with(|| a.id.0.cmp(&b.id.0))
        })
}

fn score(agent: &Agent, image: &str) -> u32 {
    agent.allocated + if agent.has_image(image) { 0 } else { MISSING_IMAGE_PENALTY }
}
