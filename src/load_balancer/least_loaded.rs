//! Least-loaded load balancing strategy.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::load_balancer::{endpoint::ReplicaEndpoint, LoadBalancer};

/// Least-loaded selector.
/// Ranks by (active requests, smoothed latency), then fewest historical
/// failures, then declaration order.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

fn rank(a: &ReplicaEndpoint, b: &ReplicaEndpoint) -> Ordering {
    // Endpoints without a latency sample yet rank as zero latency.
    let latency = |r: &ReplicaEndpoint| r.avg_latency_ms().unwrap_or(0.0);
    a.active()
        .cmp(&b.active())
        .then_with(|| latency(a).total_cmp(&latency(b)))
        .then_with(|| a.failed().cmp(&b.failed()))
        .then_with(|| a.index.cmp(&b.index))
}

impl LoadBalancer for LeastLoaded {
    fn next_server(
        &self,
        replicas: &[Arc<ReplicaEndpoint>],
        allowed: &dyn Fn(&ReplicaEndpoint) -> bool,
    ) -> Option<Arc<ReplicaEndpoint>> {
        replicas
            .iter()
            .filter(|r| allowed(r))
            .min_by(|a, b| rank(a, b))
            .cloned()
    }
}
