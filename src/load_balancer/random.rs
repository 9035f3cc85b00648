//! Uniform random load balancing strategy.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::load_balancer::{endpoint::ReplicaEndpoint, LoadBalancer};

/// Picks uniformly among allowed endpoints.
#[derive(Debug, Default)]
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Random {
    fn next_server(
        &self,
        replicas: &[Arc<ReplicaEndpoint>],
        allowed: &dyn Fn(&ReplicaEndpoint) -> bool,
    ) -> Option<Arc<ReplicaEndpoint>> {
        let candidates: Vec<&Arc<ReplicaEndpoint>> =
            replicas.iter().filter(|r| allowed(r)).collect();
        candidates.choose(&mut rand::thread_rng()).map(|r| (*r).clone())
    }
}
