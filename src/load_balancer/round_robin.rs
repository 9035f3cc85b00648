//! Round-robin load balancing strategy.

use std::sync::{Arc, Mutex};

use crate::load_balancer::{endpoint::ReplicaEndpoint, LoadBalancer};

/// Round-robin selector.
/// One shared cursor; concurrent selections are serialized through it.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(
        &self,
        replicas: &[Arc<ReplicaEndpoint>],
        allowed: &dyn Fn(&ReplicaEndpoint) -> bool,
    ) -> Option<Arc<ReplicaEndpoint>> {
        if replicas.is_empty() {
            return None;
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let len = replicas.len();

        // Skipped endpoints do not advance the cursor; it moves to just
        // past whichever endpoint is picked.
        for i in 0..len {
            let index = (*cursor + i) % len;
            let replica = &replicas[index];
            if allowed(replica) {
                *cursor = (index + 1) % len;
                return Some(replica.clone());
            }
        }
        None
    }
}
