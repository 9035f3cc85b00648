//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! dispatch(service_type, ...)
//!     → replica_set.rs (resolve the service's ReplicaSet)
//!     → filter: breaker allows it (AvailabilityGate), not tried yet
//!     → Apply load balancing strategy:
//!         - least_loaded.rs (fewest active requests, then latency)
//!         - round_robin.rs (rotate through endpoints)
//!         - random.rs (uniform pick)
//!     → endpoint.rs (RequestGuard tracks the in-flight request)
//!     → Return guard or NoHealthyEndpoint
//! ```
//!
//! # Design Decisions
//! - Strategies are stateless apart from the round-robin cursor
//! - Health counters are owned by the replica set; callers only report
//!   outcomes through the guard
//! - Breaker state is read through a trait so selection never does I/O

use std::sync::Arc;
use std::time::Duration;

pub mod endpoint;
pub mod least_loaded;
pub mod random;
pub mod replica_set;
pub mod round_robin;

pub use endpoint::{Endpoint, EndpointStats, HealthState, ReplicaEndpoint, RequestGuard};
pub use replica_set::{ReplicaRegistry, ReplicaSet, ReplicaSetStats};

/// A strategy that picks one endpoint among the allowed ones.
pub trait LoadBalancer: Send + Sync + std::fmt::Debug {
    fn next_server(
        &self,
        replicas: &[Arc<ReplicaEndpoint>],
        allowed: &dyn Fn(&ReplicaEndpoint) -> bool,
    ) -> Option<Arc<ReplicaEndpoint>>;
}

/// Read-only view of per-endpoint circuit state.
pub trait AvailabilityGate: Send + Sync {
    /// Whether a request to this endpoint would currently be admitted.
    fn is_allowed(&self, endpoint: &Endpoint) -> bool;

    /// Remaining cooldown of an open circuit.
    fn cooldown_remaining(&self, endpoint: &Endpoint) -> Option<Duration>;
}
