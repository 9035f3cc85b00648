//! Replica set management.
//!
//! # Responsibilities
//! - Hold the interchangeable endpoints of one service type
//! - Apply the configured strategy, skipping endpoints whose breaker says no
//! - Fail fast with the soonest-recovering endpoint when nothing is allowed
//! - Own the health counters of its endpoints

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::{ServiceConfig, Strategy};
use crate::error::GatewayError;
use crate::load_balancer::{
    endpoint::{Endpoint, EndpointStats, ReplicaEndpoint, RequestGuard},
    least_loaded::LeastLoaded,
    random::Random,
    round_robin::RoundRobin,
    AvailabilityGate, LoadBalancer,
};

fn strategy_for(strategy: Strategy) -> Box<dyn LoadBalancer> {
    match strategy {
        Strategy::LeastLoaded => Box::new(LeastLoaded::new()),
        Strategy::RoundRobin => Box::new(RoundRobin::new()),
        Strategy::Random => Box::new(Random::new()),
    }
}

/// Endpoints of one service type plus the strategy that picks among them.
#[derive(Debug)]
pub struct ReplicaSet {
    service: String,
    strategy: Strategy,
    replicas: Vec<Arc<ReplicaEndpoint>>,
    balancer: Box<dyn LoadBalancer>,
}

/// Stats for one service.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSetStats {
    pub strategy: Strategy,
    pub endpoints: Vec<EndpointStats>,
}

impl ReplicaSet {
    pub fn new(service: impl Into<String>, strategy: Strategy, endpoints: Vec<Endpoint>) -> Self {
        let replicas = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, e)| Arc::new(ReplicaEndpoint::new(e, i)))
            .collect();
        Self {
            service: service.into(),
            strategy,
            replicas,
            balancer: strategy_for(strategy),
        }
    }

    /// Build from configuration, skipping addresses that fail to parse.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .enumerate()
            .filter_map(|(i, address)| match Endpoint::parse(&config.name, i, address) {
                Ok(e) => Some(e),
                Err(e) => {
                    tracing::warn!(service = %config.name, error = %e, "Invalid endpoint address");
                    None
                }
            })
            .collect();
        Self::new(config.name.clone(), config.strategy, endpoints)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn replicas(&self) -> &[Arc<ReplicaEndpoint>] {
        &self.replicas
    }

    /// Pick an endpoint allowed by `gate` and not in `exclude`.
    ///
    /// The returned guard counts the request as active until it is finished
    /// or dropped.
    pub fn select(
        &self,
        gate: &dyn AvailabilityGate,
        exclude: &HashSet<String>,
    ) -> Result<RequestGuard, GatewayError> {
        let candidates = |r: &ReplicaEndpoint| !exclude.contains(r.id());
        let allowed = |r: &ReplicaEndpoint| candidates(r) && gate.is_allowed(&r.endpoint);

        if let Some(replica) = self.balancer.next_server(&self.replicas, &allowed) {
            tracing::trace!(service = %self.service, endpoint = %replica.id(), "Endpoint selected");
            return Ok(replica.begin());
        }

        let soonest = self
            .replicas
            .iter()
            .filter(|r| candidates(r))
            .filter_map(|r| gate.cooldown_remaining(&r.endpoint).map(|d| (r.id().to_string(), d)))
            .min_by_key(|(_, remaining)| *remaining);

        tracing::debug!(
            service = %self.service,
            endpoint_count = self.replicas.len(),
            excluded = exclude.len(),
            soonest = ?soonest,
            "No healthy endpoint"
        );
        Err(GatewayError::NoHealthyEndpoint {
            service: self.service.clone(),
            soonest,
        })
    }

    pub fn stats(&self) -> ReplicaSetStats {
        ReplicaSetStats {
            strategy: self.strategy,
            endpoints: self.replicas.iter().map(|r| r.stats()).collect(),
        }
    }
}

/// All replica sets, keyed by service type. Immutable after startup.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    sets: HashMap<String, Arc<ReplicaSet>>,
}

impl ReplicaRegistry {
    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let sets = services
            .iter()
            .map(|s| (s.name.clone(), Arc::new(ReplicaSet::from_config(s))))
            .collect();
        Self { sets }
    }

    pub fn get(&self, service: &str) -> Option<&Arc<ReplicaSet>> {
        self.sets.get(service)
    }

    /// Every replica set (for health checking).
    pub fn all(&self) -> Vec<Arc<ReplicaSet>> {
        self.sets.values().cloned().collect()
    }

    pub fn stats(&self) -> BTreeMap<String, ReplicaSetStats> {
        self.sets
            .iter()
            .map(|(name, set)| (name.clone(), set.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    /// Gate with a fixed set of open circuits.
    struct FixedGate {
        open: Map<String, Duration>,
    }

    impl AvailabilityGate for FixedGate {
        fn is_allowed(&self, endpoint: &Endpoint) -> bool {
            !self.open.contains_key(&endpoint.id)
        }

        fn cooldown_remaining(&self, endpoint: &Endpoint) -> Option<Duration> {
            self.open.get(&endpoint.id).copied()
        }
    }

    fn set(strategy: Strategy) -> ReplicaSet {
        ReplicaSet::from_config(&ServiceConfig {
            name: "static-analyzer".into(),
            strategy,
            endpoints: vec![
                "127.0.0.1:2001".into(),
                "127.0.0.1:2002".into(),
                "127.0.0.1:2003".into(),
            ],
        })
    }

    #[test]
    fn test_select_excludes_open_and_tried() {
        let rs = set(Strategy::RoundRobin);
        let gate = FixedGate {
            open: Map::from([("static-analyzer-2".to_string(), Duration::from_secs(30))]),
        };
        let mut tried = HashSet::new();
        tried.insert("static-analyzer-1".to_string());

        for _ in 0..3 {
            let guard = rs.select(&gate, &tried).unwrap();
            assert_eq!(guard.id(), "static-analyzer-3");
        }
    }

    #[test]
    fn test_all_disallowed_fails_fast_with_soonest() {
        let rs = set(Strategy::LeastLoaded);
        let gate = FixedGate {
            open: Map::from([
                ("static-analyzer-1".to_string(), Duration::from_secs(40)),
                ("static-analyzer-2".to_string(), Duration::from_secs(5)),
                ("static-analyzer-3".to_string(), Duration::from_secs(20)),
            ]),
        };
        let err = rs.select(&gate, &HashSet::new()).unwrap_err();
        assert_eq!(
            err,
            GatewayError::NoHealthyEndpoint {
                service: "static-analyzer".into(),
                soonest: Some(("static-analyzer-2".into(), Duration::from_secs(5))),
            }
        );
    }

    #[test]
    fn test_guard_counts_against_least_loaded() {
        let rs = set(Strategy::LeastLoaded);
        let gate = FixedGate { open: Map::new() };
        let none = HashSet::new();

        let a = rs.select(&gate, &none).unwrap();
        let b = rs.select(&gate, &none).unwrap();
        let c = rs.select(&gate, &none).unwrap();
        let mut ids = vec![a.id().to_string(), b.id().to_string(), c.id().to_string()];
        ids.sort();
        assert_eq!(ids, vec!["static-analyzer-1", "static-analyzer-2", "static-analyzer-3"]);

        b.finish(true);
        let stats = rs.stats();
        let active: usize = stats.endpoints.iter().map(|e| e.active).sum();
        assert_eq!(active, 2);
        drop(a);
        drop(c);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ReplicaRegistry::from_config(&[ServiceConfig {
            name: "ai-analyzer".into(),
            strategy: Strategy::Random,
            endpoints: vec!["127.0.0.1:2004".into(), "not a url at all::".into()],
        }]);
        let rs = registry.get("ai-analyzer").unwrap();
        assert_eq!(rs.replicas().len(), 1);
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.stats()["ai-analyzer"].endpoints.len(), 1);
    }
}
