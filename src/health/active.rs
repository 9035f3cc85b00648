//! Active health checking.
//!
//! # Responsibilities
//! - Periodically check every replica with a `health_check` message
//! - Feed outcomes to the endpoint's circuit breaker and health counters

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::error::GatewayError;
use crate::gateway::protocol::{health_check_frame, OutcomeStatus, ReplicaMessage};
use crate::load_balancer::{AvailabilityGate, ReplicaEndpoint, ReplicaRegistry};
use crate::observability::metrics;
use crate::pool::{ConnectionLease, ConnectionPool};

/// Result of one health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Healthy,
    Unhealthy,
    /// Breaker open; nothing was sent.
    Skipped,
}

pub struct HealthMonitor {
    pool: Arc<ConnectionPool>,
    registry: Arc<ReplicaRegistry>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(pool: Arc<ConnectionPool>, registry: Arc<ReplicaRegistry>, config: HealthCheckConfig) -> Self {
        Self {
            pool,
            registry,
            config,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Active health checks disabled");
            return;
        }

        tracing::info!(interval = self.config.interval_secs, "Health monitor starting");

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Health-check every endpoint of every service concurrently.
    pub async fn check_all(&self) -> Vec<(String, CheckOutcome)> {
        let replicas: Vec<Arc<ReplicaEndpoint>> = self
            .registry
            .all()
            .iter()
            .flat_map(|set| set.replicas().iter().cloned())
            .collect();

        let results = join_all(replicas.iter().map(|replica| async move {
            (replica.id().to_string(), self.check_replica(replica).await)
        }))
        .await;

        for (endpoint, _) in &results {
            metrics::record_circuit_state(endpoint, self.pool.breaker(endpoint).state());
        }
        results
    }

    pub async fn check_replica(&self, replica: &ReplicaEndpoint) -> CheckOutcome {
        let endpoint = &replica.endpoint;
        if !self.pool.is_allowed(endpoint) {
            tracing::debug!(endpoint = %endpoint.id, "Skipping health check, circuit open");
            return CheckOutcome::Skipped;
        }

        // A full pool says nothing about the replica, so never wait on it.
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let lease = match time::timeout(timeout, self.pool.try_acquire(endpoint)).await {
            Ok(Ok(Some(lease))) => lease,
            Ok(Ok(None)) => {
                tracing::debug!(endpoint = %endpoint.id, "Skipping health check, connection pool full");
                return CheckOutcome::Skipped;
            }
            Ok(Err(GatewayError::CircuitOpen { .. })) => return CheckOutcome::Skipped,
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %endpoint.id, error = %e, "Health check failed: connection error");
                return self.settle(replica, false);
            }
            Err(_) => {
                tracing::warn!(endpoint = %endpoint.id, "Health check failed: connect timeout");
                return self.settle(replica, false);
            }
        };

        let mut lease = lease;
        let healthy = match time::timeout(timeout, exchange(&mut lease)).await {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                tracing::warn!(endpoint = %endpoint.id, "Health check failed: replica reported unhealthy");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(endpoint = %endpoint.id, error = %e, "Health check failed: transport error");
                false
            }
            Err(_) => {
                tracing::warn!(endpoint = %endpoint.id, "Health check failed: timeout");
                false
            }
        };
        if healthy {
            lease.record_success();
            lease.mark_reusable();
            self.settle(replica, true)
        } else {
            lease.record_failure();
            self.settle(replica, false)
        }
    }

    fn settle(&self, replica: &ReplicaEndpoint, healthy: bool) -> CheckOutcome {
        if healthy {
            replica.mark_healthy();
        } else {
            replica.mark_unhealthy();
        }
        metrics::record_endpoint_health(replica.id(), healthy);
        if healthy {
            CheckOutcome::Healthy
        } else {
            CheckOutcome::Unhealthy
        }
    }
}

/// Send a `health_check` and wait for its `health_response`.
async fn exchange(lease: &mut ConnectionLease) -> Result<bool, String> {
    lease
        .send_text(health_check_frame())
        .await
        .map_err(|e| e.to_string())?;
    loop {
        match lease.recv_text().await {
            Some(Ok(text)) => match ReplicaMessage::parse(&text) {
                Ok(ReplicaMessage::HealthResponse { status }) => {
                    return Ok(status == OutcomeStatus::Success)
                }
                Ok(other) => tracing::trace!(message = ?other, "Ignoring message while probing"),
                Err(e) => tracing::debug!(error = %e.message, "Unparsable health reply"),
            },
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("connection closed".into()),
        }
    }
}
