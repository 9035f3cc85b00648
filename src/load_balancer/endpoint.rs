//! Replica endpoint abstraction.
//!
//! # Responsibilities
//! - Represent a single analyzer replica (immutable address)
//! - Track active requests (for least-loaded balancing)
//! - Track total/failed counts and smoothed latency
//! - Track last health check result (Healthy/Unhealthy)

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use url::Url;

/// Weight of the newest sample in the latency moving average.
const LATENCY_SMOOTHING: f64 = 0.3;

/// Transport used to reach a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    SecureWebSocket,
}

/// Address of one replica. Immutable once configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Unique id, `<service>-<n>` with n starting at 1.
    pub id: String,
    pub service: String,
    pub address: Url,
    pub transport: TransportKind,
}

impl Endpoint {
    /// Parse a configured address. Bare `host:port` means `ws://host:port`.
    pub fn parse(service: &str, index: usize, address: &str) -> Result<Self, String> {
        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("ws://{address}")
        };
        let url = Url::parse(&raw).map_err(|e| format!("invalid address {address}: {e}"))?;
        let transport = match url.scheme() {
            "ws" => TransportKind::WebSocket,
            "wss" => TransportKind::SecureWebSocket,
            other => return Err(format!("unsupported scheme {other} in {address}")),
        };
        if url.host_str().is_none() {
            return Err(format!("missing host in {address}"));
        }
        Ok(Self {
            id: format!("{}-{}", service, index + 1),
            service: service.to_string(),
            address: url,
            transport,
        })
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.id, self.address)
    }
}

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

#[derive(Debug, Default)]
struct Timing {
    avg_latency_ms: Option<f64>,
    last_failure: Option<Instant>,
}

/// One endpoint plus the bookkeeping its replica set owns.
#[derive(Debug)]
pub struct ReplicaEndpoint {
    pub endpoint: Endpoint,
    /// Position in the configured list; final tie-breaker.
    pub index: usize,
    active: AtomicUsize,
    total: AtomicU64,
    failed: AtomicU64,
    consecutive_failures: AtomicUsize,
    state: AtomicU8,
    timing: Mutex<Timing>,
}

/// Counters for stats.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub id: String,
    pub address: String,
    pub health: HealthState,
    pub active: usize,
    pub total: u64,
    pub failed: u64,
    pub consecutive_failures: usize,
    pub avg_latency_ms: Option<f64>,
    /// Milliseconds since the last failure.
    pub last_failure_ago_ms: Option<u64>,
}

impl ReplicaEndpoint {
    pub fn new(endpoint: Endpoint, index: usize) -> Self {
        Self {
            endpoint,
            index,
            active: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            consecutive_failures: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Unknown as u8),
            timing: Mutex::new(Timing::default()),
        }
    }

    fn timing(&self) -> MutexGuard<'_, Timing> {
        self.timing.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.endpoint.id
    }

    /// Requests currently in flight on this endpoint.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        self.timing().avg_latency_ms
    }

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Relaxed))
    }

    /// Start tracking a request. The guard reports the outcome.
    pub(crate) fn begin(self: &Arc<Self>) -> RequestGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            replica: self.clone(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn record(&self, success: bool, latency: Option<Duration>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut timing = self.timing();
        if let Some(latency) = latency {
            let sample = latency.as_secs_f64() * 1000.0;
            timing.avg_latency_ms = Some(match timing.avg_latency_ms {
                Some(avg) => avg + LATENCY_SMOOTHING * (sample - avg),
                None => sample,
            });
        }
        if success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
            timing.last_failure = Some(Instant::now());
        }
    }

    // --- Health Logic ---

    /// Report a successful health check.
    pub(crate) fn mark_healthy(&self) {
        let previous = self.state.swap(HealthState::Healthy as u8, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if previous != HealthState::Healthy as u8 {
            tracing::info!(endpoint = %self.endpoint.id, "Endpoint healthy");
        }
    }

    /// Report a failed health check.
    pub(crate) fn mark_unhealthy(&self) {
        let previous = self.state.swap(HealthState::Unhealthy as u8, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.timing().last_failure = Some(Instant::now());
        if previous != HealthState::Unhealthy as u8 {
            tracing::warn!(endpoint = %self.endpoint.id, "Endpoint unhealthy");
        }
    }

    pub fn stats(&self) -> EndpointStats {
        let timing = self.timing();
        EndpointStats {
            id: self.endpoint.id.clone(),
            address: self.endpoint.address.to_string(),
            health: self.health(),
            active: self.active(),
            total: self.total.load(Ordering::Relaxed),
            failed: self.failed(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            avg_latency_ms: timing.avg_latency_ms,
            last_failure_ago_ms: timing
                .last_failure
                .map(|at| Instant::now().saturating_duration_since(at).as_millis() as u64),
        }
    }
}

/// RAII guard for one in-flight request on a replica.
///
/// Dropping it without calling [`RequestGuard::finish`] only releases the
/// active slot (used for cancelled requests).
#[derive(Debug)]
pub struct RequestGuard {
    replica: Arc<ReplicaEndpoint>,
    started: Instant,
    finished: bool,
}

impl RequestGuard {
    /// Record the outcome and latency of the request.
    pub fn finish(mut self, success: bool) {
        self.finished = true;
        self.replica.record(success, Some(self.started.elapsed()));
    }

    /// Record a failure that never reached the replica (no latency sample).
    pub fn fail_without_latency(mut self) {
        self.finished = true;
        self.replica.record(false, None);
    }
}

impl Deref for RequestGuard {
    type Target = ReplicaEndpoint;
    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.replica.active.fetch_sub(1, Ordering::Relaxed);
        if !self.finished {
            tracing::trace!(endpoint = %self.replica.endpoint.id, "Request abandoned");
        }
    }
}
