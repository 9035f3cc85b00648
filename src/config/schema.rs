//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the analysis gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Admin API listener.
    pub admin: AdminConfig,

    /// Connection pool limits and timeouts.
    pub pool: PoolConfig,

    /// Per-endpoint circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry and timeout policy for dispatched requests.
    pub dispatch: DispatchConfig,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Analyzer services and their replicas.
    pub services: Vec<ServiceConfig>,
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the admin API.
    pub enabled: bool,

    /// Bind address (e.g., "127.0.0.1:8090").
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8090".to_string(),
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum simultaneously leased connections across all endpoints.
    pub max_connections: usize,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Idle connections older than this are closed by the sweeper.
    pub idle_timeout_secs: u64,

    /// How often the idle sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Circuit breaker configuration, applied to every endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before allowing trial calls.
    pub cooldown_secs: u64,

    /// Trial calls admitted while half-open.
    pub half_open_max_calls: u32,

    /// Half-open successes needed to close the circuit again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 60,
            half_open_max_calls: 3,
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Dispatch policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum stream-level attempts per dispatch.
    pub max_retries: u32,

    /// Default overall timeout when the caller supplies none.
    pub request_timeout_secs: u64,

    /// Subtracted from the remaining budget before it is handed to the
    /// replica, so the replica gives up before the gateway does.
    pub replica_timeout_margin_secs: u64,

    /// Collapse concurrent identical requests into one execution.
    pub deduplicate: bool,

    /// Base delay for exponential backoff in milliseconds.
    pub backoff_base_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub backoff_max_ms: u64,

    /// Grace period between SIGTERM and SIGKILL for task subprocesses.
    pub cancel_grace_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout_secs: 600,
            replica_timeout_margin_secs: 5,
            deduplicate: true,
            backoff_base_ms: 250,
            backoff_max_ms: 5000,
            cancel_grace_secs: 5,
        }
    }
}

impl DispatchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn replica_timeout_margin(&self) -> Duration {
        Duration::from_secs(self.replica_timeout_margin_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Time allowed for a `health_response` in seconds.
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty output for development, JSON for log shipping.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9095".to_string(),
        }
    }
}

/// Load balancing strategy for one service.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LeastLoaded,
    RoundRobin,
    Random,
}

/// One analyzer service type and its interchangeable replicas.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service type used in dispatch calls (e.g., "static-analyzer").
    pub name: String,

    /// Load balancing strategy.
    #[serde(default)]
    pub strategy: Strategy,

    /// Replica addresses (`ws://host:port` or bare `host:port`).
    pub endpoints: Vec<String>,
}
