//! Error taxonomy for the dispatch core.
//!
//! Every failure that can happen between the coordinator and an analyzer
//! replica is one variant of [`GatewayError`]. Errors never cross the
//! dispatch boundary as-is: the dispatcher folds them into an
//! [`AnalysisOutcome`](crate::gateway::AnalysisOutcome) with a wire status.
//!
//! The enum is `Clone` because deduplicated waiters all observe the same
//! error value.

use std::time::Duration;

use thiserror::Error;

use crate::gateway::protocol::OutcomeStatus;

/// Errors produced while selecting, connecting to, or streaming from a replica.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("circuit open for endpoint {endpoint} (retry in {retry_after:?})")]
    CircuitOpen {
        endpoint: String,
        retry_after: Duration,
    },

    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectionTimeout { endpoint: String, timeout: Duration },

    #[error("connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("no terminal message from {endpoint} within {timeout:?}")]
    RequestTimeout { endpoint: String, timeout: Duration },

    #[error("transport error on {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: String },

    #[error("protocol error: {message}")]
    Protocol { message: String },

    #[error("no healthy endpoint for service {service}{}", describe_recovery(.soonest.as_ref()))]
    NoHealthyEndpoint {
        service: String,
        /// Endpoint whose cooldown expires first, with the time left.
        soonest: Option<(String, Duration)>,
    },

    #[error("unknown service type: {0}")]
    UnknownService(String),

    #[error("gave up after {attempts} attempt(s) against [{}]: {last}", .tried.join(", "))]
    RetriesExhausted {
        attempts: u32,
        tried: Vec<String>,
        last: Box<GatewayError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_recovery(soonest: Option<&(String, Duration)>) -> String {
    match soonest {
        Some((endpoint, remaining)) => {
            format!(" ({endpoint} recovers first, in {remaining:?})")
        }
        None => String::new(),
    }
}

impl GatewayError {
    /// Whether another attempt (on another endpoint) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::CircuitOpen { .. }
                | GatewayError::ConnectionTimeout { .. }
                | GatewayError::Connection { .. }
                | GatewayError::RequestTimeout { .. }
                | GatewayError::Transport { .. }
                | GatewayError::Protocol { .. }
        )
    }

    /// Connection-level failures happen before anything was sent, so they
    /// do not count against the attempt budget.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(
            self,
            GatewayError::CircuitOpen { .. }
                | GatewayError::ConnectionTimeout { .. }
                | GatewayError::Connection { .. }
        )
    }

    /// Wire status reported to the caller for this error.
    pub fn status(&self) -> OutcomeStatus {
        match self {
            GatewayError::RequestTimeout { .. } | GatewayError::ConnectionTimeout { .. } => {
                OutcomeStatus::Timeout
            }
            GatewayError::Cancelled { .. } => OutcomeStatus::Cancelled,
            GatewayError::CircuitOpen { .. }
            | GatewayError::NoHealthyEndpoint { .. }
            | GatewayError::UnknownService(_) => OutcomeStatus::NotAvailable,
            GatewayError::RetriesExhausted { last, .. } => last.status(),
            _ => OutcomeStatus::Error,
        }
    }

    /// Short machine-readable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::ConnectionTimeout { .. } => "connection_timeout",
            GatewayError::Connection { .. } => "connection",
            GatewayError::RequestTimeout { .. } => "request_timeout",
            GatewayError::Transport { .. } => "transport",
            GatewayError::Cancelled { .. } => "cancelled",
            GatewayError::Protocol { .. } => "protocol",
            GatewayError::NoHealthyEndpoint { .. } => "no_healthy_endpoint",
            GatewayError::UnknownService(_) => "unknown_service",
            GatewayError::RetriesExhausted { .. } => "retries_exhausted",
            GatewayError::Internal(_) => "internal",
        }
    }
}
