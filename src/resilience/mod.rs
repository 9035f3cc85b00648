//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to replica:
//!     → timeouts.rs (overall deadline, per-attempt and replica slices)
//!     → circuit_breaker.rs (fail fast, track failures per endpoint)
//!     → On retryable failure: backoff.rs (jittered delay before next attempt)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Circuit breaker prevents hammering a dead replica
//! - Jittered backoff prevents thundering herd on shared replicas

pub mod backoff;
pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use timeouts::Deadline;
