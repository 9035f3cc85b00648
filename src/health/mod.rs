//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → health_check message to each replica (through the pool, breaker-gated)
//!     → breaker success/failure + replica health state
//!
//! Passive signals come from the dispatcher itself: every attempt outcome
//! is recorded on the same breaker and replica counters.
//! ```
//!
//! # Design Decisions
//! - Health checks reuse the pool so they respect the connection bound
//! - An open circuit is not checked; its cooldown decides when to retry

pub mod active;

pub use active::{CheckOutcome, HealthMonitor};
