//! Dispatch core for containerized analyzer replicas.
//!
//! Pools long-lived WebSocket connections to analyzer replicas, fails fast
//! against unhealthy ones, balances load across healthy ones, collapses
//! identical concurrent requests, and cancels in-flight analyses together
//! with their subprocesses.

pub mod admin;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod transport;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use gateway::{AnalysisOutcome, DispatchRequest, Dispatcher, OutcomeStatus};
pub use lifecycle::Shutdown;
