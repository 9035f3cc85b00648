//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Build pool + dispatcher → Start workers → Serve admin API
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Admin server drains → Workers stop → Idle connections closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!
//! Workers (worker.rs):
//!     Health monitor, idle sweeper
//! ```
//!
//! # Design Decisions
//! - Shutdown is one broadcast; every long-running task subscribes
//! - Worker stop has a timeout: stuck workers are aborted

pub mod shutdown;
pub mod signals;
pub mod worker;

pub use shutdown::Shutdown;
pub use worker::BackgroundWorker;
