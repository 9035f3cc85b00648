//! Dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! caller
//!     → dispatcher.rs (dedup, retries, hierarchical deadline)
//!     → ReplicaSet::select → ConnectionPool::acquire
//!     → stream.rs (send request, relay progress, wait for terminal)
//!     → protocol.rs (frame parsing, outcome envelope)
//! ```

pub mod dispatcher;
pub mod protocol;
pub mod stream;

pub use dispatcher::{Dispatcher, GatewayStats};
pub use protocol::{AnalysisOutcome, AnalysisTarget, DispatchRequest, OutcomeStatus, ReplicaMessage};
pub use stream::ProgressEvent;
