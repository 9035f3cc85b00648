//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher
//!     → deduplicate(key, work)       (dedup.rs: first caller runs, rest await)
//!     → register_task(id)            (task.rs: cancellation + subprocesses)
//!     → acquire(endpoint)            (connection_pool.rs: breaker, semaphore, idle cache)
//!     → ConnectionLease              (returned or closed on drop)
//!
//! Background:
//!     sweeper.rs closes idle connections past their timeout
//! ```
//!
//! # Design Decisions
//! - The pool is the single owner of the semaphore, idle lists, breakers,
//!   task registry and dedup map; each has its own lock
//! - Leases are RAII: a permit can never leak past a dropped lease

pub mod connection_pool;
pub mod dedup;
pub mod sweeper;
pub mod task;

pub use connection_pool::{ConnectionLease, ConnectionPool, PoolStats};
pub use dedup::Deduplicator;
pub use sweeper::IdleSweeper;
pub use task::{ChildProcess, ManagedTask, ProcessHandle, TaskInfo, TaskMetadata};
