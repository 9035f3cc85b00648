//! Replica transport subsystem.
//!
//! # Data Flow
//! ```text
//! ConnectionPool::acquire
//!     → Connector::connect(endpoint)      (websocket.rs in production)
//!     → Box<dyn Connection>               (owned by a lease while in use)
//!     → send_text / recv_text JSON frames
//!     → back to the pool's idle list, or closed
//! ```
//!
//! # Design Decisions
//! - Message-oriented: one JSON object per frame
//! - The pool and dispatcher only see the traits, so tests swap in a
//!   scripted in-memory transport

use async_trait::async_trait;
use thiserror::Error;

use crate::load_balancer::endpoint::Endpoint;

pub mod websocket;

#[cfg(test)]
pub(crate) mod mock;

pub use websocket::WebSocketConnector;

/// Errors raised by a single connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Io(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// A live, message-oriented connection to one replica.
#[async_trait]
pub trait Connection: Send {
    /// Send one JSON text frame.
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Next text frame; `None` once the peer has closed the stream.
    async fn recv_text(&mut self) -> Option<TransportResult<String>>;

    /// Close politely. Errors are ignored.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Opens connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Endpoint) -> TransportResult<Box<dyn Connection>>;
}
