//! Physical push-channel transports.
//!
//! A [`Transport`] opens one authenticated session at a time; the
//! [`ConnectionManager`](crate::connection_manager::ConnectionManager) owns the
//! lifecycle (retries, backoff, teardown) on top of it.
//!
//! - `WebSocketTransport`: tokio-tungstenite client, bearer credential in the upgrade request
//! - `MemoryTransport`: scripted in-process transport for tests and bridging

mod backoff;
mod memory;
mod websocket;

use async_trait::async_trait;
use thiserror::Error;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use memory::{HandshakeOutcome, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Transport-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The server refused the credential (401/403 equivalent). Terminal for that credential.
    #[error("Handshake rejected: {0}")]
    AuthRejected(String),

    #[error("Timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TransportError::AuthRejected(_))
    }
}

/// Opens authenticated sessions on the push channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake, presenting `credential` as the bearer token.
    async fn open(&self, credential: &str) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// One live physical session
#[async_trait]
pub trait TransportSession: Send {
    /// Next inbound text frame. `None` means the peer closed the session.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the session; must not block indefinitely.
    async fn close(&mut self);
}
