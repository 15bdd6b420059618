//! Lifecycle of the single logical push connection: connect, authenticate,
//! reconnect with backoff, teardown.

mod manager;
mod types;

pub use manager::ConnectionManager;
pub use types::{ConnectionSignal, ConnectionState};
