// Shared components
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

// Push channel
pub mod connection_manager;
pub mod dispatcher;
pub mod transport;

// Reconcilers
pub mod notification;
pub mod video;
pub mod visibility;

// Supporting modules
pub mod client;
pub mod tasks;

pub use client::SyncContext;
pub use error::{Result, SyncError};
