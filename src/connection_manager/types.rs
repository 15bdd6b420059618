//! Connection state and lifecycle signals

use std::fmt;

use uuid::Uuid;

/// Lifecycle state of the single logical push connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry; `attempt` is the consecutive handshake attempt about to be made
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a session task is alive (connected or working towards it)
    pub fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    pub(crate) fn metric_code(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting { .. } => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "reconnecting (attempt {})", attempt)
            }
        }
    }
}

/// Lifecycle notifications for observers.
///
/// Delivered on a broadcast channel; observers that lag lose old signals, never
/// the current state (read that from `watch_state()`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A handshake succeeded and a new physical session is live
    Connected { session_id: Uuid },
    /// A handshake failed with a transient error; a retry is scheduled
    ConnectError(String),
    /// The credential was missing, expired or refused. No further retries.
    AuthFailed(String),
    /// An established session was lost
    Dropped(String),
    /// `disconnect()` tore the connection down
    Disconnected,
    /// Consecutive failures reached the configured limit
    RetriesExhausted { attempts: u32 },
}
