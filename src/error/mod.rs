use thiserror::Error;

use crate::notification::ApiError;
use crate::transport::TransportError;

/// Top-level error for the sync layer.
///
/// Components return their own narrower error types; this enum is what the
/// binary and embedders see when they wire everything together.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the error means the current credential is no longer usable
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Auth(_) => true,
            SyncError::Transport(e) => e.is_auth(),
            SyncError::Api(e) => matches!(e, ApiError::Unauthorized(_)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_classification() {
        assert!(SyncError::Auth("expired".into()).is_auth());
        assert!(SyncError::Transport(TransportError::AuthRejected("401".into())).is_auth());
        assert!(SyncError::Api(ApiError::Unauthorized("401".into())).is_auth());
        assert!(!SyncError::Transport(TransportError::Timeout).is_auth());
        assert!(!SyncError::Internal("boom".into()).is_auth());
    }
}
