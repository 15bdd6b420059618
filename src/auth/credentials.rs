use std::sync::{Arc, PoisonError, RwLock};

use super::inspect_token;

/// Source of the current bearer credential.
///
/// Read at every handshake and every REST call, so a rotated token is picked up
/// without restarting anything.
pub trait CredentialStore: Send + Sync {
    /// The token to present right now, or `None` when signed out
    fn bearer_token(&self) -> Option<String>;
}

/// Reason a credential cannot be presented
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialProblem {
    #[error("no credential available")]
    Missing,
    #[error("credential has expired")]
    Expired,
}

/// Fetch the current token and reject it locally if it is missing or its
/// `exp` claim has passed.
pub fn usable_token(store: &dyn CredentialStore) -> Result<String, CredentialProblem> {
    let token = store
        .bearer_token()
        .filter(|t| !t.trim().is_empty())
        .ok_or(CredentialProblem::Missing)?;

    match inspect_token(&token) {
        Some(claims) if claims.is_expired() => Err(CredentialProblem::Expired),
        _ => Ok(token),
    }
}

/// In-process credential holder shared between the app shell and the sync layer
#[derive(Debug, Default, Clone)]
pub struct SharedCredentials {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    /// Replace the token (sign-in or refresh)
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Forget the token (sign-out)
    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl CredentialStore for SharedCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
