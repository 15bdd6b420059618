use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Claims read from the client's bearer token.
///
/// The client never holds the signing key, so these are inspected rather than
/// verified. Only `exp` drives behavior: an expired token is not presented.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiration time (Unix timestamp)
    #[serde(default)]
    pub exp: Option<i64>,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: Option<i64>,
    /// Additional custom claims
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    pub fn user_id(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    /// Tokens without an `exp` claim never expire client-side
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.exp.is_some_and(|exp| exp <= now)
    }
}

/// Decode the claims of a JWT without checking its signature.
///
/// Returns `None` for opaque (non-JWT) tokens; callers treat those as
/// non-expiring and let the server decide.
pub fn inspect_token(token: &str) -> Option<Claims> {
    let header = jsonwebtoken::decode_header(token).ok()?;

    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn create_test_token(exp: Option<i64>) -> String {
        let claims = Claims {
            sub: Some("user-123".to_string()),
            exp,
            iat: Some(chrono::Utc::now().timestamp()),
            extra: Default::default(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"server-side-secret"),
        )
        .unwrap()
    }

    #[test]
    fn test_inspect_valid_token() {
        let token = create_test_token(Some(chrono::Utc::now().timestamp() + 3600));
        let claims = inspect_token(&token).unwrap();
        assert_eq!(claims.user_id(), Some("user-123"));
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_inspect_expired_token() {
        let token = create_test_token(Some(chrono::Utc::now().timestamp() - 60));
        let claims = inspect_token(&token).unwrap();
        assert!(claims.is_expired());
    }

    #[test]
    fn test_token_without_exp_never_expires() {
        let token = create_test_token(None);
        let claims = inspect_token(&token).unwrap();
        assert!(!claims.is_expired());
    }

    #[test]
    fn test_opaque_token_is_not_inspectable() {
        assert!(inspect_token("opaque-session-token").is_none());
    }
}
