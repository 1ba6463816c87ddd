//! Bearer JWT validation for WebSocket upgrades and HTTP endpoints

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    Missing,

    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token expired")]
    Expired,
}

/// Claims carried by the session JWT issued at login.
///
/// Only the subject is consumed by the cores; everything else the external
/// auth layer stuffs into the token is ignored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id the session belongs to
    pub sub: String,
    /// Expiry (seconds since epoch)
    pub exp: i64,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Validates Bearer tokens against the shared `JWT_SECRET`.
#[derive(Clone)]
pub struct Authenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl Authenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a raw compact JWT and return its claims.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }

    /// Extract and verify a token from an `Authorization: Bearer` header
    /// value or a `?token=` query fallback.
    ///
    /// Browsers cannot attach headers to `new WebSocket(...)`, so upgrade
    /// requests are allowed to carry the token in the query string instead.
    pub fn verify_request(
        &self,
        authorization: Option<&str>,
        query_token: Option<&str>,
    ) -> Result<Claims, AuthError> {
        let token = authorization
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or(query_token)
            .ok_or(AuthError::Missing)?;
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn issue(secret: &str, sub: &str, exp: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp,
            username: None,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn accepts_valid_bearer_header() {
        let auth = Authenticator::new("secret");
        let token = issue("secret", "user-1", future_exp());
        let header = format!("Bearer {}", token);
        let claims = auth.verify_request(Some(&header), None).unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn accepts_query_token_fallback() {
        let auth = Authenticator::new("secret");
        let token = issue("secret", "user-2", future_exp());
        let claims = auth.verify_request(None, Some(&token)).unwrap();
        assert_eq!(claims.sub, "user-2");
    }

    #[test]
    fn rejects_wrong_secret() {
        let auth = Authenticator::new("secret");
        let token = issue("other", "user-1", future_exp());
        assert!(matches!(
            auth.verify(&token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_expired() {
        let auth = Authenticator::new("secret");
        let token = issue("secret", "user-1", chrono::Utc::now().timestamp() - 10);
        assert!(matches!(auth.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn rejects_missing() {
        let auth = Authenticator::new("secret");
        assert!(matches!(
            auth.verify_request(None, None),
            Err(AuthError::Missing)
        ));
    }
}
