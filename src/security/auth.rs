use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, AuthError};
use crate::security::credentials::{Claims, CredentialValidator};

pub const BEARER_PREFIX: &str = "Bearer ";

/// Caller identity attached to a request once its bearer token checks out.
/// Product handlers scope every query to `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.subject_id,
            username: claims.username,
        }
    }
}

/// Turns an `Authorization` header into an [`Identity`]. One attempt per
/// request; any failure is final.
#[derive(Debug, Clone)]
pub struct AuthGate {
    validator: CredentialValidator,
}

impl AuthGate {
    pub fn new(validator: CredentialValidator) -> Self {
        Self { validator }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = bearer_token(headers)?;
        let claims = self.validator.verify(token)?;
        Ok(claims.into())
    }
}

/// Extracts the raw token after the literal `Bearer ` prefix.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .ok_or(AuthError::MissingCredential)
}

// Only succeeds behind the identity middleware, which inserts the extension.
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    fn gate() -> (AuthGate, CredentialValidator) {
        let clock = ManualClock::starting_now();
        let validator = CredentialValidator::new(b"gate-secret", "inventory", chrono::Duration::hours(24), Arc::new(clock));
        (AuthGate::new(validator.clone()), validator)
    }

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn missing_header() {
        let (gate, _) = gate();
        assert_eq!(gate.authenticate(&HeaderMap::new()), Err(AuthError::MissingCredential));
    }

    #[test]
    fn prefix_is_literal() {
        let (gate, v) = gate();
        let token = v.issue(Uuid::new_v4(), "puja").unwrap();
        for value in [token.clone(), format!("bearer {token}"), format!("Token {token}"), format!("Bearer{token}")] {
            assert_eq!(gate.authenticate(&headers(&value)), Err(AuthError::MissingCredential));
        }
    }

    #[test]
    fn valid_token_yields_identity() {
        let (gate, v) = gate();
        let id = Uuid::new_v4();
        let token = v.issue(id, "puja").unwrap();

        let identity = gate.authenticate(&headers(&format!("Bearer {token}"))).unwrap();
        assert_eq!(identity, Identity { user_id: id, username: "puja".into() });
    }

    #[test]
    fn verifier_errors_pass_through() {
        let (gate, _) = gate();
        assert!(matches!(
            gate.authenticate(&headers("Bearer not-a-token")),
            Err(AuthError::Malformed(_))
        ));
    }
}
