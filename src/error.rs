use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Why a bearer credential was refused. Only ever logged; clients see
/// [`ApiError::Unauthorized`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("signing algorithm {0:?} is not accepted")]
    AlgorithmMismatch(String),
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("credential expired")]
    Expired,
    #[error("unexpected issuer")]
    IssuerMismatch,
    #[error("token signing failed: {0}")]
    SigningFailure(String),
}

impl AuthError {
    /// Short machine-friendly label for audit events.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::Malformed(_) => "malformed",
            Self::AlgorithmMismatch(_) => "algorithm_mismatch",
            Self::InvalidSignature => "bad_signature",
            Self::Expired => "expired",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::SigningFailure(_) => "signing_failure",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidIssuer => Self::IssuerMismatch,
            ErrorKind::InvalidAlgorithm => Self::AlgorithmMismatch("undeclared".to_string()),
            _ => Self::Malformed(err.to_string()),
        }
    }
}

/// Startup-fatal configuration problems.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("signing secret is not configured (set INVENTORY_JWT_SECRET)")]
    MissingSecret,
    #[error("{field} must be a positive integer, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("bucket idle ttl of {ttl_secs}s is shorter than the {refill_window_secs}s refill window")]
    IdleTtlTooShort { ttl_secs: u64, refill_window_secs: u64 },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors as the HTTP client sees them. Every variant renders as
/// `{"error": "..."}` and nothing more.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Too many requests. Please try again later.")]
    RateLimited,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
