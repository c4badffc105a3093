use base64::{engine::general_purpose, Engine as _};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AuthError;
use crate::utils::clock::SharedClock;

/// Algorithm used when issuing tokens.
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

/// Identity payload carried inside a bearer token.
///
/// `username` is the one canonical label claim; tokens carrying the label
/// under any other name fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userID")]
    pub subject_id: Uuid,
    pub username: String,
    pub iss: String,
    pub exp: i64,
}

#[derive(Deserialize)]
struct DeclaredHeader {
    alg: String,
}

/// Issues and verifies HMAC-signed bearer tokens with the process secret.
#[derive(Clone)]
pub struct CredentialValidator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    lifetime: chrono::Duration,
    clock: SharedClock,
}

impl fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("issuer", &self.issuer)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl CredentialValidator {
    pub fn new(secret: &[u8], issuer: impl Into<String>, lifetime: chrono::Duration, clock: SharedClock) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            lifetime,
            clock,
        }
    }

    pub fn issue(&self, subject_id: Uuid, username: &str) -> Result<String, AuthError> {
        let claims = Claims {
            subject_id,
            username: username.to_string(),
            iss: self.issuer.clone(),
            exp: (self.clock.now_utc() + self.lifetime).timestamp(),
        };
        encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding)
            .map_err(|e| AuthError::SigningFailure(e.to_string()))
    }

    /// Checks structure, then the declared algorithm, then the signature,
    /// then expiry. The algorithm gate runs before any key material is used.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let algorithm = declared_algorithm(token)?;

        let mut validation = Validation::new(algorithm);
        // expiry is judged against our own clock below
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let claims = decode::<Claims>(token, &self.decoding, &validation)?.claims;

        if claims.exp <= self.clock.now_utc().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }
}

fn declared_algorithm(token: &str) -> Result<Algorithm, AuthError> {
    let mut segments = token.split('.');
    let header = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(h), Some(_), Some(_), None) if !h.is_empty() => h,
        _ => return Err(AuthError::Malformed("expected three dot-separated segments".into())),
    };
    let raw = general_purpose::URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| AuthError::Malformed(format!("header encoding: {e}")))?;
    let declared: DeclaredHeader =
        serde_json::from_slice(&raw).map_err(|e| AuthError::Malformed(format!("header json: {e}")))?;

    match declared.alg.as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(AuthError::AlgorithmMismatch(other.to_string())),
    }
}
