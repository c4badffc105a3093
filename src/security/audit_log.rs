use tracing::{error, info, warn};
use uuid::Uuid;

/// Structured security events on the `audit` target. Failure reasons are
/// recorded here and never returned to clients.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn rate_limited(&self, client: &str, path: &str) {
        warn!(target: "audit", event = "rate_limited", client, path);
    }

    pub fn auth_success(&self, client: &str, user_id: &Uuid, path: &str) {
        info!(target: "audit", event = "auth_success", client, user_id = %user_id, path);
    }

    pub fn auth_failure(&self, client: &str, reason: &str, detail: &str) {
        warn!(target: "audit", event = "auth_failure", client, reason, detail);
    }

    pub fn token_issued(&self, client: &str, user_id: &Uuid) {
        info!(target: "audit", event = "token_issued", client, user_id = %user_id);
    }

    pub fn login_failed(&self, client: &str, username: &str, reason: &str) {
        warn!(target: "audit", event = "login_failed", client, username, reason);
    }

    pub fn internal_error(&self, client: &str, error_msg: &str) {
        error!(target: "audit", event = "internal_error", client, error = error_msg);
    }
}
