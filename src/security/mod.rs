pub mod audit_log;
pub mod auth;
pub mod credentials;
pub mod rate_limit;

pub use auth::{AuthGate, Identity};
pub use credentials::{Claims, CredentialValidator};
pub use rate_limit::{Admission, AdmissionControl, BucketConfig, RateLimiter};
