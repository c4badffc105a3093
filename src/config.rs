use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::time::Duration;

use crate::error::ConfigError;
use crate::security::rate_limit::BucketConfig;

pub const DEFAULT_ISSUER: &str = "inventory";
const MIN_IDLE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_tokens: i64,
    pub refill_per_sec: i64,
    /// Defaults to twice the full-refill window, never under a minute.
    pub idle_ttl_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            refill_per_sec: 1,
            idle_ttl_secs: None,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    #[serde(skip_serializing)]
    pub jwt_secret: Option<String>,
    pub issuer: String,
    pub token_ttl_hours: i64,
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("issuer", &self.issuer)
            .field("token_ttl_hours", &self.token_ttl_hours)
            .finish()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: DEFAULT_ISSUER.to_string(),
            token_ttl_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rate_limit: RateLimitSettings,
    pub auth: AuthSettings,
    /// Key the limiter on `X-Forwarded-For` / `X-Real-IP` instead of the peer address.
    pub trust_forwarded_headers: bool,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_file_with(path, |key| std::env::var(key).ok())
    }

    /// Reads `path`, then overlays whatever `lookup` resolves.
    pub fn from_file_with<F>(path: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.apply_overrides(lookup)
            .context("applying environment overrides")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Overlays values found through `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("INVENTORY_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(issuer) = lookup("INVENTORY_JWT_ISSUER") {
            self.auth.issuer = issuer;
        }
        if let Some(v) = parsed(&lookup, "INVENTORY_TOKEN_TTL_HOURS")? {
            self.auth.token_ttl_hours = v;
        }
        if let Some(v) = parsed(&lookup, "RATE_LIMIT_MAX_TOKENS")? {
            self.rate_limit.max_tokens = v;
        }
        if let Some(v) = parsed(&lookup, "RATE_LIMIT_REFILL_PER_SEC")? {
            self.rate_limit.refill_per_sec = v;
        }
        if let Some(v) = parsed(&lookup, "RATE_LIMIT_IDLE_TTL_SECS")? {
            self.rate_limit.idle_ttl_secs = Some(v);
        }
        if let Some(v) = parsed(&lookup, "RATE_LIMIT_SWEEP_SECS")? {
            self.rate_limit.sweep_interval_secs = v;
        }
        if let Some(v) = parsed(&lookup, "TRUST_FORWARDED_HEADERS")? {
            self.trust_forwarded_headers = v;
        }
        Ok(())
    }

    /// Checks every startup constraint at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.signing_secret()?;
        self.bucket_config()?;
        self.token_lifetime()?;
        self.sweep_interval()?;
        Ok(())
    }

    pub fn signing_secret(&self) -> Result<&[u8], ConfigError> {
        match self.auth.jwt_secret.as_deref() {
            Some(s) if !s.trim().is_empty() => Ok(s.as_bytes()),
            _ => Err(ConfigError::MissingSecret),
        }
    }

    pub fn bucket_config(&self) -> Result<BucketConfig, ConfigError> {
        let rl = &self.rate_limit;
        let idle_ttl = match rl.idle_ttl_secs {
            Some(secs) => secs,
            None if rl.max_tokens > 0 && rl.refill_per_sec > 0 => {
                let window = (rl.max_tokens as u64).div_ceil(rl.refill_per_sec as u64);
                (window * 2).max(MIN_IDLE_TTL_SECS)
            }
            None => MIN_IDLE_TTL_SECS,
        };
        BucketConfig::new(rl.max_tokens, rl.refill_per_sec, Duration::from_secs(idle_ttl))
    }

    pub fn token_lifetime(&self) -> Result<chrono::Duration, ConfigError> {
        let hours = self.auth.token_ttl_hours;
        if hours <= 0 {
            return Err(ConfigError::NonPositive {
                field: "token_ttl_hours",
                value: hours,
            });
        }
        chrono::Duration::try_hours(hours).ok_or(ConfigError::InvalidValue {
            key: "token_ttl_hours".into(),
            value: hours.to_string(),
        })
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        match self.rate_limit.sweep_interval_secs {
            0 => Err(ConfigError::NonPositive {
                field: "sweep_interval_secs",
                value: 0,
            }),
            secs => Ok(Duration::from_secs(secs)),
        }
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}
