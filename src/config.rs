//! Configuration parsed from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::RestBackendConfig;

pub const DEFAULT_SESSION_FETCH_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HYDRATE_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_HYDRATE_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_HYDRATE_MAX_RETRIES: u32 = 1;
pub const DEFAULT_CACHED_SESSION_MAX_AGE_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_SIGN_OUT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SESSION_STORE_PATH: &str = ".rentdesk-session.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var {var}")]
    Missing { var: &'static str },
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn parse(raw: Option<&str>) -> Result<Self, ConfigError> {
        match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            None | Some("" | "production" | "prod") => Ok(Self::Production),
            Some("development" | "dev") => Ok(Self::Development),
            Some(other) => Err(ConfigError::Invalid { var: "APP_ENV", value: other.to_owned() }),
        }
    }

    #[must_use]
    pub fn is_development(self) -> bool {
        self == Self::Development
    }
}

/// Time bounds of the reconciliation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileTimeouts {
    /// Race bound on the initial remote session fetch.
    pub session_fetch: Duration,
    /// Time-box on profile hydration once a principal is known.
    pub hydrate: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub cached_session_max_age: Duration,
    pub sign_out: Duration,
}

impl Default for ReconcileTimeouts {
    fn default() -> Self {
        Self {
            session_fetch: Duration::from_millis(DEFAULT_SESSION_FETCH_TIMEOUT_MS),
            hydrate: Duration::from_millis(DEFAULT_HYDRATE_TIMEOUT_MS),
            retry_delay: Duration::from_millis(DEFAULT_HYDRATE_RETRY_DELAY_MS),
            max_retries: DEFAULT_HYDRATE_MAX_RETRIES,
            cached_session_max_age: Duration::from_secs(DEFAULT_CACHED_SESSION_MAX_AGE_SECS),
            sign_out: Duration::from_millis(DEFAULT_SIGN_OUT_TIMEOUT_MS),
        }
    }
}

impl ReconcileTimeouts {
    /// Overlay `*_MS` / `*_SECS` overrides on the defaults. Unparseable
    /// values keep the default.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            session_fetch: Duration::from_millis(env_parse("SESSION_FETCH_TIMEOUT_MS", DEFAULT_SESSION_FETCH_TIMEOUT_MS)),
            hydrate: Duration::from_millis(env_parse("HYDRATE_TIMEOUT_MS", DEFAULT_HYDRATE_TIMEOUT_MS)),
            retry_delay: Duration::from_millis(env_parse("HYDRATE_RETRY_DELAY_MS", DEFAULT_HYDRATE_RETRY_DELAY_MS)),
            max_retries: env_parse("HYDRATE_MAX_RETRIES", DEFAULT_HYDRATE_MAX_RETRIES),
            cached_session_max_age: Duration::from_secs(env_parse(
                "CACHED_SESSION_MAX_AGE_SECS",
                DEFAULT_CACHED_SESSION_MAX_AGE_SECS,
            )),
            sign_out: Duration::from_millis(env_parse("SIGN_OUT_TIMEOUT_MS", DEFAULT_SIGN_OUT_TIMEOUT_MS)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: RestBackendConfig,
    pub store_path: PathBuf,
    pub environment: Environment,
    pub timeouts: ReconcileTimeouts,
}

impl AppConfig {
    /// Build typed config from environment variables.
    ///
    /// Required:
    /// - `BACKEND_URL` (`http://` or `https://`)
    /// - `BACKEND_ANON_KEY`
    ///
    /// Optional:
    /// - `SESSION_STORE_PATH`: default `.rentdesk-session.json`
    /// - `APP_ENV`: `production` (default) or `development`
    /// - `HTTP_REQUEST_TIMEOUT_SECS`: default 30
    /// - `HTTP_CONNECT_TIMEOUT_SECS`: default 10
    /// - timeout overrides read by [`ReconcileTimeouts::from_env`]
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for missing required values, a malformed
    /// backend URL or an unknown `APP_ENV`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = required("BACKEND_URL")?;
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(ConfigError::Invalid { var: "BACKEND_URL", value: base_url });
        }
        let anon_key = required("BACKEND_ANON_KEY")?;

        let backend = RestBackendConfig {
            base_url: base_url.trim_end_matches('/').to_owned(),
            anon_key,
            request_timeout: Duration::from_secs(env_parse(
                "HTTP_REQUEST_TIMEOUT_SECS",
                DEFAULT_HTTP_REQUEST_TIMEOUT_SECS,
            )),
            connect_timeout: Duration::from_secs(env_parse(
                "HTTP_CONNECT_TIMEOUT_SECS",
                DEFAULT_HTTP_CONNECT_TIMEOUT_SECS,
            )),
        };
        let store_path = std::env::var("SESSION_STORE_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_SESSION_STORE_PATH), PathBuf::from);
        let environment = Environment::parse(std::env::var("APP_ENV").ok().as_deref())?;

        Ok(Self { backend, store_path, environment, timeouts: ReconcileTimeouts::from_env() })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing { var })
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
