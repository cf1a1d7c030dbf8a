//! Environment-driven configuration, loaded once at startup.
//!
//! A missing required secret (the upstream API key) must cause the process to refuse to
//! start before any socket is bound — see [`Config::from_env`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::constants::*;

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub upstream_api_key: String,
    pub store_path: std::path::PathBuf,
    pub cache_ttl: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery: Duration,
    pub breaker_half_open_probes: u32,
    pub quota_ceiling: u64,
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub request_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingRequired(&'static str),
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl Config {
    /// Loads configuration from the process environment, first merging in a `.env` file if
    /// present (local-development convenience only; production deployments set real env vars).
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let upstream_api_key = require_env("GATEWAY_UPSTREAM_API_KEY")?;

        let upstream_base_url = env_or("GATEWAY_UPSTREAM_BASE_URL", DEFAULT_UPSTREAM_BASE_URL);
        let store_path =
            std::path::PathBuf::from(env_or("GATEWAY_STORE_PATH", DEFAULT_STORE_PATH));
        let cache_ttl = Duration::from_secs(parse_env(
            "GATEWAY_CACHE_TTL_SECONDS",
            DEFAULT_CACHE_TTL_SECONDS,
        )?);
        let breaker_failure_threshold = parse_env(
            "GATEWAY_BREAKER_FAILURE_THRESHOLD",
            DEFAULT_BREAKER_FAILURE_THRESHOLD,
        )?;
        let breaker_recovery = Duration::from_secs(parse_env(
            "GATEWAY_BREAKER_RECOVERY_SECONDS",
            DEFAULT_BREAKER_RECOVERY_SECONDS,
        )?);
        let breaker_half_open_probes = parse_env(
            "GATEWAY_BREAKER_HALF_OPEN_PROBES",
            DEFAULT_BREAKER_HALF_OPEN_PROBES,
        )?;
        let quota_ceiling = parse_env("GATEWAY_QUOTA_CEILING", DEFAULT_QUOTA_CEILING)?;
        let listen_addr_raw = env_or("GATEWAY_LISTEN_ADDR", DEFAULT_LISTEN_ADDR);
        let listen_addr = listen_addr_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "GATEWAY_LISTEN_ADDR",
                value: listen_addr_raw,
                reason: e.to_string(),
            })?;
        let log_level = env_or("GATEWAY_LOG_LEVEL", DEFAULT_LOG_LEVEL);
        let request_timeout = Duration::from_secs(parse_env(
            "GATEWAY_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?);

        Ok(Self {
            upstream_base_url,
            upstream_api_key,
            store_path,
            cache_ttl,
            breaker_failure_threshold,
            breaker_recovery,
            breaker_half_open_probes,
            quota_ceiling,
            listen_addr,
            log_level,
            request_timeout,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingRequired(name)),
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value: v,
            reason: e.to_string(),
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        std::env::remove_var("GATEWAY_TEST_UNSET_VAR");
        assert_eq!(env_or("GATEWAY_TEST_UNSET_VAR", "fallback"), "fallback");
    }

    #[test]
    fn parse_env_rejects_garbage() {
        std::env::set_var("GATEWAY_TEST_BAD_NUMBER", "not-a-number");
        let err = parse_env::<u64>("GATEWAY_TEST_BAD_NUMBER", 5).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        std::env::remove_var("GATEWAY_TEST_BAD_NUMBER");
    }
}
