//! Process configuration from environment variables.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `PURSE_BIND_ADDR` | `0.0.0.0:8080` | HTTP listen address |
//! | `DATABASE_URL` | unset | Postgres URL; unset selects the in-memory store |
//! | `PURSE_DB_MAX_CONNECTIONS` | `10` | Postgres pool size |
//! | `PURSE_REQUEST_TIMEOUT_MS` | `5000` | Per-request deadline |
//! | `PURSE_LOG_FORMAT` | `json` | `json` or `pretty` |

use std::net::SocketAddr;
use std::time::Duration;

use purse_observability::LogFormat;
use thiserror::Error;

pub const BIND_ADDR: &str = "PURSE_BIND_ADDR";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "PURSE_DB_MAX_CONNECTIONS";
pub const REQUEST_TIMEOUT_MS: &str = "PURSE_REQUEST_TIMEOUT_MS";
pub const LOG_FORMAT: &str = "PURSE_LOG_FORMAT";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Where balances and operations live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    Postgres { url: String, max_connections: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub storage: StorageBackend,
    pub request_timeout: Duration,
    pub log_format: LogFormat,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_raw = get(BIND_ADDR).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid(BIND_ADDR, &bind_raw, e))?;

        let max_connections = match get(DB_MAX_CONNECTIONS) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(0) => return Err(ConfigError::invalid(DB_MAX_CONNECTIONS, &raw, "must be at least 1")),
                Ok(n) => n,
                Err(e) => return Err(ConfigError::invalid(DB_MAX_CONNECTIONS, &raw, e)),
            },
            None => DEFAULT_MAX_CONNECTIONS,
        };

        let storage = match get(DATABASE_URL) {
            Some(url) => StorageBackend::Postgres { url, max_connections },
            None => StorageBackend::InMemory,
        };

        let timeout_ms = match get(REQUEST_TIMEOUT_MS) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(0) => return Err(ConfigError::invalid(REQUEST_TIMEOUT_MS, &raw, "must be positive")),
                Ok(n) => n,
                Err(e) => return Err(ConfigError::invalid(REQUEST_TIMEOUT_MS, &raw, e)),
            },
            None => DEFAULT_REQUEST_TIMEOUT_MS,
        };

        let log_format = match get(LOG_FORMAT) {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::invalid(LOG_FORMAT, &raw, e))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            bind_addr,
            storage,
            request_timeout: Duration::from_millis(timeout_ms),
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_select_in_memory_store() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(cfg.storage, StorageBackend::InMemory);
        assert_eq!(cfg.request_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn database_url_selects_postgres() {
        let cfg = config(&[
            (DATABASE_URL, "postgres://purse@localhost/purse"),
            (DB_MAX_CONNECTIONS, "4"),
            (LOG_FORMAT, "pretty"),
        ])
        .unwrap();
        assert_eq!(
            cfg.storage,
            StorageBackend::Postgres {
                url: "postgres://purse@localhost/purse".to_string(),
                max_connections: 4
            }
        );
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config(&[(DATABASE_URL, "  "), (REQUEST_TIMEOUT_MS, "")]).unwrap();
        assert_eq!(cfg.storage, StorageBackend::InMemory);
        assert_eq!(cfg.request_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[(REQUEST_TIMEOUT_MS, "soon")]).unwrap_err();
        assert!(err.to_string().starts_with("PURSE_REQUEST_TIMEOUT_MS"));

        assert!(config(&[(BIND_ADDR, "localhost")]).is_err());
        assert!(config(&[(DB_MAX_CONNECTIONS, "0")]).is_err());
        assert!(config(&[(LOG_FORMAT, "xml")]).is_err());
    }
}
