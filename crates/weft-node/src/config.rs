//! Node configuration
//!
//! Everything comes from `WEFT_*` environment variables (plus `.env` via
//! dotenvy). A missing database URL or an unparseable value is fatal; the
//! binary exits with the configuration error code.

use std::net::SocketAddr;
use std::time::Duration;

use weft_core::config::{AnalyticsConfig, ConfigError, EngineConfig, FailoverConfig};

/// Full node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// PostgreSQL connection string (required)
    pub database_url: String,

    /// HTTP bind address for the submission/health API
    pub bind_addr: SocketAddr,

    /// Connection attempts against each port before giving up
    pub connect_attempts: u32,

    pub engine: EngineConfig,
    pub failover: FailoverConfig,
    pub analytics: AnalyticsConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("WEFT_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("WEFT_DATABASE_URL".to_string()))?;

        let bind_raw =
            std::env::var("WEFT_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: "WEFT_HTTP_ADDR".to_string(),
            value: bind_raw,
        })?;

        let connect_attempts = match std::env::var("WEFT_CONNECT_ATTEMPTS") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "WEFT_CONNECT_ATTEMPTS".to_string(),
                value: raw,
            })?,
            Err(_) => 5,
        };

        Ok(Self {
            database_url,
            bind_addr,
            connect_attempts,
            engine: EngineConfig::from_env()?,
            failover: FailoverConfig::from_env()?,
            analytics: AnalyticsConfig::from_env()?,
        })
    }

    /// Backoff before connection attempt `attempt` (1-based), capped at 10 s
    pub fn connect_backoff(attempt: u32) -> Duration {
        let secs = 0.5 * 2f64.powi(attempt.saturating_sub(1).min(8) as i32);
        Duration::from_secs_f64(secs.min(10.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_database_url_is_fatal() {
        std::env::remove_var("WEFT_DATABASE_URL");
        assert!(matches!(
            NodeConfig::from_env(),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn test_connect_backoff_capped() {
        assert_eq!(NodeConfig::connect_backoff(1), Duration::from_millis(500));
        assert_eq!(NodeConfig::connect_backoff(2), Duration::from_secs(1));
        assert!(NodeConfig::connect_backoff(30) <= Duration::from_secs(10));
    }
}
