//! Application configuration

use std::env;

/// Log output selected by `LOG_FORMAT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables.
///
/// Billing settings (provider credentials, webhook secrets, invoice TTL) are read
/// separately by `BillingConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub max_request_body_bytes: usize,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            max_request_body_bytes: env::var("MAX_REQUEST_BODY_BYTES")
                .unwrap_or_else(|_| "1048576".to_string()) // 1MB default
                .parse()
                .unwrap_or(1_048_576),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: match env::var("DATABASE_MAX_CONNECTIONS") {
                Ok(raw) => raw
                    .parse()
                    .ok()
                    .filter(|n: &u32| *n > 0)
                    .ok_or(ConfigError::Invalid("DATABASE_MAX_CONNECTIONS"))?,
                Err(_) => 10,
            },

            // Logging
            log_format: match env::var("LOG_FORMAT")
                .unwrap_or_default()
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),
}
