//! Application configuration loaded from environment variables.

use crate::errors::{EarnError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (e.g. `sqlite:./earn.db?mode=rwc`)
    pub database_url: String,
    /// Upper bound on pooled database connections
    pub db_max_connections: u32,
    /// Port for the REST API server
    pub api_port: u16,
    /// Shared HS256 secret used to verify identity-provider tokens
    pub jwt_secret: String,
    /// Endpoint accepting notification jobs
    pub broker_url: String,
    /// Per-request timeout for broker calls
    pub broker_timeout_secs: u64,
    /// Base submission credits every user gets each month on top of the ledger
    pub monthly_credit_allowance: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./earn.db?mode=rwc".to_string()),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 5)?,
            api_port: parse_or("API_PORT", 3001)?,
            jwt_secret: env_var("JWT_SECRET").map_err(|_| {
                EarnError::Config("JWT_SECRET environment variable is required".to_string())
            })?,
            broker_url: env_var("BROKER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3002/jobs".to_string()),
            broker_timeout_secs: parse_or("BROKER_TIMEOUT_SECS", 10)?,
            monthly_credit_allowance: parse_or("MONTHLY_CREDIT_ALLOWANCE", 3)?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EarnError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EarnError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
