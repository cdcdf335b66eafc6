use anyhow::{Context, Result, bail};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:./transfer_watch.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_rpc_url: String,
    pub database_url: String,
    pub risk_analyzer_url: Option<String>,
    pub subscribe_timeout: Duration,
    pub subscribe_max_retries: usize,
    pub detection_timeout: Duration,
    pub discovery_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let ws_rpc_url = std::env::var("WS_RPC_URL").context("WS_RPC_URL must be set in .env")?;

        let risk_analyzer_url = std::env::var("RISK_ANALYZER_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        Ok(Config {
            ws_rpc_url,
            database_url: database_url(),
            risk_analyzer_url,
            subscribe_timeout: secs_or("SUBSCRIBE_TIMEOUT_SECS", 30)?,
            subscribe_max_retries: parse_or("SUBSCRIBE_MAX_RETRIES", 3)?,
            detection_timeout: secs_or("DETECTION_TIMEOUT_SECS", 60)?,
            discovery_interval: secs_or("DISCOVERY_INTERVAL_SECS", 30)?,
        })
    }
}

/// `DATABASE_URL`, or the local default.
pub fn database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string())
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_value(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_value<T>(key: &str, raw: Option<&str>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key} value: {raw}")),
        None => Ok(default),
    }
}

fn secs_or(key: &str, default: u64) -> Result<Duration> {
    parse_secs(key, std::env::var(key).ok().as_deref(), default)
}

/// Timeouts and intervals must be positive.
fn parse_secs(key: &str, raw: Option<&str>, default: u64) -> Result<Duration> {
    let secs: u64 = parse_value(key, raw, default)?;
    if secs == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}
