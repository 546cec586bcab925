use anyhow::{Context, Result};
use quizgrade_common::config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Process-level settings, read from the environment at boot
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub redis_url: String,
    pub sandbox_config: PathBuf,
    pub poll_interval: Duration,
    pub grace_period: Duration,
    pub consumers: usize,
    pub assessment_url: Option<String>,
    pub sandbox_enabled: bool,
    pub log_format: LogFormat,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            sandbox_config: PathBuf::from(DEFAULT_CONFIG_PATH),
            poll_interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(30),
            consumers: 1,
            assessment_url: None,
            sandbox_enabled: true,
            log_format: LogFormat::Text,
        }
    }
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let consumers = parse_or(&lookup, "WORKER_CONSUMERS", defaults.consumers)?;
        if consumers == 0 {
            anyhow::bail!("WORKER_CONSUMERS must be at least 1");
        }

        let poll_secs: u64 = parse_or(&lookup, "EXPIRY_POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?;
        if poll_secs == 0 {
            anyhow::bail!("EXPIRY_POLL_INTERVAL_SECS must be at least 1");
        }

        let log_format = match lookup("LOG_FORMAT").map(|v| v.to_lowercase()) {
            Some(v) if v == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            sandbox_config: lookup("SANDBOX_CONFIG").map(PathBuf::from).unwrap_or(defaults.sandbox_config),
            poll_interval: Duration::from_secs(poll_secs),
            grace_period: Duration::from_secs(parse_or(
                &lookup,
                "EXPIRY_GRACE_SECS",
                defaults.grace_period.as_secs(),
            )?),
            consumers,
            assessment_url: lookup("ASSESSMENT_URL").filter(|url| !url.trim().is_empty()),
            sandbox_enabled: parse_or(&lookup, "SANDBOX_ENABLED", defaults.sandbox_enabled)?,
            log_format,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
