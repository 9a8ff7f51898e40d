use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::submissions::activities::DispatchConfig;
use crate::kernel::EventBusConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub webhook_secret: String,
    /// Signs `/files` URLs handed to the classifier.
    pub files_url_secret: String,
    pub classifier_base_url: String,
    pub public_base_url: String,
    pub text_timeout: Duration,
    pub file_timeout: Duration,
    pub media_timeout: Duration,
    pub dispatch_max_attempts: u32,
    pub dispatch_retry_backoff: Duration,
    pub media_concurrency: usize,
    pub text_concurrency: usize,
    pub heartbeat_interval: Duration,
    pub sink_buffer: usize,
    pub upload_dir: PathBuf,
    pub upload_max_bytes: usize,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        _ => Ok(default),
    }
}

fn seconds(name: &str, default: u64) -> Result<Duration> {
    parsed(name, default).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let port: u16 = parsed("PORT", 8080)?;
        let webhook_secret = env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET must be set")?;
        if webhook_secret.trim().is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must not be empty");
        }

        let files_url_secret = env::var("FILES_URL_SECRET")
            .ok()
            .filter(|secret| !secret.trim().is_empty())
            .unwrap_or_else(|| webhook_secret.clone());

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port,
            webhook_secret,
            files_url_secret,
            classifier_base_url: env::var("CLASSIFIER_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| format!("http://localhost:{}", port)),
            text_timeout: seconds("TEXT_TIMEOUT_SECS", 15)?,
            file_timeout: seconds("FILE_TIMEOUT_SECS", 60)?,
            media_timeout: seconds("MEDIA_TIMEOUT_SECS", 120)?,
            dispatch_max_attempts: parsed("DISPATCH_MAX_ATTEMPTS", 3)?,
            dispatch_retry_backoff: seconds("DISPATCH_RETRY_BACKOFF_SECS", 10)?,
            media_concurrency: parsed("MEDIA_CONCURRENCY", 2)?,
            text_concurrency: parsed("TEXT_CONCURRENCY", 16)?,
            heartbeat_interval: seconds("HEARTBEAT_INTERVAL_SECS", 25)?,
            sink_buffer: parsed("SINK_BUFFER", 64)?,
            upload_dir: env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| "./uploads".to_string())
                .into(),
            upload_max_bytes: parsed::<usize>("UPLOAD_MAX_MB", 200)? * 1024 * 1024,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            text_timeout: self.text_timeout,
            file_timeout: self.file_timeout,
            media_timeout: self.media_timeout,
            retry_backoff: self.dispatch_retry_backoff,
            text_concurrency: self.text_concurrency,
            media_concurrency: self.media_concurrency,
            public_base_url: self.public_base_url.clone(),
        }
    }

    pub fn event_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            heartbeat_interval: self.heartbeat_interval,
            sink_buffer: self.sink_buffer,
        }
    }
}
