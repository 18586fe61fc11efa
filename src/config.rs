//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::services::batch_queue::QueueConfig;
use crate::services::replay::ReplayRate;
use crate::types::{JobOptions, JobPriority};

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// Optional NATS credentials
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Import pipeline tuning
    pub import: ImportConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url = std::env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set")?;

        let nats_user = std::env::var("NATS_USER").ok().filter(|s| !s.is_empty());
        let nats_password = std::env::var("NATS_PASSWORD").ok().filter(|s| !s.is_empty());

        let import = ImportConfig::from_env()?;

        Ok(Self {
            nats_url,
            nats_user,
            nats_password,
            database_url,
            import,
        })
    }
}

/// Import pipeline settings (`IMPORT_*` variables)
#[derive(Debug, Clone, PartialEq)]
pub struct ImportConfig {
    /// Messages per queued batch
    pub batch_size: usize,
    /// Batches replayed at the same time, across all imports
    pub queue_concurrency: usize,
    /// Attempts per job, including the first
    pub job_attempts: u32,
    pub backoff_base: Duration,
    /// Minimum spacing between replayed messages
    pub replay_interval: Duration,
    /// Fine-grained progress is published every N messages
    pub progress_every: u32,
    /// Pending imported tickets younger than this are auto-closed
    pub auto_close_window: chrono::Duration,
    pub job_retention: chrono::Duration,
    pub job_retention_count: usize,
    /// How long shutdown waits for queued imports to drain
    pub shutdown_grace: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            queue_concurrency: 5,
            job_attempts: 3,
            backoff_base: Duration::from_millis(5000),
            replay_interval: Duration::from_millis(100),
            progress_every: 10,
            auto_close_window: chrono::Duration::hours(5),
            job_retention: chrono::Duration::hours(24),
            job_retention_count: 1000,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let batch_size: usize = parse_or(&lookup, "IMPORT_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            anyhow::bail!("IMPORT_BATCH_SIZE must be at least 1");
        }

        let queue_concurrency: usize =
            parse_or(&lookup, "IMPORT_QUEUE_CONCURRENCY", defaults.queue_concurrency)?;
        if queue_concurrency == 0 {
            anyhow::bail!("IMPORT_QUEUE_CONCURRENCY must be at least 1");
        }

        let job_attempts: u32 = parse_or(&lookup, "IMPORT_JOB_ATTEMPTS", defaults.job_attempts)?;
        let backoff_ms: u64 = parse_or(&lookup, "IMPORT_BACKOFF_BASE_MS", 5000)?;
        let replay_ms: u64 = parse_or(&lookup, "IMPORT_REPLAY_INTERVAL_MS", 100)?;
        let progress_every: u32 =
            parse_or(&lookup, "IMPORT_PROGRESS_EVERY", defaults.progress_every)?;
        let window_hours: i64 = parse_or(&lookup, "IMPORT_AUTO_CLOSE_WINDOW_HOURS", 5)?;
        let retention_hours: i64 = parse_or(&lookup, "IMPORT_JOB_RETENTION_HOURS", 24)?;
        let job_retention_count: usize =
            parse_or(&lookup, "IMPORT_JOB_RETENTION_COUNT", defaults.job_retention_count)?;
        let grace_secs: u64 = parse_or(&lookup, "IMPORT_SHUTDOWN_GRACE_SECS", 10)?;

        Ok(Self {
            batch_size,
            queue_concurrency,
            job_attempts: job_attempts.max(1),
            backoff_base: Duration::from_millis(backoff_ms),
            replay_interval: Duration::from_millis(replay_ms),
            progress_every: progress_every.max(1),
            auto_close_window: chrono::Duration::hours(window_hours),
            job_retention: chrono::Duration::hours(retention_hours),
            job_retention_count,
            shutdown_grace: Duration::from_secs(grace_secs),
        })
    }

    /// Options for replay batches; they rank below live traffic
    pub fn batch_job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.job_attempts,
            backoff_base: self.backoff_base,
            ..JobOptions::import_batch()
        }
    }

    pub fn finalize_job_options(&self) -> JobOptions {
        JobOptions {
            priority: JobPriority::Normal,
            ..self.batch_job_options()
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.queue_concurrency,
            record_max_age: self.job_retention,
            max_records: self.job_retention_count,
        }
    }

    pub fn replay_rate(&self) -> ReplayRate {
        ReplayRate::every(self.replay_interval)
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        _ => Ok(default),
    }
}
