use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub broker_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_region: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub parser_url: String,
    pub rank_ingest_url: String,
    pub batch_rank_url: String,
    pub port: u16,
    pub rust_log: String,
    pub run_workers: bool,
    pub run_http: bool,
    pub pipeline: PipelineConfig,
}

/// Tunables for the ingestion and ranking pipeline.
///
/// Defaults are the constants the pipeline has always shipped with; none of
/// them are derived from measurements, so every one can be overridden by env.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub ingest_max_attempts: u32,
    pub ingest_backoff: Duration,
    pub parse_timeout: Duration,
    pub rank_timeout_base: Duration,
    pub rank_timeout_per_item: Duration,
    pub ranking_page_size: u32,
    pub ranking_page_pause: Duration,
    pub prefetch: usize,
    pub reconnect_delay: Duration,
    pub status_ttl_secs: u64,
    pub results_freshness: Duration,
    pub broker_poll_interval: Duration,
    pub unacked_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_timeout: Duration::from_millis(5000),
            ingest_max_attempts: 3,
            ingest_backoff: Duration::from_millis(1000),
            parse_timeout: Duration::from_secs(60),
            rank_timeout_base: Duration::from_millis(30_000),
            rank_timeout_per_item: Duration::from_millis(5000),
            ranking_page_size: 10,
            ranking_page_pause: Duration::from_millis(500),
            prefetch: 1,
            reconnect_delay: Duration::from_secs(5),
            status_ttl_secs: 24 * 60 * 60,
            results_freshness: Duration::from_secs(6 * 60 * 60),
            broker_poll_interval: Duration::from_millis(250),
            unacked_timeout: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    /// Timeout for one batch-ranking call: `base + per_item × batch_len`.
    pub fn rank_timeout_for(&self, batch_len: usize) -> Duration {
        self.rank_timeout_base + self.rank_timeout_per_item * batch_len as u32
    }

    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            batch_size: env_or("BATCH_SIZE", defaults.batch_size)?.max(1),
            batch_timeout: Duration::from_millis(env_or(
                "BATCH_TIMEOUT_MS",
                defaults.batch_timeout.as_millis() as u64,
            )?),
            ingest_max_attempts: env_or("INGEST_MAX_ATTEMPTS", defaults.ingest_max_attempts)?
                .max(1),
            ingest_backoff: Duration::from_millis(env_or(
                "INGEST_BACKOFF_MS",
                defaults.ingest_backoff.as_millis() as u64,
            )?),
            parse_timeout: Duration::from_secs(env_or(
                "PARSE_TIMEOUT_SECS",
                defaults.parse_timeout.as_secs(),
            )?),
            rank_timeout_base: Duration::from_millis(env_or(
                "RANK_TIMEOUT_BASE_MS",
                defaults.rank_timeout_base.as_millis() as u64,
            )?),
            rank_timeout_per_item: Duration::from_millis(env_or(
                "RANK_TIMEOUT_PER_ITEM_MS",
                defaults.rank_timeout_per_item.as_millis() as u64,
            )?),
            ranking_page_size: env_or("RANKING_PAGE_SIZE", defaults.ranking_page_size)?.max(1),
            ranking_page_pause: Duration::from_millis(env_or(
                "RANKING_PAGE_PAUSE_MS",
                defaults.ranking_page_pause.as_millis() as u64,
            )?),
            prefetch: env_or("PREFETCH", defaults.prefetch)?.max(1),
            reconnect_delay: Duration::from_secs(env_or(
                "RECONNECT_DELAY_SECS",
                defaults.reconnect_delay.as_secs(),
            )?),
            status_ttl_secs: env_or("STATUS_TTL_SECS", defaults.status_ttl_secs)?,
            results_freshness: Duration::from_secs(env_or(
                "RESULTS_FRESHNESS_SECS",
                defaults.results_freshness.as_secs(),
            )?),
            broker_poll_interval: Duration::from_millis(env_or(
                "BROKER_POLL_MS",
                defaults.broker_poll_interval.as_millis() as u64,
            )?),
            unacked_timeout: Duration::from_secs(
                env_or("UNACKED_TIMEOUT_SECS", defaults.unacked_timeout.as_secs())?.max(1),
            ),
        })
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let redis_url = require_env("REDIS_URL")?;

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            broker_url: std::env::var("BROKER_URL").unwrap_or_else(|_| redis_url.clone()),
            redis_url,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            parser_url: require_env("PARSER_URL")?,
            rank_ingest_url: require_env("RANK_INGEST_URL")?,
            batch_rank_url: require_env("BATCH_RANK_URL")?,
            port: env_or("PORT", 8080u16).context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            run_workers: env_or("RUN_WORKERS", true)?,
            run_http: env_or("RUN_HTTP", true)?,
            pipeline: PipelineConfig::from_env()?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Environment variable '{key}' is invalid: {e}")),
        Err(_) => Ok(default),
    }
}
