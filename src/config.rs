//! Configuration management for the bot engine

use crate::services::retry::RetryPolicy;
use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection string
    pub database_path: String,

    /// Taker fee charged by the paper executor, in basis points
    pub taker_fee_bps: u32,

    /// Optional WebSocket ticker endpoint
    pub price_feed_url: Option<String>,

    /// Supervisor and worker tuning
    pub supervisor: SupervisorConfig,
}

/// Settings for the supervisor and its per-bot workers
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Capacity of each bot's command/fill queue
    pub queue_capacity: usize,
    /// Capacity of the shared price broadcast
    pub price_channel_capacity: usize,
    /// Ticks older than this (vs. wall clock) are ignored. None disables the check.
    pub max_tick_age: Option<Duration>,
    /// Warn once a worker has seen no tick for this long
    pub stale_feed_after: Duration,
    /// Retry policy for order submission
    pub retry: RetryPolicy,
    /// Attempts to persist a snapshot under version conflicts
    pub snapshot_max_retries: u32,
    /// Attempts to generate a non-colliding activation key
    pub key_generation_attempts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            price_channel_capacity: 1024,
            max_tick_age: Some(Duration::from_secs(60)),
            stale_feed_after: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            snapshot_max_retries: 3,
            key_generation_attempts: 5,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let database_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "sqlite:bots.db".to_string());

        let taker_fee_bps = env_parse("TAKER_FEE_BPS").unwrap_or(10);

        let price_feed_url = env::var("PRICE_FEED_URL").ok().filter(|s| !s.is_empty());

        let defaults = SupervisorConfig::default();
        let max_tick_age = match env_parse::<u64>("MAX_TICK_AGE_SECONDS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.max_tick_age,
        };

        let retry = RetryPolicy {
            max_retries: env_parse("ORDER_MAX_RETRIES").unwrap_or(defaults.retry.max_retries),
            initial_delay: env_parse::<u64>("ORDER_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            ..defaults.retry.clone()
        };

        let supervisor = SupervisorConfig {
            queue_capacity: env_parse("BOT_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            price_channel_capacity: env_parse("PRICE_CHANNEL_CAPACITY")
                .unwrap_or(defaults.price_channel_capacity),
            max_tick_age,
            stale_feed_after: env_parse::<u64>("STALE_FEED_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_feed_after),
            retry,
            snapshot_max_retries: env_parse("SNAPSHOT_MAX_RETRIES").unwrap_or(defaults.snapshot_max_retries),
            key_generation_attempts: env_parse("KEY_GENERATION_ATTEMPTS")
                .unwrap_or(defaults.key_generation_attempts),
        };

        // Validate configuration
        if supervisor.queue_capacity == 0 || supervisor.price_channel_capacity == 0 {
            anyhow::bail!("BOT_QUEUE_CAPACITY and PRICE_CHANNEL_CAPACITY must be positive");
        }
        if supervisor.key_generation_attempts == 0 {
            anyhow::bail!("KEY_GENERATION_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_path,
            taker_fee_bps,
            price_feed_url,
            supervisor,
        })
    }

    /// Taker fee as a fraction of notional
    pub fn taker_fee_rate(&self) -> Decimal {
        Decimal::from(self.taker_fee_bps) / Decimal::from(10_000)
    }
}
