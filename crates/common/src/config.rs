use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::types::Channel;

/// Token-bucket settings for one channel's provider.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained sends per second
    pub per_second: f64,
    /// Bucket capacity (maximum burst)
    pub burst: u32,
}

/// Upper bound for any seconds-valued setting (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Tunables for dispatch, scheduling and retry.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Window in which a repeated idempotency key is a duplicate (default: 300)
    pub dedup_window_secs: u64,

    /// Scheduler tick interval (default: 30)
    pub scheduler_poll_interval_secs: u64,

    /// Delay before re-queueing an entry whose re-dispatch failed (default: 60)
    pub scheduler_requeue_delay_secs: u64,

    /// Attempts per (request, channel) before giving up (default: 3)
    pub retry_max_attempts: i32,

    /// First retry delay; doubles per attempt (default: 60)
    pub retry_base_delay_secs: u64,

    /// Upper bound on a single retry delay (default: 1800)
    pub retry_max_delay_secs: u64,

    /// How often the retry supervisor polls the ledger (default: 15)
    pub retry_poll_interval_secs: u64,

    /// Concurrent retries per supervisor pass (default: 4)
    pub retry_workers: usize,

    /// Per-adapter call timeout, including rate-limit wait (default: 10)
    pub channel_timeout_secs: u64,

    /// Fan-out deadline for one dispatch call (default: 15)
    pub request_timeout_secs: u64,

    /// Channels that may be used during quiet hours (default: realtime)
    pub quiet_hours_exempt_channels: BTreeSet<Channel>,

    /// Per-channel provider rate limits
    pub rate_limits: BTreeMap<Channel, RateLimitConfig>,
}

impl EngineConfig {
    pub fn dedup_window(&self) -> chrono::Duration {
        bounded_seconds(self.dedup_window_secs)
    }

    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_poll_interval_secs)
    }

    pub fn scheduler_requeue_delay(&self) -> chrono::Duration {
        bounded_seconds(self.scheduler_requeue_delay_secs)
    }

    pub fn retry_base_delay(&self) -> chrono::Duration {
        bounded_seconds(self.retry_base_delay_secs)
    }

    pub fn retry_max_delay(&self) -> chrono::Duration {
        bounded_seconds(self.retry_max_delay_secs)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.retry_poll_interval_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn default_rate_limits() -> BTreeMap<Channel, RateLimitConfig> {
        BTreeMap::from([
            (
                Channel::Mail,
                RateLimitConfig {
                    per_second: 10.0,
                    burst: 20,
                },
            ),
            (
                Channel::Sms,
                RateLimitConfig {
                    per_second: 5.0,
                    burst: 10,
                },
            ),
            (
                Channel::Push,
                RateLimitConfig {
                    per_second: 50.0,
                    burst: 100,
                },
            ),
            (
                Channel::Realtime,
                RateLimitConfig {
                    per_second: 200.0,
                    burst: 400,
                },
            ),
        ])
    }

    /// Reject seconds values above [`MAX_DURATION_SECS`].
    pub fn validate(&self) -> anyhow::Result<()> {
        let bounded = [
            ("DEDUP_WINDOW_SECS", self.dedup_window_secs),
            ("SCHEDULER_POLL_INTERVAL_SECS", self.scheduler_poll_interval_secs),
            ("SCHEDULER_REQUEUE_DELAY_SECS", self.scheduler_requeue_delay_secs),
            ("RETRY_BASE_DELAY_SECS", self.retry_base_delay_secs),
            ("RETRY_MAX_DELAY_SECS", self.retry_max_delay_secs),
            ("RETRY_POLL_INTERVAL_SECS", self.retry_poll_interval_secs),
            ("CHANNEL_TIMEOUT_SECS", self.channel_timeout_secs),
            ("REQUEST_TIMEOUT_SECS", self.request_timeout_secs),
        ];
        for (key, secs) in bounded {
            if secs > MAX_DURATION_SECS {
                anyhow::bail!("{} must be at most {} seconds, got {}", key, MAX_DURATION_SECS, secs);
            }
        }
        Ok(())
    }

    /// Load engine settings from environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let quiet_hours_exempt_channels = match std::env::var("QUIET_HOURS_EXEMPT_CHANNELS") {
            Ok(raw) => parse_channel_list(&raw)?,
            Err(_) => defaults.quiet_hours_exempt_channels.clone(),
        };

        let mut rate_limits = defaults.rate_limits.clone();
        for channel in Channel::ALL {
            let prefix = format!("RATE_LIMIT_{}", channel.as_str().to_ascii_uppercase());
            let fallback = rate_limits[&channel];
            rate_limits.insert(
                channel,
                RateLimitConfig {
                    per_second: env_or(&format!("{}_PER_SEC", prefix), fallback.per_second)?,
                    burst: env_or(&format!("{}_BURST", prefix), fallback.burst)?,
                },
            );
        }

        let config = Self {
            dedup_window_secs: env_or("DEDUP_WINDOW_SECS", defaults.dedup_window_secs)?,
            scheduler_poll_interval_secs: env_or(
                "SCHEDULER_POLL_INTERVAL_SECS",
                defaults.scheduler_poll_interval_secs,
            )?,
            scheduler_requeue_delay_secs: env_or(
                "SCHEDULER_REQUEUE_DELAY_SECS",
                defaults.scheduler_requeue_delay_secs,
            )?,
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_delay_secs: env_or("RETRY_BASE_DELAY_SECS", defaults.retry_base_delay_secs)?,
            retry_max_delay_secs: env_or("RETRY_MAX_DELAY_SECS", defaults.retry_max_delay_secs)?,
            retry_poll_interval_secs: env_or(
                "RETRY_POLL_INTERVAL_SECS",
                defaults.retry_poll_interval_secs,
            )?,
            retry_workers: env_or("RETRY_WORKERS", defaults.retry_workers)?,
            channel_timeout_secs: env_or("CHANNEL_TIMEOUT_SECS", defaults.channel_timeout_secs)?,
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            quiet_hours_exempt_channels,
            rate_limits,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300,
            scheduler_poll_interval_secs: 30,
            scheduler_requeue_delay_secs: 60,
            retry_max_attempts: 3,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 1800,
            retry_poll_interval_secs: 15,
            retry_workers: 4,
            channel_timeout_secs: 10,
            request_timeout_secs: 15,
            quiet_hours_exempt_channels: BTreeSet::from([Channel::Realtime]),
            rate_limits: Self::default_rate_limits(),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the HTTP API listens on (default: 3000)
    pub http_port: u16,

    /// Resend API key for mail delivery
    pub resend_api_key: Option<String>,

    /// Mail sender address
    pub email_from: Option<String>,

    /// Twilio account SID for SMS delivery
    pub twilio_account_sid: Option<String>,

    /// Twilio auth token
    pub twilio_auth_token: Option<String>,

    /// SMS sender number
    pub sms_from: Option<String>,

    /// Push gateway endpoint
    pub push_gateway_url: Option<String>,

    /// Push gateway API key
    pub push_api_key: Option<String>,

    /// Redis pub/sub channel prefix for realtime broadcasts (default: "notifications")
    pub realtime_channel_prefix: String,

    /// Dispatch, scheduling and retry tunables
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            http_port: env_or("HTTP_PORT", 3000)?,
            resend_api_key: std::env::var("RESEND_API_KEY").ok(),
            email_from: std::env::var("EMAIL_FROM").ok(),
            twilio_account_sid: std::env::var("TWILIO_ACCOUNT_SID").ok(),
            twilio_auth_token: std::env::var("TWILIO_AUTH_TOKEN").ok(),
            sms_from: std::env::var("SMS_FROM").ok(),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok(),
            push_api_key: std::env::var("PUSH_API_KEY").ok(),
            realtime_channel_prefix: std::env::var("REALTIME_CHANNEL_PREFIX")
                .unwrap_or_else(|_| "notifications".to_string()),
            engine: EngineConfig::from_env()?,
        })
    }
}

fn bounded_seconds(secs: u64) -> chrono::Duration {
    // MAX_DURATION_SECS fits in i64 and well inside chrono's range
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Read and parse an environment variable, using `default` when it is unset.
fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated channel list such as `"push,realtime"`.
pub fn parse_channel_list(raw: &str) -> anyhow::Result<BTreeSet<Channel>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Channel>().map_err(|e| anyhow::anyhow!(e)))
        .collect()
}
