//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::transport::sms::SmsConfig;
use crate::transport::smtp::SmtpConfig;

/// Top-level service configuration.
#[derive(Clone)]
pub struct SentinelConfig {
    /// HTTP bind address.
    pub bind_addr: String,
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Public base URL used in check-in and trustee access links.
    pub base_url: String,
    /// Scheduler sweep period.
    pub poll_interval: Duration,
    /// Per-queue worker concurrency (release is always 1).
    pub worker_concurrency: usize,
    /// Consumer idle poll interval.
    pub queue_poll_interval: Duration,
    /// Per-subscan batch bound for the sweep.
    pub sweep_batch: usize,
    /// Admin endpoints are disabled when unset.
    pub admin_token: Option<SecretString>,
    /// SMTP transport; log-only fallback when unset.
    pub smtp: Option<SmtpConfig>,
    /// SMS gateway transport; log-only fallback when unset.
    pub sms: Option<SmsConfig>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            db_path: PathBuf::from("data/sentinel.db"),
            base_url: "http://127.0.0.1:8080".to_string(),
            poll_interval: Duration::from_millis(60_000),
            worker_concurrency: 5,
            queue_poll_interval: Duration::from_millis(1_000),
            sweep_batch: 100,
            admin_token: None,
            smtp: None,
            sms: None,
        }
    }
}

impl SentinelConfig {
    /// Build the config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            db_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            base_url: std::env::var("BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            poll_interval: std::env::var("CHECK_IN_POLL_INTERVAL")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            worker_concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_concurrency),
            queue_poll_interval: std::env::var("QUEUE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue_poll_interval),
            sweep_batch: std::env::var("SWEEP_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.sweep_batch),
            admin_token: std::env::var("ADMIN_API_TOKEN").ok().map(SecretString::from),
            smtp: SmtpConfig::from_env(),
            sms: SmsConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SentinelConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(60_000));
        assert_eq!(config.worker_concurrency, 5);
        assert!(config.admin_token.is_none());
    }
}
