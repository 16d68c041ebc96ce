use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Event bus connection. When unset, events are logged instead of published.
    pub nats_url: Option<String>,
    pub pipeline: PipelineConfig,
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_from_email: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_from_number: Option<String>,
    pub twilio_whatsapp_from: Option<String>,
    pub expo_access_token: Option<String>,
}

/// Tunables for the send pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `true` runs the in-process work broker; `false` runs the polling
    /// worker against the job store directly. Exactly one mode is active.
    pub use_broker: bool,
    /// Retry attempts per job before it is marked dead.
    pub max_retries: i32,
    /// Base backoff between retries.
    pub retry_interval: Duration,
    /// Exponential backoff factor.
    pub backoff_multiplier: u32,
    /// Retry controller tick interval.
    pub retry_poll_interval: Duration,
    /// Jobs stuck in processing longer than this are failed by the reaper.
    pub stuck_threshold: Duration,
    /// Base64-encoded HMAC key for provider webhook signatures.
    pub email_webhook_verification_key: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            use_broker: true,
            max_retries: 3,
            retry_interval: Duration::from_millis(60_000),
            backoff_multiplier: 2,
            retry_poll_interval: Duration::from_millis(30_000),
            stuck_threshold: Duration::from_millis(600_000),
            email_webhook_verification_key: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            nats_url: env::var("NATS_URL").ok(),
            pipeline: PipelineConfig::from_env()?,
            sendgrid_api_key: env::var("SENDGRID_API_KEY").ok(),
            sendgrid_from_email: env::var("SENDGRID_FROM_EMAIL").ok(),
            twilio_account_sid: env::var("TWILIO_ACCOUNT_SID").ok(),
            twilio_auth_token: env::var("TWILIO_AUTH_TOKEN").ok(),
            twilio_from_number: env::var("TWILIO_FROM_NUMBER").ok(),
            twilio_whatsapp_from: env::var("TWILIO_WHATSAPP_FROM").ok(),
            expo_access_token: env::var("EXPO_ACCESS_TOKEN").ok(),
        })
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            use_broker: env::var("PIPELINE_USE_BROKER")
                .map(|v| v != "false")
                .unwrap_or(defaults.use_broker),
            max_retries: parse_var("PIPELINE_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_interval: parse_var("PIPELINE_RETRY_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            backoff_multiplier: parse_var("PIPELINE_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.backoff_multiplier),
            retry_poll_interval: parse_var("PIPELINE_RETRY_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_poll_interval),
            stuck_threshold: parse_var("PIPELINE_STUCK_THRESHOLD_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.stuck_threshold),
            email_webhook_verification_key: env::var("EMAIL_WEBHOOK_VERIFICATION_KEY").ok(),
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => {
            let parsed = raw
                .parse::<T>()
                .with_context(|| format!("{key} must be a valid number"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let config = PipelineConfig::default();
        assert!(config.use_broker);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert_eq!(config.backoff_multiplier, 2);
        assert_eq!(config.retry_poll_interval, Duration::from_secs(30));
    }
}
