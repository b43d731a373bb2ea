use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection string (redis:// or rediss://)
    pub kv_url: String,
    /// Document store (Postgres) connection string
    pub docstore_uri: String,
    pub jwt_secret: String,
    pub port: u16,
    pub frontend_url: String,
    /// IANA timezone used when a request carries none
    pub default_timezone: String,
    /// Business-hours window applied to scheduled calls, local hour [0, 24)
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    /// Delayed-job runner retry policy
    pub queue_retry_attempts: i32,
    pub queue_retry_backoff_ms: i64,
    /// Stable marker distinguishing instances of a clustered deployment
    pub instance_id: String,
    /// Concurrent-call cap for campaign-less outbound calls
    pub adhoc_concurrent_limit: i64,
    /// Caller id (exophone) stamped on outbound call logs
    pub caller_phone: String,
    /// Base URL the carrier posts status webhooks back to
    pub webhook_base_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let jwt_secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < 32 {
            bail!("JWT_SECRET must be at least 32 characters");
        }

        let business_hours_start: u32 = env::var("DEFAULT_BUSINESS_HOURS_START")
            .unwrap_or_else(|_| "9".to_string())
            .parse()
            .context("DEFAULT_BUSINESS_HOURS_START must be an hour 0-23")?;
        let business_hours_end: u32 = env::var("DEFAULT_BUSINESS_HOURS_END")
            .unwrap_or_else(|_| "18".to_string())
            .parse()
            .context("DEFAULT_BUSINESS_HOURS_END must be an hour 1-24")?;
        if business_hours_start >= business_hours_end || business_hours_end > 24 {
            bail!(
                "business hours window {}..{} is not a valid range",
                business_hours_start,
                business_hours_end
            );
        }

        Ok(Self {
            kv_url: env::var("KV_URL").context("KV_URL must be set")?,
            docstore_uri: env::var("DOCSTORE_URI").context("DOCSTORE_URI must be set")?,
            jwt_secret,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            default_timezone: env::var("DEFAULT_TIMEZONE")
                .unwrap_or_else(|_| "Asia/Kolkata".to_string()),
            business_hours_start,
            business_hours_end,
            queue_retry_attempts: env::var("QUEUE_RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("QUEUE_RETRY_ATTEMPTS must be a number")?,
            queue_retry_backoff_ms: env::var("QUEUE_RETRY_BACKOFF_DELAY")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("QUEUE_RETRY_BACKOFF_DELAY must be milliseconds")?,
            instance_id: env::var("NODE_APP_INSTANCE").unwrap_or_else(|_| "0".to_string()),
            adhoc_concurrent_limit: env::var("ADHOC_CONCURRENT_LIMIT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("ADHOC_CONCURRENT_LIMIT must be a number")?,
            caller_phone: env::var("CALLER_PHONE")
                .unwrap_or_else(|_| "+15005550006".to_string()),
            webhook_base_url: env::var("WEBHOOK_BASE_URL").unwrap_or_else(|_| {
                let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
                format!("http://localhost:{}", port)
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_jwt_secret() {
        let vars = [
            ("KV_URL", "redis://localhost:6379"),
            ("DOCSTORE_URI", "postgres://localhost/dispatch"),
            ("JWT_SECRET", "too-short"),
        ];
        for (k, v) in vars {
            env::set_var(k, v);
        }
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("32 characters"));
        env::set_var("JWT_SECRET", "0123456789abcdef0123456789abcdef");
        assert!(Config::from_env().is_ok());
    }
}
