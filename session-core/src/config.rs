//! Configuration management

use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Configuration for prekey management
#[derive(Debug, Clone)]
pub struct PreKeyConfig {
    /// Replenish when the server-visible one-time prekey count drops below this
    pub low_water_mark: usize,
    /// Pool size to refill up to
    pub target_pool_size: usize,
    /// Maximum age of signed prekey in days before rotation
    pub signed_prekey_max_age_days: i64,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 20,
            target_pool_size: 100,
            signed_prekey_max_age_days: 7,
        }
    }
}

/// Backoff policy for background session persistence
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based), doubling up to `max_delay`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Bounds for the inbound de-duplication set
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub capacity: usize,
    pub window: Duration,
    /// Events kept per closed conversation until it is opened
    pub closed_queue_capacity: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            window: Duration::from_secs(24 * 60 * 60),
            closed_queue_capacity: 1_000,
        }
    }
}

/// Session layer configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API base URL
    pub api_url: String,
    /// WebSocket URL of the real-time event feed
    pub ws_url: String,
    /// SQLite database file
    pub database_path: String,
    pub request_timeout: Duration,
    pub prekeys: PreKeyConfig,
    pub persist_retry: RetryPolicy,
    pub dedup: DedupConfig,
    /// How long a typing indicator stays visible without a refresh
    pub typing_expiry: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: "https://nochat-server.fly.dev".to_string(),
            ws_url: "wss://nochat-server.fly.dev".to_string(),
            database_path: "nochat.db".to_string(),
            request_timeout: Duration::from_secs(30),
            prekeys: PreKeyConfig::default(),
            persist_retry: RetryPolicy::default(),
            dedup: DedupConfig::default(),
            typing_expiry: Duration::from_secs(3),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> AppResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| AppError::Config(format!("Invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> AppResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("NOCHAT_API_URL") {
            config.api_url = url;
        }
        if let Ok(url) = std::env::var("NOCHAT_WS_URL") {
            config.ws_url = url;
        }
        if let Ok(path) = std::env::var("NOCHAT_DATABASE_PATH") {
            config.database_path = path;
        }
        if let Some(v) = parse_env("NOCHAT_PREKEY_LOW_WATER")? {
            config.prekeys.low_water_mark = v;
        }
        if let Some(v) = parse_env("NOCHAT_PREKEY_TARGET")? {
            config.prekeys.target_pool_size = v;
        }
        if let Some(v) = parse_env("NOCHAT_DEDUP_CAPACITY")? {
            config.dedup.capacity = v;
        }
        if let Some(secs) = parse_env::<u64>("NOCHAT_DEDUP_WINDOW_SECS")? {
            config.dedup.window = Duration::from_secs(secs);
        }
        if let Some(v) = parse_env("NOCHAT_CLOSED_QUEUE_CAPACITY")? {
            config.dedup.closed_queue_capacity = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.prekeys.target_pool_size < self.prekeys.low_water_mark {
            return Err(AppError::Config(format!(
                "Prekey target pool size ({}) is below the low-water mark ({})",
                self.prekeys.target_pool_size, self.prekeys.low_water_mark
            )));
        }
        if self.dedup.capacity == 0 {
            return Err(AppError::Config("Dedup capacity must be non-zero".to_string()));
        }
        if self.dedup.closed_queue_capacity == 0 {
            return Err(AppError::Config("Closed conversation queue capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.prekeys.low_water_mark, 20);
        assert_eq!(config.prekeys.target_pool_size, 100);
        assert_eq!(config.typing_expiry, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_prekey_bounds() {
        let mut config = Config::default();
        config.prekeys.target_pool_size = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_closed_queue_must_hold_something() {
        let mut config = Config::default();
        config.dedup.closed_queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
