//! Application configuration loaded from environment variables.

use std::str::FromStr;

use crate::errors::{LedgerError, Result};

/// One year.
const MAX_DAILY_REWARD_COOLDOWN_HOURS: i64 = 24 * 366;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Shared secret used to sign settlement webhooks
    pub webhook_secret: String,
    /// Coins credited per rupee (100 minor units) of a settled payment
    pub coins_per_rupee: i64,
    /// Coins credited to the owner of an applied referral code
    pub referrer_bonus: i64,
    /// Coins credited to the user applying a referral code
    pub referee_bonus: i64,
    pub daily_reward_min: i64,
    pub daily_reward_max: i64,
    pub daily_reward_cooldown_hours: i64,
    /// Period of the passive score recovery job
    pub recovery_interval_secs: u64,
    /// Only users with PCI activity inside this window are recovered
    pub recovery_lookback_days: i64,
    /// Maximum number of users recovered in parallel
    pub recovery_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./ledger.db".to_string()),
            api_port: parse_or("API_PORT", 3002)?,
            webhook_secret: env_var("WEBHOOK_SECRET").map_err(|_| {
                LedgerError::Config("WEBHOOK_SECRET environment variable is required".to_string())
            })?,
            coins_per_rupee: parse_or("COINS_PER_RUPEE", 1)?,
            referrer_bonus: parse_or("REFERRER_BONUS", 100)?,
            referee_bonus: parse_or("REFEREE_BONUS", 50)?,
            daily_reward_min: parse_or("DAILY_REWARD_MIN", 5)?,
            daily_reward_max: parse_or("DAILY_REWARD_MAX", 25)?,
            daily_reward_cooldown_hours: parse_or("DAILY_REWARD_COOLDOWN_HOURS", 24)?,
            recovery_interval_secs: parse_or("RECOVERY_INTERVAL_SECS", 86_400)?,
            recovery_lookback_days: parse_or("RECOVERY_LOOKBACK_DAYS", 90)?,
            recovery_concurrency: parse_or("RECOVERY_CONCURRENCY", 8)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.daily_reward_min <= 0 || self.daily_reward_min > self.daily_reward_max {
            return Err(LedgerError::Config(format!(
                "Invalid daily reward range [{}, {}]",
                self.daily_reward_min, self.daily_reward_max
            )));
        }
        if !(1..=MAX_DAILY_REWARD_COOLDOWN_HOURS).contains(&self.daily_reward_cooldown_hours) {
            return Err(LedgerError::Config(format!(
                "DAILY_REWARD_COOLDOWN_HOURS must be within 1..={MAX_DAILY_REWARD_COOLDOWN_HOURS}, got {}",
                self.daily_reward_cooldown_hours
            )));
        }
        if self.referrer_bonus <= 0 || self.referee_bonus <= 0 {
            return Err(LedgerError::Config(
                "Referral bonuses must be positive".to_string(),
            ));
        }
        if self.recovery_interval_secs == 0 || self.recovery_concurrency == 0 {
            return Err(LedgerError::Config(
                "RECOVERY_INTERVAL_SECS and RECOVERY_CONCURRENCY must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            webhook_secret: "test_secret".to_string(),
            coins_per_rupee: 1,
            referrer_bonus: 100,
            referee_bonus: 50,
            daily_reward_min: 5,
            daily_reward_max: 25,
            daily_reward_cooldown_hours: 24,
            recovery_interval_secs: 86_400,
            recovery_lookback_days: 90,
            recovery_concurrency: 4,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| LedgerError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| LedgerError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
