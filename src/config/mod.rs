use crate::error::AppResult;
use crate::fairness::TierLimits;
use config::Config;
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, formats::Flexible, serde_as};
use std::time::Duration;
use validator::Validate;

/// Process configuration, loaded from the environment (plus a `.env` file in
/// development). Variable names map 1:1 to field names, e.g. `DATABASE_URL`,
/// `FAIRNESS_FREE_LIMIT`, `SHUTDOWN_TIMEOUT` (seconds).
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AppConfig {
    /// Required by every long-running process; the one-shot `enqueue` command
    /// may substitute `--database-url`, so the requirement is enforced where
    /// the pool is opened.
    pub database_url: String,

    /// Base64-encoded 32-byte AES key for host-token decryption.
    pub encryption_key: Option<String>,

    pub gemini_api_key: Option<String>,
    pub gemini_phase1_model: String,
    pub gemini_phase2_model: String,

    /// Substitute deterministic mock VCS and AI providers. Everything else
    /// (queue, fairness, shutdown) behaves identically.
    pub mock_mode: bool,

    #[validate(range(min = 1))]
    pub queue_analyzer_workers: u32,
    #[validate(range(min = 1))]
    pub queue_specgen_workers: u32,

    #[validate(range(min = 1))]
    pub fairness_free_limit: u32,
    #[validate(range(min = 1))]
    pub fairness_pro_limit: u32,
    #[validate(range(min = 1))]
    pub fairness_pro_plus_limit: u32,
    #[validate(range(min = 1))]
    pub fairness_enterprise_limit: u32,
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub fairness_snooze_base: Duration,
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub fairness_snooze_jitter: Duration,

    /// Must stay strictly below the platform's SIGKILL grace window.
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub shutdown_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub scheduler_tick: Duration,

    /// Uniqueness window applied to scheduler-originated enqueues. Kept
    /// comfortably above the scheduler tick so jitter cannot re-enqueue the
    /// same refresh.
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub dedup_window: Duration,

    /// Inventories with more tests than this go through the AI batch API.
    pub batch_threshold: usize,
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub batch_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            encryption_key: None,
            gemini_api_key: None,
            gemini_phase1_model: "gemini-2.5-flash".to_owned(),
            gemini_phase2_model: "gemini-2.5-flash".to_owned(),
            mock_mode: false,
            queue_analyzer_workers: 5,
            queue_specgen_workers: 2,
            fairness_free_limit: 1,
            fairness_pro_limit: 3,
            fairness_pro_plus_limit: 4,
            fairness_enterprise_limit: 5,
            fairness_snooze_base: Duration::from_secs(30),
            fairness_snooze_jitter: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            scheduler_tick: Duration::from_secs(60 * 60),
            dedup_window: Duration::from_secs(2 * 60 * 60),
            batch_threshold: 100,
            batch_poll_interval: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn load() -> AppResult<Self> {
        dotenv().ok();

        let config: AppConfig = Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// The AI key may only be omitted when the mock provider is in play.
    /// Enforced where the provider is constructed, so the one-shot `enqueue`
    /// command stays usable without AI credentials.
    pub fn check_provider_keys(&self) -> Result<(), config::ConfigError> {
        if !self.mock_mode && self.gemini_api_key.is_none() {
            return Err(config::ConfigError::Message(
                "GEMINI_API_KEY is required unless MOCK_MODE=true".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn tier_limits(&self) -> TierLimits {
        TierLimits {
            free: self.fairness_free_limit,
            pro: self.fairness_pro_limit,
            pro_plus: self.fairness_pro_plus_limit,
            enterprise: self.fairness_enterprise_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_table() {
        let config = AppConfig::default();
        assert_eq!(config.queue_analyzer_workers, 5);
        assert_eq!(config.fairness_free_limit, 1);
        assert_eq!(config.fairness_pro_limit, 3);
        assert_eq!(config.fairness_pro_plus_limit, 4);
        assert_eq!(config.fairness_enterprise_limit, 5);
        assert_eq!(config.fairness_snooze_base, Duration::from_secs(30));
        assert_eq!(config.fairness_snooze_jitter, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.dedup_window, Duration::from_secs(7200));
    }

    #[test]
    fn zero_worker_counts_fail_validation() {
        let config = AppConfig {
            queue_analyzer_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AppConfig {
            fairness_free_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn gemini_key_required_without_mock_mode() {
        let mut config = AppConfig {
            database_url: "postgres://localhost/specfleet".to_owned(),
            ..Default::default()
        };
        assert!(config.check_provider_keys().is_err());

        config.mock_mode = true;
        assert!(config.check_provider_keys().is_ok());

        config.mock_mode = false;
        config.gemini_api_key = Some("key".to_owned());
        assert!(config.check_provider_keys().is_ok());
    }
}
