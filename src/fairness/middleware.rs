//! Outermost job middleware: per-user concurrency fairness. Must wrap every
//! other layer so slot release outlives inner recovery and logging.

use crate::error::AppResult;
use crate::fairness::{FairnessLimiter, Tier};
use crate::repo::UserRepo;
use crate::worker::JobContext;
use crate::worker::WorkError;
use crate::worker::middleware::{JobMiddleware, Next};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Args larger than this are not decoded; the job is treated as
/// system-originated.
pub const MAX_DECODED_ARGS_BYTES: i64 = 64 * 1024;

/// Authoritative tier lookup. The tier carried in job args is a hint only; a
/// client must not be able to self-promote.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TierResolver: Send + Sync {
    async fn resolve(&self, user_id: Uuid) -> AppResult<Option<Tier>>;
}

/// Resolves tiers through the user store.
pub struct RepoTierResolver {
    users: Arc<dyn UserRepo>,
}

impl RepoTierResolver {
    pub fn new(users: Arc<dyn UserRepo>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl TierResolver for RepoTierResolver {
    async fn resolve(&self, user_id: Uuid) -> AppResult<Option<Tier>> {
        self.users.tier(user_id).await
    }
}

/// The user-identifying fields every job-args payload may carry.
#[derive(Debug, Default, Deserialize)]
struct UserHint {
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    tier: Option<Tier>,
}

pub struct FairnessMiddleware {
    limiter: FairnessLimiter,
    resolver: Arc<dyn TierResolver>,
    snooze_base: Duration,
    snooze_jitter: Duration,
}

impl FairnessMiddleware {
    pub fn new(
        limiter: FairnessLimiter,
        resolver: Arc<dyn TierResolver>,
        snooze_base: Duration,
        snooze_jitter: Duration,
    ) -> Self {
        Self {
            limiter,
            resolver,
            snooze_base,
            snooze_jitter,
        }
    }

    fn decode_hint(job: &JobContext, args: &serde_json::Value) -> UserHint {
        if job.args_bytes > MAX_DECODED_ARGS_BYTES {
            return UserHint::default();
        }
        serde_json::from_value(args.clone()).unwrap_or_default()
    }

    async fn resolve_tier(&self, user_id: Uuid, hint: Option<Tier>) -> Tier {
        let resolved = match self.resolver.resolve(user_id).await {
            Ok(tier) => tier,
            Err(err) => {
                warn!(user.id = %user_id, "tier resolution failed, defaulting to free: {err}");
                None
            }
        };
        let tier = resolved.unwrap_or_default();
        if let Some(hinted) = hint {
            if hinted != tier {
                debug!(
                    user.id = %user_id,
                    user.tier = %tier,
                    user.tier_hint = %hinted,
                    "ignoring args tier hint"
                );
            }
        }
        tier
    }

    fn snooze_duration(&self) -> Duration {
        let jitter_ms = self.snooze_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.snooze_base;
        }
        let offset = rand::rng().random_range(0..=jitter_ms * 2);
        (self.snooze_base + Duration::from_millis(offset))
            .saturating_sub(Duration::from_millis(jitter_ms))
            .max(Duration::from_secs(1))
    }
}

#[async_trait]
impl JobMiddleware for FairnessMiddleware {
    async fn handle(
        &self,
        job: &JobContext,
        args: &serde_json::Value,
        next: Next<'_>,
    ) -> Result<(), WorkError> {
        let hint = Self::decode_hint(job, args);
        // No user: system-originated work skips fairness entirely.
        let Some(user_id) = hint.user_id else {
            return next.run(job, args).await;
        };

        let tier = self.resolve_tier(user_id, hint.tier).await;
        let key = user_id.to_string();
        match self.limiter.try_acquire(&key, tier, job.job_id) {
            // The guard is held across the whole inner chain and released on
            // drop, panic unwind included.
            Some(_guard) => next.run(job, args).await,
            None => {
                debug!(
                    job.id = %job.job_id,
                    user.id = %user_id,
                    user.tier = %tier,
                    "user at concurrency ceiling, snoozing job"
                );
                Err(WorkError::snooze(self.snooze_duration()))
            }
        }
    }
}
