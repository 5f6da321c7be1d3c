//! Shared component container. The only place concrete adapters are named;
//! everything downstream consumes the capability traits.

use crate::ai::AiProvider;
use crate::ai::gemini::GeminiProvider;
use crate::ai::mock::MockAiProvider;
use crate::config::AppConfig;
use crate::crypto::TokenCipher;
use crate::error::AppResult;
use crate::fairness::FairnessLimiter;
use crate::parser::{FsTestScanner, TestParser};
use crate::repo::pg::{PgAnalysisRepo, PgCodebaseRepo, PgSpecDocRepo, PgUserRepo};
use crate::repo::{AnalysisRepo, CodebaseRepo, SpecDocRepo, UserRepo};
use crate::vcs::VcsClient;
use crate::vcs::github::GithubClient;
use crate::vcs::mock::MockVcs;
use crate::worker::enqueue::EnqueueClient;
use crate::worker::store::JobStore;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppContext {
    inner: Arc<AppContextInner>,
}

struct AppContextInner {
    config: AppConfig,
    pool: PgPool,
    store: JobStore,
    enqueue: EnqueueClient,
    limiter: FairnessLimiter,
    codebases: Arc<dyn CodebaseRepo>,
    analyses: Arc<dyn AnalysisRepo>,
    docs: Arc<dyn SpecDocRepo>,
    users: Arc<dyn UserRepo>,
    vcs: Arc<dyn VcsClient>,
    ai: Arc<dyn AiProvider>,
    parser: Arc<dyn TestParser>,
    cipher: Option<TokenCipher>,
}

impl AppContext {
    pub async fn build(config: AppConfig) -> AppResult<Self> {
        config.check_provider_keys()?;
        if config.database_url.is_empty() {
            return Err(
                config::ConfigError::Message("DATABASE_URL is required".to_owned()).into(),
            );
        }

        let pool = PgPoolOptions::new()
            .max_connections(pool_size(&config))
            .connect(&config.database_url)
            .await?;
        sqlx::migrate!().run(&pool).await?;

        let cipher = config
            .encryption_key
            .as_deref()
            .map(TokenCipher::from_base64_key)
            .transpose()?;

        let vcs: Arc<dyn VcsClient> = if config.mock_mode {
            info!("mock mode: using the deterministic VCS provider");
            Arc::new(MockVcs)
        } else {
            Arc::new(GithubClient::new()?)
        };
        let ai: Arc<dyn AiProvider> = if config.mock_mode {
            info!("mock mode: using the deterministic AI provider");
            Arc::new(MockAiProvider::default())
        } else {
            let api_key = config.gemini_api_key.clone().ok_or_else(|| {
                config::ConfigError::Message("GEMINI_API_KEY is required".to_owned())
            })?;
            Arc::new(GeminiProvider::new(
                api_key,
                config.gemini_phase1_model.clone(),
                config.gemini_phase2_model.clone(),
            )?)
        };

        let limiter = FairnessLimiter::new(config.tier_limits());

        Ok(Self {
            inner: Arc::new(AppContextInner {
                store: JobStore::new(pool.clone()),
                enqueue: EnqueueClient::new(pool.clone()),
                limiter,
                codebases: Arc::new(PgCodebaseRepo::new(pool.clone())),
                analyses: Arc::new(PgAnalysisRepo::new(pool.clone())),
                docs: Arc::new(PgSpecDocRepo::new(pool.clone())),
                users: Arc::new(PgUserRepo::new(pool.clone())),
                vcs,
                ai,
                parser: Arc::new(FsTestScanner),
                cipher,
                config,
                pool,
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.inner.pool
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    pub fn enqueue(&self) -> &EnqueueClient {
        &self.inner.enqueue
    }

    pub fn limiter(&self) -> &FairnessLimiter {
        &self.inner.limiter
    }

    pub fn codebases(&self) -> Arc<dyn CodebaseRepo> {
        self.inner.codebases.clone()
    }

    pub fn analyses(&self) -> Arc<dyn AnalysisRepo> {
        self.inner.analyses.clone()
    }

    pub fn docs(&self) -> Arc<dyn SpecDocRepo> {
        self.inner.docs.clone()
    }

    pub fn users(&self) -> Arc<dyn UserRepo> {
        self.inner.users.clone()
    }

    pub fn vcs(&self) -> Arc<dyn VcsClient> {
        self.inner.vcs.clone()
    }

    pub fn ai(&self) -> Arc<dyn AiProvider> {
        self.inner.ai.clone()
    }

    pub fn parser(&self) -> Arc<dyn TestParser> {
        self.inner.parser.clone()
    }

    pub fn cipher(&self) -> Option<TokenCipher> {
        self.inner.cipher.clone()
    }

    /// Last step of shutdown, after all consumers have stopped.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

/// Bounded by the queue runtime's worker-count sum plus the scheduler's lock
/// connection, with a little slack for enqueues and cleanup writes.
fn pool_size(config: &AppConfig) -> u32 {
    config.queue_analyzer_workers + config.queue_specgen_workers + 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_sized_to_the_worker_budget() {
        let config = AppConfig::default();
        assert_eq!(pool_size(&config), 5 + 2 + 5);
    }
}
