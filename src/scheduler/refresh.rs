//! Decay-driven auto-refresh: while holding the advisory lock, re-enqueue
//! analysis for codebases whose HEAD moved since the last completed run.

use crate::analysis::{AnalyzeArgs, AnalyzeWorker};
use crate::error::AppResult;
use crate::repo::{CodebaseRefreshInfo, CodebaseRepo};
use crate::scheduler::TickHandler;
use crate::scheduler::decay;
use crate::scheduler::lock::DistLock;
use crate::vcs::VcsClient;
use crate::worker::enqueue::{EnqueueClient, EnqueueOpts, EnqueueOutcome};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const REFRESH_LOCK_NAME: &str = "specfleet:auto_refresh";

pub struct AutoRefreshHandler {
    lock: DistLock,
    codebases: Arc<dyn CodebaseRepo>,
    vcs: Arc<dyn VcsClient>,
    enqueue: EnqueueClient,
    /// Comfortably exceeds the scheduler tick so jitter cannot duplicate a
    /// refresh.
    dedup_window: Duration,
}

impl AutoRefreshHandler {
    pub fn new(
        lock: DistLock,
        codebases: Arc<dyn CodebaseRepo>,
        vcs: Arc<dyn VcsClient>,
        enqueue: EnqueueClient,
        dedup_window: Duration,
    ) -> Self {
        Self {
            lock,
            codebases,
            vcs,
            enqueue,
            dedup_window,
        }
    }

    #[instrument(skip_all)]
    async fn refresh_due(&self) -> AppResult<()> {
        let now = Utc::now();
        let candidates = self.codebases.refresh_candidates(now).await?;
        let due: Vec<_> = candidates
            .iter()
            .filter(|candidate| decay::should_refresh(candidate, now))
            .collect();
        info!(
            candidates = candidates.len(),
            due = due.len(),
            "auto-refresh tick"
        );

        for codebase in due {
            // One bad codebase must not abort the tick.
            if let Err(err) = self.refresh_one(codebase).await {
                warn!(
                    codebase.owner = codebase.owner,
                    codebase.name = codebase.name,
                    "skipping codebase refresh: {err}"
                );
            }
        }
        Ok(())
    }

    async fn refresh_one(&self, codebase: &CodebaseRefreshInfo) -> AppResult<()> {
        let head = self
            .vcs
            .head_sha(&codebase.owner, &codebase.name, None)
            .await?;
        if codebase.last_commit_sha.as_deref() == Some(head.as_str()) {
            debug!(
                codebase.owner = codebase.owner,
                codebase.name = codebase.name,
                "HEAD unchanged, nothing to refresh"
            );
            return Ok(());
        }

        let args = AnalyzeArgs {
            owner: codebase.owner.clone(),
            repo: codebase.name.clone(),
            commit_sha: head,
            user_id: None,
        };
        let opts = EnqueueOpts::builder()
            .unique_by_args(true)
            .unique_window(self.dedup_window)
            .build();
        match self.enqueue.enqueue::<AnalyzeWorker>(&args, &opts).await? {
            EnqueueOutcome::Enqueued(job_id) => {
                info!(
                    job.id = %job_id,
                    codebase.owner = codebase.owner,
                    codebase.name = codebase.name,
                    commit.sha = args.commit_sha,
                    "enqueued refresh analysis"
                );
            }
            EnqueueOutcome::Deduplicated => {
                debug!(
                    codebase.owner = codebase.owner,
                    codebase.name = codebase.name,
                    "refresh already enqueued"
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TickHandler for AutoRefreshHandler {
    fn name(&self) -> &str {
        "auto_refresh"
    }

    async fn run(&self) -> AppResult<()> {
        // Exactly one replica runs the tick body; the rest bow out.
        let Some(guard) = self.lock.try_acquire().await? else {
            debug!("another replica is handling this tick");
            return Ok(());
        };

        let outcome = self.refresh_due().await;
        guard.release().await?;
        outcome
    }
}
