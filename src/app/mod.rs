//! Process bootstrap and lifecycle: tracing, container wiring, signal
//! handling, and ordered graceful shutdown for each of the fleet's processes.

pub mod cleanup;
pub mod context;

pub use context::AppContext;

use crate::analysis::{ANALYZE_QUEUE, AnalyzeArgs, AnalyzeService, AnalyzeWorker};
use crate::error::AppResult;
use crate::fairness::middleware::{FairnessMiddleware, RepoTierResolver};
use crate::scheduler::Scheduler;
use crate::scheduler::lock::DistLock;
use crate::scheduler::refresh::{AutoRefreshHandler, REFRESH_LOCK_NAME};
use crate::specview::{SPECVIEW_QUEUE, SpecViewService, SpecViewWorker};
use crate::vcs::VcsClient;
use crate::vcs::github::GithubClient;
use crate::vcs::mock::MockVcs;
use crate::worker::enqueue::{EnqueueClient, EnqueueOpts, EnqueueOutcome};
use crate::worker::processor::Processor;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use url::Url;

/// Structured JSON log sink. `RUST_LOG` overrides the default level.
pub fn init_tracing() -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false),
        )
        .try_init()?;
    Ok(())
}

/// Clone-and-parse worker process. Blocks until a termination signal, then
/// drains within the configured shutdown timeout.
pub async fn run_analyzer(context: AppContext) -> AppResult<()> {
    let config = context.config();
    let service = Arc::new(AnalyzeService::new(
        context.codebases(),
        context.analyses(),
        context.users(),
        context.vcs(),
        context.parser(),
        context.cipher(),
    ));

    let processor = Processor::builder(context.store().clone())
        .queue(ANALYZE_QUEUE, config.queue_analyzer_workers)
        .middleware(fairness_middleware(&context))
        .shutdown_timeout(config.shutdown_timeout)
        .register(AnalyzeWorker::new(service))?
        .build()?;

    run_processor(&context, processor).await
}

/// Spec-view worker process.
pub async fn run_spec_generator(context: AppContext) -> AppResult<()> {
    let config = context.config();
    let service = Arc::new(SpecViewService::new(
        context.codebases(),
        context.analyses(),
        context.docs(),
        context.ai(),
        config.batch_threshold,
    ));

    let processor = Processor::builder(context.store().clone())
        .queue(SPECVIEW_QUEUE, config.queue_specgen_workers)
        .middleware(fairness_middleware(&context))
        .shutdown_timeout(config.shutdown_timeout)
        .register(SpecViewWorker::new(service, config.batch_poll_interval))?
        .build()?;

    run_processor(&context, processor).await
}

/// Auto-refresh ticker process. A single replica wins the advisory lock each
/// tick; the rest idle.
pub async fn run_scheduler(context: AppContext) -> AppResult<()> {
    let config = context.config();
    let handler = AutoRefreshHandler::new(
        DistLock::new(context.pool().clone(), REFRESH_LOCK_NAME),
        context.codebases(),
        context.vcs(),
        context.enqueue().clone(),
        config.dedup_window,
    );
    let scheduler = Scheduler::new(config.scheduler_tick).register(Arc::new(handler));

    let cancel = CancellationToken::new();
    let run = tokio::spawn(scheduler.run(cancel.clone()));

    shutdown_signal().await;
    info!("received shutdown signal, stopping scheduler");
    cancel.cancel();
    run.await
        .map_err(|err| anyhow::anyhow!("scheduler task panicked: {err}"))?;

    context.close().await;
    Ok(())
}

async fn run_processor(context: &AppContext, processor: Processor) -> AppResult<()> {
    let handle = processor.start().await?;

    shutdown_signal().await;
    info!("received shutdown signal, shutting down gracefully");
    handle.stop().await?;

    // Release container resources last.
    context.close().await;
    Ok(())
}

/// One-shot enqueue: parse a repository URL, resolve HEAD, insert an analysis
/// job with per-args uniqueness, and report what happened.
pub async fn run_enqueue(
    config: &crate::config::AppConfig,
    url: &str,
    database_url: Option<String>,
) -> AppResult<()> {
    let (host, owner, repo) = parse_repo_url(url)?;

    let database_url = database_url.unwrap_or_else(|| config.database_url.clone());
    if database_url.is_empty() {
        return Err(config::ConfigError::Message(
            "DATABASE_URL or --database-url is required".to_owned(),
        )
        .into());
    }

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;

    let vcs: Arc<dyn VcsClient> = if config.mock_mode {
        Arc::new(MockVcs)
    } else {
        Arc::new(GithubClient::new()?)
    };
    let commit_sha = vcs.head_sha(&owner, &repo, None).await?;

    let args = AnalyzeArgs {
        owner,
        repo,
        commit_sha,
        user_id: None,
    };
    let opts = EnqueueOpts::builder().unique_by_args(true).build();
    let client = EnqueueClient::new(pool.clone());
    match client.enqueue::<AnalyzeWorker>(&args, &opts).await? {
        EnqueueOutcome::Enqueued(job_id) => {
            println!(
                "enqueued analysis {job_id} for {host}/{}/{} at {}",
                args.owner, args.repo, args.commit_sha
            );
        }
        EnqueueOutcome::Deduplicated => {
            println!(
                "analysis for {host}/{}/{} at {} is already queued",
                args.owner, args.repo, args.commit_sha
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn fairness_middleware(context: &AppContext) -> Arc<FairnessMiddleware> {
    let config = context.config();
    Arc::new(FairnessMiddleware::new(
        context.limiter().clone(),
        Arc::new(RepoTierResolver::new(context.users())),
        config.fairness_snooze_base,
        config.fairness_snooze_jitter,
    ))
}

/// `(host, owner, repo)` from a repository URL like
/// `https://github.com/octocat/Hello-World` (optionally `.git`).
pub fn parse_repo_url(raw: &str) -> AppResult<(String, String, String)> {
    let parsed = Url::parse(raw)
        .map_err(|err| config::ConfigError::Message(format!("`{raw}` is not a URL: {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| config::ConfigError::Message(format!("`{raw}` has no host")))?
        .to_owned();
    let mut segments = parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()))
        .ok_or_else(|| config::ConfigError::Message(format!("`{raw}` has no path")))?;
    let owner = segments.next();
    let repo = segments.next();
    let extra = segments.next();
    match (owner, repo, extra) {
        (Some(owner), Some(repo), None) => {
            let repo = repo.strip_suffix(".git").unwrap_or(repo);
            Ok((host, owner.to_owned(), repo.to_owned()))
        }
        _ => Err(config::ConfigError::Message(format!(
            "`{raw}` is not an owner/repo URL"
        ))
        .into()),
    }
}

/// Resolves on SIGINT or SIGTERM (the PaaS sends SIGTERM first, SIGKILL
/// after the grace window).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("unable to install the ctrl-c handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("unable to install the SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("shutting down due to ctrl-c");
        }
        _ = sigterm => {
            info!("shutting down due to SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://github.com/octocat/Hello-World", "github.com", "octocat", "Hello-World")]
    #[case("https://github.com/octocat/Hello-World.git", "github.com", "octocat", "Hello-World")]
    #[case("https://github.com/octocat/Hello-World/", "github.com", "octocat", "Hello-World")]
    #[case("https://gitlab.example.com/team/tool", "gitlab.example.com", "team", "tool")]
    fn parses_repo_urls(
        #[case] raw: &str,
        #[case] host: &str,
        #[case] owner: &str,
        #[case] repo: &str,
    ) {
        let (parsed_host, parsed_owner, parsed_repo) = parse_repo_url(raw).unwrap();
        assert_eq!(parsed_host, host);
        assert_eq!(parsed_owner, owner);
        assert_eq!(parsed_repo, repo);
    }

    #[rstest]
    #[case("not a url")]
    #[case("https://github.com/octocat")]
    #[case("https://github.com/octocat/repo/extra")]
    #[case("mailto:someone@example.com")]
    fn rejects_non_repo_urls(#[case] raw: &str) {
        assert!(parse_repo_url(raw).is_err());
    }
}
