//! Queue server: one poll loop per `(queue, worker slot)` pair, all feeding
//! from the shared store with `SKIP LOCKED` claims. `start` returns once
//! polling is live; `stop` refuses new pickups first, drains in-flight work
//! up to the shutdown timeout, then hard-cancels stragglers and records them
//! through the cleanup path.

use crate::app::cleanup;
use crate::error::AppResult;
use crate::worker::job::ClaimedJob;
use crate::worker::middleware::{JobMiddleware, run_chain};
use crate::worker::registry::WorkerRegistry;
use crate::worker::store::JobStore;
use crate::worker::{JobContext, WorkError, retry_delay};
use chrono::{TimeDelta, Utc};
use itertools::Itertools;
use rand::Rng;
use std::cmp::max;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Claim leases get this much slack beyond the worker timeout before the
/// stale sweep may re-queue the job.
const LEASE_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessorError {
    #[error("no queues configured")]
    NoQueues,

    #[error("queue `{0}` was configured twice")]
    DuplicateQueue(String),
}

#[derive(Debug, Clone)]
pub struct QueueAllocation {
    pub name: String,
    pub max_workers: u32,
}

pub struct ProcessorBuilder {
    store: JobStore,
    registry: WorkerRegistry,
    middleware: Vec<Arc<dyn JobMiddleware>>,
    allocations: Vec<QueueAllocation>,
    shutdown_timeout: Duration,
    empty_delay: Duration,
    error_delay: Duration,
    default_lease: Duration,
}

impl ProcessorBuilder {
    fn new(store: JobStore) -> Self {
        Self {
            store,
            registry: WorkerRegistry::new(),
            middleware: Vec::new(),
            allocations: Vec::new(),
            shutdown_timeout: Duration::from_secs(30),
            empty_delay: Duration::from_millis(500),
            error_delay: Duration::from_secs(5),
            default_lease: Duration::from_secs(10 * 60),
        }
    }

    /// Binds a named queue with its own worker-count ceiling.
    pub fn queue(mut self, name: impl Into<String>, max_workers: u32) -> Self {
        self.allocations.push(QueueAllocation {
            name: name.into(),
            max_workers: max_workers.max(1),
        });
        self
    }

    pub fn register<W: crate::worker::Worker>(mut self, worker: W) -> AppResult<Self> {
        self.registry.register(worker)?;
        Ok(self)
    }

    /// Appends to the middleware chain; the first added runs outermost.
    pub fn middleware(mut self, middleware: Arc<dyn JobMiddleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Processor, ProcessorError> {
        if self.allocations.is_empty() {
            return Err(ProcessorError::NoQueues);
        }
        if let Some(name) = self
            .allocations
            .iter()
            .map(|allocation| allocation.name.as_str())
            .duplicates()
            .next()
        {
            return Err(ProcessorError::DuplicateQueue(name.to_owned()));
        }
        Ok(Processor {
            inner: Arc::new(ProcessorInner {
                store: self.store,
                registry: self.registry,
                middleware: self.middleware,
                allocations: self.allocations,
                shutdown_timeout: self.shutdown_timeout,
                empty_delay: self.empty_delay,
                error_delay: self.error_delay,
                default_lease: self.default_lease,
            }),
        })
    }
}

#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor").finish_non_exhaustive()
    }
}

struct ProcessorInner {
    store: JobStore,
    registry: WorkerRegistry,
    middleware: Vec<Arc<dyn JobMiddleware>>,
    allocations: Vec<QueueAllocation>,
    shutdown_timeout: Duration,
    empty_delay: Duration,
    error_delay: Duration,
    default_lease: Duration,
}

impl Processor {
    pub fn builder(store: JobStore) -> ProcessorBuilder {
        ProcessorBuilder::new(store)
    }

    /// Spawns the poll loops and returns once polling is live.
    #[instrument(skip_all)]
    pub async fn start(&self) -> AppResult<ProcessorHandle> {
        let released = self.inner.store.release_stale().await?;
        if released > 0 {
            info!(count = released, "re-queued jobs with expired leases");
        }

        let stop = CancellationToken::new();
        let hard = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for allocation in &self.inner.allocations {
            for worker_task_num in 1..=allocation.max_workers {
                tasks.spawn(poll_loop(
                    self.inner.clone(),
                    allocation.name.clone(),
                    worker_task_num,
                    allocation.max_workers,
                    stop.clone(),
                    hard.clone(),
                ));
            }
        }

        info!(
            queues = ?self
                .inner
                .allocations
                .iter()
                .map(|allocation| format!("{}x{}", allocation.name, allocation.max_workers))
                .collect_vec(),
            "queue polling started"
        );

        Ok(ProcessorHandle {
            tasks,
            stop,
            hard,
            shutdown_timeout: self.inner.shutdown_timeout,
        })
    }
}

pub struct ProcessorHandle {
    tasks: JoinSet<()>,
    stop: CancellationToken,
    hard: CancellationToken,
    shutdown_timeout: Duration,
}

impl ProcessorHandle {
    /// Graceful stop: no new pickups, in-flight jobs get `shutdown_timeout`
    /// to finish, anything still running is cancelled and recorded.
    #[instrument(skip_all)]
    pub async fn stop(mut self) -> AppResult<()> {
        info!("stopping queue processor, draining in-flight jobs");
        self.stop.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(result)) => {
                    if let Err(err) = result {
                        error!("processor task join failed: {err}");
                    }
                }
                Ok(None) => {
                    info!("queue processor stopped cleanly");
                    return Ok(());
                }
                Err(_) => break,
            }
        }

        warn!(
            timeout = ?self.shutdown_timeout,
            "shutdown timeout elapsed, cancelling in-flight jobs"
        );
        self.hard.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                error!("processor task join failed: {err}");
            }
        }
        info!("queue processor stopped");
        Ok(())
    }
}

async fn poll_loop(
    inner: Arc<ProcessorInner>,
    queue: String,
    worker_task_num: u32,
    total_worker_tasks: u32,
    stop: CancellationToken,
    hard: CancellationToken,
) {
    let mut next_fetch = Utc::now();
    loop {
        let wait = max(TimeDelta::zero(), next_fetch - Utc::now())
            .to_std()
            .unwrap_or_default();
        tokio::select! {
            // `biased` ensures the stop token is polled before the timer.
            biased;

            _ = stop.cancelled() => {
                info!(
                    worker.queue.name = queue,
                    worker_task_num,
                    total_worker_tasks,
                    "exiting worker poll loop"
                );
                return;
            }
            _ = sleep(wait) => {}
        }

        let job = match inner.store.claim(&queue, inner.default_lease).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                next_fetch = Utc::now() + inner.empty_delay;
                continue;
            }
            Err(err) => {
                error!(
                    worker.queue.name = queue,
                    "an error occurred while claiming from the queue: {err}"
                );
                next_fetch = Utc::now() + inner.error_delay;
                continue;
            }
        };

        dispatch(&inner, job, &hard).await;
        next_fetch = Utc::now();
    }
}

async fn dispatch(inner: &Arc<ProcessorInner>, job: ClaimedJob, hard: &CancellationToken) {
    let Some(worker) = inner.registry.get(&job.kind) else {
        error!(
            job.id = %job.id,
            worker.kind = job.kind,
            worker.queue.name = job.queue_name,
            "unable to handle job, worker not registered"
        );
        let result = Err(WorkError::retryable(anyhow::anyhow!(
            "no worker registered for kind `{}`",
            job.kind
        )));
        finalize(inner, &job, &result).await;
        return;
    };

    // Stretch the lease when this worker's timeout outlives the default.
    if let Some(timeout) = worker.timeout_hint(&job.args) {
        let lease = timeout + LEASE_GRACE;
        if lease > inner.default_lease {
            if let Err(err) = inner.store.extend_lease(job.id, lease).await {
                error!(job.id = %job.id, "unable to extend job lease: {err}");
            }
        }
    }

    let context = JobContext {
        job_id: job.id,
        kind: job.kind.clone(),
        queue: job.queue_name.clone(),
        attempt: job.attempt,
        max_attempts: job.max_attempts,
        args_bytes: job.args_bytes,
        cancellation: hard.child_token(),
    };

    let result = tokio::select! {
        biased;

        _ = hard.cancelled() => {
            // Dropping the in-flight future releases its guards; the row is
            // recorded on the cleanup clock so shutdown cannot lose it.
            warn!(job.id = %job.id, worker.kind = job.kind, "job cancelled by shutdown");
            cleanup::write(
                "cancelled job row",
                inner.store.cancel(job.id, "cancelled: worker shutting down"),
            )
            .await;
            return;
        }
        result = run_chain(&inner.middleware, worker, &context, &job.args) => result,
    };

    finalize(inner, &job, &result).await;
}

async fn finalize(inner: &Arc<ProcessorInner>, job: &ClaimedJob, result: &Result<(), WorkError>) {
    match disposition(result, job.attempt, job.max_attempts) {
        Disposition::Complete => {
            debug!(job.id = %job.id, worker.kind = job.kind, "job completed");
            cleanup::write("completed job row", inner.store.complete(job.id)).await;
        }
        Disposition::Cancel(message) => {
            info!(job.id = %job.id, worker.kind = job.kind, "job cancelled: {message}");
            cleanup::write("cancelled job row", inner.store.cancel(job.id, &message)).await;
        }
        Disposition::Snooze(delay) => {
            let delay = jittered(delay);
            debug!(job.id = %job.id, worker.kind = job.kind, delay = ?delay, "job snoozed");
            cleanup::write("snoozed job row", inner.store.snooze(job.id, delay)).await;
        }
        Disposition::Retry { delay, error } => {
            error!(
                job.id = %job.id,
                job.attempt = job.attempt,
                worker.kind = job.kind,
                delay = ?delay,
                "an error occurred while handling a job, will retry: {error}"
            );
            cleanup::write(
                "retryable job row",
                inner.store.mark_retryable(job.id, delay, &error),
            )
            .await;
        }
        Disposition::Fail(error) => {
            error!(
                job.id = %job.id,
                job.attempt = job.attempt,
                worker.kind = job.kind,
                "job exhausted its attempts: {error}"
            );
            cleanup::write("failed job row", inner.store.fail(job.id, &error)).await;
        }
    }
}

#[derive(Debug, PartialEq)]
enum Disposition {
    Complete,
    Cancel(String),
    Snooze(Duration),
    Retry { delay: Duration, error: String },
    Fail(String),
}

fn disposition(result: &Result<(), WorkError>, attempt: i32, max_attempts: i32) -> Disposition {
    match result {
        Ok(()) => Disposition::Complete,
        Err(WorkError::Cancel(err)) => Disposition::Cancel(err.to_string()),
        Err(WorkError::Snooze(delay)) => Disposition::Snooze(*delay),
        Err(err) => match retry_delay(attempt, max_attempts) {
            Some(delay) => Disposition::Retry {
                delay,
                error: err.to_string(),
            },
            None => Disposition::Fail(err.to_string()),
        },
    }
}

/// ±10% so rescheduled herds spread out.
fn jittered(delay: Duration) -> Duration {
    let spread_ms = (delay.as_millis() / 10) as u64;
    if spread_ms == 0 {
        return delay;
    }
    let offset = rand::rng().random_range(0..=spread_ms * 2);
    delay - Duration::from_millis(spread_ms) + Duration::from_millis(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn retryable() -> Result<(), WorkError> {
        Err(WorkError::retryable(anyhow::anyhow!("transient")))
    }

    #[test]
    fn success_completes() {
        assert_eq!(disposition(&Ok(()), 1, 3), Disposition::Complete);
    }

    #[test]
    fn cancel_is_terminal_regardless_of_attempts() {
        let result = Err(WorkError::cancel(anyhow::anyhow!("obsolete")));
        assert!(matches!(
            disposition(&result, 1, 3),
            Disposition::Cancel(message) if message.contains("obsolete")
        ));
    }

    #[test]
    fn snooze_preserves_the_delay() {
        let result = Err(WorkError::snooze(Duration::from_secs(30)));
        assert_eq!(
            disposition(&result, 3, 3),
            Disposition::Snooze(Duration::from_secs(30))
        );
    }

    #[rstest]
    #[case(1, Duration::from_secs(1))]
    #[case(2, Duration::from_secs(4))]
    fn retryable_errors_back_off_quadratically(#[case] attempt: i32, #[case] expected: Duration) {
        assert_eq!(
            disposition(&retryable(), attempt, 3),
            Disposition::Retry {
                delay: expected,
                error: "transient".to_owned()
            }
        );
    }

    #[test]
    fn exhausted_attempts_fail_terminally() {
        assert_eq!(
            disposition(&retryable(), 3, 3),
            Disposition::Fail("transient".to_owned())
        );
    }

    #[test]
    fn timeouts_and_panics_are_retryable() {
        let timeout = Err(WorkError::Timeout(Duration::from_secs(300)));
        assert!(matches!(
            disposition(&timeout, 1, 3),
            Disposition::Retry { .. }
        ));
        let panic = Err(WorkError::Panic("boom".to_owned()));
        assert!(matches!(
            disposition(&panic, 3, 3),
            Disposition::Fail(message) if message.contains("boom")
        ));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(30);
        for _ in 0..100 {
            let delay = jittered(base);
            assert!(delay >= Duration::from_secs(27));
            assert!(delay <= Duration::from_secs(33));
        }
    }

    #[tokio::test]
    async fn builder_rejects_duplicate_queues() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/specfleet")
            .unwrap();
        let err = Processor::builder(JobStore::new(pool))
            .queue("analysis", 2)
            .queue("analysis", 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, ProcessorError::DuplicateQueue(name) if name == "analysis"));
    }

    #[tokio::test]
    async fn builder_requires_a_queue() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/specfleet")
            .unwrap();
        let err = Processor::builder(JobStore::new(pool)).build().unwrap_err();
        assert!(matches!(err, ProcessorError::NoQueues));
    }
}
