//! Insert-only queue client used by the web tier, the scheduler, and the
//! one-shot CLI. Dedup is an argument-hash uniqueness check: within the
//! window (or while a previous instance is non-terminal) a matching enqueue
//! succeeds without inserting a row.

use crate::error::AppResult;
use crate::error::worker::EnqueueError;
use crate::worker::Worker;
use crate::worker::job::args_fingerprint;
use crate::worker::store::{JobStore, NewJob};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Args payload ceiling; keeps fairness decoding and queue rows bounded.
pub const MAX_ARGS_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Default, bon::Builder)]
pub struct EnqueueOpts {
    #[builder(default)]
    pub unique_by_args: bool,
    /// Only meaningful with `unique_by_args`. Without it, uniqueness covers
    /// non-terminal instances only.
    pub unique_window: Option<Duration>,
    pub max_attempts: Option<i32>,
    pub priority: Option<i32>,
    pub queue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(Uuid),
    /// A uniqueness match absorbed the submission; no row was inserted.
    Deduplicated,
}

#[derive(Debug, Clone)]
pub struct EnqueueClient {
    store: JobStore,
}

impl EnqueueClient {
    pub fn new(pool: PgPool) -> Self {
        Self {
            store: JobStore::new(pool),
        }
    }

    #[instrument(skip_all, fields(worker.kind))]
    pub async fn enqueue<W: Worker>(
        &self,
        args: &W::Args,
        opts: &EnqueueOpts,
    ) -> AppResult<EnqueueOutcome> {
        let kind = W::kind();
        tracing::Span::current().record("worker.kind", kind.as_str());

        let job = build_job::<W>(args, opts)?;
        match self.store.insert(&job).await? {
            Some(id) => {
                debug!(job.id = %id, worker.queue.name = job.queue_name, "job enqueued");
                Ok(EnqueueOutcome::Enqueued(id))
            }
            None => {
                debug!(worker.queue.name = job.queue_name, "enqueue deduplicated");
                Ok(EnqueueOutcome::Deduplicated)
            }
        }
    }
}

fn build_job<W: Worker>(args: &W::Args, opts: &EnqueueOpts) -> Result<NewJob, EnqueueError> {
    let kind = W::kind();
    let config = W::enqueue_config();

    let args_value = serde_json::to_value(args).map_err(EnqueueError::Serde)?;
    let encoded_len = args_value.to_string().len();
    if encoded_len > MAX_ARGS_BYTES {
        return Err(EnqueueError::ArgsTooLarge {
            limit: MAX_ARGS_BYTES,
            actual: encoded_len,
        });
    }

    let fingerprint = opts
        .unique_by_args
        .then(|| args_fingerprint(&kind, &W::unique_key(args)));

    Ok(NewJob::builder()
        .kind(kind)
        .queue_name(opts.queue.clone().unwrap_or(config.queue))
        .args(args_value)
        .maybe_args_fingerprint(fingerprint)
        .maybe_unique_window(opts.unique_window)
        .max_attempts(opts.max_attempts.unwrap_or(config.max_attempts))
        .priority(opts.priority.unwrap_or(config.priority))
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{EnqueueConfig, JobContext, WorkError, Worker};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PingArgs {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_by: Option<Uuid>,
    }

    struct PingWorker;

    #[async_trait]
    impl Worker for PingWorker {
        type Args = PingArgs;

        fn kind() -> String {
            "test:ping".to_owned()
        }

        fn enqueue_config() -> EnqueueConfig {
            EnqueueConfig::builder().queue("pings").priority(2).build()
        }

        fn unique_key(args: &Self::Args) -> String {
            args.target.clone()
        }

        fn timeout(&self, _args: &Self::Args) -> Duration {
            Duration::from_secs(1)
        }

        async fn handle(&self, _job: &JobContext, _args: Self::Args) -> Result<(), WorkError> {
            Ok(())
        }
    }

    #[test]
    fn build_job_applies_worker_defaults() {
        let args = PingArgs {
            target: "a".to_owned(),
            requested_by: None,
        };
        let job = build_job::<PingWorker>(&args, &EnqueueOpts::default()).unwrap();
        assert_eq!(job.kind, "test:ping");
        assert_eq!(job.queue_name, "pings");
        assert_eq!(job.priority, 2);
        assert_eq!(job.max_attempts, crate::worker::DEFAULT_MAX_ATTEMPTS);
        assert!(job.args_fingerprint.is_none());
    }

    #[test]
    fn opts_override_worker_defaults() {
        let args = PingArgs {
            target: "a".to_owned(),
            requested_by: None,
        };
        let opts = EnqueueOpts::builder()
            .queue("other".to_string())
            .priority(9)
            .max_attempts(1)
            .build();
        let job = build_job::<PingWorker>(&args, &opts).unwrap();
        assert_eq!(job.queue_name, "other");
        assert_eq!(job.priority, 9);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn unique_by_args_fingerprints_the_unique_key_only() {
        let opts = EnqueueOpts::builder().unique_by_args(true).build();
        let a = build_job::<PingWorker>(
            &PingArgs {
                target: "host-1".to_owned(),
                requested_by: Some(Uuid::new_v4()),
            },
            &opts,
        )
        .unwrap();
        let b = build_job::<PingWorker>(
            &PingArgs {
                target: "host-1".to_owned(),
                requested_by: Some(Uuid::new_v4()),
            },
            &opts,
        )
        .unwrap();
        // Different requesters, same semantic identity.
        assert_eq!(a.args_fingerprint, b.args_fingerprint);
        assert!(a.args_fingerprint.is_some());

        let c = build_job::<PingWorker>(
            &PingArgs {
                target: "host-2".to_owned(),
                requested_by: None,
            },
            &opts,
        )
        .unwrap();
        assert_ne!(a.args_fingerprint, c.args_fingerprint);
    }

    #[test]
    fn oversized_args_are_rejected() {
        let args = PingArgs {
            target: "x".repeat(MAX_ARGS_BYTES + 1),
            requested_by: None,
        };
        let err = build_job::<PingWorker>(&args, &EnqueueOpts::default()).unwrap_err();
        assert!(matches!(err, EnqueueError::ArgsTooLarge { .. }));
    }
}
