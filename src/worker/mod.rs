//! The job runtime: typed [`Worker`]s registered by kind, a Postgres-backed
//! durable queue, an ordered middleware chain, and poll loops with bounded
//! graceful drain.

pub mod enqueue;
pub mod job;
pub mod middleware;
pub mod processor;
pub mod registry;
pub mod store;

pub use crate::error::worker::WorkError;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// A typed job handler. Registration is by [`Worker::kind`]; routing is by
/// the `queue_name` stamped on each job at insert time, so a worker is not
/// bound to a single queue.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    type Args: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Job kind discriminator, e.g. `analysis:analyze`.
    fn kind() -> String
    where
        Self: Sized;

    /// Enqueue-side defaults for this kind: target queue, attempts, priority.
    fn enqueue_config() -> EnqueueConfig
    where
        Self: Sized;

    /// Canonical uniqueness material for dedup. Hashed together with the kind
    /// into the args fingerprint, so two submissions with equal semantic
    /// fields collide.
    fn unique_key(args: &Self::Args) -> String
    where
        Self: Sized,
    {
        serde_json::to_string(args).unwrap_or_default()
    }

    /// Per-job timeout enforced by the runtime around [`Worker::handle`].
    fn timeout(&self, args: &Self::Args) -> Duration;

    async fn handle(&self, job: &JobContext, args: Self::Args) -> Result<(), WorkError>;
}

/// Defaults applied when enqueuing jobs for a worker; per-call
/// [`enqueue::EnqueueOpts`] win over these.
#[derive(Debug, Clone, bon::Builder)]
pub struct EnqueueConfig {
    #[builder(into)]
    pub queue: String,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    #[builder(default)]
    pub priority: i32,
}

/// Metadata handed to middleware and handlers alongside the decoded args.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub kind: String,
    pub queue: String,
    /// The attempt currently executing, starting at 1.
    pub attempt: i32,
    pub max_attempts: i32,
    /// Serialized size of the args payload.
    pub args_bytes: i64,
    /// Cancelled when the runtime hard-stops past the shutdown grace window.
    pub cancellation: CancellationToken,
}

/// Backoff before the next attempt: `attempt²` seconds (1s, 4s, 9s, ...).
/// `None` when the attempt budget is exhausted.
pub(crate) fn retry_delay(attempt: i32, max_attempts: i32) -> Option<Duration> {
    if attempt >= max_attempts {
        return None;
    }
    let attempt = u64::try_from(attempt).ok()?;
    Some(Duration::from_secs(attempt.saturating_mul(attempt).max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 3, Some(Duration::from_secs(1)))]
    #[case(2, 3, Some(Duration::from_secs(4)))]
    #[case(3, 3, None)]
    #[case(3, 4, Some(Duration::from_secs(9)))]
    #[case(4, 5, Some(Duration::from_secs(16)))]
    #[case(5, 3, None)]
    #[case(-1, 3, None)]
    fn retry_delay_squares_the_attempt(
        #[case] attempt: i32,
        #[case] max_attempts: i32,
        #[case] expected: Option<Duration>,
    ) {
        assert_eq!(retry_delay(attempt, max_attempts), expected);
    }

    #[test]
    fn enqueue_config_defaults() {
        let config = EnqueueConfig::builder().queue("analysis").build();
        assert_eq!(config.queue, "analysis");
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.priority, 0);
    }
}
