use std::time::Duration;
use thiserror::Error;

/// Outcome classification for a job handler. Anything that is not a
/// [`WorkError::Cancel`] or a [`WorkError::Snooze`] is retried until the
/// job's `max_attempts` is exhausted, after which the job is marked failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkError {
    /// Terminal. The job is obsolete or can never succeed (invalid args,
    /// repository gone, work already done); it must not be retried.
    #[error("job cancelled: {0}")]
    Cancel(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Reschedule after the given delay without consuming an attempt.
    #[error("job snoozed for {0:?}")]
    Snooze(Duration),

    /// The handler exceeded its per-job timeout. Retryable.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked. The panic is contained at the dispatch boundary
    /// and classified as retryable.
    #[error("job handler panicked: {0}")]
    Panic(String),

    #[error(transparent)]
    Retryable(Box<dyn std::error::Error + Send + Sync>),
}

impl WorkError {
    pub fn cancel(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Cancel(err.into())
    }

    pub fn snooze(delay: Duration) -> Self {
        Self::Snooze(delay)
    }

    pub fn retryable(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Retryable(err.into())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnqueueError {
    #[error("unable to serialize job args: {0}")]
    Serde(#[from] serde_json::Error),

    /// Args payloads are capped so fairness decoding stays cheap.
    #[error("job args exceed the {limit} byte limit ({actual} bytes)")]
    ArgsTooLarge { limit: usize, actual: usize },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("a worker was already registered for kind `{0}`")]
    AlreadyRegistered(String),
}
