//! Post-cancellation bookkeeping. Failure rows, failure counters, and slot
//! bookkeeping must land even while the surrounding task is being torn down,
//! so these writes run on their own bounded clock, created inside the failure
//! branch rather than inherited from the (possibly cancelled) task.

use crate::error::AppResult;
use std::future::Future;
use std::time::Duration;
use tracing::error;

pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a cleanup write with an independent timeout. Failures are logged,
/// never propagated: cleanup is best-effort and must not mask the original
/// error.
pub async fn write<F, T>(label: &str, fut: F) -> Option<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(CLEANUP_TIMEOUT, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            error!(cleanup.label = label, "cleanup write failed: {err}");
            None
        }
        Err(_) => {
            error!(cleanup.label = label, "cleanup write timed out");
            None
        }
    }
}
