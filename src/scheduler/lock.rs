//! Advisory-lock election. The lock is session-scoped: the guard owns its
//! pooled connection, so dropping the guard without a clean release closes
//! the session instead of returning a lock-holding connection to the pool.

use crate::error::AppResult;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DistLock {
    pool: PgPool,
    name: String,
    key: i64,
}

impl DistLock {
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = advisory_key(&name);
        Self { pool, name, key }
    }

    /// Non-blocking: `None` when another session holds the lock.
    pub async fn try_acquire(&self) -> AppResult<Option<DistLockGuard>> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            debug!(lock.name = self.name, "advisory lock held elsewhere");
            return Ok(None);
        }
        Ok(Some(DistLockGuard {
            conn: Some(conn),
            key: self.key,
        }))
    }
}

pub struct DistLockGuard {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl DistLockGuard {
    /// Unlocks and returns the connection to the pool. Safe to skip: dropping
    /// the guard releases the lock by ending the session.
    pub async fn release(mut self) -> AppResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let result = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                // Unlock failed; don't hand a lock-holding session back to
                // the pool.
                drop(conn.detach());
                Err(err.into())
            }
        }
    }
}

impl Drop for DistLockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Folds a lock name into the 64-bit key space `pg_advisory_lock` expects.
/// sha2 keeps the mapping stable across processes and releases.
pub(crate) fn advisory_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable() {
        assert_eq!(
            advisory_key("specfleet:auto_refresh"),
            advisory_key("specfleet:auto_refresh")
        );
    }

    #[test]
    fn distinct_names_get_distinct_keys() {
        assert_ne!(
            advisory_key("specfleet:auto_refresh"),
            advisory_key("specfleet:other")
        );
    }
}
