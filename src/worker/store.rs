//! SQL surface of the durable queue. Claims use `FOR UPDATE SKIP LOCKED` so
//! exactly one worker holds a job at a time; a lease on every claim lets a
//! startup sweep re-queue work orphaned by a crashed process.

use crate::error::AppResult;
use crate::worker::job::ClaimedJob;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
}

/// Row to insert; built by the enqueue client.
#[derive(Debug, Clone, bon::Builder)]
pub struct NewJob {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    #[builder(into)]
    pub kind: String,
    #[builder(into)]
    pub queue_name: String,
    pub args: serde_json::Value,
    /// Present only for unique-by-args inserts.
    pub args_fingerprint: Option<String>,
    /// Widens dedup from "a non-terminal instance exists" to "any instance
    /// was created within the window".
    pub unique_window: Option<Duration>,
    #[builder(default = crate::worker::DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    #[builder(default)]
    pub priority: i32,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts one job unless a fingerprint match exists among non-terminal
    /// instances or within the uniqueness window. Returns `None` when the
    /// insert was absorbed as a duplicate (idempotent enqueue).
    pub async fn insert(&self, job: &NewJob) -> AppResult<Option<Uuid>> {
        // The partial unique index on active fingerprints backstops the
        // NOT EXISTS check under concurrent inserts; losing that race
        // surfaces as a conflict, absorbed by ON CONFLICT DO NOTHING.
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO jobs (id, kind, queue_name, args, args_fingerprint, max_attempts, priority)
            SELECT $1, $2, $3, $4, $5, $6, $7
            WHERE $5::text IS NULL OR NOT EXISTS (
                SELECT 1 FROM jobs
                WHERE args_fingerprint = $5
                  AND (
                    state IN ('pending', 'running', 'retryable', 'snoozed')
                    OR ($8::float8 IS NOT NULL
                        AND created_at > now() - make_interval(secs => $8))
                  )
            )
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.kind)
        .bind(&job.queue_name)
        .bind(&job.args)
        .bind(&job.args_fingerprint)
        .bind(job.max_attempts)
        .bind(job.priority)
        .bind(job.unique_window.map(|window| window.as_secs_f64()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Pops the next due job from `queue`: highest priority first, then
    /// oldest `scheduled_at`. The claim flips the row to `running` and
    /// increments its attempt.
    pub async fn claim(&self, queue: &str, lease: Duration) -> AppResult<Option<ClaimedJob>> {
        let job = sqlx::query_as::<_, ClaimedJob>(
            r#"
            WITH next_job AS (
                SELECT id FROM jobs
                WHERE queue_name = $1
                  AND state IN ('pending', 'retryable', 'snoozed')
                  AND scheduled_at <= now()
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'running',
                attempt = jobs.attempt + 1,
                lease_expires_at = now() + make_interval(secs => $2),
                updated_at = now()
            FROM next_job
            WHERE jobs.id = next_job.id
            RETURNING jobs.id, jobs.kind, jobs.queue_name, jobs.args, jobs.attempt,
                      jobs.max_attempts, length(jobs.args::text)::bigint AS args_bytes
            "#,
        )
        .bind(queue)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Stretches the lease when a worker's timeout exceeds the claim default.
    pub async fn extend_lease(&self, id: Uuid, lease: Duration) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = now() + make_interval(secs => $2), updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete(&self, id: Uuid) -> AppResult<()> {
        self.finish(id, "completed", None).await
    }

    pub async fn cancel(&self, id: Uuid, error: &str) -> AppResult<()> {
        self.finish(id, "cancelled", Some(error)).await
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> AppResult<()> {
        self.finish(id, "failed", Some(error)).await
    }

    /// Reschedule without consuming the attempt: the claim's increment is
    /// rolled back.
    pub async fn snooze(&self, id: Uuid, delay: Duration) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'snoozed',
                attempt = greatest(attempt - 1, 0),
                scheduled_at = now() + make_interval(secs => $2),
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_retryable(&self, id: Uuid, delay: Duration, error: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'retryable',
                scheduled_at = now() + make_interval(secs => $2),
                last_error = $3,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Re-queues `running` rows whose lease expired (crashed or force-killed
    /// worker). The consumed attempt stays consumed; a row that died on its
    /// final attempt goes terminal instead, keeping `attempt <= max_attempts`.
    pub async fn release_stale(&self) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempt >= max_attempts THEN 'failed' ELSE 'retryable' END,
                last_error = CASE WHEN attempt >= max_attempts
                    THEN 'lease expired on the final attempt' ELSE last_error END,
                scheduled_at = now(),
                lease_expires_at = NULL,
                updated_at = now()
            WHERE state = 'running' AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn finish(&self, id: Uuid, state: &str, error: Option<&str>) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                last_error = coalesce($3, last_error),
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
