//! sqlx-backed repository implementations. Queries are runtime-checked and
//! column lists match the `FromRow` derives on the entities.

use crate::error::AppResult;
use crate::fairness::Tier;
use crate::repo::{
    AnalysisRecord, AnalysisRepo, AnalysisState, Codebase, CodebaseRefreshInfo, CodebaseRepo,
    SpecDocRepo, SpecDocument, SpecPhase, UserRepo,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

const CODEBASE_COLUMNS: &str = "id, host, owner, name, external_repo_id, last_commit_sha, \
     last_completed_at, last_viewed_at, consecutive_failures, last_parser_version";

#[derive(Debug, Clone)]
pub struct PgCodebaseRepo {
    pool: PgPool,
}

impl PgCodebaseRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CodebaseRepo for PgCodebaseRepo {
    async fn find_or_create(&self, host: &str, owner: &str, name: &str) -> AppResult<Codebase> {
        let codebase = sqlx::query_as::<_, Codebase>(&format!(
            r#"
            INSERT INTO codebases (id, host, owner, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (host, owner, name) DO UPDATE SET updated_at = now()
            RETURNING {CODEBASE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(host)
        .bind(owner)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(codebase)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Codebase>> {
        let codebase = sqlx::query_as::<_, Codebase>(&format!(
            "SELECT {CODEBASE_COLUMNS} FROM codebases WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(codebase)
    }

    async fn set_external_repo_id(&self, id: Uuid, external_repo_id: i64) -> AppResult<()> {
        sqlx::query("UPDATE codebases SET external_repo_id = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(external_repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_success(
        &self,
        id: Uuid,
        commit_sha: &str,
        parser_version: i32,
        completed_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE codebases
            SET last_commit_sha = $2,
                last_parser_version = $3,
                last_completed_at = $4,
                consecutive_failures = 0,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(commit_sha)
        .bind(parser_version)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE codebases
            SET consecutive_failures = consecutive_failures + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_candidates(&self, now: DateTime<Utc>) -> AppResult<Vec<CodebaseRefreshInfo>> {
        let candidates = sqlx::query_as::<_, CodebaseRefreshInfo>(
            r#"
            SELECT id, host, owner, name, last_commit_sha, last_viewed_at,
                   last_completed_at, consecutive_failures
            FROM codebases
            WHERE consecutive_failures < 5
              AND last_viewed_at <= $1
              AND last_viewed_at >= $1 - interval '90 days'
            ORDER BY last_viewed_at DESC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(candidates)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AnalysisRow {
    id: Uuid,
    codebase_id: Uuid,
    branch: String,
    commit_sha: String,
    parser_version: i32,
    state: String,
    error_text: Option<String>,
    inventory: Option<serde_json::Value>,
    committed_at: Option<DateTime<Utc>>,
}

impl TryFrom<AnalysisRow> for AnalysisRecord {
    type Error = crate::error::Error;

    fn try_from(row: AnalysisRow) -> AppResult<Self> {
        let state = AnalysisState::from_str(&row.state)
            .map_err(|_| anyhow!("unknown analysis state `{}`", row.state))?;
        Ok(Self {
            id: row.id,
            codebase_id: row.codebase_id,
            branch: row.branch,
            commit_sha: row.commit_sha,
            parser_version: row.parser_version,
            state,
            error_text: row.error_text,
            inventory: row.inventory,
            committed_at: row.committed_at,
        })
    }
}

const ANALYSIS_COLUMNS: &str = "id, codebase_id, branch, commit_sha, parser_version, state, \
     error_text, inventory, committed_at";

#[derive(Debug, Clone)]
pub struct PgAnalysisRepo {
    pool: PgPool,
}

impl PgAnalysisRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisRepo for PgAnalysisRepo {
    async fn create_pending(
        &self,
        codebase_id: Uuid,
        branch: &str,
        commit_sha: &str,
        parser_version: i32,
    ) -> AppResult<AnalysisRecord> {
        let row = sqlx::query_as::<_, AnalysisRow>(&format!(
            r#"
            INSERT INTO analyses (id, codebase_id, branch, commit_sha, parser_version, state)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING {ANALYSIS_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(codebase_id)
        .bind(branch)
        .bind(commit_sha)
        .bind(parser_version)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn finalize_completed(
        &self,
        id: Uuid,
        inventory: &serde_json::Value,
        committed_at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE analyses
            SET state = 'completed', inventory = $2, committed_at = $3,
                error_text = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(inventory)
        .bind(committed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_failed(&self, id: Uuid, error_text: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE analyses
            SET state = 'failed', error_text = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_completed(
        &self,
        codebase_id: Uuid,
        commit_sha: &str,
        parser_version: i32,
    ) -> AppResult<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM analyses
            WHERE codebase_id = $1 AND commit_sha = $2 AND parser_version = $3
              AND state = 'completed'
            LIMIT 1
            "#,
        )
        .bind(codebase_id)
        .bind(commit_sha)
        .bind(parser_version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<AnalysisRecord>> {
        let row = sqlx::query_as::<_, AnalysisRow>(&format!(
            "SELECT {ANALYSIS_COLUMNS} FROM analyses WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AnalysisRecord::try_from).transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SpecDocumentRow {
    id: Uuid,
    analysis_id: Uuid,
    language: String,
    phase: String,
    batch_handle: Option<String>,
    classified: Option<serde_json::Value>,
    rewritten: Option<serde_json::Value>,
    summary: Option<String>,
    error_text: Option<String>,
}

impl TryFrom<SpecDocumentRow> for SpecDocument {
    type Error = crate::error::Error;

    fn try_from(row: SpecDocumentRow) -> AppResult<Self> {
        let phase = SpecPhase::from_str(&row.phase)
            .map_err(|_| anyhow!("unknown spec document phase `{}`", row.phase))?;
        Ok(Self {
            id: row.id,
            analysis_id: row.analysis_id,
            language: row.language,
            phase,
            batch_handle: row.batch_handle,
            classified: row.classified,
            rewritten: row.rewritten,
            summary: row.summary,
            error_text: row.error_text,
        })
    }
}

const SPEC_DOC_COLUMNS: &str = "id, analysis_id, language, phase, batch_handle, classified, \
     rewritten, summary, error_text";

#[derive(Debug, Clone)]
pub struct PgSpecDocRepo {
    pool: PgPool,
}

impl PgSpecDocRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpecDocRepo for PgSpecDocRepo {
    async fn find_or_create(&self, analysis_id: Uuid, language: &str) -> AppResult<SpecDocument> {
        let row = sqlx::query_as::<_, SpecDocumentRow>(&format!(
            r#"
            INSERT INTO spec_documents (id, analysis_id, language)
            VALUES ($1, $2, $3)
            ON CONFLICT (analysis_id, language) DO UPDATE SET updated_at = now()
            RETURNING {SPEC_DOC_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(analysis_id)
        .bind(language)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn save_batch_handle(&self, id: Uuid, handle: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE spec_documents SET batch_handle = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(handle)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_batch_handle(&self, id: Uuid) -> AppResult<()> {
        sqlx::query(
            "UPDATE spec_documents SET batch_handle = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_classified(&self, id: Uuid, classified: &serde_json::Value) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE spec_documents
            SET classified = $2, batch_handle = NULL, phase = 'rewriting', updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(classified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_rewritten(&self, id: Uuid, rewritten: &serde_json::Value) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE spec_documents
            SET rewritten = $2, phase = 'summarizing', updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(rewritten)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_summary(&self, id: Uuid, summary: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE spec_documents
            SET summary = $2, phase = 'completed', error_text = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_text: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE spec_documents
            SET phase = 'failed', error_text = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgUserRepo {
    pool: PgPool,
}

impl PgUserRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn tier(&self, user_id: Uuid) -> AppResult<Option<Tier>> {
        let tier = sqlx::query_scalar::<_, String>("SELECT tier FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tier.map(|raw| {
            Tier::from_str(&raw).unwrap_or_else(|_| {
                warn!(user.id = %user_id, user.tier = raw, "unknown tier, defaulting to free");
                Tier::Free
            })
        }))
    }

    async fn encrypted_host_token(&self, user_id: Uuid) -> AppResult<Option<Vec<u8>>> {
        let token = sqlx::query_scalar::<_, Option<Vec<u8>>>(
            "SELECT encrypted_host_token FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token.flatten())
    }
}
