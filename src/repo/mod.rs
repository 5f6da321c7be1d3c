//! Relational-store entities and the narrow repository capabilities the
//! use-cases consume. Concrete `Pg*` adapters live in [`pg`]; tests inject
//! mocks at these seams.

pub mod pg;

use crate::error::AppResult;
use crate::fairness::Tier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Codebase {
    pub id: Uuid,
    pub host: String,
    pub owner: String,
    pub name: String,
    pub external_repo_id: Option<i64>,
    pub last_commit_sha: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_viewed_at: DateTime<Utc>,
    pub consecutive_failures: i32,
    pub last_parser_version: Option<i32>,
}

/// Projection the auto-refresh scheduler works from.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CodebaseRefreshInfo {
    pub id: Uuid,
    pub host: String,
    pub owner: String,
    pub name: String,
    pub last_commit_sha: Option<String>,
    pub last_viewed_at: DateTime<Utc>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AnalysisState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub codebase_id: Uuid,
    pub branch: String,
    pub commit_sha: String,
    pub parser_version: i32,
    pub state: AnalysisState,
    pub error_text: Option<String>,
    pub inventory: Option<serde_json::Value>,
    pub committed_at: Option<DateTime<Utc>>,
}

/// Spec-view pipeline progress. `Classifying` may persist a `batch_handle`
/// while an AI batch is in flight; every phase is resumable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SpecPhase {
    Classifying,
    Rewriting,
    Summarizing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpecDocument {
    pub id: Uuid,
    pub analysis_id: Uuid,
    pub language: String,
    pub phase: SpecPhase,
    pub batch_handle: Option<String>,
    pub classified: Option<serde_json::Value>,
    pub rewritten: Option<serde_json::Value>,
    pub summary: Option<String>,
    pub error_text: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CodebaseRepo: Send + Sync {
    async fn find_or_create(&self, host: &str, owner: &str, name: &str) -> AppResult<Codebase>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Codebase>>;

    async fn set_external_repo_id(&self, id: Uuid, external_repo_id: i64) -> AppResult<()>;

    /// Successful analysis: record the commit, reset the failure counter.
    async fn record_success(
        &self,
        id: Uuid,
        commit_sha: &str,
        parser_version: i32,
        completed_at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn record_failure(&self, id: Uuid) -> AppResult<()>;

    /// Codebases that may be due for refresh; the caller applies the decay
    /// policy. Excludes circuit-broken and never-viewed-in-90-days rows
    /// up front so the scan stays cheap.
    async fn refresh_candidates(&self, now: DateTime<Utc>) -> AppResult<Vec<CodebaseRefreshInfo>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisRepo: Send + Sync {
    async fn create_pending(
        &self,
        codebase_id: Uuid,
        branch: &str,
        commit_sha: &str,
        parser_version: i32,
    ) -> AppResult<AnalysisRecord>;

    async fn finalize_completed(
        &self,
        id: Uuid,
        inventory: &serde_json::Value,
        committed_at: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn finalize_failed(&self, id: Uuid, error_text: &str) -> AppResult<()>;

    /// Duplicate-work detection for `(codebase, commit, parser_version)`.
    async fn find_completed(
        &self,
        codebase_id: Uuid,
        commit_sha: &str,
        parser_version: i32,
    ) -> AppResult<Option<Uuid>>;

    async fn get(&self, id: Uuid) -> AppResult<Option<AnalysisRecord>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpecDocRepo: Send + Sync {
    async fn find_or_create(&self, analysis_id: Uuid, language: &str) -> AppResult<SpecDocument>;

    async fn save_batch_handle(&self, id: Uuid, handle: &str) -> AppResult<()>;

    /// Forgets a dead batch so the next attempt resubmits.
    async fn clear_batch_handle(&self, id: Uuid) -> AppResult<()>;

    /// Stores phase-1 output, clears any batch handle, advances to rewriting.
    async fn save_classified(&self, id: Uuid, classified: &serde_json::Value) -> AppResult<()>;

    /// Stores phase-2 output, advances to summarizing.
    async fn save_rewritten(&self, id: Uuid, rewritten: &serde_json::Value) -> AppResult<()>;

    /// Stores phase-3 output, marks the document completed.
    async fn save_summary(&self, id: Uuid, summary: &str) -> AppResult<()>;

    async fn mark_failed(&self, id: Uuid, error_text: &str) -> AppResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn tier(&self, user_id: Uuid) -> AppResult<Option<Tier>>;

    async fn encrypted_host_token(&self, user_id: Uuid) -> AppResult<Option<Vec<u8>>>;
}
