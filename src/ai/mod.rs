//! AI provider seam for the spec-view pipeline: chat-completion style calls
//! for the three phases plus an optional batch API for large phase-1 runs.
//! The Gemini adapter and the deterministic mock are wired by the container.

pub mod gemini;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AiError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("AI provider returned an unexpected response: {0}")]
    Response(String),

    #[error("unknown AI batch handle `{0}`")]
    UnknownBatch(String),
}

/// One test as presented to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDescriptor {
    pub file: String,
    pub suite: String,
    pub name: String,
}

/// Phase-1 output: a `(domain, feature)` label per test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestClassification {
    pub domain: String,
    pub feature: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchStatus {
    Pending,
    Completed(Vec<TestClassification>),
    Failed(String),
}

/// Phase-3 input distilled from the classified inventory.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryInput {
    pub repo: String,
    pub test_count: usize,
    pub domains: Vec<String>,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Phase 1, synchronous path: one `(domain, feature)` per input test, in
    /// input order.
    async fn classify_tests(
        &self,
        tests: &[TestDescriptor],
    ) -> Result<Vec<TestClassification>, AiError>;

    /// Phase 1, batch path: submit and return an opaque handle to poll.
    async fn submit_classification_batch(
        &self,
        tests: &[TestDescriptor],
    ) -> Result<String, AiError>;

    async fn poll_classification_batch(&self, handle: &str) -> Result<BatchStatus, AiError>;

    /// Phase 2: natural-language behavior descriptions in `language`, one per
    /// input test, in input order.
    async fn rewrite_descriptions(
        &self,
        language: &str,
        tests: &[TestDescriptor],
    ) -> Result<Vec<String>, AiError>;

    /// Phase 3: a 3-5 sentence executive summary in `language`.
    async fn summarize(&self, language: &str, input: &SummaryInput) -> Result<String, AiError>;
}
