//! Spec-view generation: a three-phase AI pipeline over a persisted analysis
//! inventory. Documents progress state-by-state and every phase is
//! resumable, so a snoozed or retried job picks up where it stopped.

use crate::ai::{AiError, AiProvider, BatchStatus, SummaryInput, TestClassification, TestDescriptor};
use crate::app::cleanup;
use crate::error::Error;
use crate::fairness::Tier;
use crate::parser::Inventory;
use crate::repo::{AnalysisRepo, AnalysisState, CodebaseRepo, SpecDocRepo, SpecPhase};
use crate::worker::{EnqueueConfig, JobContext, WorkError, Worker};
use async_trait::async_trait;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const SPECVIEW_QUEUE: &str = "specview";
pub const SPECVIEW_KIND: &str = "specview:generate";

const SPECVIEW_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecViewArgs {
    pub analysis_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    /// Target natural language for the generated document.
    pub language: String,
    /// Hint only; the fairness layer resolves the authoritative tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
}

impl SpecViewArgs {
    pub fn validate(&self) -> Result<(), SpecViewError> {
        if self.analysis_id.is_nil() {
            return Err(SpecViewError::InvalidInput("analysis id is nil".to_owned()));
        }
        if self.language.is_empty() || self.language.len() > 32 {
            return Err(SpecViewError::InvalidInput(format!(
                "language `{}` is not usable",
                self.language
            )));
        }
        if self.user_id.is_some_and(|id| id.is_nil()) {
            return Err(SpecViewError::InvalidInput("user id is nil".to_owned()));
        }
        Ok(())
    }
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum SpecViewError {
    /// Terminal: the args or the referenced analysis can never work.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The analysis exists but has not completed yet; retry later.
    #[error("analysis is not ready")]
    NotReady,

    #[error(transparent)]
    Other(#[from] Error),
}

impl From<AiError> for SpecViewError {
    fn from(err: AiError) -> Self {
        Self::Other(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecViewOutcome {
    Completed,
    /// A phase-1 batch is still running; come back after the poll interval.
    BatchPending,
}

enum ClassifyStep {
    Pending,
    Done(Vec<TestClassification>),
}

pub struct SpecViewService {
    codebases: Arc<dyn CodebaseRepo>,
    analyses: Arc<dyn AnalysisRepo>,
    docs: Arc<dyn SpecDocRepo>,
    ai: Arc<dyn AiProvider>,
    /// Inventories above this many tests classify through the batch API.
    batch_threshold: usize,
}

impl SpecViewService {
    pub fn new(
        codebases: Arc<dyn CodebaseRepo>,
        analyses: Arc<dyn AnalysisRepo>,
        docs: Arc<dyn SpecDocRepo>,
        ai: Arc<dyn AiProvider>,
        batch_threshold: usize,
    ) -> Self {
        Self {
            codebases,
            analyses,
            docs,
            ai,
            batch_threshold,
        }
    }

    #[instrument(skip_all, fields(analysis.id = %args.analysis_id, language = args.language))]
    pub async fn generate(&self, args: &SpecViewArgs) -> Result<SpecViewOutcome, SpecViewError> {
        args.validate()?;

        let analysis = self
            .analyses
            .get(args.analysis_id)
            .await?
            .ok_or_else(|| SpecViewError::InvalidInput("unknown analysis".to_owned()))?;
        match analysis.state {
            AnalysisState::Completed => {}
            AnalysisState::Pending => return Err(SpecViewError::NotReady),
            AnalysisState::Failed => {
                return Err(SpecViewError::InvalidInput(
                    "analysis failed; nothing to summarize".to_owned(),
                ));
            }
        }
        let inventory_json = analysis.inventory.ok_or_else(|| {
            SpecViewError::InvalidInput("completed analysis has no inventory".to_owned())
        })?;
        let inventory: Inventory = serde_json::from_value(inventory_json)
            .map_err(|err| SpecViewError::InvalidInput(format!("inventory decode: {err}")))?;
        let tests = descriptors(&inventory);

        let doc = self
            .docs
            .find_or_create(args.analysis_id, &args.language)
            .await?;
        // A failed document restarts from the top on the next attempt.
        let mut phase = match doc.phase {
            SpecPhase::Failed => SpecPhase::Classifying,
            phase => phase,
        };
        let mut classified = doc.classified.clone();

        if phase == SpecPhase::Classifying {
            let labels = match self.classify(doc.id, doc.batch_handle.as_deref(), &tests).await? {
                ClassifyStep::Pending => return Ok(SpecViewOutcome::BatchPending),
                ClassifyStep::Done(labels) => labels,
            };
            if labels.len() != tests.len() {
                return Err(SpecViewError::Other(
                    anyhow::anyhow!(
                        "phase 1 returned {} labels for {} tests",
                        labels.len(),
                        tests.len()
                    )
                    .into(),
                ));
            }
            let value = classified_json(&tests, &labels);
            self.docs.save_classified(doc.id, &value).await?;
            debug!(doc.id = %doc.id, tests = tests.len(), "classification stored");
            classified = Some(value);
            phase = SpecPhase::Rewriting;
        }

        if phase == SpecPhase::Rewriting {
            let descriptions = self
                .ai
                .rewrite_descriptions(&args.language, &tests)
                .await
                .map_err(Error::from)?;
            if descriptions.len() != tests.len() {
                return Err(SpecViewError::Other(
                    anyhow::anyhow!(
                        "phase 2 returned {} descriptions for {} tests",
                        descriptions.len(),
                        tests.len()
                    )
                    .into(),
                ));
            }
            let value = rewritten_json(&tests, &descriptions);
            self.docs.save_rewritten(doc.id, &value).await?;
            debug!(doc.id = %doc.id, "descriptions stored");
            phase = SpecPhase::Summarizing;
        }

        if phase == SpecPhase::Summarizing {
            let repo_label = match self.codebases.get(analysis.codebase_id).await? {
                Some(codebase) => format!("{}/{}", codebase.owner, codebase.name),
                None => analysis.commit_sha.clone(),
            };
            let input = SummaryInput {
                repo: repo_label,
                test_count: tests.len(),
                domains: top_domains(classified.as_ref()),
            };
            let summary = self
                .ai
                .summarize(&args.language, &input)
                .await
                .map_err(Error::from)?;
            self.docs.save_summary(doc.id, &summary).await?;
            info!(doc.id = %doc.id, "spec view completed");
        }

        Ok(SpecViewOutcome::Completed)
    }

    async fn classify(
        &self,
        doc_id: Uuid,
        batch_handle: Option<&str>,
        tests: &[TestDescriptor],
    ) -> Result<ClassifyStep, SpecViewError> {
        if let Some(handle) = batch_handle {
            return match self.ai.poll_classification_batch(handle).await {
                Ok(BatchStatus::Pending) => {
                    debug!(ai.batch = handle, "classification batch still running");
                    Ok(ClassifyStep::Pending)
                }
                Ok(BatchStatus::Completed(labels)) => Ok(ClassifyStep::Done(labels)),
                Ok(BatchStatus::Failed(message)) => {
                    self.docs.clear_batch_handle(doc_id).await?;
                    Err(SpecViewError::Other(
                        anyhow::anyhow!("classification batch failed: {message}").into(),
                    ))
                }
                Err(AiError::UnknownBatch(handle)) => {
                    self.docs.clear_batch_handle(doc_id).await?;
                    Err(SpecViewError::Other(
                        anyhow::anyhow!("classification batch `{handle}` disappeared").into(),
                    ))
                }
                Err(err) => Err(err.into()),
            };
        }

        if tests.len() > self.batch_threshold {
            let handle = self
                .ai
                .submit_classification_batch(tests)
                .await
                .map_err(Error::from)?;
            self.docs.save_batch_handle(doc_id, &handle).await?;
            info!(ai.batch = handle, tests = tests.len(), "classification batch submitted");
            return Ok(ClassifyStep::Pending);
        }

        let labels = self.ai.classify_tests(tests).await.map_err(Error::from)?;
        Ok(ClassifyStep::Done(labels))
    }

    /// Terminal failure bookkeeping on the cleanup clock.
    pub async fn record_failure(&self, args: &SpecViewArgs, message: &str) {
        let Some(doc) = cleanup::write(
            "spec document lookup",
            self.docs.find_or_create(args.analysis_id, &args.language),
        )
        .await
        else {
            return;
        };
        cleanup::write(
            "spec document failure row",
            self.docs.mark_failed(doc.id, message),
        )
        .await;
    }
}

fn descriptors(inventory: &Inventory) -> Vec<TestDescriptor> {
    inventory
        .tests()
        .map(|(file, suite, test)| TestDescriptor {
            file: file.path.clone(),
            suite: suite.name.clone(),
            name: test.name.clone(),
        })
        .collect()
}

fn classified_json(tests: &[TestDescriptor], labels: &[TestClassification]) -> serde_json::Value {
    serde_json::Value::Array(
        tests
            .iter()
            .zip(labels)
            .map(|(test, label)| {
                json!({
                    "file": test.file,
                    "suite": test.suite,
                    "name": test.name,
                    "domain": label.domain,
                    "feature": label.feature,
                })
            })
            .collect(),
    )
}

fn rewritten_json(tests: &[TestDescriptor], descriptions: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        tests
            .iter()
            .zip(descriptions)
            .map(|(test, description)| {
                json!({
                    "name": test.name,
                    "description": description,
                })
            })
            .collect(),
    )
}

/// The three most common domains from the classified output.
fn top_domains(classified: Option<&serde_json::Value>) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    if let Some(serde_json::Value::Array(entries)) = classified {
        for entry in entries {
            if let Some(domain) = entry.get("domain").and_then(|value| value.as_str()) {
                *counts.entry(domain).or_default() += 1;
            }
        }
    }
    counts
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)))
        .take(3)
        .map(|(domain, _)| domain.to_owned())
        .collect()
}

pub struct SpecViewWorker {
    service: Arc<SpecViewService>,
    batch_poll_interval: Duration,
}

impl SpecViewWorker {
    pub fn new(service: Arc<SpecViewService>, batch_poll_interval: Duration) -> Self {
        Self {
            service,
            batch_poll_interval,
        }
    }
}

#[async_trait]
impl Worker for SpecViewWorker {
    type Args = SpecViewArgs;

    fn kind() -> String {
        SPECVIEW_KIND.to_owned()
    }

    fn enqueue_config() -> EnqueueConfig {
        EnqueueConfig::builder().queue(SPECVIEW_QUEUE).build()
    }

    fn unique_key(args: &Self::Args) -> String {
        args.analysis_id.to_string()
    }

    fn timeout(&self, _args: &Self::Args) -> Duration {
        SPECVIEW_TIMEOUT
    }

    async fn handle(&self, job: &JobContext, args: Self::Args) -> Result<(), WorkError> {
        match self.service.generate(&args).await {
            Ok(SpecViewOutcome::Completed) => {
                info!(job.id = %job.job_id, analysis.id = %args.analysis_id, "spec view job complete");
                Ok(())
            }
            Ok(SpecViewOutcome::BatchPending) => {
                Err(WorkError::snooze(self.batch_poll_interval))
            }
            Err(err @ SpecViewError::InvalidInput(_)) => Err(WorkError::cancel(err)),
            Err(err) => {
                if job.attempt >= job.max_attempts {
                    self.service.record_failure(&args, &err.to_string()).await;
                }
                Err(WorkError::retryable(err))
            }
        }
    }
}
