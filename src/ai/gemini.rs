use crate::ai::{AiError, AiProvider, BatchStatus, SummaryInput, TestClassification, TestDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Tests per request on the synchronous classification path.
const CLASSIFY_CHUNK: usize = 50;

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    phase1_model: String,
    phase2_model: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchOperation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    response: Option<serde_json::Value>,
}

impl GeminiProvider {
    pub fn new(api_key: String, phase1_model: String, phase2_model: String) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("specfleet/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base: DEFAULT_API_BASE.to_owned(),
            api_key,
            phase1_model,
            phase2_model,
        })
    }

    async fn generate(&self, model: &str, prompt: String) -> Result<String, AiError> {
        let url = format!("{}/models/{model}:generateContent", self.api_base);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<GenerateResponse>()
            .await?;

        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .map(|part| part.text)
            .ok_or_else(|| AiError::Response("no candidates returned".to_owned()))?;
        Ok(text)
    }

    fn classify_prompt(tests: &[TestDescriptor]) -> String {
        let listing = tests
            .iter()
            .map(|test| format!("{} :: {} :: {}", test.file, test.suite, test.name))
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "Label each test with a product domain and feature. Reply with a JSON \
             array of {{\"domain\", \"feature\"}} objects, one per line, same order, \
             no prose.\n\n{listing}"
        )
    }

    fn parse_classifications(
        text: &str,
        expected: usize,
    ) -> Result<Vec<TestClassification>, AiError> {
        let labels: Vec<TestClassification> = serde_json::from_str(strip_fences(text))
            .map_err(|err| AiError::Response(format!("classification parse: {err}")))?;
        if labels.len() != expected {
            return Err(AiError::Response(format!(
                "expected {expected} classifications, got {}",
                labels.len()
            )));
        }
        Ok(labels)
    }
}

#[async_trait]
impl AiProvider for GeminiProvider {
    #[instrument(skip_all, fields(ai.tests = tests.len()))]
    async fn classify_tests(
        &self,
        tests: &[TestDescriptor],
    ) -> Result<Vec<TestClassification>, AiError> {
        let mut labels = Vec::with_capacity(tests.len());
        for chunk in tests.chunks(CLASSIFY_CHUNK) {
            let text = self
                .generate(&self.phase1_model, Self::classify_prompt(chunk))
                .await?;
            labels.extend(Self::parse_classifications(&text, chunk.len())?);
        }
        Ok(labels)
    }

    #[instrument(skip_all, fields(ai.tests = tests.len()))]
    async fn submit_classification_batch(
        &self,
        tests: &[TestDescriptor],
    ) -> Result<String, AiError> {
        let url = format!(
            "{}/models/{}:batchGenerateContent",
            self.api_base, self.phase1_model
        );
        let requests: Vec<_> = tests
            .chunks(CLASSIFY_CHUNK)
            .map(|chunk| {
                json!({
                    "request": {
                        "contents": [{ "parts": [{ "text": Self::classify_prompt(chunk) }] }]
                    }
                })
            })
            .collect();
        let body = json!({ "batch": { "inputConfig": { "requests": { "requests": requests } } } });

        let operation = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<BatchOperation>()
            .await?;
        debug!(ai.batch = operation.name, "classification batch submitted");
        Ok(operation.name)
    }

    #[instrument(skip_all, fields(ai.batch = handle))]
    async fn poll_classification_batch(&self, handle: &str) -> Result<BatchStatus, AiError> {
        let url = format!("{}/{handle}", self.api_base);
        let operation = self
            .http
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json::<BatchOperation>()
            .await?;

        if !operation.done {
            return Ok(BatchStatus::Pending);
        }
        if let Some(error) = operation.error {
            return Ok(BatchStatus::Failed(error.to_string()));
        }

        let response = operation
            .response
            .ok_or_else(|| AiError::Response("batch done without a response".to_owned()))?;
        let mut labels = Vec::new();
        let responses = response
            .pointer("/inlinedResponses/inlinedResponses")
            .and_then(|value| value.as_array())
            .ok_or_else(|| AiError::Response("batch response missing inlined output".to_owned()))?;
        for entry in responses {
            let text = entry
                .pointer("/response/candidates/0/content/parts/0/text")
                .and_then(|value| value.as_str())
                .ok_or_else(|| AiError::Response("batch entry missing text".to_owned()))?;
            let chunk: Vec<TestClassification> = serde_json::from_str(strip_fences(text))
                .map_err(|err| AiError::Response(format!("batch classification parse: {err}")))?;
            labels.extend(chunk);
        }
        Ok(BatchStatus::Completed(labels))
    }

    #[instrument(skip_all, fields(ai.tests = tests.len(), ai.language = language))]
    async fn rewrite_descriptions(
        &self,
        language: &str,
        tests: &[TestDescriptor],
    ) -> Result<Vec<String>, AiError> {
        let mut descriptions = Vec::with_capacity(tests.len());
        for chunk in tests.chunks(CLASSIFY_CHUNK) {
            let listing = chunk
                .iter()
                .map(|test| test.name.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            let prompt = format!(
                "Rewrite each test name below as a one-sentence behavior description \
                 in {language}. Reply with a JSON array of strings, same order, no \
                 prose.\n\n{listing}"
            );
            let text = self.generate(&self.phase2_model, prompt).await?;
            let chunk_out: Vec<String> = serde_json::from_str(strip_fences(&text))
                .map_err(|err| AiError::Response(format!("description parse: {err}")))?;
            if chunk_out.len() != chunk.len() {
                return Err(AiError::Response(format!(
                    "expected {} descriptions, got {}",
                    chunk.len(),
                    chunk_out.len()
                )));
            }
            descriptions.extend(chunk_out);
        }
        Ok(descriptions)
    }

    #[instrument(skip_all, fields(ai.language = language))]
    async fn summarize(&self, language: &str, input: &SummaryInput) -> Result<String, AiError> {
        let prompt = format!(
            "Write a 3-5 sentence executive summary in {language} of the project \
             `{}` based on its test inventory: {} tests covering the domains {}.",
            input.repo,
            input.test_count,
            input.domains.join(", "),
        );
        self.generate(&self.phase2_model, prompt).await
    }
}

/// Models routinely wrap JSON answers in markdown fences.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
