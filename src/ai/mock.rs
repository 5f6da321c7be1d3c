use crate::ai::{AiError, AiProvider, BatchStatus, SummaryInput, TestClassification, TestDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

const DOMAINS: &[&str] = &["api", "storage", "auth", "ui", "core"];

/// Deterministic provider substituted when `MOCK_MODE` is set. Outputs are a
/// pure function of the inputs so repeated runs produce identical documents;
/// batches stay pending for a fixed number of polls to exercise the
/// snooze-and-poll path.
pub struct MockAiProvider {
    polls_until_ready: u32,
    batches: Mutex<HashMap<String, PendingBatch>>,
}

struct PendingBatch {
    tests: Vec<TestDescriptor>,
    polls: u32,
}

impl Default for MockAiProvider {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MockAiProvider {
    pub fn new(polls_until_ready: u32) -> Self {
        Self {
            polls_until_ready,
            batches: Mutex::new(HashMap::new()),
        }
    }

    fn classify_one(test: &TestDescriptor) -> TestClassification {
        let digest = Sha256::digest(format!("{}::{}", test.suite, test.name));
        let domain = DOMAINS[digest[0] as usize % DOMAINS.len()];
        TestClassification {
            domain: domain.to_owned(),
            feature: test.suite.clone(),
        }
    }

    fn describe_one(language: &str, test: &TestDescriptor) -> String {
        let behavior = humanize(&test.name);
        if language.eq_ignore_ascii_case("en") || language.eq_ignore_ascii_case("english") {
            format!("Verifies that {behavior}.")
        } else {
            format!("[{language}] Verifies that {behavior}.")
        }
    }
}

#[async_trait]
impl AiProvider for MockAiProvider {
    async fn classify_tests(
        &self,
        tests: &[TestDescriptor],
    ) -> Result<Vec<TestClassification>, AiError> {
        Ok(tests.iter().map(Self::classify_one).collect())
    }

    async fn submit_classification_batch(
        &self,
        tests: &[TestDescriptor],
    ) -> Result<String, AiError> {
        let digest = Sha256::digest(
            tests
                .iter()
                .map(|test| test.name.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );
        let handle = format!("batches/mock-{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2]);
        self.batches.lock().insert(
            handle.clone(),
            PendingBatch {
                tests: tests.to_vec(),
                polls: 0,
            },
        );
        Ok(handle)
    }

    async fn poll_classification_batch(&self, handle: &str) -> Result<BatchStatus, AiError> {
        let mut batches = self.batches.lock();
        let batch = batches
            .get_mut(handle)
            .ok_or_else(|| AiError::UnknownBatch(handle.to_owned()))?;
        batch.polls += 1;
        if batch.polls <= self.polls_until_ready {
            return Ok(BatchStatus::Pending);
        }
        let labels = batch.tests.iter().map(Self::classify_one).collect();
        batches.remove(handle);
        Ok(BatchStatus::Completed(labels))
    }

    async fn rewrite_descriptions(
        &self,
        language: &str,
        tests: &[TestDescriptor],
    ) -> Result<Vec<String>, AiError> {
        Ok(tests
            .iter()
            .map(|test| Self::describe_one(language, test))
            .collect())
    }

    async fn summarize(&self, language: &str, input: &SummaryInput) -> Result<String, AiError> {
        let domains = if input.domains.is_empty() {
            "general functionality".to_owned()
        } else {
            input.domains.join(", ")
        };
        Ok(format!(
            "[{language}] {repo} ships with {count} automated tests. Coverage \
             concentrates on {domains}. The suite exercises the main user-facing \
             behaviors end to end.",
            repo = input.repo,
            count = input.test_count,
        ))
    }
}

fn humanize(name: &str) -> String {
    let stripped = name
        .strip_prefix("test_")
        .or_else(|| name.strip_prefix("Test"))
        .unwrap_or(name);
    let mut out = String::with_capacity(stripped.len() + 8);
    let mut prev_lower = false;
    for ch in stripped.chars() {
        if ch == '_' || ch == '-' {
            out.push(' ');
            prev_lower = false;
        } else if ch.is_uppercase() {
            if prev_lower {
                out.push(' ');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = true;
        }
    }
    let trimmed = out.trim().to_owned();
    if trimmed.is_empty() { name.to_owned() } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> TestDescriptor {
        TestDescriptor {
            file: "pkg/queue_test.go".to_owned(),
            suite: "queue".to_owned(),
            name: name.to_owned(),
        }
    }

    #[tokio::test]
    async fn classification_is_deterministic() {
        let provider = MockAiProvider::default();
        let tests = vec![descriptor("TestClaim"), descriptor("TestSnooze")];
        let a = provider.classify_tests(&tests).await.unwrap();
        let b = provider.classify_tests(&tests).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert!(DOMAINS.contains(&a[0].domain.as_str()));
    }

    #[tokio::test]
    async fn batch_goes_pending_then_completes() {
        let provider = MockAiProvider::new(1);
        let tests = vec![descriptor("TestClaim")];
        let handle = provider.submit_classification_batch(&tests).await.unwrap();

        assert_eq!(
            provider.poll_classification_batch(&handle).await.unwrap(),
            BatchStatus::Pending
        );
        let status = provider.poll_classification_batch(&handle).await.unwrap();
        let BatchStatus::Completed(labels) = status else {
            panic!("expected completed batch");
        };
        assert_eq!(labels.len(), 1);

        // consumed after completion
        assert!(provider.poll_classification_batch(&handle).await.is_err());
    }

    #[tokio::test]
    async fn descriptions_follow_the_language() {
        let provider = MockAiProvider::default();
        let tests = vec![descriptor("TestClaimInOrder")];
        let en = provider.rewrite_descriptions("en", &tests).await.unwrap();
        assert_eq!(en[0], "Verifies that claim in order.");
        let ja = provider.rewrite_descriptions("ja", &tests).await.unwrap();
        assert!(ja[0].starts_with("[ja] "));
    }

    #[test]
    fn humanize_splits_camel_and_snake_case() {
        assert_eq!(humanize("TestClaimInOrder"), "claim in order");
        assert_eq!(humanize("test_claim_in_order"), "claim in order");
    }
}
