//! Clone-and-parse use-case: validate, resolve credentials, clone at the
//! requested commit, run the parser, and persist the inventory. Invoked by
//! the analyze worker.

pub mod workspace;

use crate::app::cleanup;
use crate::crypto::TokenCipher;
use crate::parser::{Inventory, TestParser};
use crate::repo::{AnalysisRepo, Codebase, CodebaseRepo, UserRepo};
use crate::vcs::{VcsClient, VcsError};
use crate::worker::{EnqueueConfig, JobContext, WorkError, Worker};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use workspace::Workspace;

pub const ANALYZE_QUEUE: &str = "analysis";
pub const ANALYZE_KIND: &str = "analysis:analyze";

const ANALYZE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const HOST: &str = "github.com";

const MAX_OWNER_LEN: usize = 39;
const MAX_REPO_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeArgs {
    pub owner: String,
    pub repo: String,
    pub commit_sha: String,
    /// Absent for system-originated jobs (auto-refresh).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl AnalyzeArgs {
    pub fn validate(&self) -> Result<(), AnalyzeError> {
        if !valid_repo_component(&self.owner, MAX_OWNER_LEN) {
            return Err(AnalyzeError::InvalidInput(format!(
                "owner `{}` is not a valid repository owner",
                self.owner
            )));
        }
        if !valid_repo_component(&self.repo, MAX_REPO_LEN) {
            return Err(AnalyzeError::InvalidInput(format!(
                "repo `{}` is not a valid repository name",
                self.repo
            )));
        }
        if !valid_commit_sha(&self.commit_sha) {
            return Err(AnalyzeError::InvalidInput(format!(
                "commit sha `{}` is not a full hex sha",
                self.commit_sha
            )));
        }
        if self.user_id.is_some_and(|id| id.is_nil()) {
            return Err(AnalyzeError::InvalidInput("user id is nil".to_owned()));
        }
        Ok(())
    }
}

/// `[A-Za-z0-9._-]`, bounded length, and no path-traversal shapes.
fn valid_repo_component(value: &str, max_len: usize) -> bool {
    !value.is_empty()
        && value.len() <= max_len
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && value != "."
        && value != ".."
        && !value.contains("..")
}

fn valid_commit_sha(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AnalyzeError {
    /// Terminal: the args can never become valid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Terminal: the hosting platform has no such repository.
    #[error("repository not found")]
    RepoNotFound,

    /// Terminal: an identical analysis already completed.
    #[error("analysis already completed")]
    AlreadyCompleted,

    #[error(transparent)]
    Other(#[from] crate::error::Error),
}

/// Stage-prefixed wrap; the root cause stays on the source chain.
fn wrap(
    stage: &'static str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> AnalyzeError {
    AnalyzeError::Other(anyhow::Error::new(err).context(stage).into())
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeOutcome {
    pub analysis_id: Uuid,
    pub test_count: usize,
}

pub struct AnalyzeService {
    codebases: Arc<dyn CodebaseRepo>,
    analyses: Arc<dyn AnalysisRepo>,
    users: Arc<dyn UserRepo>,
    vcs: Arc<dyn VcsClient>,
    parser: Arc<dyn TestParser>,
    cipher: Option<TokenCipher>,
}

impl AnalyzeService {
    pub fn new(
        codebases: Arc<dyn CodebaseRepo>,
        analyses: Arc<dyn AnalysisRepo>,
        users: Arc<dyn UserRepo>,
        vcs: Arc<dyn VcsClient>,
        parser: Arc<dyn TestParser>,
        cipher: Option<TokenCipher>,
    ) -> Self {
        Self {
            codebases,
            analyses,
            users,
            vcs,
            parser,
            cipher,
        }
    }

    #[instrument(skip_all, fields(repo.owner = args.owner, repo.name = args.repo, commit.sha = args.commit_sha))]
    pub async fn analyze(&self, args: &AnalyzeArgs) -> Result<AnalyzeOutcome, AnalyzeError> {
        args.validate()?;
        let token = self.host_token(args.user_id).await?;

        let codebase = self
            .codebases
            .find_or_create(HOST, &args.owner, &args.repo)
            .await?;

        if let Some(existing) = self
            .analyses
            .find_completed(codebase.id, &args.commit_sha, self.parser.version())
            .await?
        {
            debug!(analysis.id = %existing, "identical analysis already completed");
            return Err(AnalyzeError::AlreadyCompleted);
        }

        let metadata = match self
            .vcs
            .repo_metadata(&args.owner, &args.repo, token.as_deref())
            .await
        {
            Ok(metadata) => metadata,
            Err(VcsError::NotFound) => {
                self.record_codebase_failure(codebase.id).await;
                return Err(AnalyzeError::RepoNotFound);
            }
            Err(err) => return Err(wrap("repo metadata", err)),
        };
        self.codebases
            .set_external_repo_id(codebase.id, metadata.id)
            .await?;

        // Pending row first so every later failure has something to finalize.
        let record = self
            .analyses
            .create_pending(
                codebase.id,
                &metadata.default_branch,
                &args.commit_sha,
                self.parser.version(),
            )
            .await?;

        match self.execute(&codebase, record.id, args, token.as_deref()).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.record_failure(codebase.id, record.id, &err).await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        codebase: &Codebase,
        analysis_id: Uuid,
        args: &AnalyzeArgs,
        token: Option<&str>,
    ) -> Result<AnalyzeOutcome, AnalyzeError> {
        let inventory = self.clone_and_parse(args, token).await?;
        let test_count = inventory.test_count();

        let inventory_json =
            serde_json::to_value(&inventory).map_err(|err| wrap("save inventory", err))?;
        let committed_at = Utc::now();
        self.analyses
            .finalize_completed(analysis_id, &inventory_json, committed_at)
            .await
            .map_err(|err| wrap("save inventory", err))?;
        self.codebases
            .record_success(codebase.id, &args.commit_sha, self.parser.version(), committed_at)
            .await?;

        info!(
            analysis.id = %analysis_id,
            tests = test_count,
            "analysis completed"
        );
        Ok(AnalyzeOutcome {
            analysis_id,
            test_count,
        })
    }

    async fn clone_and_parse(
        &self,
        args: &AnalyzeArgs,
        token: Option<&str>,
    ) -> Result<Inventory, AnalyzeError> {
        let workspace = Workspace::create("analyze").map_err(|err| wrap("workspace", err))?;
        match self
            .vcs
            .clone_at(
                &args.owner,
                &args.repo,
                &args.commit_sha,
                workspace.path(),
                token,
            )
            .await
        {
            Ok(()) => {}
            Err(VcsError::NotFound) => return Err(AnalyzeError::RepoNotFound),
            Err(err) => return Err(wrap("clone", err)),
        }
        let inventory = self
            .parser
            .parse(workspace.path())
            .await
            .map_err(|err| wrap("parser", err))?;
        Ok(inventory)
    }

    /// Lazy, per-use token decryption.
    async fn host_token(&self, user_id: Option<Uuid>) -> Result<Option<String>, AnalyzeError> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        let Some(encrypted) = self.users.encrypted_host_token(user_id).await? else {
            return Ok(None);
        };
        let Some(cipher) = &self.cipher else {
            return Err(AnalyzeError::Other(
                anyhow::anyhow!("user {user_id} has a stored host token but no ENCRYPTION_KEY is configured")
                    .into(),
            ));
        };
        let token = cipher
            .decrypt(&encrypted)
            .map_err(|err| wrap("decrypt host token", err))?;
        Ok(Some(token))
    }

    /// Terminal failure bookkeeping on the cleanup clock: the one-line error
    /// lands on the analysis row for the UI, and the codebase failure counter
    /// feeds the refresh circuit breaker.
    async fn record_failure(&self, codebase_id: Uuid, analysis_id: Uuid, err: &AnalyzeError) {
        let message = one_line(&err.to_string());
        cleanup::write(
            "analysis failure row",
            self.analyses.finalize_failed(analysis_id, &message),
        )
        .await;
        self.record_codebase_failure(codebase_id).await;
    }

    async fn record_codebase_failure(&self, codebase_id: Uuid) {
        cleanup::write(
            "codebase failure counter",
            self.codebases.record_failure(codebase_id),
        )
        .await;
    }
}

/// Failure rows carry a single display-ready line.
fn one_line(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default();
    if line.len() <= 300 {
        return line.to_owned();
    }
    let mut end = 300;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}

pub struct AnalyzeWorker {
    service: Arc<AnalyzeService>,
}

impl AnalyzeWorker {
    pub fn new(service: Arc<AnalyzeService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Worker for AnalyzeWorker {
    type Args = AnalyzeArgs;

    fn kind() -> String {
        ANALYZE_KIND.to_owned()
    }

    fn enqueue_config() -> EnqueueConfig {
        EnqueueConfig::builder().queue(ANALYZE_QUEUE).build()
    }

    fn unique_key(args: &Self::Args) -> String {
        format!("{}/{}@{}", args.owner, args.repo, args.commit_sha)
    }

    fn timeout(&self, _args: &Self::Args) -> Duration {
        ANALYZE_TIMEOUT
    }

    async fn handle(&self, job: &JobContext, args: Self::Args) -> Result<(), WorkError> {
        match self.service.analyze(&args).await {
            Ok(outcome) => {
                info!(
                    job.id = %job.job_id,
                    analysis.id = %outcome.analysis_id,
                    tests = outcome.test_count,
                    "analyze job complete"
                );
                Ok(())
            }
            Err(
                err @ (AnalyzeError::InvalidInput(_)
                | AnalyzeError::RepoNotFound
                | AnalyzeError::AlreadyCompleted),
            ) => Err(WorkError::cancel(err)),
            Err(err) => Err(WorkError::retryable(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::FsTestScanner;
    use crate::repo::{
        AnalysisRecord, AnalysisState, MockAnalysisRepo, MockCodebaseRepo, MockUserRepo,
    };
    use crate::vcs::mock::{MISSING_OWNER, MockVcs};
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use rstest::rstest;

    const SHA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn args(owner: &str, repo: &str, sha: &str) -> AnalyzeArgs {
        AnalyzeArgs {
            owner: owner.to_owned(),
            repo: repo.to_owned(),
            commit_sha: sha.to_owned(),
            user_id: None,
        }
    }

    #[rstest]
    #[case("octocat", "Hello-World", SHA, true)]
    #[case("a.b-c_d", "x.y", SHA, true)]
    #[case("", "repo", SHA, false)]
    #[case("owner", "", SHA, false)]
    #[case("own/er", "repo", SHA, false)]
    #[case("owner", "re po", SHA, false)]
    #[case(".", "repo", SHA, false)]
    #[case("..", "repo", SHA, false)]
    #[case("owner", "a..b", SHA, false)]
    #[case("owner", "repo", "", false)]
    #[case("owner", "repo", "abc", false)]
    #[case("owner", "repo", "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz", false)]
    fn arg_validation(
        #[case] owner: &str,
        #[case] repo: &str,
        #[case] sha: &str,
        #[case] ok: bool,
    ) {
        assert_eq!(args(owner, repo, sha).validate().is_ok(), ok);
    }

    #[test]
    fn owner_and_repo_length_limits() {
        assert!(args(&"a".repeat(39), "repo", SHA).validate().is_ok());
        assert!(args(&"a".repeat(40), "repo", SHA).validate().is_err());
        assert!(args("owner", &"r".repeat(100), SHA).validate().is_ok());
        assert!(args("owner", &"r".repeat(101), SHA).validate().is_err());
    }

    #[test]
    fn nil_user_id_is_invalid() {
        let mut invalid = args("octocat", "Hello-World", SHA);
        invalid.user_id = Some(Uuid::nil());
        assert!(matches!(
            invalid.validate(),
            Err(AnalyzeError::InvalidInput(_))
        ));
    }

    #[test]
    fn one_line_truncates_and_strips_newlines() {
        assert_eq!(one_line("clone: boom\nstack trace"), "clone: boom");
        let long = "x".repeat(400);
        assert!(one_line(&long).len() < 310);
    }

    fn codebase() -> Codebase {
        Codebase {
            id: Uuid::new_v4(),
            host: HOST.to_owned(),
            owner: "octocat".to_owned(),
            name: "Hello-World".to_owned(),
            external_repo_id: None,
            last_commit_sha: None,
            last_completed_at: None,
            last_viewed_at: Utc::now(),
            consecutive_failures: 0,
            last_parser_version: None,
        }
    }

    fn pending_record(codebase_id: Uuid) -> AnalysisRecord {
        AnalysisRecord {
            id: Uuid::new_v4(),
            codebase_id,
            branch: "main".to_owned(),
            commit_sha: SHA.to_owned(),
            parser_version: 1,
            state: AnalysisState::Pending,
            error_text: None,
            inventory: None,
            committed_at: None,
        }
    }

    fn service(
        codebases: MockCodebaseRepo,
        analyses: MockAnalysisRepo,
        users: MockUserRepo,
        cipher: Option<TokenCipher>,
    ) -> AnalyzeService {
        AnalyzeService::new(
            Arc::new(codebases),
            Arc::new(analyses),
            Arc::new(users),
            Arc::new(MockVcs),
            Arc::new(FsTestScanner),
            cipher,
        )
    }

    #[tokio::test]
    async fn happy_path_persists_inventory_and_resets_failures() {
        let cb = codebase();
        let record = pending_record(cb.id);
        let record_id = record.id;

        let mut codebases = MockCodebaseRepo::new();
        {
            let cb = cb.clone();
            codebases
                .expect_find_or_create()
                .returning(move |_, _, _| Ok(cb.clone()));
        }
        codebases
            .expect_set_external_repo_id()
            .times(1)
            .returning(|_, _| Ok(()));
        codebases
            .expect_record_success()
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut analyses = MockAnalysisRepo::new();
        analyses
            .expect_find_completed()
            .returning(|_, _, _| Ok(None));
        {
            let record = record.clone();
            analyses
                .expect_create_pending()
                .times(1)
                .returning(move |_, _, _, _| Ok(record.clone()));
        }
        analyses
            .expect_finalize_completed()
            .times(1)
            .returning(|_, inventory, _| {
                assert!(inventory.get("files").is_some());
                Ok(())
            });

        let service = service(codebases, analyses, MockUserRepo::new(), None);
        let outcome = service
            .analyze(&args("octocat", "Hello-World", SHA))
            .await
            .unwrap();

        assert_eq!(outcome.analysis_id, record_id);
        // The mock VCS fixture tree carries 2 go tests + 2 js tests.
        assert_eq!(outcome.test_count, 4);
    }

    #[tokio::test]
    async fn duplicate_work_is_detected_before_cloning() {
        let cb = codebase();
        let mut codebases = MockCodebaseRepo::new();
        {
            let cb = cb.clone();
            codebases
                .expect_find_or_create()
                .returning(move |_, _, _| Ok(cb.clone()));
        }

        let mut analyses = MockAnalysisRepo::new();
        analyses
            .expect_find_completed()
            .returning(|_, _, _| Ok(Some(Uuid::new_v4())));
        analyses.expect_create_pending().never();

        let service = service(codebases, analyses, MockUserRepo::new(), None);
        let err = service
            .analyze(&args("octocat", "Hello-World", SHA))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::AlreadyCompleted));
    }

    #[tokio::test]
    async fn missing_repo_records_a_terminal_failure() {
        let cb = codebase();
        let mut codebases = MockCodebaseRepo::new();
        {
            let cb = cb.clone();
            codebases
                .expect_find_or_create()
                .returning(move |_, _, _| Ok(cb.clone()));
        }
        codebases
            .expect_record_failure()
            .times(1)
            .returning(|_| Ok(()));

        let mut analyses = MockAnalysisRepo::new();
        analyses
            .expect_find_completed()
            .returning(|_, _, _| Ok(None));
        analyses.expect_create_pending().never();

        let service = service(codebases, analyses, MockUserRepo::new(), None);
        let err = service
            .analyze(&args(MISSING_OWNER, "gone", SHA))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzeError::RepoNotFound));
    }

    #[tokio::test]
    async fn stored_token_is_decrypted_lazily() {
        let key = BASE64.encode([9u8; 32]);
        let cipher = TokenCipher::from_base64_key(&key).unwrap();
        let encrypted = cipher.encrypt("ghp_secret").unwrap();

        let user_id = Uuid::new_v4();
        let mut users = MockUserRepo::new();
        users
            .expect_encrypted_host_token()
            .times(1)
            .returning(move |_| Ok(Some(encrypted.clone())));

        let cb = codebase();
        let record = pending_record(cb.id);
        let mut codebases = MockCodebaseRepo::new();
        {
            let cb = cb.clone();
            codebases
                .expect_find_or_create()
                .returning(move |_, _, _| Ok(cb.clone()));
        }
        codebases
            .expect_set_external_repo_id()
            .returning(|_, _| Ok(()));
        codebases
            .expect_record_success()
            .returning(|_, _, _, _| Ok(()));

        let mut analyses = MockAnalysisRepo::new();
        analyses
            .expect_find_completed()
            .returning(|_, _, _| Ok(None));
        analyses
            .expect_create_pending()
            .returning(move |_, _, _, _| Ok(record.clone()));
        analyses
            .expect_finalize_completed()
            .returning(|_, _, _| Ok(()));

        let service = service(codebases, analyses, users, Some(cipher));
        let mut analyze_args = args("octocat", "Hello-World", SHA);
        analyze_args.user_id = Some(user_id);
        service.analyze(&analyze_args).await.unwrap();
    }

    #[tokio::test]
    async fn stored_token_without_key_is_an_error() {
        let user_id = Uuid::new_v4();
        let mut users = MockUserRepo::new();
        users
            .expect_encrypted_host_token()
            .returning(|_| Ok(Some(vec![1, 2, 3])));

        let service = service(
            MockCodebaseRepo::new(),
            MockAnalysisRepo::new(),
            users,
            None,
        );
        let mut analyze_args = args("octocat", "Hello-World", SHA);
        analyze_args.user_id = Some(user_id);
        let err = service.analyze(&analyze_args).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::Other(_)));
    }
}
