//! Hosting-platform adapter: repo metadata and HEAD lookup over the REST API,
//! clone via the `git` CLI. Consumed through [`VcsClient`]; the GitHub
//! implementation and the deterministic mock are wired by the container.

pub mod github;
pub mod mock;

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum VcsError {
    /// The hosting API returned 404 for the repository. Terminal for the job.
    #[error("repository not found")]
    NotFound,

    #[error("clone: {0}")]
    Clone(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("hosting API returned an unexpected response: {0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoMetadata {
    pub id: i64,
    pub default_branch: String,
}

#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn repo_metadata(
        &self,
        owner: &str,
        repo: &str,
        token: Option<&str>,
    ) -> Result<RepoMetadata, VcsError>;

    /// Current HEAD commit SHA of the default branch.
    async fn head_sha(&self, owner: &str, repo: &str, token: Option<&str>)
    -> Result<String, VcsError>;

    /// Materialize the repository at `commit_sha` into `dest`. The caller
    /// owns `dest` and its cleanup.
    async fn clone_at(
        &self,
        owner: &str,
        repo: &str,
        commit_sha: &str,
        dest: &Path,
        token: Option<&str>,
    ) -> Result<(), VcsError>;
}
