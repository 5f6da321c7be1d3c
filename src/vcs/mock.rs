use crate::vcs::{RepoMetadata, VcsClient, VcsError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Deterministic in-process stand-in for the hosting platform, used when
/// `MOCK_MODE` is set and by tests. SHAs are a pure function of
/// `owner/repo`, and clones materialize a tiny fixture tree with a couple of
/// test files so the analyze pipeline has something to scan.
#[derive(Debug, Clone, Default)]
pub struct MockVcs;

/// Owner that the mock treats as nonexistent, for exercising the 404 path.
pub const MISSING_OWNER: &str = "missing";

impl MockVcs {
    fn check_exists(owner: &str) -> Result<(), VcsError> {
        if owner == MISSING_OWNER {
            return Err(VcsError::NotFound);
        }
        Ok(())
    }

    pub fn sha_for(owner: &str, repo: &str) -> String {
        let digest = Sha256::digest(format!("{owner}/{repo}"));
        digest
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<String>()[..40]
            .to_owned()
    }
}

#[async_trait]
impl VcsClient for MockVcs {
    async fn repo_metadata(
        &self,
        owner: &str,
        repo: &str,
        _token: Option<&str>,
    ) -> Result<RepoMetadata, VcsError> {
        Self::check_exists(owner)?;
        let digest = Sha256::digest(format!("{owner}/{repo}"));
        let id = i64::from(u32::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3],
        ]));
        Ok(RepoMetadata {
            id,
            default_branch: "main".to_owned(),
        })
    }

    async fn head_sha(
        &self,
        owner: &str,
        repo: &str,
        _token: Option<&str>,
    ) -> Result<String, VcsError> {
        Self::check_exists(owner)?;
        Ok(Self::sha_for(owner, repo))
    }

    async fn clone_at(
        &self,
        owner: &str,
        repo: &str,
        _commit_sha: &str,
        dest: &Path,
        _token: Option<&str>,
    ) -> Result<(), VcsError> {
        Self::check_exists(owner)?;
        let pkg = dest.join("internal");
        tokio::fs::create_dir_all(&pkg).await?;
        tokio::fs::write(
            pkg.join("queue_test.go"),
            "package internal\n\nfunc TestEnqueueOnce(t *testing.T) {}\nfunc TestClaimInOrder(t *testing.T) {}\n",
        )
        .await?;
        tokio::fs::write(
            dest.join("app.test.js"),
            "it(\"renders the dashboard\", () => {});\nit(\"paginates results\", () => {});\n",
        )
        .await?;
        Ok(())
    }
}
