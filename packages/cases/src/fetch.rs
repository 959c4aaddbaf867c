use crate::case::ErrorCode;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Typed failures from the external repository-fetch collaborator.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Git clone failed: {0}")]
    GitCloneFailed(String),

    #[error("GitHub rate limit hit: {0}")]
    GithubRateLimit(String),

    #[error("Git LFS fetch failed: {0}")]
    LfsFailed(String),

    #[error("Submodule fetch failed: {0}")]
    SubmoduleFailed(String),
}

impl FetchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            FetchError::GitCloneFailed(_) => ErrorCode::GitCloneFailed,
            FetchError::GithubRateLimit(_) => ErrorCode::GithubRateLimit,
            FetchError::LfsFailed(_) => ErrorCode::LfsFailed,
            FetchError::SubmoduleFailed(_) => ErrorCode::SubmoduleFailed,
        }
    }
}

/// Normalized snapshot returned by the fetch collaborator.
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    /// Filesystem root of the checked-out tree.
    pub root: PathBuf,
    /// Commit the requested ref resolved to.
    pub commit_sha: String,
    pub default_branch: Option<String>,
}

/// External collaborator that materializes a repository snapshot.
///
/// The engine treats this as opaque: it hands over `repo_url` and an optional
/// ref and receives a filesystem view plus resolved commit, or one of the
/// typed fetch failures.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(
        &self,
        repo_url: &str,
        git_ref: Option<&str>,
    ) -> std::result::Result<RepoSnapshot, FetchError>;
}
