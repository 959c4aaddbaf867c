// ABOUTME: Reference repository fetcher shelling out to the git CLI
// ABOUTME: Produces normalized snapshots and classifies failures into typed fetch errors

use async_trait::async_trait;
use drydock_cases::{FetchError, RepoFetcher, RepoSnapshot};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

/// Clones repositories into per-attempt directories under a scoped workdir.
pub struct GitFetcher {
    workdir: PathBuf,
}

impl GitFetcher {
    pub fn new(workdir: PathBuf) -> Self {
        Self { workdir }
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(
        &self,
        repo_url: &str,
        git_ref: Option<&str>,
    ) -> Result<RepoSnapshot, FetchError> {
        let target = self
            .workdir
            .join("clones")
            .join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| FetchError::GitCloneFailed(e.to_string()))?;

        info!("Cloning {} into {}", repo_url, target.display());

        let mut command = Command::new("git");
        command.arg("clone").arg("--depth").arg("1");
        if let Some(reference) = git_ref {
            command.arg("--branch").arg(reference);
        }
        command.arg(repo_url).arg(&target);

        let output = command
            .output()
            .await
            .map_err(|e| FetchError::GitCloneFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(classify_failure(&stderr));
        }

        let commit = Command::new("git")
            .arg("-C")
            .arg(&target)
            .arg("rev-parse")
            .arg("HEAD")
            .output()
            .await
            .map_err(|e| FetchError::GitCloneFailed(e.to_string()))?;
        if !commit.status.success() {
            return Err(FetchError::GitCloneFailed(
                String::from_utf8_lossy(&commit.stderr).to_string(),
            ));
        }
        let commit_sha = String::from_utf8_lossy(&commit.stdout).trim().to_string();

        let default_branch = Command::new("git")
            .arg("-C")
            .arg(&target)
            .arg("symbolic-ref")
            .arg("--short")
            .arg("HEAD")
            .output()
            .await
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string());

        debug!("Resolved {} to {}", repo_url, commit_sha);
        Ok(RepoSnapshot {
            root: target,
            commit_sha,
            default_branch,
        })
    }
}

/// Map git's stderr onto the typed fetch failure taxonomy.
fn classify_failure(stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_string();

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        FetchError::GithubRateLimit(message)
    } else if lower.contains("git-lfs") || lower.contains("lfs") {
        FetchError::LfsFailed(message)
    } else if lower.contains("submodule") {
        FetchError::SubmoduleFailed(message)
    } else {
        FetchError::GitCloneFailed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_failure("fatal: unable to access: The requested URL returned error: 429 Too Many Requests");
        assert!(matches!(err, FetchError::GithubRateLimit(_)));
    }

    #[test]
    fn test_classify_lfs() {
        let err = classify_failure("error: external filter 'git-lfs filter-process' failed");
        assert!(matches!(err, FetchError::LfsFailed(_)));
    }

    #[test]
    fn test_classify_submodule() {
        let err = classify_failure("fatal: clone of 'x' into submodule path 'y' failed");
        assert!(matches!(err, FetchError::SubmoduleFailed(_)));
    }

    #[test]
    fn test_classify_default() {
        let err = classify_failure("fatal: repository 'https://example.com/x.git' not found");
        assert!(matches!(err, FetchError::GitCloneFailed(_)));
    }

    #[tokio::test]
    async fn test_fetch_local_repository() {
        // Skip silently when git is unavailable in the environment.
        if Command::new("git").arg("--version").output().await.is_err() {
            return;
        }

        let origin = tempfile::TempDir::new().unwrap();
        let setup = [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ];
        for args in setup {
            let ok = Command::new("git")
                .arg("-C")
                .arg(origin.path())
                .args(&args)
                .output()
                .await
                .unwrap();
            assert!(ok.status.success());
        }
        std::fs::write(origin.path().join("README.md"), "hello\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "init"]] {
            let ok = Command::new("git")
                .arg("-C")
                .arg(origin.path())
                .args(&args)
                .output()
                .await
                .unwrap();
            assert!(ok.status.success());
        }

        let workdir = tempfile::TempDir::new().unwrap();
        let fetcher = GitFetcher::new(workdir.path().to_path_buf());
        let snapshot = fetcher
            .fetch(&format!("file://{}", origin.path().display()), None)
            .await
            .unwrap();

        assert_eq!(snapshot.commit_sha.len(), 40);
        assert!(snapshot.root.join("README.md").exists());
    }
}
