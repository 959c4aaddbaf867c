// ABOUTME: Content-addressed cache for expensive derived artifacts keyed by repo identity
// ABOUTME: Guarantees at most one concurrent generation per key and immutable entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Artifact generation failed: {0}")]
    Generation(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache key: repository identity plus commit, with a template version for
/// artifacts whose rendering depends on one (visualization packs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub repo_url: String,
    pub commit_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_version: Option<String>,
}

impl ArtifactKey {
    /// Key for documentation-style artifacts.
    pub fn report(repo_url: impl Into<String>, commit_sha: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            commit_sha: commit_sha.into(),
            template_version: None,
        }
    }

    /// Key for visualization artifacts, versioned by template.
    pub fn visual(
        repo_url: impl Into<String>,
        commit_sha: impl Into<String>,
        template_version: impl Into<String>,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            commit_sha: commit_sha.into(),
            template_version: Some(template_version.into()),
        }
    }
}

/// An immutable cached artifact bundle plus generation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub key: ArtifactKey,
    pub bundle: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

/// In-memory artifact cache.
///
/// Entries never mutate once written; forced regeneration overwrites
/// wholesale under the same key. Concurrent `get_or_create` calls for one
/// unseen key run the generator exactly once; the rest wait for its result.
pub struct ArtifactCache {
    entries: Arc<RwLock<HashMap<ArtifactKey, Arc<Artifact>>>>,
    inflight: Arc<Mutex<HashMap<ArtifactKey, Arc<Mutex<()>>>>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch the artifact for `key`, invoking `generator` only on a miss.
    pub async fn get_or_create<F, Fut>(&self, key: ArtifactKey, generator: F) -> Result<Arc<Artifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        {
            let entries = self.entries.read().await;
            if let Some(artifact) = entries.get(&key) {
                debug!("Cache hit for {}@{}", key.repo_url, key.commit_sha);
                return Ok(Arc::clone(artifact));
            }
        }

        let key_lock = self.key_lock(&key).await;
        let _guard = key_lock.lock().await;

        // Another caller may have finished generating while we queued.
        {
            let entries = self.entries.read().await;
            if let Some(artifact) = entries.get(&key) {
                return Ok(Arc::clone(artifact));
            }
        }

        let artifact = self.generate_and_store(key.clone(), generator).await?;
        self.forget_key_lock(&key).await;
        Ok(artifact)
    }

    /// Regenerate unconditionally, overwriting any stored entry for `key`.
    pub async fn regenerate<F, Fut>(&self, key: ArtifactKey, generator: F) -> Result<Arc<Artifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        let key_lock = self.key_lock(&key).await;
        let _guard = key_lock.lock().await;

        let artifact = self.generate_and_store(key.clone(), generator).await?;
        self.forget_key_lock(&key).await;
        Ok(artifact)
    }

    /// Read-only lookup with no generation.
    pub async fn get(&self, key: &ArtifactKey) -> Option<Arc<Artifact>> {
        let entries = self.entries.read().await;
        entries.get(key).map(Arc::clone)
    }

    pub async fn contains(&self, key: &ArtifactKey) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn generate_and_store<F, Fut>(&self, key: ArtifactKey, generator: F) -> Result<Arc<Artifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value>>,
    {
        info!("Generating artifact for {}@{}", key.repo_url, key.commit_sha);
        let bundle = generator().await?;

        let artifact = Arc::new(Artifact {
            key: key.clone(),
            bundle,
            generated_at: Utc::now(),
        });

        let mut entries = self.entries.write().await;
        entries.insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    async fn key_lock(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        Arc::clone(
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn forget_key_lock(&self, key: &ArtifactKey) {
        let mut inflight = self.inflight.lock().await;
        inflight.remove(key);
    }
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new()
    }
}
