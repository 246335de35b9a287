//! [`ArtifactStore`] over a local model directory.
//!
//! Two layouts are understood under the root:
//!
//! - Hugging Face hub cache: `models--{org}--{name}/{blobs,snapshots}`. A
//!   download is complete once a snapshot holds `config.json` and no blob is
//!   still suffixed `.incomplete`.
//! - Plain checkout: `{org}/{name}/config.json` with no `.incomplete` files.

use super::{ArtifactStore, human_size};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

const INCOMPLETE_SUFFIX: &str = ".incomplete";

#[derive(Debug, Clone)]
pub struct HfCacheStore {
    root: PathBuf,
}

impl HfCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn hub_dir(&self, artifact_key: &str) -> PathBuf {
        self.root
            .join(format!("models--{}", artifact_key.replace('/', "--")))
    }

    fn plain_dir(&self, artifact_key: &str) -> PathBuf {
        self.root.join(artifact_key)
    }

    async fn locate(&self, artifact_key: &str) -> Option<PathBuf> {
        for dir in [self.hub_dir(artifact_key), self.plain_dir(artifact_key)] {
            if tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
                return Some(dir);
            }
        }
        None
    }
}

/// Sum file sizes and note whether any partial download remains.
async fn scan(dir: &Path) -> std::io::Result<(u64, bool)> {
    let mut total = 0u64;
    let mut incomplete = false;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            // symlink_metadata so snapshot links are not counted twice
            let meta = tokio::fs::symlink_metadata(entry.path()).await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
                if entry.file_name().to_string_lossy().ends_with(INCOMPLETE_SUFFIX) {
                    incomplete = true;
                }
            }
        }
    }

    Ok((total, incomplete))
}

async fn has_config(dir: &Path) -> bool {
    let snapshots = dir.join("snapshots");
    if let Ok(mut entries) = tokio::fs::read_dir(&snapshots).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            if tokio::fs::metadata(entry.path().join("config.json")).await.is_ok() {
                return true;
            }
        }
        return false;
    }
    tokio::fs::metadata(dir.join("config.json")).await.is_ok()
}

#[async_trait]
impl ArtifactStore for HfCacheStore {
    async fn is_complete(&self, artifact_key: &str) -> bool {
        let Some(dir) = self.locate(artifact_key).await else {
            debug!(artifact = %artifact_key, "Artifact not found");
            return false;
        };

        match scan(&dir).await {
            Ok((_, true)) => {
                debug!(artifact = %artifact_key, "Artifact download still in progress");
                false
            }
            Ok((_, false)) => has_config(&dir).await,
            Err(e) => {
                debug!(artifact = %artifact_key, error = %e, "Failed to scan artifact");
                false
            }
        }
    }

    async fn approx_size(&self, artifact_key: &str) -> Option<String> {
        let dir = self.locate(artifact_key).await?;
        let (bytes, _) = scan(&dir).await.ok()?;
        Some(human_size(bytes))
    }
}
