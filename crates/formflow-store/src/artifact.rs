//! Filesystem-backed chunk artifact storage

use crate::StoreError;
use async_trait::async_trait;
use formflow_domain::{ArtifactRef, ArtifactStore, ReadableRef};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Distinguishes temp files of concurrent writers to the same name
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Artifact store that writes chunk files under a root directory
///
/// Artifacts are addressed by their sanitized name, so storing the same
/// name twice replaces the file. Writes go to a temp file first and are
/// renamed into place, which keeps readers from seeing partial files.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        let name = sanitize_name(artifact.as_str())?;
        if name != artifact.as_str() {
            return Err(StoreError::InvalidData(format!(
                "Not an artifact of this store: {}",
                artifact
            )));
        }
        Ok(self.root.join(name))
    }
}

/// Reduce a suggested name to a single safe path component
fn sanitize_name(suggested: &str) -> Result<String, StoreError> {
    let name: String = suggested
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();

    if name.is_empty() || name == "." || name == ".." {
        return Err(StoreError::InvalidData(format!(
            "Unusable artifact name: {:?}",
            suggested
        )));
    }
    Ok(name)
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    type Error = StoreError;

    async fn store(&self, bytes: &[u8], suggested_name: &str) -> Result<ArtifactRef, Self::Error> {
        let name = sanitize_name(suggested_name)?;
        let target = self.root.join(&name);
        let temp = self.root.join(format!(
            ".{}.tmp-{}",
            name,
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&temp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(artifact = %name, bytes = bytes.len(), "Stored artifact");
        Ok(ArtifactRef::new(name))
    }

    async fn readable_ref(
        &self,
        artifact: &ArtifactRef,
        ttl: Duration,
    ) -> Result<ReadableRef, Self::Error> {
        let path = self.path_for(artifact)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(artifact.to_string()));
        }

        let expires_at = SystemTime::now() + ttl;
        let expires_unix = expires_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Ok(ReadableRef {
            locator: format!("file://{}?expires={}", path.display(), expires_unix),
            expires_at,
        })
    }
}
