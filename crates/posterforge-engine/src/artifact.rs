use std::path::PathBuf;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::timestamp_millis;

/// Final poster persistence. Assumed to either succeed or raise a fatal
/// error; the pipeline never retries a store call.
pub trait ArtifactStore: Send + Sync {
    /// Persist the bytes and return a public reference to them.
    fn store(&self, bytes: &[u8], extension: &str) -> Result<String>;
}

/// Writes posters under a root directory and returns the file path.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn store(&self, bytes: &[u8], extension: &str) -> Result<String> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.root.join(format!(
            "poster-{}-{}.{}",
            timestamp_millis(),
            content_id(bytes),
            extension.trim_start_matches('.')
        ));
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path.to_string_lossy().to_string())
    }
}

fn content_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}
