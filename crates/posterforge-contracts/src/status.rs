use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::jobs::{now_utc_iso, JobStatus};

/// Live progress mirror for one job.
///
/// This is a hint channel for clients waiting on a poster, never the
/// authority on the outcome: the durable job record wins whenever the two
/// disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: String,
    pub updated_at: String,
}

impl StatusUpdate {
    pub fn new(status: JobStatus, progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            progress_percent,
            message: message.into(),
            updated_at: now_utc_iso(),
        }
    }
}

/// Last-writer-wins progress channel keyed by (owner, job id).
pub trait StatusStore: Send + Sync {
    /// Idempotent overwrite; no history is kept.
    fn set_status(&self, owner_id: &str, job_id: &str, update: &StatusUpdate) -> Result<()>;

    /// Advisory cleanup once the client has consumed the terminal state.
    fn clear(&self, owner_id: &str, job_id: &str) -> Result<()>;

    fn read(&self, owner_id: &str, job_id: &str) -> Result<Option<StatusUpdate>>;
}

/// One compact JSON file per key. Writes replace the whole file, so the
/// last writer wins and readers always see a complete record.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    root: PathBuf,
}

impl FileStatusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, owner_id: &str, job_id: &str) -> PathBuf {
        self.root
            .join(owner_id)
            .join(format!("{job_id}.status.json"))
    }
}

impl StatusStore for FileStatusStore {
    fn set_status(&self, owner_id: &str, job_id: &str, update: &StatusUpdate) -> Result<()> {
        let path = self.path(owner_id, job_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string(update)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    fn clear(&self, owner_id: &str, job_id: &str) -> Result<()> {
        let path = self.path(owner_id, job_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to clear {}", path.display())),
        }
    }

    fn read(&self, owner_id: &str, job_id: &str) -> Result<Option<StatusUpdate>> {
        read_status(&self.path(owner_id, job_id))
    }
}

fn read_status(path: &Path) -> Result<Option<StatusUpdate>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    Ok(Some(serde_json::from_str(&raw).with_context(|| {
        format!("status record unreadable ({})", path.display())
    })?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_status_overwrites_last_writer_wins() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FileStatusStore::new(temp.path());

        store.set_status(
            "owner-1",
            "job-1",
            &StatusUpdate::new(JobStatus::GeneratingCopy, 10, "writing copy"),
        )?;
        store.set_status(
            "owner-1",
            "job-1",
            &StatusUpdate::new(JobStatus::GeneratingImage, 35, "generating artwork"),
        )?;

        let current = store.read("owner-1", "job-1")?.expect("status present");
        assert_eq!(current.status, JobStatus::GeneratingImage);
        assert_eq!(current.progress_percent, 35);
        assert_eq!(current.message, "generating artwork");
        Ok(())
    }

    #[test]
    fn keys_are_isolated_per_owner_and_job() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FileStatusStore::new(temp.path());

        store.set_status(
            "owner-1",
            "job-1",
            &StatusUpdate::new(JobStatus::Compositing, 70, "building poster"),
        )?;
        store.set_status(
            "owner-2",
            "job-1",
            &StatusUpdate::new(JobStatus::Complete, 100, "done"),
        )?;

        let first = store.read("owner-1", "job-1")?.expect("status present");
        assert_eq!(first.status, JobStatus::Compositing);
        assert!(store.read("owner-1", "job-2")?.is_none());
        Ok(())
    }

    #[test]
    fn clear_removes_the_record_and_is_idempotent() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = FileStatusStore::new(temp.path());

        store.set_status(
            "owner-1",
            "job-1",
            &StatusUpdate::new(JobStatus::Complete, 100, "done"),
        )?;
        store.clear("owner-1", "job-1")?;
        assert!(store.read("owner-1", "job-1")?.is_none());

        // Clearing a missing record is not an error.
        store.clear("owner-1", "job-1")?;
        store.clear("owner-9", "job-9")?;
        Ok(())
    }
}
