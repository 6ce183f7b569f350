use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::brand::{AspectRatio, BrandIdentity, ContentBrief, PosterCopy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    GeneratingCopy,
    GeneratingImage,
    Compositing,
    Uploading,
    Complete,
    Failed,
}

impl JobStatus {
    /// Position in the forward chain. `Failed` is absorbing, not ranked.
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::GeneratingCopy => 1,
            Self::GeneratingImage => 2,
            Self::Compositing => 3,
            Self::Uploading => 4,
            Self::Complete => 5,
            Self::Failed => u8::MAX,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::GeneratingCopy => "generating_copy",
            Self::GeneratingImage => "generating_image",
            Self::Compositing => "compositing",
            Self::Uploading => "uploading",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Durable record for one poster generation job.
///
/// Mutated exclusively by the generation controller; the status channel is
/// a best-effort mirror of the `status`/`progress_percent`/`message`
/// fields, never the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub owner_id: String,
    pub job_id: String,
    pub brand: BrandIdentity,
    pub brief: ContentBrief,
    pub aspect: AspectRatio,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy: Option<PosterCopy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_has_text: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GenerationJob {
    pub fn new(
        owner_id: impl Into<String>,
        brand: BrandIdentity,
        brief: ContentBrief,
        aspect: AspectRatio,
    ) -> Self {
        let now = now_utc_iso();
        Self {
            owner_id: owner_id.into(),
            job_id: Uuid::new_v4().to_string(),
            brand,
            brief,
            aspect,
            status: JobStatus::Pending,
            progress_percent: 0,
            message: "queued".to_string(),
            error_detail: None,
            copy: None,
            artifact: None,
            image_has_text: None,
            provider: None,
            warnings: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Move the job forward through the state chain.
    ///
    /// Transitions never go backward and never leave a terminal state;
    /// progress is clamped so it cannot decrease.
    pub fn advance(&mut self, status: JobStatus, progress_percent: u8, message: &str) -> Result<()> {
        if self.status.is_terminal() {
            bail!(
                "job {} already terminal ({}), cannot move to {}",
                self.job_id,
                self.status.label(),
                status.label()
            );
        }
        if status == JobStatus::Failed {
            bail!("use fail() to mark a job failed");
        }
        if status.rank() <= self.status.rank() {
            bail!(
                "illegal transition {} -> {} for job {}",
                self.status.label(),
                status.label(),
                self.job_id
            );
        }
        self.status = status;
        self.progress_percent = self.progress_percent.max(progress_percent.min(100));
        self.message = message.to_string();
        self.updated_at = now_utc_iso();
        Ok(())
    }

    /// Absorb the job into `failed` with a displayable message and the full
    /// error detail. No-op transitions out of a terminal state are refused.
    pub fn fail(&mut self, message: &str, detail: &str) -> Result<()> {
        if self.status.is_terminal() {
            bail!(
                "job {} already terminal ({}), cannot fail",
                self.job_id,
                self.status.label()
            );
        }
        self.status = JobStatus::Failed;
        self.message = message.to_string();
        self.error_detail = Some(detail.to_string());
        self.updated_at = now_utc_iso();
        Ok(())
    }

    /// Record which provider won and whether it rendered text into the
    /// pixels. Set once; later calls are ignored.
    pub fn set_image_provenance(&mut self, provider: &str, image_has_text: bool) {
        if self.image_has_text.is_none() {
            self.image_has_text = Some(image_has_text);
            self.provider = Some(provider.to_string());
        }
    }

    pub fn push_warning(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

/// One pretty-printed JSON file per (owner, job id) under a root directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, owner_id: &str, job_id: &str) -> PathBuf {
        self.root.join(owner_id).join(format!("{job_id}.json"))
    }

    pub fn save(&self, job: &GenerationJob) -> Result<()> {
        let path = self.path(&job.owner_id, &job.job_id);
        write_json(&path, serde_json::to_value(job)?)
    }

    pub fn load(&self, owner_id: &str, job_id: &str) -> Result<GenerationJob> {
        let path = self.path(owner_id, job_id);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("job record not found ({})", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("job record unreadable ({})", path.display()))
    }

    pub fn exists(&self, owner_id: &str, job_id: &str) -> bool {
        self.path(owner_id, job_id).exists()
    }
}

fn write_json(path: &Path, payload: serde_json::Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
