use anyhow::{bail, Context, Result};

use posterforge_contracts::{
    AspectRatio, BrandIdentity, ContentBrief, GenerationJob, JobStatus, JobStore, PosterCopy,
    StatusStore, StatusUpdate,
};

use crate::{
    error_chain_text, ArtifactStore, BackgroundGenerator, CancelToken, Compositor, CopyGenerator,
};

/// Drives one job through its state machine.
///
/// Every transition is committed to the durable job record and mirrored to
/// the status store. The record is authoritative; the mirror is advisory
/// and its failures never fail the job. Each stage gets exactly one
/// attempt — the provider fallback inside the background generator is
/// invisible here.
pub struct GenerationController {
    jobs: JobStore,
    status: Box<dyn StatusStore>,
    copywriter: Box<dyn CopyGenerator>,
    backgrounds: BackgroundGenerator,
    compositor: Compositor,
    artifacts: Box<dyn ArtifactStore>,
}

impl GenerationController {
    pub fn new(
        jobs: JobStore,
        status: Box<dyn StatusStore>,
        copywriter: Box<dyn CopyGenerator>,
        backgrounds: BackgroundGenerator,
        compositor: Compositor,
        artifacts: Box<dyn ArtifactStore>,
    ) -> Self {
        Self {
            jobs,
            status,
            copywriter,
            backgrounds,
            compositor,
            artifacts,
        }
    }

    /// Create the durable record and seed the status channel. Returns
    /// immediately; the caller runs the pipeline separately.
    pub fn create_job(
        &self,
        owner_id: &str,
        brand: BrandIdentity,
        brief: ContentBrief,
        aspect: AspectRatio,
    ) -> Result<GenerationJob> {
        let job = GenerationJob::new(owner_id, brand, brief, aspect);
        self.jobs.save(&job)?;
        self.mirror(&job);
        Ok(job)
    }

    /// Run one job to a terminal state. Collaborator errors are absorbed
    /// here: the returned job is `failed` with a displayable message, and
    /// only record-store write failures propagate as errors.
    pub fn run(&self, owner_id: &str, job_id: &str, cancel: &CancelToken) -> Result<GenerationJob> {
        let mut job = self.jobs.load(owner_id, job_id)?;
        if job.status.is_terminal() {
            bail!(
                "job {} is already {}; retry by creating a new job",
                job.job_id,
                job.status.label()
            );
        }
        if let Err(err) = self.execute(&mut job, cancel) {
            let detail = error_chain_text(&err, 2048);
            let message = match cancel.cause() {
                Some(cause) => format!("generation {cause}"),
                None => err.to_string(),
            };
            job.fail(&message, &detail)?;
            self.jobs.save(&job)?;
            self.mirror(&job);
        }
        Ok(job)
    }

    fn execute(&self, job: &mut GenerationJob, cancel: &CancelToken) -> Result<()> {
        self.advance(job, JobStatus::GeneratingCopy, 10, "writing copy")?;
        ensure_live(cancel, "copy generation")?;
        let copy = self
            .copywriter
            .generate_copy(&job.brand, &job.brief)
            .context("copy generation failed")?;
        job.copy = Some(copy.clone());

        self.advance(job, JobStatus::GeneratingImage, 35, "generating artwork")?;
        ensure_live(cancel, "image generation")?;
        let prompt = build_image_prompt(&job.brand, &job.brief, &copy);
        let background = self
            .backgrounds
            .generate(&prompt, job.aspect, cancel)
            .context("background generation failed")?;
        for warning in &background.warnings {
            job.push_warning(warning.clone());
        }
        job.set_image_provenance(&background.provider, background.image_has_text);

        self.advance(job, JobStatus::Compositing, 70, "building poster")?;
        ensure_live(cancel, "composition")?;
        let poster = self
            .compositor
            .compose(
                &background.bytes,
                &job.brand,
                &copy,
                background.image_has_text,
            )
            .context("poster composition failed")?;
        for warning in &poster.warnings {
            job.push_warning(warning.clone());
        }

        self.advance(job, JobStatus::Uploading, 90, "saving")?;
        let reference = self
            .artifacts
            .store(&poster.bytes, "png")
            .context("artifact persistence failed")?;
        job.artifact = Some(reference);

        self.advance(job, JobStatus::Complete, 100, "poster ready")?;
        Ok(())
    }

    fn advance(
        &self,
        job: &mut GenerationJob,
        status: JobStatus,
        progress: u8,
        message: &str,
    ) -> Result<()> {
        job.advance(status, progress, message)?;
        self.jobs.save(job)?;
        self.mirror(job);
        Ok(())
    }

    fn mirror(&self, job: &GenerationJob) {
        // Advisory channel: a failed mirror write never fails the job.
        let update = StatusUpdate::new(job.status, job.progress_percent, job.message.clone());
        let _ = self
            .status
            .set_status(&job.owner_id, &job.job_id, &update);
    }
}

fn ensure_live(cancel: &CancelToken, stage: &str) -> Result<()> {
    if let Some(cause) = cancel.cause() {
        bail!("{cause} before {stage}");
    }
    Ok(())
}

/// Image prompt derived from the brief, the brand, and the generated copy.
/// The primary provider renders the headline; the fallback strips text via
/// its own negative prompt.
pub fn build_image_prompt(brand: &BrandIdentity, brief: &ContentBrief, copy: &PosterCopy) -> String {
    let mut parts = vec![format!("{} poster background", brief.theme)];
    if let Some(occasion) = brief.occasion.as_deref().filter(|value| !value.is_empty()) {
        parts.push(occasion.to_string());
    }
    parts.push(format!("for {}", brand.name));
    if let Some(tone) = brand.tone.as_deref().filter(|value| !value.is_empty()) {
        parts.push(format!("{tone} mood"));
    }
    parts.push(format!("headline text: \"{}\"", copy.headline));
    if let Some(instructions) = brief
        .instructions
        .as_deref()
        .filter(|value| !value.is_empty())
    {
        parts.push(instructions.to_string());
    }
    parts.push("high quality social media poster, no watermark".to_string());
    parts.join(", ")
}
