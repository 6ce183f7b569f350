use std::env;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use posterforge_contracts::AspectRatio;

mod artifact;
mod cancel;
mod compose;
mod controller;
mod copywriter;

pub use artifact::{ArtifactStore, FsArtifactStore};
pub use cancel::CancelToken;
pub use compose::{ComposeOutput, Compositor, CANVAS_SIZE};
pub use controller::{build_image_prompt, GenerationController};
pub use copywriter::{CopyGenerator, DryrunCopywriter, OpenAiCopywriter};

/// Remote task status after normalization. Provider payloads spell these a
/// dozen ways; everything the adapter does not recognize is `Unknown` and
/// treated as still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Completed,
    Failed,
    InProgress,
    Unknown,
}

pub fn normalize_remote_status(raw: &str) -> RemoteStatus {
    let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "completed" | "complete" | "succeeded" | "success" | "done" | "finished" | "ready" => {
            RemoteStatus::Completed
        }
        "failed" | "failure" | "error" | "canceled" | "cancelled" | "rejected" | "expired" => {
            RemoteStatus::Failed
        }
        "in_progress" | "processing" | "pending" | "queued" | "starting" | "running"
        | "generating" | "waiting" | "submitted" => RemoteStatus::InProgress,
        _ => RemoteStatus::Unknown,
    }
}

/// Ephemeral handle for one submitted provider task. Owned by the adapter
/// call that created it; never persisted past the attempt.
#[derive(Debug, Clone)]
pub struct ProviderTask {
    pub provider: String,
    pub task_id: String,
    pub poll_url: Option<String>,
    pub submitted_at: Instant,
    pub poll_count: u32,
}

impl ProviderTask {
    pub fn new(provider: &str, task_id: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            task_id: task_id.into(),
            poll_url: None,
            submitted_at: Instant::now(),
            poll_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub status: RemoteStatus,
    pub payload: Value,
}

/// One remote image-generation service: submit a task, then poll it.
pub trait ImageTaskProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this service renders the requested text into the pixels.
    fn renders_text(&self) -> bool;

    fn submit(&self, prompt: &str, aspect: AspectRatio) -> Result<ProviderTask>;

    fn poll(&self, task: &ProviderTask) -> Result<PollOutcome>;
}

/// A fetchable image representation extracted from a provider payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Url(String),
    DataUri(String),
    Base64(String),
}

const IMAGE_KEY_PRIORITY: &[&str] = &[
    "url",
    "image_url",
    "image",
    "images",
    "b64_json",
    "base64",
    "data",
    "result",
    "output",
    "artifacts",
];
const IMAGE_SEARCH_DEPTH: usize = 6;

/// Locate an image reference anywhere in an untyped provider payload.
///
/// Priority keys are searched across the whole document first, so a value
/// under `images` beats an earlier-encountered unnamed string. The search
/// is depth-bounded; when nothing matches, the exhaustive scan runs last.
pub fn find_image_reference(payload: &Value) -> Option<ImageRef> {
    for key in IMAGE_KEY_PRIORITY {
        if let Some(reference) = find_under_key(payload, key, IMAGE_SEARCH_DEPTH) {
            return Some(reference);
        }
    }
    scan_for_image_string(payload, IMAGE_SEARCH_DEPTH)
}

fn find_under_key(value: &Value, key: &str, depth: usize) -> Option<ImageRef> {
    if depth == 0 {
        return None;
    }
    match value {
        Value::Object(obj) => {
            if let Some(named) = obj.get(key) {
                if let Some(reference) = scan_for_image_string(named, depth.saturating_sub(1)) {
                    return Some(reference);
                }
            }
            obj.values()
                .find_map(|child| find_under_key(child, key, depth - 1))
        }
        Value::Array(rows) => rows
            .iter()
            .find_map(|row| find_under_key(row, key, depth - 1)),
        _ => None,
    }
}

fn scan_for_image_string(value: &Value, depth: usize) -> Option<ImageRef> {
    match value {
        Value::String(raw) => classify_image_string(raw),
        Value::Array(rows) if depth > 0 => rows
            .iter()
            .find_map(|row| scan_for_image_string(row, depth - 1)),
        Value::Object(obj) if depth > 0 => obj
            .values()
            .find_map(|child| scan_for_image_string(child, depth - 1)),
        _ => None,
    }
}

fn classify_image_string(raw: &str) -> Option<ImageRef> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(ImageRef::Url(trimmed.to_string()));
    }
    if trimmed.starts_with("data:") {
        return Some(ImageRef::DataUri(trimmed.to_string()));
    }
    if looks_like_base64_image(trimmed) {
        return Some(ImageRef::Base64(trimmed.to_string()));
    }
    None
}

fn looks_like_base64_image(raw: &str) -> bool {
    raw.len() >= 96
        && raw
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'='))
}

#[derive(Debug, Clone)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// Normalize any extracted reference into raw image bytes.
pub fn fetch_image_reference(http: &HttpClient, reference: &ImageRef) -> Result<ImageBytes> {
    match reference {
        ImageRef::Url(url) => download_image(http, url),
        ImageRef::DataUri(uri) => decode_data_uri(uri),
        ImageRef::Base64(encoded) => Ok(ImageBytes {
            bytes: BASE64
                .decode(encoded.as_bytes())
                .context("image base64 decode failed")?,
            mime_type: None,
        }),
    }
}

fn download_image(http: &HttpClient, url: &str) -> Result<ImageBytes> {
    let response = http
        .get(url)
        .send()
        .with_context(|| format!("failed downloading image ({url})"))?;
    if !response.status().is_success() {
        let code = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        bail!(
            "image download failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .context("failed reading image bytes")?
        .to_vec();
    Ok(ImageBytes { bytes, mime_type })
}

fn decode_data_uri(uri: &str) -> Result<ImageBytes> {
    let body = uri
        .strip_prefix("data:")
        .ok_or_else(|| anyhow::anyhow!("not a data URI"))?;
    let (header, payload) = body
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("data URI missing payload"))?;
    if !header.ends_with(";base64") {
        bail!("unsupported data URI encoding ({header})");
    }
    let mime = header.trim_end_matches(";base64");
    Ok(ImageBytes {
        bytes: BASE64
            .decode(payload.as_bytes())
            .context("data URI base64 decode failed")?,
        mime_type: Some(mime.to_string()).filter(|value| !value.is_empty()),
    })
}

/// First status-like string in a nested payload, searched the same way as
/// image references.
pub fn find_status_string(payload: &Value, depth: usize) -> Option<String> {
    for key in ["status", "state"] {
        if let Some(found) = find_string_under_key(payload, key, depth) {
            return Some(found);
        }
    }
    None
}

fn find_string_under_key(value: &Value, key: &str, depth: usize) -> Option<String> {
    if depth == 0 {
        return None;
    }
    match value {
        Value::Object(obj) => {
            if let Some(named) = obj.get(key).and_then(Value::as_str) {
                return Some(named.to_string());
            }
            obj.values()
                .find_map(|child| find_string_under_key(child, key, depth - 1))
        }
        Value::Array(rows) => rows
            .iter()
            .find_map(|row| find_string_under_key(row, key, depth - 1)),
        _ => None,
    }
}

/// Ideogram: the preferred service. It can render readable text straight
/// into the artwork, so the compositor skips the text overlay for its
/// images.
pub struct IdeogramProvider {
    api_base: String,
    api_key: String,
    http: HttpClient,
}

impl IdeogramProvider {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let Some(api_key) = non_empty_env("IDEOGRAM_API_KEY") else {
            bail!("IDEOGRAM_API_KEY not set");
        };
        Ok(Self::new(api_base_env("IDEOGRAM_API_BASE", "https://api.ideogram.ai"), api_key))
    }

    fn aspect_label(aspect: AspectRatio) -> &'static str {
        match aspect {
            AspectRatio::Square => "ASPECT_1_1",
            AspectRatio::Portrait => "ASPECT_2_3",
            AspectRatio::Landscape => "ASPECT_3_2",
        }
    }
}

impl ImageTaskProvider for IdeogramProvider {
    fn name(&self) -> &str {
        "ideogram"
    }

    fn renders_text(&self) -> bool {
        true
    }

    fn submit(&self, prompt: &str, aspect: AspectRatio) -> Result<ProviderTask> {
        let endpoint = format!("{}/generate", self.api_base);
        let payload = json!({
            "image_request": {
                "prompt": prompt,
                "aspect_ratio": Self::aspect_label(aspect),
                "magic_prompt_option": "AUTO",
            }
        });
        let response = self
            .http
            .post(&endpoint)
            .header("Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("Ideogram request failed ({endpoint})"))?;
        let body = response_json_or_error("Ideogram", response)?;
        let task_id = body
            .get("data")
            .and_then(|data| data.get("task_id"))
            .or_else(|| body.get("task_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Ideogram response missing task id"))?;
        Ok(ProviderTask::new(self.name(), task_id))
    }

    fn poll(&self, task: &ProviderTask) -> Result<PollOutcome> {
        let endpoint = format!("{}/tasks/{}", self.api_base, task.task_id);
        let response = self
            .http
            .get(&endpoint)
            .header("Api-Key", &self.api_key)
            .send()
            .with_context(|| format!("Ideogram poll failed ({endpoint})"))?;
        let payload = response_json_or_error("Ideogram poll", response)?;
        let status = find_status_string(&payload, IMAGE_SEARCH_DEPTH)
            .map(|raw| normalize_remote_status(&raw))
            .unwrap_or(RemoteStatus::Unknown);
        Ok(PollOutcome { status, payload })
    }
}

/// Replicate: the fallback. Lower fidelity, and it cannot be trusted with
/// typography, so its submissions carry a negative prompt that keeps the
/// background clean for the compositor's overlay.
pub struct ReplicateProvider {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

const REPLICATE_NEGATIVE_PROMPT: &str =
    "text, words, letters, captions, typography, watermark, logo, signature";

impl ReplicateProvider {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let Some(api_key) =
            non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY"))
        else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        Ok(Self::new(
            api_base_env("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            api_key,
            non_empty_env("REPLICATE_MODEL").unwrap_or_else(|| "stability-ai/sdxl".to_string()),
        ))
    }
}

impl ImageTaskProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    fn renders_text(&self) -> bool {
        false
    }

    fn submit(&self, prompt: &str, aspect: AspectRatio) -> Result<ProviderTask> {
        let endpoint = format!("{}/predictions", self.api_base);
        let (width, height) = aspect.dims();
        let payload = json!({
            "model": self.model,
            "input": {
                "prompt": format!("{prompt}, poster background, clean negative space"),
                "negative_prompt": REPLICATE_NEGATIVE_PROMPT,
                "width": width,
                "height": height,
            }
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        let body = response_json_or_error("Replicate", response)?;
        let prediction_id = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Replicate response missing prediction id"))?;
        let mut task = ProviderTask::new(self.name(), prediction_id);
        task.poll_url = body
            .get("urls")
            .and_then(Value::as_object)
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(task)
    }

    fn poll(&self, task: &ProviderTask) -> Result<PollOutcome> {
        let endpoint = task
            .poll_url
            .clone()
            .unwrap_or_else(|| format!("{}/predictions/{}", self.api_base, task.task_id));
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&self.api_key)
            .send()
            .with_context(|| format!("Replicate poll failed ({endpoint})"))?;
        let payload = response_json_or_error("Replicate poll", response)?;
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(normalize_remote_status)
            .unwrap_or(RemoteStatus::Unknown);
        Ok(PollOutcome { status, payload })
    }
}

/// Offline provider: completes on the first poll with a flat-color image
/// derived from the prompt. Used by `--dryrun` and tests.
pub struct DryrunImageProvider {
    renders_text: bool,
}

impl DryrunImageProvider {
    pub fn new(renders_text: bool) -> Self {
        Self { renders_text }
    }
}

impl ImageTaskProvider for DryrunImageProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn renders_text(&self) -> bool {
        self.renders_text
    }

    fn submit(&self, prompt: &str, _aspect: AspectRatio) -> Result<ProviderTask> {
        let mut task = ProviderTask::new(self.name(), short_id(prompt.as_bytes()));
        task.poll_url = Some(prompt.to_string());
        Ok(task)
    }

    fn poll(&self, task: &ProviderTask) -> Result<PollOutcome> {
        let prompt = task.poll_url.as_deref().unwrap_or(&task.task_id);
        let (width, height) = AspectRatio::Square.dims();
        let png = dryrun_image_png(width.min(256), height.min(256), prompt)?;
        let payload = json!({
            "status": "COMPLETED",
            "data": {
                "images": [format!("data:image/png;base64,{}", BASE64.encode(png))],
            }
        });
        Ok(PollOutcome {
            status: RemoteStatus::Completed,
            payload,
        })
    }
}

pub fn dryrun_image_png(width: u32, height: u32, prompt: &str) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt);
    let mut canvas = RgbImage::new(width, height);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    canvas
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .context("failed to encode dryrun image")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_attempts: 40,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundImage {
    pub bytes: Vec<u8>,
    pub image_has_text: bool,
    pub provider: String,
    pub warnings: Vec<String>,
}

/// The provider adapter: one finished background per call, surviving the
/// failure of the preferred service.
///
/// Primary first; any primary failure (submission, remote failure, poll
/// budget) falls through to one full attempt against the fallback. Only a
/// dual failure reaches the caller. Stateless across calls.
pub struct BackgroundGenerator {
    primary: Box<dyn ImageTaskProvider>,
    fallback: Box<dyn ImageTaskProvider>,
    http: HttpClient,
    poll: PollConfig,
}

impl BackgroundGenerator {
    pub fn new(primary: Box<dyn ImageTaskProvider>, fallback: Box<dyn ImageTaskProvider>) -> Self {
        Self {
            primary,
            fallback,
            http: HttpClient::new(),
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn generate(
        &self,
        prompt: &str,
        aspect: AspectRatio,
        cancel: &CancelToken,
    ) -> Result<BackgroundImage> {
        let mut warnings = Vec::new();
        let primary_err = match self.attempt(self.primary.as_ref(), prompt, aspect, cancel) {
            Ok(bytes) => {
                return Ok(BackgroundImage {
                    bytes,
                    image_has_text: self.primary.renders_text(),
                    provider: self.primary.name().to_string(),
                    warnings,
                })
            }
            Err(err) => err,
        };
        if cancel.is_cancelled() {
            return Err(primary_err);
        }
        warnings.push(format!(
            "{} failed, retrying with {}: {}",
            self.primary.name(),
            self.fallback.name(),
            error_chain_text(&primary_err, 512)
        ));

        match self.attempt(self.fallback.as_ref(), prompt, aspect, cancel) {
            Ok(bytes) => Ok(BackgroundImage {
                bytes,
                image_has_text: self.fallback.renders_text(),
                provider: self.fallback.name().to_string(),
                warnings,
            }),
            Err(fallback_err) => bail!(
                "both image providers failed ({}: {}; {}: {})",
                self.primary.name(),
                error_chain_text(&primary_err, 512),
                self.fallback.name(),
                error_chain_text(&fallback_err, 512)
            ),
        }
    }

    /// One full submit -> poll -> fetch flow against a single provider.
    fn attempt(
        &self,
        provider: &dyn ImageTaskProvider,
        prompt: &str,
        aspect: AspectRatio,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        let mut task = provider
            .submit(prompt, aspect)
            .with_context(|| format!("{} submission failed", provider.name()))?;

        for _ in 0..self.poll.max_attempts {
            if let Some(cause) = cancel.cause() {
                bail!("{cause} while waiting on {}", provider.name());
            }
            task.poll_count += 1;
            let outcome = match provider.poll(&task) {
                Ok(outcome) => outcome,
                // A transport blip on one poll costs one attempt, nothing
                // more.
                Err(_) => {
                    cancel.sleep(self.poll.interval);
                    continue;
                }
            };
            match outcome.status {
                RemoteStatus::Completed => {
                    let reference = find_image_reference(&outcome.payload).ok_or_else(|| {
                        anyhow::anyhow!(
                            "{} task {} completed without an image reference",
                            provider.name(),
                            task.task_id
                        )
                    })?;
                    let image = fetch_image_reference(&self.http, &reference)?;
                    return Ok(image.bytes);
                }
                RemoteStatus::Failed => bail!(
                    "{} task {} reported failure",
                    provider.name(),
                    task.task_id
                ),
                RemoteStatus::InProgress | RemoteStatus::Unknown => {
                    cancel.sleep(self.poll.interval);
                }
            }
        }
        if let Some(cause) = cancel.cause() {
            bail!("{cause} while waiting on {}", provider.name());
        }
        bail!(
            "{} polling budget exhausted after {} attempts",
            provider.name(),
            self.poll.max_attempts
        )
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{label} response unreadable"))?;
    if !status.is_success() {
        bail!(
            "{label} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON: {}", truncate_text(&body, 512)))
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let kept: String = value.chars().take(max_chars).collect();
    format!("{kept}…")
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        if !parts.contains(&text) {
            parts.push(text);
        }
    }
    truncate_text(&parts.join(": "), max_chars)
}

pub(crate) fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

pub(crate) fn short_id(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}
