use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use posterforge_contracts::{BrandIdentity, ContentBrief, PosterCopy};

use crate::{api_base_env, non_empty_env, response_json_or_error};

/// Single-call marketing copy collaborator. No retry contract is owed here;
/// a failure is a plain error the controller maps to the failed state.
pub trait CopyGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate_copy(&self, brand: &BrandIdentity, brief: &ContentBrief) -> Result<PosterCopy>;
}

pub struct OpenAiCopywriter {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl OpenAiCopywriter {
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
        let Some(api_key) = non_empty_env("OPENAI_API_KEY") else {
            bail!("OPENAI_API_KEY not set");
        };
        Ok(Self::new(
            api_base_env("OPENAI_API_BASE", "https://api.openai.com/v1"),
            api_key,
            non_empty_env("POSTERFORGE_COPY_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
        ))
    }

    fn user_prompt(brand: &BrandIdentity, brief: &ContentBrief) -> String {
        let mut lines = vec![
            format!("Brand: {}", brand.name),
            format!("Theme: {}", brief.theme),
        ];
        if let Some(tone) = brand.tone.as_deref().filter(|value| !value.is_empty()) {
            lines.push(format!("Tone: {tone}"));
        }
        if let Some(occasion) = brief.occasion.as_deref().filter(|value| !value.is_empty()) {
            lines.push(format!("Occasion: {occasion}"));
        }
        if let Some(instructions) = brief
            .instructions
            .as_deref()
            .filter(|value| !value.is_empty())
        {
            lines.push(format!("Instructions: {instructions}"));
        }
        lines.join("\n")
    }
}

const COPY_SYSTEM_PROMPT: &str = "You write social-media poster copy. Respond with a JSON object \
containing exactly these keys: headline (short, punchy), subheadline (optional, may be null), \
body (one or two sentences), cta (a few words), hashtags (array of up to six strings).";

impl CopyGenerator for OpenAiCopywriter {
    fn name(&self) -> &str {
        "openai"
    }

    fn generate_copy(&self, brand: &BrandIdentity, brief: &ContentBrief) -> Result<PosterCopy> {
        let endpoint = format!("{}/chat/completions", self.api_base);
        let payload = json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": COPY_SYSTEM_PROMPT },
                { "role": "user", "content": Self::user_prompt(brand, brief) },
            ],
        });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .with_context(|| format!("copy request failed ({endpoint})"))?;
        let body = response_json_or_error("copywriter", response)?;
        let content = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("copywriter response missing content"))?;
        let parsed: Value =
            serde_json::from_str(content).context("copywriter returned invalid JSON copy")?;
        parse_poster_copy(&parsed)
    }
}

/// Tolerant mapping from a model's JSON object into `PosterCopy`. Hashtags
/// may come back as an array or one space-separated string.
pub(crate) fn parse_poster_copy(value: &Value) -> Result<PosterCopy> {
    let headline = string_field(value, "headline")
        .ok_or_else(|| anyhow::anyhow!("copy is missing a headline"))?;
    let cta = string_field(value, "cta")
        .or_else(|| string_field(value, "call_to_action"))
        .ok_or_else(|| anyhow::anyhow!("copy is missing a call to action"))?;
    let body = string_field(value, "body").unwrap_or_default();
    let subheadline = string_field(value, "subheadline");
    let hashtags = match value.get("hashtags") {
        Some(Value::Array(rows)) => rows
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(raw)) => raw
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    Ok(PosterCopy {
        headline,
        subheadline,
        body,
        cta,
        hashtags,
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}

/// Deterministic offline copy for `--dryrun` and tests.
pub struct DryrunCopywriter;

impl CopyGenerator for DryrunCopywriter {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_copy(&self, brand: &BrandIdentity, brief: &ContentBrief) -> Result<PosterCopy> {
        let occasion = brief
            .occasion
            .as_deref()
            .filter(|value| !value.is_empty())
            .unwrap_or("today");
        Ok(PosterCopy {
            headline: format!("{} presents {}", brand.name, brief.theme),
            subheadline: Some(format!("Only {occasion}")),
            body: format!(
                "Discover what {} has in store. {}",
                brand.name, brief.theme
            ),
            cta: "Learn more".to_string(),
            hashtags: vec![
                format!("#{}", brand.name.to_ascii_lowercase().replace(' ', "")),
                format!("#{}", brief.theme.to_ascii_lowercase().replace(' ', "")),
            ],
        })
    }
}
