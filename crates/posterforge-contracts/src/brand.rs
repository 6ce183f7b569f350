use serde::{Deserialize, Serialize};

/// Snapshot of a brand's visual identity taken when a job is created.
///
/// The snapshot is copied into the job record so that later edits to the
/// brand profile never change what an in-flight job renders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandIdentity {
    pub name: String,
    pub colors: ColorTriad,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

/// Brand color triad as hex strings (`#rrggbb`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorTriad {
    pub primary: String,
    pub secondary: String,
    pub accent: String,
}

impl Default for ColorTriad {
    fn default() -> Self {
        Self {
            primary: "#1f2937".to_string(),
            secondary: "#f9fafb".to_string(),
            accent: "#f59e0b".to_string(),
        }
    }
}

/// What the poster should be about.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentBrief {
    pub theme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occasion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Marketing copy produced by the copy collaborator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PosterCopy {
    pub headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subheadline: Option<String>,
    pub body: String,
    pub cta: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    Square,
    Portrait,
    Landscape,
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::Square
    }
}

impl AspectRatio {
    pub fn dims(self) -> (u32, u32) {
        match self {
            Self::Square => (1024, 1024),
            Self::Portrait => (832, 1216),
            Self::Landscape => (1216, 832),
        }
    }

    /// `w:h` form used by providers that take a ratio string.
    pub fn ratio_label(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Portrait => "2:3",
            Self::Landscape => "3:2",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "square" | "1:1" => Some(Self::Square),
            "portrait" | "2:3" | "9:16" => Some(Self::Portrait),
            "landscape" | "3:2" | "16:9" => Some(Self::Landscape),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brand_identity_roundtrip() -> anyhow::Result<()> {
        let brand = BrandIdentity {
            name: "Crumb & Crust".to_string(),
            colors: ColorTriad::default(),
            logo: Some("https://example.com/logo.png".to_string()),
            tone: Some("warm".to_string()),
        };
        let raw = serde_json::to_string(&brand)?;
        let parsed: BrandIdentity = serde_json::from_str(&raw)?;
        assert_eq!(parsed, brand);
        Ok(())
    }

    #[test]
    fn brand_identity_tolerates_missing_optionals() -> anyhow::Result<()> {
        let raw = r##"{"name":"Acme","colors":{"primary":"#111111","secondary":"#eeeeee","accent":"#ff0055"}}"##;
        let parsed: BrandIdentity = serde_json::from_str(raw)?;
        assert!(parsed.logo.is_none());
        assert!(parsed.tone.is_none());
        Ok(())
    }

    #[test]
    fn aspect_ratio_parse_accepts_common_spellings() {
        assert_eq!(AspectRatio::parse("Square"), Some(AspectRatio::Square));
        assert_eq!(AspectRatio::parse(" 9:16 "), Some(AspectRatio::Portrait));
        assert_eq!(AspectRatio::parse("16:9"), Some(AspectRatio::Landscape));
        assert_eq!(AspectRatio::parse("circle"), None);
    }
}
