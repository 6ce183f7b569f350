use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use reqwest::blocking::Client as HttpClient;
use resvg::{tiny_skia, usvg};

use posterforge_contracts::{BrandIdentity, PosterCopy};

use crate::truncate_text;

/// Poster canvas edge in pixels. Backgrounds are cover-fit into this square
/// whatever their native size.
pub const CANVAS_SIZE: u32 = 1080;

const LOGO_BADGE_SIZE: u32 = 128;
const LOGO_OFFSET: (i64, i64) = (48, 48);

const HEADLINE_CHAR_BUDGET: usize = 18;
const HEADLINE_MAX_LINES: usize = 2;
const SUBHEADLINE_CHAR_BUDGET: usize = 34;
const BODY_CHAR_BUDGET: usize = 46;
const BODY_MAX_LINES: usize = 2;
const MAX_HASHTAGS: usize = 4;

const TEXT_MARGIN: u32 = 64;
const HEADLINE_LINE_HEIGHT: u32 = 78;
const SUBHEADLINE_LINE_HEIGHT: u32 = 46;
const BODY_LINE_HEIGHT: u32 = 38;
const CTA_HEIGHT: u32 = 64;
const HASHTAG_LINE_HEIGHT: u32 = 36;

#[derive(Debug, Clone)]
pub struct ComposeOutput {
    pub bytes: Vec<u8>,
    pub warnings: Vec<String>,
}

/// Rasterizes the final poster from a background plus brand and copy data.
///
/// The logo badge is applied in both branches: a logo baked into an
/// AI-generated background cannot be trusted as the brand's own mark.
pub struct Compositor {
    http: HttpClient,
    font_family: String,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compositor {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
            font_family: "DejaVu Sans".to_string(),
        }
    }

    pub fn with_font_family(mut self, font_family: impl Into<String>) -> Self {
        self.font_family = font_family.into();
        self
    }

    pub fn compose(
        &self,
        background: &[u8],
        brand: &BrandIdentity,
        copy: &PosterCopy,
        image_has_text: bool,
    ) -> Result<ComposeOutput> {
        let mut warnings = Vec::new();
        let decoded =
            image::load_from_memory(background).context("failed to decode background image")?;
        let mut canvas = cover_fit_top(&decoded, CANVAS_SIZE);

        if !image_has_text {
            let svg = build_overlay_svg(brand, copy, CANVAS_SIZE, &self.font_family);
            let overlay = rasterize_svg(&svg, CANVAS_SIZE, CANVAS_SIZE)?;
            imageops::overlay(&mut canvas, &overlay, 0, 0);
        }

        if let Some(reference) = brand.logo.as_deref() {
            match self.load_logo(reference) {
                Ok(logo) => imageops::overlay(&mut canvas, &logo, LOGO_OFFSET.0, LOGO_OFFSET.1),
                Err(err) => warnings.push(format!(
                    "logo unavailable, composing without it: {}",
                    truncate_text(&format!("{err:#}"), 256)
                )),
            }
        }

        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(canvas)
            .write_to(&mut std::io::Cursor::new(&mut bytes), ImageFormat::Png)
            .context("failed to encode poster")?;
        Ok(ComposeOutput { bytes, warnings })
    }

    fn load_logo(&self, reference: &str) -> Result<RgbaImage> {
        let bytes = if reference.starts_with("http://") || reference.starts_with("https://") {
            let response = self
                .http
                .get(reference)
                .send()
                .with_context(|| format!("logo download failed ({reference})"))?;
            if !response.status().is_success() {
                bail!("logo download failed ({})", response.status().as_u16());
            }
            response
                .bytes()
                .context("failed reading logo bytes")?
                .to_vec()
        } else {
            std::fs::read(reference)
                .with_context(|| format!("failed reading logo file ({reference})"))?
        };
        let logo = image::load_from_memory(&bytes).context("failed to decode logo")?;
        Ok(logo
            .resize(LOGO_BADGE_SIZE, LOGO_BADGE_SIZE, FilterType::Lanczos3)
            .to_rgba8())
    }
}

/// Scale to fill the square, crop horizontal overflow from the center and
/// vertical overflow from the bottom (top-anchored).
fn cover_fit_top(source: &DynamicImage, size: u32) -> RgbaImage {
    let (width, height) = (source.width().max(1), source.height().max(1));
    let scale = (size as f64 / width as f64).max(size as f64 / height as f64);
    let scaled_w = ((width as f64 * scale).round() as u32).max(size);
    let scaled_h = ((height as f64 * scale).round() as u32).max(size);
    let resized = source.resize_exact(scaled_w, scaled_h, FilterType::Lanczos3);
    let x = (scaled_w - size) / 2;
    resized.crop_imm(x, 0, size, size).to_rgba8()
}

/// Build the text layer as SVG markup.
///
/// Every free-text value passes through `xml_escape` before it reaches the
/// markup, and brand colors are sanitized to hex literals.
pub fn build_overlay_svg(
    brand: &BrandIdentity,
    copy: &PosterCopy,
    size: u32,
    font_family: &str,
) -> String {
    let primary = sanitize_hex_color(&brand.colors.primary, "#1f2937");
    let secondary = sanitize_hex_color(&brand.colors.secondary, "#f9fafb");
    let accent = sanitize_hex_color(&brand.colors.accent, "#f59e0b");
    let font = xml_escape(font_family);

    let headline_lines = wrap_text(&copy.headline, HEADLINE_CHAR_BUDGET, HEADLINE_MAX_LINES);
    let subheadline = copy
        .subheadline
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| wrap_text(value, SUBHEADLINE_CHAR_BUDGET, 1).join(""));
    let body_lines = wrap_text(&copy.body, BODY_CHAR_BUDGET, BODY_MAX_LINES);
    let hashtags = caption_hashtags(&copy.hashtags);
    let cta = copy.cta.trim();

    // Stack the panel from its measured content height.
    let mut content_height = TEXT_MARGIN;
    content_height += HEADLINE_LINE_HEIGHT * headline_lines.len() as u32;
    if subheadline.is_some() {
        content_height += SUBHEADLINE_LINE_HEIGHT;
    }
    content_height += BODY_LINE_HEIGHT * body_lines.len() as u32;
    if !cta.is_empty() {
        content_height += CTA_HEIGHT + 28;
    }
    if !hashtags.is_empty() {
        content_height += HASHTAG_LINE_HEIGHT;
    }
    content_height += 40;
    let panel_top = size.saturating_sub(content_height);
    let fade_top = panel_top.saturating_sub(96);

    let mut svg = String::new();
    svg.push_str(&format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{size}\" height=\"{size}\" viewBox=\"0 0 {size} {size}\">"
    ));
    svg.push_str(&format!(
        "<defs><linearGradient id=\"panel\" x1=\"0\" y1=\"0\" x2=\"0\" y2=\"1\">\
         <stop offset=\"0\" stop-color=\"#000000\" stop-opacity=\"0\"/>\
         <stop offset=\"0.35\" stop-color=\"#000000\" stop-opacity=\"0.55\"/>\
         <stop offset=\"1\" stop-color=\"#000000\" stop-opacity=\"0.9\"/>\
         </linearGradient></defs>"
    ));
    svg.push_str(&format!(
        "<rect x=\"0\" y=\"{fade_top}\" width=\"{size}\" height=\"{}\" fill=\"url(#panel)\"/>",
        size - fade_top
    ));

    let mut y = panel_top + TEXT_MARGIN;
    for (idx, line) in headline_lines.iter().enumerate() {
        // Second headline line picks up the accent color.
        let fill = if idx == 0 { &secondary } else { &accent };
        svg.push_str(&format!(
            "<text x=\"{TEXT_MARGIN}\" y=\"{y}\" font-family=\"{font}\" font-size=\"64\" \
             font-weight=\"700\" fill=\"{fill}\">{}</text>",
            xml_escape(line)
        ));
        y += HEADLINE_LINE_HEIGHT;
    }
    if let Some(line) = &subheadline {
        svg.push_str(&format!(
            "<text x=\"{TEXT_MARGIN}\" y=\"{y}\" font-family=\"{font}\" font-size=\"34\" \
             fill=\"{secondary}\" opacity=\"0.92\">{}</text>",
            xml_escape(line)
        ));
        y += SUBHEADLINE_LINE_HEIGHT;
    }
    for line in &body_lines {
        svg.push_str(&format!(
            "<text x=\"{TEXT_MARGIN}\" y=\"{y}\" font-family=\"{font}\" font-size=\"27\" \
             fill=\"{secondary}\" opacity=\"0.85\">{}</text>",
            xml_escape(line)
        ));
        y += BODY_LINE_HEIGHT;
    }
    if !cta.is_empty() {
        y += 28;
        // Pill sized to its own text; no text metrics, character count only.
        let pill_width = (cta.chars().count() as u32 * 17 + 72).min(size - 2 * TEXT_MARGIN);
        let pill_top = y - 42;
        svg.push_str(&format!(
            "<rect x=\"{TEXT_MARGIN}\" y=\"{pill_top}\" width=\"{pill_width}\" \
             height=\"{CTA_HEIGHT}\" rx=\"32\" fill=\"{accent}\"/>"
        ));
        svg.push_str(&format!(
            "<text x=\"{}\" y=\"{}\" font-family=\"{font}\" font-size=\"28\" \
             font-weight=\"700\" fill=\"{primary}\" text-anchor=\"middle\">{}</text>",
            TEXT_MARGIN + pill_width / 2,
            pill_top + 41,
            xml_escape(cta)
        ));
        y += CTA_HEIGHT;
    }
    if !hashtags.is_empty() {
        svg.push_str(&format!(
            "<text x=\"{TEXT_MARGIN}\" y=\"{y}\" font-family=\"{font}\" font-size=\"24\" \
             fill=\"{accent}\" opacity=\"0.9\">{}</text>",
            xml_escape(&hashtags)
        ));
    }
    svg.push_str("</svg>");
    svg
}

/// First four tags, each normalized to a single leading `#`.
fn caption_hashtags(tags: &[String]) -> String {
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .take(MAX_HASHTAGS)
        .map(|tag| format!("#{}", tag.trim_start_matches('#')))
        .collect::<Vec<String>>()
        .join(" ")
}

/// Greedy line fill by character count. Words longer than the budget are
/// hard-split so no line ever exceeds it; text past the line cap is dropped
/// with a trailing ellipsis.
pub fn wrap_text(text: &str, budget: usize, max_lines: usize) -> Vec<String> {
    let budget = budget.max(1);
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut truncated = false;

    'words: for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > budget {
            let head: String = word.chars().take(budget).collect();
            let tail: String = word.chars().skip(budget).collect();
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            if lines.len() >= max_lines {
                truncated = true;
                break 'words;
            }
            lines.push(head);
            word = tail;
        }
        if word.is_empty() {
            continue;
        }
        let needed = word.chars().count() + if current.is_empty() { 0 } else { 1 };
        if current.chars().count() + needed > budget {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            if lines.len() >= max_lines {
                truncated = true;
                break;
            }
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() && lines.len() < max_lines {
        lines.push(current);
    } else if !current.is_empty() {
        truncated = true;
    }

    if truncated {
        if let Some(last) = lines.last_mut() {
            while last.chars().count() + 1 > budget {
                last.pop();
            }
            last.push('…');
        }
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

pub fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Accept `#rgb`/`#rrggbb`; anything else falls back to the default so an
/// arbitrary string can never reach the markup as an attribute value.
fn sanitize_hex_color(raw: &str, default: &str) -> String {
    let trimmed = raw.trim();
    let Some(digits) = trimmed.strip_prefix('#') else {
        return default.to_string();
    };
    if matches!(digits.len(), 3 | 6) && digits.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return trimmed.to_ascii_lowercase();
    }
    default.to_string()
}

fn rasterize_svg(svg: &str, width: u32, height: u32) -> Result<RgbaImage> {
    let mut options = usvg::Options::default();
    options.fontdb_mut().load_system_fonts();
    let tree = usvg::Tree::from_str(svg, &options).context("overlay markup did not parse")?;
    let mut pixmap =
        tiny_skia::Pixmap::new(width, height).context("overlay pixmap allocation failed")?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    let mut out = RgbaImage::new(width, height);
    for (index, pixel) in pixmap.pixels().iter().enumerate() {
        let color = pixel.demultiply();
        let x = index as u32 % width;
        let y = index as u32 / width;
        out.put_pixel(
            x,
            y,
            Rgba([color.red(), color.green(), color.blue(), color.alpha()]),
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use posterforge_contracts::ColorTriad;

    use crate::dryrun_image_png;

    use super::*;

    fn brand(logo: Option<String>) -> BrandIdentity {
        BrandIdentity {
            name: "Crumb & Crust".to_string(),
            colors: ColorTriad::default(),
            logo,
            tone: Some("warm".to_string()),
        }
    }

    fn copy() -> PosterCopy {
        PosterCopy {
            headline: "Fresh Bread Every Morning".to_string(),
            subheadline: Some("Baked before sunrise".to_string()),
            body: "Stop by for sourdough, croissants, and coffee worth waking up for."
                .to_string(),
            cta: "Visit us today".to_string(),
            hashtags: vec![
                "#bakery".to_string(),
                "fresh".to_string(),
                "#sourdough".to_string(),
                "#morning".to_string(),
                "#fifth-tag-dropped".to_string(),
            ],
        }
    }

    #[test]
    fn wrap_text_respects_the_budget() {
        for budget in [5, 12, 20] {
            let lines = wrap_text("the quick brown fox jumps over the lazy dog", budget, 3);
            for line in &lines {
                assert!(line.chars().count() <= budget, "{line:?} over {budget}");
            }
        }
    }

    #[test]
    fn wrap_text_is_greedy_and_caps_lines() {
        let lines = wrap_text("one two three four", 9, 2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "one two");
        assert!(lines[1].ends_with('…'));
    }

    #[test]
    fn wrap_text_splits_oversized_words() {
        let lines = wrap_text("extraordinarily", 6, 3);
        assert!(lines.len() >= 2);
        for line in &lines {
            assert!(line.chars().count() <= 6);
        }
    }

    #[test]
    fn xml_escape_covers_markup_specials() {
        assert_eq!(
            xml_escape(r#"<b>&"fish"'</b>"#),
            "&lt;b&gt;&amp;&quot;fish&quot;&apos;&lt;/b&gt;"
        );
    }

    #[test]
    fn sanitize_hex_color_rejects_injection() {
        assert_eq!(sanitize_hex_color("#FF8800", "#000000"), "#ff8800");
        assert_eq!(sanitize_hex_color("#abc", "#000000"), "#abc");
        assert_eq!(
            sanitize_hex_color("red\" onload=\"x", "#000000"),
            "#000000"
        );
        assert_eq!(sanitize_hex_color("#12345", "#000000"), "#000000");
    }

    #[test]
    fn overlay_markup_escapes_free_text() {
        let mut dirty = copy();
        dirty.headline = "Deals < & Steals".to_string();
        dirty.cta = "Buy 1 > Get 2".to_string();
        let svg = build_overlay_svg(&brand(None), &dirty, CANVAS_SIZE, "DejaVu Sans");

        assert!(svg.contains("Deals &lt; &amp; Steals"));
        assert!(svg.contains("Buy 1 &gt; Get 2"));
        assert!(!svg.contains("Deals < & Steals"));
    }

    #[test]
    fn overlay_markup_contains_all_copy_elements() {
        let svg = build_overlay_svg(&brand(None), &copy(), CANVAS_SIZE, "DejaVu Sans");
        assert!(svg.contains("Fresh Bread Every"));
        assert!(svg.contains("Baked before sunrise"));
        assert!(svg.contains("Visit us today"));
        assert!(svg.contains("#bakery #fresh #sourdough #morning"));
        assert!(!svg.contains("fifth-tag-dropped"));
        assert!(svg.contains("linearGradient"));
        assert!(svg.contains("rx=\"32\""));
    }

    #[test]
    fn compose_with_text_branch_keeps_canvas_size() -> Result<()> {
        let background = dryrun_image_png(640, 360, "wide background")?;
        let output = Compositor::new().compose(&background, &brand(None), &copy(), true)?;
        let decoded = image::load_from_memory(&output.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (CANVAS_SIZE, CANVAS_SIZE));
        assert!(output.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn compose_overlay_branch_produces_lossless_canvas() -> Result<()> {
        let background = dryrun_image_png(300, 500, "tall background")?;
        let output = Compositor::new().compose(&background, &brand(None), &copy(), false)?;
        let decoded = image::load_from_memory(&output.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (CANVAS_SIZE, CANVAS_SIZE));
        Ok(())
    }

    #[test]
    fn text_branch_adds_no_overlay_pixels() -> Result<()> {
        // With no logo and image_has_text=true the output is just the
        // cover-fit background.
        let background = dryrun_image_png(256, 256, "flat background")?;
        let output = Compositor::new().compose(&background, &brand(None), &copy(), true)?;
        let decoded = image::load_from_memory(&output.bytes)?.to_rgba8();
        let first = decoded.get_pixel(0, 0);
        let mid = decoded.get_pixel(CANVAS_SIZE / 2, CANVAS_SIZE - 1);
        assert_eq!(first, mid);
        Ok(())
    }

    #[test]
    fn missing_logo_degrades_to_a_warning() -> Result<()> {
        let background = dryrun_image_png(256, 256, "background")?;
        let output = Compositor::new().compose(
            &background,
            &brand(Some("/definitely/not/a/logo.png".to_string())),
            &copy(),
            true,
        )?;
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].contains("logo unavailable"));
        Ok(())
    }

    #[test]
    fn local_logo_is_composited_as_a_badge() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let logo_path = temp.path().join("logo.png");
        std::fs::write(&logo_path, dryrun_image_png(64, 64, "logo")?)?;

        let background = dryrun_image_png(256, 256, "background")?;
        let output = Compositor::new().compose(
            &background,
            &brand(Some(logo_path.to_string_lossy().to_string())),
            &copy(),
            true,
        )?;
        assert!(output.warnings.is_empty());

        let composed = image::load_from_memory(&output.bytes)?.to_rgba8();
        let plain = Compositor::new()
            .compose(&background, &brand(None), &copy(), true)?
            .bytes;
        let plain = image::load_from_memory(&plain)?.to_rgba8();
        // Badge region differs, far corner does not.
        assert_ne!(
            composed.get_pixel(80, 80),
            plain.get_pixel(80, 80)
        );
        assert_eq!(
            composed.get_pixel(CANVAS_SIZE - 4, CANVAS_SIZE - 4),
            plain.get_pixel(CANVAS_SIZE - 4, CANVAS_SIZE - 4)
        );
        Ok(())
    }

    #[test]
    fn undecodable_background_is_fatal() {
        let err = Compositor::new()
            .compose(b"not an image", &brand(None), &copy(), false)
            .expect_err("garbage background");
        assert!(format!("{err:#}").contains("failed to decode background image"));
    }
}
