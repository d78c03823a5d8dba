//! Post-processing: turn a vision-LLM OCR reply into line detections.
//!
//! The OCR prompt asks for a bare JSON array of
//! `{"text": ..., "box": [left, top, width, height]}` objects in normalized
//! page coordinates. Models still occasionally wrap the array in Markdown
//! fences, prepend a sentence, emit a BOM, or return boxes that poke
//! slightly outside the page. These rules fix those quirks without touching
//! content:
//!
//! 1. Normalise line endings and strip invisible Unicode
//! 2. Strip outer Markdown fences
//! 3. Cut the reply down to its outermost JSON array
//! 4. Parse, drop lines with no visible text, clamp boxes to `0..1`

use crate::blocks::BoundingBox;
use crate::ocr::LineDetection;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct RawLine {
    text: String,
    #[serde(rename = "box")]
    bbox: [f64; 4],
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse a VLM reply into normalized line detections, top to bottom.
pub fn parse_line_reply(reply: &str) -> Result<Vec<LineDetection>, String> {
    let s = normalise_line_endings(reply);
    let s = remove_invisible_chars(&s);
    let s = strip_markdown_fences(&s);
    let json = outermost_array(&s).ok_or_else(|| {
        format!(
            "reply contains no JSON array: {}",
            s.chars().take(80).collect::<String>()
        )
    })?;

    let raw: Vec<RawLine> =
        serde_json::from_str(json).map_err(|e| format!("reply is not a line list: {}", e))?;

    Ok(raw
        .into_iter()
        .filter(|l| !l.text.trim().is_empty())
        .map(|l| {
            let [left, top, width, height] = l.bbox;
            let bbox = BoundingBox::new(width, height, left, top).clamped();
            LineDetection {
                text: l.text.trim().to_string(),
                polygon: bbox.corners(),
                confidence: l.confidence.map(|c| c.clamp(0.0, 1.0)),
                words: Vec::new(),
            }
        })
        .collect())
}

// ── Rule 1: Normalise line endings, strip invisible characters ──────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_INVISIBLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{FEFF}\u{200B}\u{200C}\u{200D}\u{2060}\u{00AD}]").unwrap());

fn remove_invisible_chars(input: &str) -> String {
    RE_INVISIBLE.replace_all(input, "").to_string()
}

// ── Rule 2: Strip outer fences ───────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    }
}

// ── Rule 3: Outermost JSON array ─────────────────────────────────────────────

fn outermost_array(input: &str) -> Option<&str> {
    let start = input.find('[')?;
    let end = input.rfind(']')?;
    (end > start).then(|| &input[start..=end])
}
