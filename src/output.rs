//! Output types for the Manifest Builder: lines, pages and manifest records.
//!
//! [`ManifestRecord`] is the JSON-lines wire shape read by the labeling
//! platform and by the pre-human-task handler, so its field names follow
//! the platform's kebab-case manifest convention (`source-ref`,
//! `annotator-metadata`, ...). `page` and `metadata.pages` travel as strings.

use crate::blocks::Geometry;
use crate::error::ItemFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single word inside a [`Line`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Word {
    pub text: String,
    pub geometry: Geometry,
}

/// One line of page text with normalized geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Line {
    pub text: String,
    pub geometry: Geometry,
    /// OCR confidence in `0.0..=1.0`; `None` for native text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub words: Vec<Word>,
}

/// How a page's lines were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    Native,
    Ocr,
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Ocr => write!(f, "ocr"),
        }
    }
}

/// One physical page after extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub source_ref: String,
    /// 1-based.
    pub index: usize,
    pub strategy: ExtractionStrategy,
    pub lines: Vec<Line>,
    pub text: String,
    pub warning: Option<String>,
}

impl Page {
    pub fn new(
        source_ref: impl Into<String>,
        index: usize,
        strategy: ExtractionStrategy,
        lines: Vec<Line>,
        warning: Option<String>,
    ) -> Self {
        let text = page_text(&lines);
        Self {
            source_ref: source_ref.into(),
            index,
            strategy,
            lines,
            text,
            warning,
        }
    }
}

/// Page text: line texts joined by `\n`.
pub fn page_text(lines: &[Line]) -> String {
    lines
        .iter()
        .map(|l| l.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// A discovered PDF and its pages.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub source_ref: String,
    pub pages: Vec<Page>,
}

/// `metadata` object of a manifest line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestMetadata {
    /// Total pages of the source document.
    #[serde(with = "string_number")]
    pub pages: usize,
    #[serde(default, deserialize_with = "flexible_bool::deserialize")]
    pub use_textract_only: bool,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Text and geometry captured at manifest time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub strategy: ExtractionStrategy,
    pub text: String,
    pub lines: Vec<Line>,
}

/// One manifest line: the unit of work sent to the labeling platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestRecord {
    pub source_ref: String,
    /// 1-based page number.
    #[serde(with = "string_number")]
    pub page: usize,
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub annotator_metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_annotation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_annotation_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<Extraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl ManifestRecord {
    /// True when the record points at prior annotations to review.
    pub fn is_verification(&self) -> bool {
        self.primary_annotation_ref.is_some()
    }
}

/// Aggregate statistics for one manifest build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestStats {
    pub documents: usize,
    pub failed_documents: usize,
    pub pages: usize,
    pub native_pages: usize,
    pub ocr_pages: usize,
    /// Pages emitted with an empty line list.
    pub empty_pages: usize,
    pub duration_ms: u64,
}

/// Result of [`crate::manifest::build_manifest`]: partial records plus the
/// items that failed along the way.
#[derive(Debug, Clone, Default)]
pub struct ManifestOutput {
    pub records: Vec<ManifestRecord>,
    pub failures: Vec<ItemFailure>,
    pub stats: ManifestStats,
}

// ── Wire helpers ─────────────────────────────────────────────────────────

/// Numbers written as strings, read from either strings or numbers.
pub(crate) mod string_number {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(n: &usize, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&n.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(usize),
            Str(String),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.trim().parse().map_err(de::Error::custom),
        }
    }
}

/// Booleans that may arrive as `true` or `"true"`.
pub(crate) mod flexible_bool {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Str(String),
        }
        Ok(match Option::<Raw>::deserialize(d)? {
            Some(Raw::Bool(b)) => b,
            Some(Raw::Str(s)) => s.eq_ignore_ascii_case("true"),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ManifestRecord {
        ManifestRecord {
            source_ref: "s3://docs/in/a.pdf".into(),
            page: 2,
            metadata: ManifestMetadata {
                pages: 3,
                use_textract_only: false,
                labels: vec!["PER".into()],
            },
            annotator_metadata: None,
            primary_annotation_ref: None,
            secondary_annotation_ref: None,
            extraction: None,
            warning: None,
        }
    }

    #[test]
    fn record_uses_platform_field_names() {
        let json = serde_json::to_value(record()).unwrap();
        assert_eq!(json["source-ref"], "s3://docs/in/a.pdf");
        assert_eq!(json["page"], "2");
        assert_eq!(json["metadata"]["pages"], "3");
        assert_eq!(json["metadata"]["use-textract-only"], false);
        assert!(json["annotator-metadata"].is_null());
        assert!(json.get("primary-annotation-ref").is_none());
    }

    #[test]
    fn record_accepts_numeric_page_and_string_bool() {
        let line = r#"{"source-ref":"s3://b/x.pdf","page":4,
            "metadata":{"pages":"9","use-textract-only":"true","labels":[]}}"#;
        let r: ManifestRecord = serde_json::from_str(line).unwrap();
        assert_eq!(r.page, 4);
        assert_eq!(r.metadata.pages, 9);
        assert!(r.metadata.use_textract_only);
        assert!(!r.is_verification());
    }

    #[test]
    fn page_text_joins_with_newline() {
        let line = |t: &str| Line {
            text: t.into(),
            geometry: Geometry::default(),
            confidence: None,
            words: vec![],
        };
        let page = Page::new("a.pdf", 1, ExtractionStrategy::Native, vec![line("a"), line("b")], None);
        assert_eq!(page.text, "a\nb");
    }

    #[test]
    fn strategy_display() {
        assert_eq!(ExtractionStrategy::Ocr.to_string(), "ocr");
        assert_eq!(
            serde_json::to_string(&ExtractionStrategy::Native).unwrap(),
            "\"native\""
        );
    }
}
