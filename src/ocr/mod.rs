//! OCR collaborator: submit a rendered page image, receive line detections.
//!
//! The manifest builder and the pre-human-task handler only see the
//! [`OcrBackend`] trait. Two implementations ship with the crate:
//!
//! - [`VlmOcrBackend`]: a vision LLM reached through `edgequake-llm`
//!   (default; works with any provider the factory can build)
//! - `TextractOcrBackend`: AWS Textract `DetectDocumentText` (feature `aws`)
//!
//! Backends report geometry in whatever space they natively use;
//! [`normalize_detections`] maps both pixel and normalized replies onto the
//! same top-left `0..1` page space used by native extraction.

pub mod vlm;

#[cfg(feature = "aws")]
pub mod textract;

pub use vlm::VlmOcrBackend;

#[cfg(feature = "aws")]
pub use textract::TextractOcrBackend;

use crate::blocks::{BoundingBox, Geometry, Point};
use crate::output::{Line, Word};
use crate::pipeline::retry::Retryable;
use async_trait::async_trait;
use thiserror::Error;

/// Errors from OCR backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OcrError {
    #[error("OCR service throttled the request: {0}")]
    Throttled(String),

    #[error("OCR request timed out: {0}")]
    Timeout(String),

    #[error("OCR credentials rejected: {0}")]
    Unauthorized(String),

    #[error("OCR service rejected the request: {0}")]
    InvalidRequest(String),

    #[error("OCR service error: {0}")]
    Service(String),
}

impl Retryable for OcrError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Timeout(_) | Self::Service(_))
    }
}

impl OcrError {
    /// Classify a provider error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let m = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

        if has(&["401", "403", "unauthorized", "forbidden", "api key", "authentication"]) {
            Self::Unauthorized(message)
        } else if has(&["429", "rate limit", "too many requests", "throttl", "quota"]) {
            Self::Throttled(message)
        } else if has(&["timeout", "timed out"]) {
            Self::Timeout(message)
        } else if has(&["400", "invalid", "bad request", "unsupported"]) {
            Self::InvalidRequest(message)
        } else {
            Self::Service(message)
        }
    }
}

/// Coordinate space of an [`OcrPage`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoordinateSpace {
    /// Already `0..1`, origin top-left.
    Normalized,
    /// Pixels of the submitted image, origin top-left.
    Pixels { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WordDetection {
    pub text: String,
    pub polygon: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineDetection {
    pub text: String,
    pub polygon: Vec<Point>,
    pub confidence: Option<f32>,
    /// May be empty when the backend only reports lines.
    pub words: Vec<WordDetection>,
}

/// Everything a backend found on one page, in reading order.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrPage {
    pub lines: Vec<LineDetection>,
    pub coordinates: CoordinateSpace,
}

/// Document-analysis capability: page image in, ordered lines out.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &str;

    /// Detect the text lines on a PNG page image.
    async fn detect_lines(&self, png: &[u8]) -> Result<OcrPage, OcrError>;
}

/// Map detections onto normalized page geometry.
///
/// Polygons become their enclosing box. Lines without word detections get
/// words laid out proportionally to their character counts.
pub fn normalize_detections(page: OcrPage) -> Vec<Line> {
    let scale = |p: &Point| match page.coordinates {
        CoordinateSpace::Normalized => *p,
        CoordinateSpace::Pixels { width, height } => Point::new(
            p.x / f64::from(width.max(1)),
            p.y / f64::from(height.max(1)),
        ),
    };
    let to_box = |polygon: &[Point]| {
        let scaled: Vec<Point> = polygon.iter().map(scale).collect();
        BoundingBox::enclosing(&scaled)
            .unwrap_or_default()
            .clamped()
    };

    page.lines
        .into_iter()
        .filter(|d| !d.text.trim().is_empty())
        .map(|d| {
            let line_box = to_box(&d.polygon);
            let words = if d.words.is_empty() {
                proportional_words(&d.text, &line_box)
            } else {
                d.words
                    .iter()
                    .map(|w| Word {
                        text: w.text.clone(),
                        geometry: Geometry::from_box(to_box(&w.polygon)),
                    })
                    .collect()
            };
            Line {
                text: d.text,
                geometry: Geometry::from_box(line_box),
                confidence: d.confidence,
                words,
            }
        })
        .collect()
}

fn proportional_words(text: &str, line: &BoundingBox) -> Vec<Word> {
    let total = text.chars().count().max(1) as f64;
    let mut words = Vec::new();
    let mut offset = 0usize;
    for token in text.split(' ') {
        let len = token.chars().count();
        if !token.is_empty() {
            let left = line.left + line.width * offset as f64 / total;
            let width = line.width * len as f64 / total;
            words.push(Word {
                text: token.to_string(),
                geometry: Geometry::from_box(BoundingBox::new(width, line.height, left, line.top)),
            });
        }
        offset += len + 1;
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64, y: f64, w: f64, h: f64) -> Vec<Point> {
        BoundingBox::new(w, h, x, y).corners()
    }

    #[test]
    fn classify_messages() {
        assert!(matches!(OcrError::classify("HTTP 429 Too Many Requests"), OcrError::Throttled(_)));
        assert!(matches!(OcrError::classify("Invalid API key"), OcrError::Unauthorized(_)));
        assert!(matches!(OcrError::classify("request timed out"), OcrError::Timeout(_)));
        assert!(matches!(OcrError::classify("400 bad request"), OcrError::InvalidRequest(_)));
        assert!(matches!(OcrError::classify("upstream exploded"), OcrError::Service(_)));
    }

    #[test]
    fn transient_split() {
        assert!(OcrError::Throttled("x".into()).is_transient());
        assert!(OcrError::Service("x".into()).is_transient());
        assert!(!OcrError::Unauthorized("x".into()).is_transient());
        assert!(!OcrError::InvalidRequest("x".into()).is_transient());
    }

    #[test]
    fn pixel_detections_are_normalized() {
        let page = OcrPage {
            lines: vec![LineDetection {
                text: "Total due".into(),
                polygon: square(100.0, 50.0, 400.0, 20.0),
                confidence: Some(0.98),
                words: vec![],
            }],
            coordinates: CoordinateSpace::Pixels {
                width: 1000,
                height: 1000,
            },
        };
        let lines = normalize_detections(page);
        let b = lines[0].geometry.bounding_box;
        assert!((b.left - 0.1).abs() < 1e-9);
        assert!((b.top - 0.05).abs() < 1e-9);
        assert!((b.width - 0.4).abs() < 1e-9);
        assert_eq!(lines[0].words.len(), 2);
        assert_eq!(lines[0].words[1].text, "due");
        assert!(lines[0].words[1].geometry.bounding_box.left > b.left);
    }

    #[test]
    fn skewed_polygon_uses_enclosing_box() {
        let page = OcrPage {
            lines: vec![LineDetection {
                text: "tilted".into(),
                polygon: vec![
                    Point::new(0.1, 0.12),
                    Point::new(0.5, 0.10),
                    Point::new(0.5, 0.14),
                    Point::new(0.1, 0.16),
                ],
                confidence: None,
                words: vec![],
            }],
            coordinates: CoordinateSpace::Normalized,
        };
        let b = normalize_detections(page)[0].geometry.bounding_box;
        assert!((b.top - 0.10).abs() < 1e-9);
        assert!((b.bottom() - 0.16).abs() < 1e-9);
    }

    #[test]
    fn blank_detections_are_dropped() {
        let page = OcrPage {
            lines: vec![LineDetection {
                text: "   ".into(),
                polygon: square(0.0, 0.0, 0.1, 0.1),
                confidence: None,
                words: vec![],
            }],
            coordinates: CoordinateSpace::Normalized,
        };
        assert!(normalize_detections(page).is_empty());
    }
}
