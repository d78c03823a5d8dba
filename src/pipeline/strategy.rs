//! Per-page parse-strategy decision.
//!
//! A runtime branch per page, not an extractor hierarchy: [`needs_ocr`]
//! decides whether the text layer is usable, and [`resolve_page`] folds the
//! native lines and the OCR outcome into one tagged [`PageExtraction`].
//! Both are pure so every branch is testable without pdfium or a network.

use crate::output::{ExtractionStrategy, Line};
use crate::pipeline::render::NativePage;

/// Image area / page area at or above which a page is treated as scanned.
pub const SCANNED_IMAGE_COVERAGE: f64 = 0.25;

/// Whether a page should go to the OCR backend.
pub fn needs_ocr(page: &NativePage, force_ocr: bool) -> bool {
    force_ocr || page.lines.is_empty() || page.image_coverage >= SCANNED_IMAGE_COVERAGE
}

/// Result of asking the OCR backend about a page.
#[derive(Debug, Clone, PartialEq)]
pub enum OcrOutcome {
    /// OCR was not needed, or the page could not be rendered.
    NotAttempted,
    Lines(Vec<Line>),
    Failed(String),
}

/// The lines chosen for a page and where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PageExtraction {
    pub strategy: ExtractionStrategy,
    pub lines: Vec<Line>,
    pub warning: Option<String>,
}

impl PageExtraction {
    fn native(lines: Vec<Line>, warning: Option<String>) -> Self {
        Self {
            strategy: ExtractionStrategy::Native,
            lines,
            warning,
        }
    }

    fn ocr(lines: Vec<Line>, warning: Option<String>) -> Self {
        Self {
            strategy: ExtractionStrategy::Ocr,
            lines,
            warning,
        }
    }
}

/// Pick the lines for a page.
///
/// Native text wins when the page does not need OCR. Otherwise OCR lines
/// are used; when OCR yields nothing, any native lines are kept with a
/// warning, and a page with neither is returned empty with a warning.
/// A page is never dropped.
pub fn resolve_page(native: &NativePage, ocr: OcrOutcome, force_ocr: bool) -> PageExtraction {
    if !needs_ocr(native, force_ocr) {
        return PageExtraction::native(native.lines.clone(), None);
    }

    let ocr_problem = match ocr {
        OcrOutcome::Lines(lines) if !lines.is_empty() => {
            return PageExtraction::ocr(lines, None);
        }
        OcrOutcome::Lines(_) => "OCR found no text".to_string(),
        OcrOutcome::Failed(e) => format!("OCR failed: {}", e),
        OcrOutcome::NotAttempted => match &native.error {
            Some(e) => format!("OCR not attempted: {}", e),
            None => "OCR not attempted".to_string(),
        },
    };

    if native.lines.is_empty() {
        PageExtraction::ocr(
            Vec::new(),
            Some(format!("no text layer; {}", ocr_problem)),
        )
    } else {
        PageExtraction::native(
            native.lines.clone(),
            Some(format!("{}; kept native text layer", ocr_problem)),
        )
    }
}
