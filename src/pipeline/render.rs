//! pdfium adapter: open a PDF from memory, collect each page's glyphs and
//! image coverage, and rasterise the pages that will need OCR.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is not safe to drive from async contexts. All pdfium work runs
//! on the blocking pool via `tokio::task::spawn_blocking`.
//!
//! ## Why cap pixels, not DPI?
//!
//! Page sizes vary wildly. `max_rendered_pixels` caps the longest edge of
//! the rendered PNG regardless of physical size, keeping memory bounded and
//! staying inside the image-size limits of OCR services.

use crate::error::AnnotationError;
use crate::output::Line;
use crate::pipeline::encode::encode_png;
use crate::pipeline::native::{cluster_lines, Glyph};
use crate::pipeline::strategy::needs_ocr;
use pdfium_render::prelude::*;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Options for [`analyze_document`].
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Rasterise every page for OCR, ignoring the text layer.
    pub force_ocr: bool,
    /// Longest edge of rendered page images, in pixels.
    pub max_rendered_pixels: u32,
    /// Analyze only this 1-based page.
    pub only_page: Option<usize>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            force_ocr: false,
            max_rendered_pixels: 2000,
            only_page: None,
        }
    }
}

/// What pdfium could tell us about one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativePage {
    /// 1-based.
    pub index: usize,
    /// Page size in PDF points.
    pub width: f64,
    pub height: f64,
    /// Lines from the text layer.
    pub lines: Vec<Line>,
    /// Total image area divided by page area.
    pub image_coverage: f64,
    /// PNG rendering, present only when the page needs OCR and rendering succeeded.
    pub png: Option<Vec<u8>>,
    /// Problems met while reading or rendering this page.
    pub error: Option<String>,
}

/// A PDF after pdfium analysis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzedDocument {
    pub source_ref: String,
    /// Total pages in the document, even when only one was analyzed.
    pub page_count: usize,
    pub pages: Vec<NativePage>,
}

/// Bind pdfium: `PDFIUM_LIB_PATH` (file or directory), then the working
/// directory, then the system library.
pub fn bind_pdfium() -> Result<Pdfium, AnnotationError> {
    let from_env = std::env::var("PDFIUM_LIB_PATH")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let bindings = match from_env {
        Some(path) => {
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&path)
            } else {
                path
            };
            debug!("Binding pdfium from {}", lib.display());
            Pdfium::bind_to_library(&lib)
        }
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| AnnotationError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

/// Analyze a PDF held in memory.
///
/// Fails only when the document cannot be opened; per-page problems are
/// recorded in [`NativePage::error`].
pub async fn analyze_document(
    source_ref: &str,
    bytes: Vec<u8>,
    options: &AnalysisOptions,
) -> Result<AnalyzedDocument, AnnotationError> {
    let source = source_ref.to_string();
    let options = options.clone();

    tokio::task::spawn_blocking(move || analyze_blocking(&source, &bytes, &options))
        .await
        .map_err(|e| AnnotationError::Internal(format!("Analysis task panicked: {}", e)))?
}

/// Number of pages in a PDF held in memory.
pub async fn page_count(source_ref: &str, bytes: Vec<u8>) -> Result<usize, AnnotationError> {
    let source = source_ref.to_string();
    tokio::task::spawn_blocking(move || {
        let pdfium = bind_pdfium()?;
        let document = open(&pdfium, &source, &bytes)?;
        Ok(document.pages().len() as usize)
    })
    .await
    .map_err(|e| AnnotationError::Internal(format!("Page-count task panicked: {}", e)))?
}

fn open<'a>(
    pdfium: &'a Pdfium,
    source_ref: &str,
    bytes: &'a [u8],
) -> Result<PdfDocument<'a>, AnnotationError> {
    pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| AnnotationError::CorruptPdf {
            path: source_ref.to_string(),
            detail: format!("{:?}", e),
        })
}

fn analyze_blocking(
    source_ref: &str,
    bytes: &[u8],
    options: &AnalysisOptions,
) -> Result<AnalyzedDocument, AnnotationError> {
    let pdfium = bind_pdfium()?;
    let document = open(&pdfium, source_ref, bytes)?;
    let total = document.pages().len() as usize;
    info!("{}: {} pages", source_ref, total);

    if let Some(p) = options.only_page {
        if p == 0 || p > total {
            return Err(AnnotationError::PageOutOfRange { page: p, total });
        }
    }

    let render_config = PdfRenderConfig::new()
        .set_target_width(options.max_rendered_pixels as i32)
        .set_maximum_height(options.max_rendered_pixels as i32);

    let mut pages = Vec::new();
    for (i, page) in document.pages().iter().enumerate() {
        let index = i + 1;
        if options.only_page.is_some_and(|p| p != index) {
            continue;
        }
        pages.push(analyze_page(index, &page, &render_config, options.force_ocr));
    }

    Ok(AnalyzedDocument {
        source_ref: source_ref.to_string(),
        page_count: total,
        pages,
    })
}

fn analyze_page(
    index: usize,
    page: &PdfPage,
    render_config: &PdfRenderConfig,
    force_ocr: bool,
) -> NativePage {
    let width = page.width().value as f64;
    let height = page.height().value as f64;
    let mut native = NativePage {
        index,
        width,
        height,
        ..Default::default()
    };

    match collect_glyphs(page) {
        Ok(glyphs) => native.lines = cluster_lines(&glyphs, width, height),
        Err(e) => {
            warn!("Page {}: text layer unreadable: {}", index, e);
            native.error = Some(format!("text layer unreadable: {}", e));
        }
    }
    native.image_coverage = image_coverage(page, width * height);

    if needs_ocr(&native, force_ocr) {
        let image = page.render_with_config(render_config).map(|b| b.as_image());
        match image {
            Ok(img) => match encode_png(&img) {
                Ok(png) => {
                    debug!(
                        "Page {}: rendered {}x{} px for OCR",
                        index,
                        img.width(),
                        img.height()
                    );
                    native.png = Some(png);
                }
                Err(e) => native.error = Some(format!("PNG encoding failed: {}", e)),
            },
            Err(e) => {
                warn!("Page {}: rasterisation failed: {:?}", index, e);
                native.error = Some(format!("rasterisation failed: {:?}", e));
            }
        }
    }

    native
}

fn collect_glyphs(page: &PdfPage) -> Result<Vec<Glyph>, String> {
    let text = page.text().map_err(|e| format!("{:?}", e))?;
    let mut glyphs = Vec::new();
    for c in text.chars().iter() {
        let Some(ch) = c.unicode_char() else { continue };
        let Ok(rect) = c.loose_bounds() else { continue };
        glyphs.push(Glyph::new(
            ch,
            rect.left().value as f64,
            rect.bottom().value as f64,
            rect.right().value as f64,
            rect.top().value as f64,
        ));
    }
    Ok(glyphs)
}

fn image_coverage(page: &PdfPage, page_area: f64) -> f64 {
    if page_area <= 0.0 {
        return 0.0;
    }
    let image_area: f64 = page
        .objects()
        .iter()
        .filter(|o| o.object_type() == PdfPageObjectType::Image)
        .filter_map(|o| match (o.width(), o.height()) {
            (Ok(w), Ok(h)) => Some(w.value as f64 * h.value as f64),
            _ => None,
        })
        .sum();
    image_area / page_area
}

