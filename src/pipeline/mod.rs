//! Page extraction stages shared by the manifest builder and the
//! pre-human-task adapter.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ native ──▶ strategy ──▶ (encode ──▶ OCR ──▶ postprocess)
//! (pdfium)   (lines)    (auto-detect)  (PNG)     (backend)  (reply parse)
//! ```
//!
//! 1. [`render`]: open the PDF, collect glyphs and render pages; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 2. [`native`]: cluster text-layer glyphs into lines
//! 3. [`strategy`]: decide per page whether OCR is needed and fold the
//!    result into one tagged extraction
//! 4. [`encode`]: PNG-encode rendered pages, base64-wrap for vision LLMs
//! 5. [`postprocess`]: parse and clean the vision LLM's line reply
//!
//! [`retry`] wraps every collaborator call.

pub mod encode;
pub mod native;
pub mod postprocess;
pub mod render;
pub mod retry;
pub mod strategy;
