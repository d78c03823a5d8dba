//! Error types for the ssie-annotation-kit library.
//!
//! Two kinds of failure are kept apart:
//!
//! * [`AnnotationError`]: **Fatal**: the operation cannot proceed at all
//!   (missing job parameter, storage unreachable after retries, malformed
//!   request envelope). Returned as `Err(AnnotationError)` from the
//!   top-level entry points, always before partial work is reported.
//!
//! * [`ItemFailure`]: **Non-fatal**: one document, page or data object
//!   failed while the rest of the batch is fine. Collected next to the
//!   partial results in [`crate::output::ManifestOutput`] and
//!   [`crate::consolidate::BatchOutput`].
//!
//! Entity-level input problems found during consolidation are reported as
//! [`EntityRejection`]s inside the reconciled annotation itself.

use crate::ocr::OcrError;
use crate::storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All fatal errors returned by the library.
#[derive(Debug, Error)]
pub enum AnnotationError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// Builder or request validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A required field is missing from a platform request.
    #[error("Missing required field '{field}' in {context}")]
    MissingField {
        field: &'static str,
        context: &'static str,
    },

    // ── Input errors ──────────────────────────────────────────────────────
    /// The platform request or a stored document is not valid JSON for its schema.
    #[error("Malformed {what}: {detail}")]
    Malformed { what: String, detail: String },

    /// A storage path could not be interpreted.
    #[error("Invalid storage path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: String, detail: String },

    /// Requested page does not exist in the document.
    #[error("Page {page} is out of range (document has {total} pages)")]
    PageOutOfRange { page: usize, total: usize },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Collaborator errors ───────────────────────────────────────────────
    /// Storage call failed (after retries when the failure was transient).
    #[error("Storage error on '{path}': {source}")]
    Storage {
        path: String,
        #[source]
        source: StoreError,
    },

    /// OCR backend failed (after retries when the failure was transient).
    #[error("OCR backend '{backend}' failed: {source}")]
    Ocr {
        backend: String,
        #[source]
        source: OcrError,
    },

    /// The configured OCR provider could not be created.
    #[error("OCR provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnnotationError {
    pub(crate) fn malformed(what: impl Into<String>, detail: impl ToString) -> Self {
        Self::Malformed {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    pub(crate) fn storage(path: impl Into<String>, source: StoreError) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal failure of one item in a batch.
///
/// The batch keeps going; callers decide whether any failure is acceptable.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ItemFailure {
    /// A document could not be fetched or opened; none of its pages were emitted.
    #[error("Document '{source_ref}' skipped: {detail}")]
    Document { source_ref: String, detail: String },

    /// A page was emitted with an empty line list.
    #[error("Document '{source_ref}' page {page}: {detail}")]
    Page {
        source_ref: String,
        page: usize,
        detail: String,
    },

    /// One data object of a consolidation request failed.
    #[error("Data object '{dataset_object_id}': {detail}")]
    DataObject {
        dataset_object_id: String,
        detail: String,
    },
}

/// Why an entity was excluded from a reconciled annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionReason {
    /// `begin >= end`.
    EmptySpan,
    /// Offsets fall outside the page text.
    OutOfBounds,
    /// Entity type is not one of the job's configured types.
    UnknownType,
    /// The same worker annotated overlapping spans.
    SelfOverlap,
    /// Neither page offsets nor a `BlockReferences` entry pointing at a
    /// known `LINE` block. The reported entity carries zero offsets.
    Unresolvable,
}

/// An entity excluded from reconciliation as malformed input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRejection {
    pub source: crate::annotation::AnnotationSource,
    pub entity: crate::annotation::Entity,
    pub reason: RejectionReason,
}

impl std::fmt::Display for EntityRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} entity {} [{}, {}) rejected: {:?}",
            self.source,
            self.entity.entity_type,
            self.entity.begin_offset,
            self.entity.end_offset,
            self.reason
        )
    }
}
