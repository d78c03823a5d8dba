//! Progress-callback trait for manifest-build events.
//!
//! Inject an [`Arc<dyn ManifestProgressCallback>`] via
//! [`crate::config::ManifestConfigBuilder::progress_callback`] to follow a
//! build document by document and page by page. The CLI drives an
//! `indicatif` bar from these events; library callers can forward them
//! anywhere. Pages are processed concurrently, so page events may arrive
//! out of order and from different threads.

use std::sync::Arc;

/// Called by [`crate::manifest::build_manifest`] as it works.
///
/// All methods default to no-ops so implementors override only what they
/// need. Shared mutable state must be synchronised (`Mutex`, atomics).
pub trait ManifestProgressCallback: Send + Sync {
    /// Called once after listing, before any document is fetched.
    fn on_build_start(&self, total_documents: usize) {
        let _ = total_documents;
    }

    /// Called once a document is opened and its page count is known.
    fn on_document_start(&self, source_ref: &str, total_pages: usize) {
        let _ = (source_ref, total_pages);
    }

    /// Called when a page has lines from either strategy.
    ///
    /// * `page_num`  : 1-indexed page number
    /// * `line_count`: lines recorded for the page
    fn on_page_complete(&self, source_ref: &str, page_num: usize, line_count: usize) {
        let _ = (source_ref, page_num, line_count);
    }

    /// Called when a page is emitted empty with a warning.
    fn on_page_error(&self, source_ref: &str, page_num: usize, error: &str) {
        let _ = (source_ref, page_num, error);
    }

    /// Called when a whole document is skipped.
    fn on_document_error(&self, source_ref: &str, error: &str) {
        let _ = (source_ref, error);
    }

    /// Called once at the end with the number of records emitted.
    fn on_build_complete(&self, total_records: usize, failures: usize) {
        let _ = (total_records, failures);
    }
}

/// Default when no callback is configured.
pub struct NoopProgressCallback;

impl ManifestProgressCallback for NoopProgressCallback {}

/// The type stored in [`crate::config::ManifestConfig`].
pub type ProgressCallback = Arc<dyn ManifestProgressCallback>;
