//! # ssie-annotation-kit
//!
//! Prepare PDF pages for human named-entity annotation and reconcile what
//! the annotators send back.
//!
//! ## Flows
//!
//! ```text
//! PDFs under a prefix
//!  │
//!  ├─ 1. Manifest    one record per page: text-layer lines, OCR where the
//!  │                 page is scanned (manifest::build_manifest)
//!  ├─ 2. Job         UI schema + CreateLabelingJob request (job)
//!  ├─ 3. Pre-task    per-page task object for the annotation UI, page and
//!  │                 blocks staged in storage (task::handle_pre_human_task)
//!  └─ 4. Consolidate reconcile one or two workers' entities, write the
//!                    final annotation file (consolidate)
//! ```
//!
//! Storage and OCR are collaborators behind the [`storage::DocumentStore`]
//! and [`ocr::OcrBackend`] traits, so every flow runs against the local
//! filesystem or an in-memory store as well as S3.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ssie_annotation::{build_manifest, LocalDocumentStore, ManifestConfig, OcrConfig, VlmOcrBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = LocalDocumentStore::new("./data");
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let ocr = VlmOcrBackend::from_config(&OcrConfig::default())?;
//!     let config = ManifestConfig::builder()
//!         .labels(vec!["DATE".into(), "NAME".into()])
//!         .build()?;
//!     let output = build_manifest(&store, &ocr, "s3://docs/invoices", &config).await?;
//!     println!("{} records, {} failures", output.records.len(), output.failures.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `ssie-annotate` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `aws`   | off     | `S3DocumentStore` and `TextractOcrBackend` |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! ssie-annotation-kit = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod annotation;
pub mod blocks;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod job;
pub mod manifest;
pub mod ocr;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod storage;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use annotation::{
    AnnotationSet, AnnotationSource, Entity, ReconciledAnnotation, ReconciledEntity,
    ResolutionStatus, ResolvedEntities, SemiStructuredAnnotation,
};
pub use config::{ManifestConfig, ManifestConfigBuilder, OcrConfig, TaskConfig};
pub use consolidate::{consolidate_batch, reconcile, BatchOutput, ConsolidationInput};
pub use error::{AnnotationError, EntityRejection, ItemFailure, RejectionReason};
pub use job::{CreateLabelingJobRequest, JobConfig};
pub use manifest::{build_manifest, records_from_previous_jobs, write_manifest, PreviousJob};
pub use ocr::{OcrBackend, VlmOcrBackend};
pub use output::{ManifestOutput, ManifestRecord, ManifestStats};
pub use progress::{ManifestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use storage::{DocumentStore, LocalDocumentStore, MemoryDocumentStore, StoreError};
pub use task::{handle_pre_human_task, TaskOutput};
