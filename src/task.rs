//! Pre-Human-Task Adapter: one manifest record in, one UI rendering payload out.
//!
//! [`build_task_object`] is the pure transform. [`handle_pre_human_task`] is
//! the platform-facing flow around it: it reads the PDF, picks the block
//! source (a prior annotation in verification jobs, otherwise fresh
//! extraction), stores the page payloads next to the job, and wraps the
//! task object in the response envelope the labeling platform expects.

use crate::annotation::{DocumentType, SemiStructuredAnnotation};
use crate::blocks::{lines_to_blocks, Block};
use crate::config::TaskConfig;
use crate::error::AnnotationError;
use crate::manifest::ocr_page;
use crate::ocr::OcrBackend;
use crate::output::{page_text, Extraction, ExtractionStrategy, Line, ManifestRecord};
use crate::pipeline::render::{self, AnalysisOptions};
use crate::pipeline::retry::{with_retry, RetryPolicy};
use crate::pipeline::strategy::resolve_page;
use crate::storage::{bucket_of, file_stem, DocumentStore, StoredObject};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Version string the UI template checks.
pub const TASK_VERSION: &str = "2021-04-30";

/// `metadata` as handed to the UI template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub pages: String,
    pub page: String,
    #[serde(rename = "use-textract-only")]
    pub use_textract_only: String,
    pub labels: Vec<String>,
    pub source_ref: Option<String>,
    /// `{file stem}_{page}`.
    pub document_id: Option<String>,
}

/// Rendering payload for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskObject {
    #[serde(rename = "pdfBase64S3Ref", default)]
    pub pdf_base64_s3_ref: Option<String>,
    #[serde(rename = "pdfBlocksS3Ref", default)]
    pub pdf_blocks_s3_ref: Option<String>,
    pub pdf_type: DocumentType,
    pub version: String,
    pub metadata: TaskMetadata,
    /// Sorted by key.
    pub annotator_metadata: Option<BTreeMap<String, String>>,
    #[serde(rename = "primaryAnnotationS3Ref")]
    pub primary_annotation_ref: Option<String>,
    #[serde(rename = "secondaryAnnotationS3Ref")]
    pub secondary_annotation_ref: Option<String>,
    /// Entity-type menu.
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lines: Vec<Line>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
}

impl TaskObject {
    /// Annotator metadata as `(key, value)` pairs in key order.
    pub fn annotator_pairs(&self) -> Vec<(&str, &str)> {
        self.annotator_metadata
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    pub task_object: TaskObject,
    pub labels: Vec<String>,
}

/// Response to the platform's pre-human-task invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub task_input: Option<TaskInput>,
    /// `"true"` or `"false"`, as a string.
    pub human_annotation_required: String,
}

/// Build the UI payload for one record.
///
/// Does not touch `record`. Entity types come from `config`, falling back to
/// the record's own labels; an empty menu is a configuration error unless
/// the job (or the record) is a verification pass.
pub fn build_task_object(
    record: &ManifestRecord,
    config: &TaskConfig,
) -> Result<TaskObject, AnnotationError> {
    let entity_types = if config.entity_types.is_empty() {
        record.metadata.labels.clone()
    } else {
        config.entity_types.clone()
    };
    let verification = config.verification || record.is_verification();
    if entity_types.is_empty() && !verification {
        return Err(AnnotationError::InvalidConfig(format!(
            "no entity types for {} page {}",
            record.source_ref, record.page
        )));
    }

    let (strategy, text, lines) = match &record.extraction {
        Some(e) => (e.strategy, e.text.clone(), e.lines.clone()),
        None => (ExtractionStrategy::Native, String::new(), Vec::new()),
    };
    let blocks = lines_to_blocks(record.page, &lines);

    Ok(TaskObject {
        pdf_base64_s3_ref: None,
        pdf_blocks_s3_ref: None,
        pdf_type: document_type(strategy),
        version: TASK_VERSION.to_string(),
        metadata: TaskMetadata {
            pages: record.metadata.pages.to_string(),
            page: record.page.to_string(),
            use_textract_only: record.metadata.use_textract_only.to_string(),
            labels: entity_types.clone(),
            source_ref: Some(record.source_ref.clone()),
            document_id: document_id(&record.source_ref, record.page),
        },
        annotator_metadata: record.annotator_metadata.clone(),
        primary_annotation_ref: record.primary_annotation_ref.clone(),
        secondary_annotation_ref: record.secondary_annotation_ref.clone(),
        entity_types,
        text,
        lines,
        blocks,
    })
}

fn document_type(strategy: ExtractionStrategy) -> DocumentType {
    match strategy {
        ExtractionStrategy::Native => DocumentType::NativePDF,
        ExtractionStrategy::Ocr => DocumentType::ScannedPDF,
    }
}

fn document_id(source_ref: &str, page: usize) -> Option<String> {
    if source_ref.is_empty() {
        None
    } else {
        Some(format!("{}_{}", file_stem(source_ref), page))
    }
}

// ── Platform flow ────────────────────────────────────────────────────────

/// Job id: the last `/` segment of the labeling-job ARN.
pub fn job_id_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Handle one pre-human-task invocation.
///
/// `event` is the platform request: `{labelingJobArn, dataObject}` where
/// `dataObject` is a manifest line. A data object without `source-ref` is
/// answered with `humanAnnotationRequired: "false"` and no payload.
pub async fn handle_pre_human_task(
    event: &Value,
    store: &dyn DocumentStore,
    ocr: &dyn OcrBackend,
    config: &TaskConfig,
) -> Result<TaskOutput, AnnotationError> {
    let arn = event
        .get("labelingJobArn")
        .and_then(Value::as_str)
        .ok_or(AnnotationError::MissingField {
            field: "labelingJobArn",
            context: "pre-human-task request",
        })?;
    let job_id = job_id_from_arn(arn);
    let data_object = event.get("dataObject").ok_or(AnnotationError::MissingField {
        field: "dataObject",
        context: "pre-human-task request",
    })?;
    info!("Pre-human task for job {}", job_id);

    let has_source = data_object
        .get("source-ref")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    if !has_source {
        warn!("dataObject has no source-ref; no human annotation required");
        return Ok(TaskOutput {
            task_input: None,
            human_annotation_required: "false".to_string(),
        });
    }

    let mut record = parse_data_object(data_object)?;
    let policy = config.retry;
    let pdf = fetch(store, &record.source_ref, policy).await?;

    // ── Block source: latest prior annotation, else extraction ───────────
    let mut prior = None;
    if record.primary_annotation_ref.is_some() {
        prior = latest_annotation(store, &mut record, policy).await?;
        if prior.is_none() {
            debug!("Prior annotation has no blocks; extracting {}", record.source_ref);
            record.primary_annotation_ref = None;
            record.secondary_annotation_ref = None;
        }
    }

    let (blocks, pdf_type) = match prior {
        Some(annotation) => {
            let text = crate::blocks::page_text_from_blocks(&annotation.blocks);
            record.extraction = Some(Extraction {
                strategy: match annotation.document_type {
                    DocumentType::NativePDF => ExtractionStrategy::Native,
                    DocumentType::ScannedPDF => ExtractionStrategy::Ocr,
                },
                text,
                lines: Vec::new(),
            });
            (annotation.blocks, annotation.document_type)
        }
        None => {
            let extraction = extract_page(&record, pdf.bytes.clone(), ocr, policy).await?;
            let blocks = lines_to_blocks(record.page, &extraction.lines);
            let pdf_type = document_type(extraction.strategy);
            record.extraction = Some(extraction);
            (blocks, pdf_type)
        }
    };

    let mut task = build_task_object(&record, config)?;
    task.pdf_type = pdf_type;

    // ── Intermediate payloads ────────────────────────────────────────────
    let base = intermediate_folder(&record.source_ref, &config.intermediate_prefix, job_id)?;
    let stem = file_stem(&record.source_ref);
    let base64_ref = format!("{}/{}_{}_base64", base, stem, record.page);
    let blocks_ref = format!("{}/{}_{}_blocks.json", base, stem, record.page);

    let encoded = base64::engine::general_purpose::STANDARD.encode(&pdf.bytes);
    put(store, &base64_ref, encoded.into_bytes(), policy).await?;
    let blocks_json = serde_json::to_vec(&blocks)
        .map_err(|e| AnnotationError::Internal(format!("blocks serialization: {}", e)))?;
    put(store, &blocks_ref, blocks_json, policy).await?;

    task.pdf_base64_s3_ref = Some(base64_ref);
    task.pdf_blocks_s3_ref = Some(blocks_ref);
    // The UI loads geometry from the blocks file.
    task.lines.clear();
    task.blocks.clear();

    let labels = task.metadata.labels.clone();
    Ok(TaskOutput {
        task_input: Some(TaskInput {
            task_object: task,
            labels,
        }),
        human_annotation_required: "true".to_string(),
    })
}

fn parse_data_object(data_object: &Value) -> Result<ManifestRecord, AnnotationError> {
    let mut obj = data_object.clone();
    if let Value::Object(ref mut map) = obj {
        map.entry("page").or_insert_with(|| Value::String("1".into()));
    }
    serde_json::from_value(obj).map_err(|e| AnnotationError::malformed("dataObject", e))
}

fn intermediate_folder(source_ref: &str, prefix: &str, job_id: &str) -> Result<String, AnnotationError> {
    let bucket = bucket_of(source_ref).map_err(|e| AnnotationError::InvalidPath {
        path: source_ref.to_string(),
        reason: e.to_string(),
    })?;
    Ok(format!("s3://{}/{}/{}", bucket, prefix.trim_matches('/'), job_id))
}

/// Load the most recently modified of the primary/secondary annotations,
/// making it the primary ref. Ties favour the primary. Returns `None` when
/// that annotation carries no blocks.
async fn latest_annotation(
    store: &dyn DocumentStore,
    record: &mut ManifestRecord,
    policy: RetryPolicy,
) -> Result<Option<SemiStructuredAnnotation>, AnnotationError> {
    let Some(primary_ref) = record.primary_annotation_ref.clone() else {
        return Ok(None);
    };
    let primary = fetch(store, &primary_ref, policy).await?;

    let chosen = match record.secondary_annotation_ref.clone() {
        Some(secondary_ref) => {
            let secondary = fetch(store, &secondary_ref, policy).await?;
            if primary.last_modified >= secondary.last_modified {
                primary
            } else {
                debug!("Secondary annotation {} is newer; swapping refs", secondary_ref);
                record.primary_annotation_ref = Some(secondary_ref);
                record.secondary_annotation_ref = Some(primary_ref);
                secondary
            }
        }
        None => primary,
    };

    let annotation: SemiStructuredAnnotation = serde_json::from_slice(&chosen.bytes)
        .map_err(|e| AnnotationError::malformed("prior annotation", e))?;
    Ok((!annotation.blocks.is_empty()).then_some(annotation))
}

/// Native text or OCR for the record's page, with the same fallbacks as
/// the manifest builder.
async fn extract_page(
    record: &ManifestRecord,
    bytes: Vec<u8>,
    ocr: &dyn OcrBackend,
    policy: RetryPolicy,
) -> Result<Extraction, AnnotationError> {
    let force_ocr = record.metadata.use_textract_only;
    let options = AnalysisOptions {
        force_ocr,
        only_page: Some(record.page),
        ..AnalysisOptions::default()
    };
    let analyzed = render::analyze_document(&record.source_ref, bytes, &options).await?;
    let native = analyzed.pages.into_iter().next().ok_or(AnnotationError::PageOutOfRange {
        page: record.page,
        total: analyzed.page_count,
    })?;

    let outcome = ocr_page(ocr, &native, force_ocr, policy, &record.source_ref).await;
    let resolved = resolve_page(&native, outcome, force_ocr);
    if let Some(ref w) = resolved.warning {
        warn!("{} page {}: {}", record.source_ref, record.page, w);
    }
    Ok(Extraction {
        strategy: resolved.strategy,
        text: page_text(&resolved.lines),
        lines: resolved.lines,
    })
}

async fn fetch(
    store: &dyn DocumentStore,
    path: &str,
    policy: RetryPolicy,
) -> Result<StoredObject, AnnotationError> {
    with_retry(policy, path, || store.get(path))
        .await
        .map_err(|e| AnnotationError::storage(path, e))
}

async fn put(
    store: &dyn DocumentStore,
    path: &str,
    bytes: Vec<u8>,
    policy: RetryPolicy,
) -> Result<(), AnnotationError> {
    with_retry(policy, path, || store.put(path, bytes.clone()))
        .await
        .map_err(|e| AnnotationError::storage(path, e))
}
