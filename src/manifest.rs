//! Manifest Builder: PDFs under a storage prefix in, one record per page out.
//!
//! ## Pipeline
//!
//! ```text
//! list prefix ──▶ fetch PDF ──▶ analyze (pdfium) ──▶ OCR where needed ──▶ records
//!  (sorted keys)   (retry)       (spawn_blocking)     (buffer_unordered)    (doc/page order)
//! ```
//!
//! Documents are processed one after another; the pages of a document are
//! OCR'd concurrently and reassembled in physical order, so re-running the
//! builder over unchanged input reproduces the same manifest.
//!
//! ## Partial results
//!
//! A document that cannot be fetched or opened is reported as an
//! [`ItemFailure::Document`] and contributes no records. A page that yields
//! no lines from either strategy is still emitted, with an empty line list
//! and a warning, and is also reported as an [`ItemFailure::Page`]. Only
//! configuration errors, a failed listing, or a missing pdfium library abort
//! the build.

use crate::config::ManifestConfig;
use crate::error::{AnnotationError, ItemFailure};
use crate::ocr::{normalize_detections, OcrBackend};
use crate::output::{
    Extraction, ExtractionStrategy, ManifestMetadata, ManifestOutput, ManifestRecord,
    ManifestStats, Page, SourceDocument,
};
use crate::pipeline::render::{self, AnalyzedDocument, NativePage};
use crate::pipeline::retry::{with_retry, RetryPolicy};
use crate::pipeline::strategy::{needs_ocr, resolve_page, OcrOutcome};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::storage::{is_pdf, DocumentStore};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Failure reason the labeling platform records for tasks nobody finished.
const EXPIRED_TASK_REASON: &str = "ClientError: Annotation tasks expired";

/// Build the manifest for every PDF under `prefix`.
///
/// # Errors
/// Returns `Err` only for fatal problems: invalid `config`, a listing that
/// fails after retries, or pdfium that cannot be bound. Everything else is
/// reported in [`ManifestOutput::failures`].
pub async fn build_manifest(
    store: &dyn DocumentStore,
    ocr: &dyn OcrBackend,
    prefix: &str,
    config: &ManifestConfig,
) -> Result<ManifestOutput, AnnotationError> {
    config.validate()?;
    if prefix.trim_matches('/').is_empty() {
        return Err(AnnotationError::InvalidConfig(
            "an input prefix is required".into(),
        ));
    }

    let start = Instant::now();
    let policy = config.retry_policy();
    let progress = progress_of(config);
    info!("Building manifest for {}", prefix);

    // ── Step 1: Discover documents ───────────────────────────────────────
    let documents = list_documents(store, prefix, policy).await?;
    info!("Found {} PDF documents", documents.len());
    progress.on_build_start(documents.len());

    let mut output = ManifestOutput::default();
    output.stats.documents = documents.len();

    for source_ref in &documents {
        // ── Step 2: Fetch ────────────────────────────────────────────────
        let fetched = with_retry(policy, source_ref, || store.get(source_ref)).await;
        let bytes = match fetched {
            Ok(obj) => obj.bytes,
            Err(e) => {
                skip_document(&mut output, &progress, source_ref, e.to_string());
                continue;
            }
        };

        // ── Step 3: Analyze ──────────────────────────────────────────────
        let analyzed =
            match render::analyze_document(source_ref, bytes, &config.analysis_options()).await {
                Ok(doc) => doc,
                Err(e @ (AnnotationError::PdfiumBindingFailed(_) | AnnotationError::Internal(_))) => {
                    return Err(e)
                }
                Err(e) => {
                    skip_document(&mut output, &progress, source_ref, e.to_string());
                    continue;
                }
            };
        progress.on_document_start(source_ref, analyzed.page_count);

        // ── Step 4: OCR + records ────────────────────────────────────────
        let part = assemble_records(vec![analyzed], ocr, config).await;
        merge(&mut output, part);
    }

    output.stats.duration_ms = start.elapsed().as_millis() as u64;
    info!(
        "Manifest complete: {} records from {} documents ({} native, {} ocr, {} empty), {}ms",
        output.records.len(),
        output.stats.documents - output.stats.failed_documents,
        output.stats.native_pages,
        output.stats.ocr_pages,
        output.stats.empty_pages,
        output.stats.duration_ms
    );
    progress.on_build_complete(output.records.len(), output.failures.len());
    Ok(output)
}

/// Turn analyzed documents into records, running OCR where pages need it.
///
/// This is the part of [`build_manifest`] after pdfium, so it works on
/// synthetic [`AnalyzedDocument`]s as well. Records come back in document
/// then page order whatever order the OCR calls finish in.
pub async fn assemble_records(
    documents: Vec<AnalyzedDocument>,
    ocr: &dyn OcrBackend,
    config: &ManifestConfig,
) -> ManifestOutput {
    let policy = config.retry_policy();
    let force_ocr = config.force_ocr;
    let progress = progress_of(config);

    let jobs: Vec<(usize, &NativePage)> = documents
        .iter()
        .enumerate()
        .flat_map(|(d, doc)| doc.pages.iter().map(move |p| (d, p)))
        .collect();
    debug!("Resolving {} pages (concurrency {})", jobs.len(), config.concurrency);

    let mut resolved: Vec<(usize, Page)> = stream::iter(jobs)
        .map(|(d, native)| {
            let source_ref = documents[d].source_ref.as_str();
            let progress = Arc::clone(&progress);
            async move {
                let outcome = ocr_page(ocr, native, force_ocr, policy, source_ref).await;
                let extraction = resolve_page(native, outcome, force_ocr);
                match &extraction.warning {
                    Some(w) if extraction.lines.is_empty() => {
                        progress.on_page_error(source_ref, native.index, w)
                    }
                    _ => progress.on_page_complete(source_ref, native.index, extraction.lines.len()),
                }
                let page = Page::new(
                    source_ref,
                    native.index,
                    extraction.strategy,
                    extraction.lines,
                    extraction.warning,
                );
                (d, page)
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .collect()
        .await;

    // Restore document/page order
    resolved.sort_by_key(|(d, page)| (*d, page.index));

    let mut grouped: Vec<SourceDocument> = documents
        .iter()
        .map(|doc| SourceDocument {
            source_ref: doc.source_ref.clone(),
            pages: Vec::new(),
        })
        .collect();
    for (d, page) in resolved {
        grouped[d].pages.push(page);
    }

    let mut output = ManifestOutput::default();
    for (doc, analyzed) in grouped.into_iter().zip(&documents) {
        for page in doc.pages {
            tally(&mut output.stats, &page);
            if page.lines.is_empty() {
                if let Some(ref w) = page.warning {
                    output.failures.push(ItemFailure::Page {
                        source_ref: page.source_ref.clone(),
                        page: page.index,
                        detail: w.clone(),
                    });
                }
            }
            output
                .records
                .push(record_for_page(page, analyzed.page_count, config));
        }
    }
    output
}

/// Sorted PDF keys under `prefix`.
pub async fn list_documents(
    store: &dyn DocumentStore,
    prefix: &str,
    policy: RetryPolicy,
) -> Result<Vec<String>, AnnotationError> {
    let mut keys = with_retry(policy, prefix, || store.list(prefix))
        .await
        .map_err(|e| AnnotationError::storage(prefix, e))?;
    keys.retain(|k| is_pdf(k));
    keys.sort();
    Ok(keys)
}

pub(crate) async fn ocr_page(
    ocr: &dyn OcrBackend,
    native: &NativePage,
    force_ocr: bool,
    policy: RetryPolicy,
    source_ref: &str,
) -> OcrOutcome {
    if !needs_ocr(native, force_ocr) {
        return OcrOutcome::NotAttempted;
    }
    let Some(png) = native.png.as_deref() else {
        return OcrOutcome::NotAttempted;
    };
    let what = format!("{} page {} via {}", source_ref, native.index, ocr.name());
    match with_retry(policy, &what, || ocr.detect_lines(png)).await {
        Ok(page) => OcrOutcome::Lines(normalize_detections(page)),
        Err(e) => {
            warn!("{}: {}", what, e);
            OcrOutcome::Failed(e.to_string())
        }
    }
}

fn record_for_page(page: Page, page_count: usize, config: &ManifestConfig) -> ManifestRecord {
    ManifestRecord {
        source_ref: page.source_ref,
        page: page.index,
        metadata: ManifestMetadata {
            pages: page_count,
            use_textract_only: config.force_ocr,
            labels: config.labels.clone(),
        },
        annotator_metadata: config.annotator_metadata.clone(),
        primary_annotation_ref: None,
        secondary_annotation_ref: None,
        extraction: Some(Extraction {
            strategy: page.strategy,
            text: page.text,
            lines: page.lines,
        }),
        warning: page.warning,
    }
}

fn tally(stats: &mut ManifestStats, page: &Page) {
    stats.pages += 1;
    if page.lines.is_empty() {
        stats.empty_pages += 1;
    }
    match page.strategy {
        ExtractionStrategy::Native => stats.native_pages += 1,
        ExtractionStrategy::Ocr => stats.ocr_pages += 1,
    }
}

fn merge(into: &mut ManifestOutput, part: ManifestOutput) {
    into.records.extend(part.records);
    into.failures.extend(part.failures);
    into.stats.pages += part.stats.pages;
    into.stats.native_pages += part.stats.native_pages;
    into.stats.ocr_pages += part.stats.ocr_pages;
    into.stats.empty_pages += part.stats.empty_pages;
}

fn skip_document(
    output: &mut ManifestOutput,
    progress: &ProgressCallback,
    source_ref: &str,
    detail: String,
) {
    warn!("Skipping {}: {}", source_ref, detail);
    progress.on_document_error(source_ref, &detail);
    output.stats.failed_documents += 1;
    output.failures.push(ItemFailure::Document {
        source_ref: source_ref.to_string(),
        detail,
    });
}

fn progress_of(config: &ManifestConfig) -> ProgressCallback {
    config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback))
}

// ── JSON lines ───────────────────────────────────────────────────────────

/// One JSON object per line, newline-terminated.
pub fn to_json_lines(records: &[ManifestRecord]) -> Result<String, AnnotationError> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| AnnotationError::Internal(format!("manifest serialization: {}", e)))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a JSON-lines manifest. Blank lines are ignored.
pub fn parse_json_lines(text: &str) -> Result<Vec<ManifestRecord>, AnnotationError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| AnnotationError::malformed(format!("manifest line {}", i + 1), e))
        })
        .collect()
}

/// Serialize `records` and store them at `path`.
pub async fn write_manifest(
    store: &dyn DocumentStore,
    path: &str,
    records: &[ManifestRecord],
) -> Result<(), AnnotationError> {
    let body = to_json_lines(records)?;
    with_retry(RetryPolicy::default(), path, || {
        store.put(path, body.clone().into_bytes())
    })
    .await
    .map_err(|e| AnnotationError::storage(path, e))?;
    info!("Wrote {} manifest records to {}", records.len(), path);
    Ok(())
}

// ── Follow-up jobs ───────────────────────────────────────────────────────

/// An output manifest of an earlier labeling job.
#[derive(Debug, Clone, Copy)]
pub struct PreviousJob<'a> {
    /// JSON-lines output manifest text.
    pub manifest: &'a str,
    /// Job name; also the label attribute under which annotations are stored.
    pub job_name: &'a str,
}

/// Whether an output-manifest line belongs to a task that expired unanswered.
pub fn is_expired_task(line: &Value, job_name: &str) -> bool {
    line.get(format!("{}-metadata", job_name))
        .and_then(|m| m.get("failure-reason"))
        .and_then(Value::as_str)
        .is_some_and(|reason| reason.contains(EXPIRED_TASK_REASON))
}

/// Build a verification or arbitration manifest from earlier blind passes.
///
/// Each line of the primary output manifest becomes a record pointing at its
/// annotation (`primary-annotation-ref`); with a secondary job, the line at
/// the same position of its manifest supplies `secondary-annotation-ref`.
/// Labels are replaced with `labels`.
///
/// With `only_expired`, only tasks that expired in the primary job are kept,
/// and they are re-issued with the annotation refs they were given before.
pub fn records_from_previous_jobs(
    primary: PreviousJob<'_>,
    secondary: Option<PreviousJob<'_>>,
    labels: &[String],
    annotator_metadata: Option<&BTreeMap<String, String>>,
    only_expired: bool,
) -> Result<ManifestOutput, AnnotationError> {
    let primary_lines = parse_value_lines(primary.manifest, primary.job_name)?;
    let secondary_lines = match secondary {
        Some(job) => {
            let lines = parse_value_lines(job.manifest, job.job_name)?;
            if lines.len() != primary_lines.len() {
                return Err(AnnotationError::malformed(
                    "output manifests",
                    format!(
                        "{} has {} lines but {} has {}",
                        primary.job_name,
                        primary_lines.len(),
                        job.job_name,
                        lines.len()
                    ),
                ));
            }
            Some((job.job_name, lines))
        }
        None => None,
    };

    let mut output = ManifestOutput::default();
    for (i, line) in primary_lines.iter().enumerate() {
        let expired = is_expired_task(line, primary.job_name);
        if only_expired && !expired {
            continue;
        }
        let source_ref = line
            .get("source-ref")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let refs = if only_expired {
            Ok((
                string_field(line, "primary-annotation-ref"),
                string_field(line, "secondary-annotation-ref"),
            ))
        } else {
            annotation_ref(line, primary.job_name).map(|p| {
                let s = secondary_lines
                    .as_ref()
                    .and_then(|(job, lines)| annotation_ref(&lines[i], job).ok());
                (Some(p), s)
            })
        };
        let (primary_ref, secondary_ref) = match refs {
            Ok(r) => r,
            Err(detail) => {
                output.failures.push(ItemFailure::Document {
                    source_ref,
                    detail: format!("manifest line {}: {}", i + 1, detail),
                });
                continue;
            }
        };

        let mut record: ManifestRecord = serde_json::from_value(strip_job_keys(line))
            .map_err(|e| AnnotationError::malformed(format!("manifest line {}", i + 1), e))?;
        record.metadata.labels = labels.to_vec();
        record.annotator_metadata = annotator_metadata.cloned();
        record.primary_annotation_ref = primary_ref;
        record.secondary_annotation_ref = secondary_ref;
        record.extraction = None;
        record.warning = None;
        output.stats.pages += 1;
        output.records.push(record);
    }
    info!(
        "Built {} follow-up records from {}",
        output.records.len(),
        primary.job_name
    );
    Ok(output)
}

fn parse_value_lines(text: &str, job_name: &str) -> Result<Vec<Value>, AnnotationError> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str(l).map_err(|e| {
                AnnotationError::malformed(
                    format!("output manifest of {} line {}", job_name, i + 1),
                    e,
                )
            })
        })
        .collect()
}

fn annotation_ref(line: &Value, job_name: &str) -> Result<String, String> {
    line.get(job_name)
        .and_then(|a| a.get("annotation-ref"))
        .and_then(Value::as_str)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("no annotation-ref for job {}", job_name))
}

fn string_field(line: &Value, key: &str) -> Option<String> {
    line.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Keep only the fields a [`ManifestRecord`] knows; output manifests carry
/// job-named attributes next to them.
fn strip_job_keys(line: &Value) -> Value {
    const KEEP: [&str; 4] = ["source-ref", "page", "metadata", "annotator-metadata"];
    match line {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| KEEP.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels() -> Vec<String> {
        vec!["PER".into(), "ORG".into()]
    }

    fn output_line(file: &str, job: &str, ann: Option<&str>, expired: bool) -> String {
        let mut line = json!({
            "source-ref": format!("s3://bucket/documents/{}.pdf", file),
            "page": "1",
            "metadata": {"pages": "1", "use-textract-only": false, "labels": ["OLD"]},
            "annotator-metadata": null,
            "primary-annotation-ref": format!("s3://bucket/annotations/{}-1-12345678-ann.json", file),
            "secondary-annotation-ref": format!("s3://bucket/annotations/{}-1-23456789-ann.json", file),
        });
        if let Some(a) = ann {
            line[job] = json!({"annotation-ref": a});
        }
        if expired {
            line[format!("{}-metadata", job)] = json!({
                "failure-reason": "ClientError: Annotation tasks expired before completion"
            });
        }
        line.to_string()
    }

    #[test]
    fn json_lines_round_trip_keeps_order() {
        let text = [
            output_line("a", "j", None, false),
            String::new(),
            output_line("b", "j", None, false),
        ]
        .join("\n");
        let records = parse_json_lines(&text).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].source_ref.ends_with("b.pdf"));
        let back = to_json_lines(&records).unwrap();
        assert_eq!(back.lines().count(), 2);
        assert!(back.ends_with('\n'));
    }

    #[test]
    fn bad_manifest_line_is_reported_with_its_number() {
        let err = parse_json_lines("{\"source-ref\": 1}\n").unwrap_err();
        assert!(err.to_string().contains("manifest line 1"));
    }

    #[test]
    fn expired_detection() {
        let expired: Value = serde_json::from_str(&output_line("a", "job", None, true)).unwrap();
        let fine: Value = serde_json::from_str(&output_line("a", "job", Some("s3://x"), false)).unwrap();
        assert!(is_expired_task(&expired, "job"));
        assert!(!is_expired_task(&fine, "job"));
        assert!(!is_expired_task(&expired, "other-job"));
    }

    #[test]
    fn verification_records_pair_lines_by_position() {
        let blind1 = [
            output_line("f1", "b1", Some("s3://bucket/ann/f1-p.json"), false),
            output_line("f2", "b1", Some("s3://bucket/ann/f2-p.json"), false),
        ]
        .join("\n");
        let blind2 = [
            output_line("f1", "b2", Some("s3://bucket/ann/f1-s.json"), false),
            output_line("f2", "b2", Some("s3://bucket/ann/f2-s.json"), false),
        ]
        .join("\n");

        let out = records_from_previous_jobs(
            PreviousJob { manifest: &blind1, job_name: "b1" },
            Some(PreviousJob { manifest: &blind2, job_name: "b2" }),
            &labels(),
            None,
            false,
        )
        .unwrap();

        assert_eq!(out.records.len(), 2);
        let r = &out.records[1];
        assert_eq!(r.metadata.labels, labels());
        assert_eq!(r.primary_annotation_ref.as_deref(), Some("s3://bucket/ann/f2-p.json"));
        assert_eq!(r.secondary_annotation_ref.as_deref(), Some("s3://bucket/ann/f2-s.json"));
        assert!(r.is_verification());
    }

    #[test]
    fn single_blind_pass_has_no_secondary() {
        let blind1 = output_line("f1", "b1", Some("s3://bucket/ann/f1-p.json"), false);
        let out = records_from_previous_jobs(
            PreviousJob { manifest: &blind1, job_name: "b1" },
            None,
            &labels(),
            None,
            false,
        )
        .unwrap();
        assert_eq!(out.records[0].secondary_annotation_ref, None);
    }

    #[test]
    fn expired_only_reissues_original_refs() {
        let manifest = [
            output_line("file1", "job", Some("s3://bucket/ann/done.json"), false),
            output_line("file2", "job", None, true),
            output_line("file3", "job", None, true),
        ]
        .join("\n");
        let out = records_from_previous_jobs(
            PreviousJob { manifest: &manifest, job_name: "job" },
            None,
            &labels(),
            None,
            true,
        )
        .unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(
            out.records[0].primary_annotation_ref.as_deref(),
            Some("s3://bucket/annotations/file2-1-12345678-ann.json")
        );
        assert_eq!(
            out.records[1].secondary_annotation_ref.as_deref(),
            Some("s3://bucket/annotations/file3-1-23456789-ann.json")
        );
    }

    #[test]
    fn line_without_annotation_is_a_failure_not_an_abort() {
        let manifest = [
            output_line("file1", "job", None, false),
            output_line("file2", "job", Some("s3://bucket/ann/2.json"), false),
        ]
        .join("\n");
        let out = records_from_previous_jobs(
            PreviousJob { manifest: &manifest, job_name: "job" },
            None,
            &labels(),
            None,
            false,
        )
        .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.failures.len(), 1);
    }

    #[test]
    fn mismatched_manifests_are_rejected() {
        let one = output_line("f1", "b1", Some("s3://a"), false);
        let two = [
            output_line("f1", "b2", Some("s3://b"), false),
            output_line("f2", "b2", Some("s3://c"), false),
        ]
        .join("\n");
        assert!(records_from_previous_jobs(
            PreviousJob { manifest: &one, job_name: "b1" },
            Some(PreviousJob { manifest: &two, job_name: "b2" }),
            &labels(),
            None,
            false,
        )
        .is_err());
    }
}
