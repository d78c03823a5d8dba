//! Integration tests for the manifest builder and the pre-human-task flow.
//!
//! pdfium is not needed: pages are fed in as synthetic `AnalyzedDocument`s
//! and OCR goes to a scripted backend keyed by the page number stored in
//! the fake PNG bytes.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use ssie_annotation::blocks::{lines_to_blocks, Block, Geometry, Point};
use ssie_annotation::manifest::assemble_records;
use ssie_annotation::ocr::{CoordinateSpace, LineDetection, OcrError, OcrPage};
use ssie_annotation::output::{ExtractionStrategy, Line};
use ssie_annotation::pipeline::render::{AnalyzedDocument, NativePage};
use ssie_annotation::{
    build_manifest, handle_pre_human_task, DocumentStore, ItemFailure, ManifestConfig,
    MemoryDocumentStore, OcrBackend, SemiStructuredAnnotation, StoreError, TaskConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Replies per page number (the first byte of the "PNG").
#[derive(Default)]
struct ScriptedOcr {
    replies: Mutex<HashMap<u8, Vec<Result<Vec<&'static str>, OcrError>>>>,
    delays_ms: HashMap<u8, u64>,
    calls: AtomicUsize,
}

impl ScriptedOcr {
    fn reply(self, page: u8, result: Result<Vec<&'static str>, OcrError>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .push(result);
        self
    }

    fn delay(mut self, page: u8, ms: u64) -> Self {
        self.delays_ms.insert(page, ms);
        self
    }
}

#[async_trait]
impl OcrBackend for ScriptedOcr {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn detect_lines(&self, png: &[u8]) -> Result<OcrPage, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let page = png[0];
        if let Some(ms) = self.delays_ms.get(&page) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        let next = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.get_mut(&page).expect("unexpected OCR call");
            queue.remove(0)
        };
        let texts = next?;
        Ok(OcrPage {
            lines: texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let top = 0.1 + 0.05 * i as f64;
                    LineDetection {
                        text: t.to_string(),
                        polygon: vec![
                            Point::new(0.1, top),
                            Point::new(0.6, top),
                            Point::new(0.6, top + 0.03),
                            Point::new(0.1, top + 0.03),
                        ],
                        confidence: Some(0.98),
                        words: vec![],
                    }
                })
                .collect(),
            coordinates: CoordinateSpace::Normalized,
        })
    }
}

fn line(text: &str, top: f64) -> Line {
    let mut geometry = Geometry::default();
    geometry.bounding_box.top = top;
    geometry.bounding_box.height = 0.02;
    Line {
        text: text.into(),
        geometry,
        confidence: None,
        words: vec![],
    }
}

fn text_page(index: usize, texts: &[&str]) -> NativePage {
    NativePage {
        index,
        width: 612.0,
        height: 792.0,
        lines: texts
            .iter()
            .enumerate()
            .map(|(i, t)| line(t, 0.1 + 0.05 * i as f64))
            .collect(),
        ..Default::default()
    }
}

/// A page with no text layer, rendered for OCR.
fn scanned_page(index: usize) -> NativePage {
    NativePage {
        index,
        width: 612.0,
        height: 792.0,
        image_coverage: 1.0,
        png: Some(vec![index as u8]),
        ..Default::default()
    }
}

fn document(source_ref: &str, pages: Vec<NativePage>) -> AnalyzedDocument {
    AnalyzedDocument {
        source_ref: source_ref.into(),
        page_count: pages.len(),
        pages,
    }
}

fn config(concurrency: usize) -> ManifestConfig {
    ManifestConfig::builder()
        .labels(vec!["DATE".into(), "NAME".into()])
        .concurrency(concurrency)
        .retry_backoff_ms(1)
        .build()
        .unwrap()
}

// ── Manifest builder ─────────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_d_scanned_middle_page_goes_to_ocr() {
    let doc = document(
        "s3://docs/in/report.pdf",
        vec![
            text_page(1, &["Quarterly report", "Acme Corp"]),
            scanned_page(2),
            text_page(3, &["Signed by Jane Doe"]),
        ],
    );
    let ocr = ScriptedOcr::default().reply(2, Ok(vec!["Invoice 2021-04", "Total 1,200.00"]));

    let output = assemble_records(vec![doc], &ocr, &config(4)).await;

    assert!(output.failures.is_empty(), "{:?}", output.failures);
    assert_eq!(output.records.len(), 3);
    let pages: Vec<usize> = output.records.iter().map(|r| r.page).collect();
    assert_eq!(pages, vec![1, 2, 3]);

    let strategies: Vec<ExtractionStrategy> = output
        .records
        .iter()
        .map(|r| r.extraction.as_ref().unwrap().strategy)
        .collect();
    assert_eq!(
        strategies,
        vec![
            ExtractionStrategy::Native,
            ExtractionStrategy::Ocr,
            ExtractionStrategy::Native
        ]
    );

    let page2 = output.records[1].extraction.as_ref().unwrap();
    assert_eq!(page2.text, "Invoice 2021-04\nTotal 1,200.00");
    assert_eq!(page2.lines[0].confidence, Some(0.98));
    assert!(!page2.lines[0].words.is_empty());

    for record in &output.records {
        assert_eq!(record.metadata.pages, 3);
        assert_eq!(record.metadata.labels, vec!["DATE", "NAME"]);
    }
    assert_eq!(output.stats.native_pages, 2);
    assert_eq!(output.stats.ocr_pages, 1);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pages_keep_physical_order_when_ocr_finishes_out_of_order() {
    let doc = document(
        "s3://docs/in/scan.pdf",
        (1..=4).map(scanned_page).collect(),
    );
    let ocr = ScriptedOcr::default()
        .reply(1, Ok(vec!["one"]))
        .reply(2, Ok(vec!["two"]))
        .reply(3, Ok(vec!["three"]))
        .reply(4, Ok(vec!["four"]))
        .delay(1, 40)
        .delay(2, 30)
        .delay(3, 20);

    let output = assemble_records(vec![doc], &ocr, &config(4)).await;
    let texts: Vec<&str> = output
        .records
        .iter()
        .map(|r| r.extraction.as_ref().unwrap().text.as_str())
        .collect();
    assert_eq!(texts, vec!["one", "two", "three", "four"]);
}

#[tokio::test]
async fn transient_ocr_errors_are_retried() {
    let doc = document("s3://docs/in/scan.pdf", vec![scanned_page(1)]);
    let ocr = ScriptedOcr::default()
        .reply(1, Err(OcrError::Throttled("slow down".into())))
        .reply(1, Err(OcrError::Timeout("60s".into())))
        .reply(1, Ok(vec!["finally"]));

    let output = assemble_records(vec![doc], &ocr, &config(1)).await;
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 3);
    assert_eq!(output.records[0].extraction.as_ref().unwrap().text, "finally");
}

#[tokio::test]
async fn page_without_text_is_emitted_empty_and_reported() {
    let doc = document(
        "s3://docs/in/scan.pdf",
        vec![scanned_page(1), text_page(2, &["kept"])],
    );
    let ocr = ScriptedOcr::default().reply(1, Err(OcrError::Unauthorized("bad key".into())));

    let output = assemble_records(vec![doc], &ocr, &config(2)).await;
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
    assert_eq!(output.records.len(), 2);

    let empty = &output.records[0];
    assert!(empty.extraction.as_ref().unwrap().lines.is_empty());
    assert!(empty.warning.as_deref().unwrap().contains("bad key"));
    assert_eq!(output.stats.empty_pages, 1);
    assert!(matches!(
        &output.failures[..],
        [ItemFailure::Page { page: 1, .. }]
    ));
}

#[tokio::test]
async fn unreadable_document_is_skipped_not_fatal() {
    let store = MemoryDocumentStore::new();
    store.insert("s3://docs/in/a.pdf", b"%PDF-1.4".to_vec()).await;
    store.insert("s3://docs/in/notes.txt", b"ignored".to_vec()).await;
    store
        .fail_next("s3://docs/in/a.pdf", StoreError::AccessDenied("a.pdf".into()))
        .await;
    let ocr = ScriptedOcr::default();

    let output = build_manifest(&store, &ocr, "s3://docs/in", &config(2))
        .await
        .unwrap();
    assert!(output.records.is_empty());
    assert_eq!(output.stats.documents, 1);
    assert_eq!(output.stats.failed_documents, 1);
    assert!(matches!(
        &output.failures[..],
        [ItemFailure::Document { source_ref, .. }] if source_ref == "s3://docs/in/a.pdf"
    ));
}

#[tokio::test]
async fn empty_prefix_is_a_config_error() {
    let store = MemoryDocumentStore::new();
    let err = build_manifest(&store, &ScriptedOcr::default(), "", &config(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("prefix"));
}

// ── Pre-human-task flow ──────────────────────────────────────────────────────

const SOURCE_REF: &str = "s3://docs/in/invoice.pdf";
const PRIMARY_REF: &str = "s3://docs/output/job-1/annotations/primary-ann.json";
const SECONDARY_REF: &str = "s3://docs/output/job-2/annotations/secondary-ann.json";

fn annotation(texts: &[&str]) -> Vec<u8> {
    let lines: Vec<Line> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| line(t, 0.1 + 0.05 * i as f64))
        .collect();
    let doc = SemiStructuredAnnotation {
        blocks: lines_to_blocks(1, &lines),
        ..Default::default()
    };
    serde_json::to_vec(&doc).unwrap()
}

fn verification_event() -> serde_json::Value {
    json!({
        "version": "2018-10-16",
        "labelingJobArn": "arn:aws:sagemaker:us-west-2:123456789012:labeling-job/job-3",
        "dataObject": {
            "source-ref": SOURCE_REF,
            "page": "1",
            "metadata": {"pages": "1", "use-textract-only": false, "labels": ["ORG", "PER"]},
            "annotator-metadata": {"Due": "12/12", "Batch": "7"},
            "primary-annotation-ref": PRIMARY_REF,
            "secondary-annotation-ref": SECONDARY_REF,
        }
    })
}

#[tokio::test]
async fn verification_reuses_the_newest_prior_annotation() {
    let store = MemoryDocumentStore::new();
    store.insert(SOURCE_REF, b"%PDF-1.4 fake".to_vec()).await;
    let older = Utc.with_ymd_and_hms(2021, 12, 1, 0, 0, 0).unwrap();
    let newer = Utc.with_ymd_and_hms(2021, 12, 2, 0, 0, 0).unwrap();
    store.insert_at(PRIMARY_REF, annotation(&["old text"]), older).await;
    store
        .insert_at(SECONDARY_REF, annotation(&["Acme Corp", "Jane Doe"]), newer)
        .await;
    let config = TaskConfig::builder().verification(true).build().unwrap();
    let ocr = ScriptedOcr::default();

    let output = handle_pre_human_task(&verification_event(), &store, &ocr, &config)
        .await
        .unwrap();
    assert_eq!(output.human_annotation_required, "true");
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);

    let input = output.task_input.unwrap();
    let task = &input.task_object;
    assert_eq!(task.primary_annotation_ref.as_deref(), Some(SECONDARY_REF));
    assert_eq!(task.secondary_annotation_ref.as_deref(), Some(PRIMARY_REF));
    assert_eq!(task.entity_types, vec!["ORG", "PER"]);
    assert_eq!(input.labels, vec!["ORG", "PER"]);
    assert_eq!(task.text, "Acme Corp\nJane Doe");
    assert_eq!(task.annotator_pairs(), vec![("Batch", "7"), ("Due", "12/12")]);
    assert!(task.blocks.is_empty() && task.lines.is_empty());

    let folder = "s3://docs/comprehend-semi-structured-docs-intermediate-output/job-3";
    let blocks_ref = format!("{}/invoice_1_blocks.json", folder);
    let base64_ref = format!("{}/invoice_1_base64", folder);
    assert_eq!(task.pdf_blocks_s3_ref.as_deref(), Some(blocks_ref.as_str()));
    assert_eq!(task.pdf_base64_s3_ref.as_deref(), Some(base64_ref.as_str()));

    let staged: Vec<Block> =
        serde_json::from_str(&store.text(&blocks_ref).await.unwrap()).unwrap();
    assert_eq!(ssie_annotation::blocks::page_text_from_blocks(&staged), "Acme Corp\nJane Doe");
    let encoded = store.get(&base64_ref).await.unwrap();
    assert_eq!(encoded.text().unwrap(), "JVBERi0xLjQgZmFrZQ==");
}

#[tokio::test]
async fn missing_source_ref_needs_no_human() {
    let store = MemoryDocumentStore::new();
    let event = json!({
        "labelingJobArn": "arn:aws:sagemaker:us-west-2:1:labeling-job/job-3",
        "dataObject": {"page": "1"}
    });
    let config = TaskConfig::builder().verification(true).build().unwrap();
    let output = handle_pre_human_task(&event, &store, &ScriptedOcr::default(), &config)
        .await
        .unwrap();
    assert_eq!(output.human_annotation_required, "false");
    assert!(output.task_input.is_none());
    assert!(store.paths().await.is_empty());
}

#[tokio::test]
async fn missing_pdf_is_a_storage_error() {
    let store = MemoryDocumentStore::new();
    let config = TaskConfig::builder().verification(true).build().unwrap();
    let err = handle_pre_human_task(&verification_event(), &store, &ScriptedOcr::default(), &config)
        .await
        .unwrap_err();
    assert!(err.to_string().contains(SOURCE_REF));
}
