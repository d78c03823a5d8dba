//! Integration tests for annotation consolidation: the reconciliation rules
//! and the batch flow over an in-memory store.

use serde_json::{json, Value};
use ssie_annotation::blocks::{lines_to_blocks, Geometry};
use ssie_annotation::output::Line;
use ssie_annotation::{
    consolidate_batch, reconcile, AnnotationSet, AnnotationSource, BatchOutput, ConsolidationInput,
    Entity, ItemFailure, MemoryDocumentStore, ReconciledAnnotation, RejectionReason,
    ResolutionStatus, SemiStructuredAnnotation,
};

// ── Test helpers ─────────────────────────────────────────────────────────────

fn set(source: AnnotationSource, entities: &[(&str, i64, i64)]) -> AnnotationSet {
    AnnotationSet::new(
        source,
        entities
            .iter()
            .map(|(t, b, e)| Entity::new(*t, *b, *e))
            .collect(),
    )
}

fn pair(a: &[(&str, i64, i64)], b: &[(&str, i64, i64)]) -> ConsolidationInput {
    ConsolidationInput::pair(
        set(AnnotationSource::Worker1, a),
        set(AnnotationSource::Worker2, b),
        100,
    )
}

fn swapped(input: &ConsolidationInput) -> ConsolidationInput {
    let w2 = input.worker2.clone().expect("two workers");
    ConsolidationInput {
        worker1: AnnotationSet::new(AnnotationSource::Worker1, w2.entities),
        worker2: Some(AnnotationSet::new(
            AnnotationSource::Worker2,
            input.worker1.entities.clone(),
        )),
        ..input.clone()
    }
}

/// The reconciliation with `-only` labels and candidate sources ignored.
fn shape(r: &ReconciledAnnotation) -> Vec<(i64, i64, Option<String>, bool, usize)> {
    r.entities
        .iter()
        .map(|e| {
            (
                e.begin_offset,
                e.end_offset,
                e.entity_type.clone(),
                e.status == ResolutionStatus::Conflicting,
                e.candidates.len(),
            )
        })
        .collect()
}

// ── Reconciliation scenarios ─────────────────────────────────────────────────

#[test]
fn scenario_a_identical_sets_agree() {
    let r = reconcile(&pair(&[("DATE", 0, 10)], &[("DATE", 0, 10)]));
    assert_eq!(r.entities.len(), 1);
    let e = &r.entities[0];
    assert_eq!((e.begin_offset, e.end_offset), (0, 10));
    assert_eq!(e.entity_type.as_deref(), Some("DATE"));
    assert_eq!(e.status, ResolutionStatus::Agreed);
}

#[test]
fn scenario_b_same_span_different_type_conflicts() {
    let r = reconcile(&pair(&[("DATE", 0, 10)], &[("NAME", 0, 10)]));
    assert_eq!(r.entities.len(), 1);
    let e = &r.entities[0];
    assert_eq!(e.status, ResolutionStatus::Conflicting);
    assert_eq!((e.begin_offset, e.end_offset), (0, 10));
    let types: Vec<_> = e.candidates.iter().map(|c| c.entity_type.as_str()).collect();
    assert_eq!(types, vec!["DATE", "NAME"]);
}

#[test]
fn scenario_c_single_worker_passes_through() {
    let input = ConsolidationInput::single(set(AnnotationSource::Worker1, &[("ORG", 5, 15)]), 40);
    let r = reconcile(&input);
    assert_eq!(r.entities.len(), 1);
    assert_eq!(r.entities[0].entity_type.as_deref(), Some("ORG"));
    assert_eq!((r.entities[0].begin_offset, r.entities[0].end_offset), (5, 15));
    assert_eq!(r.entities[0].status, ResolutionStatus::Worker1Only);
}

#[test]
fn swapping_workers_only_swaps_attribution() {
    let cases = [
        pair(&[("DATE", 0, 10)], &[("DATE", 0, 10)]),
        pair(&[("DATE", 0, 10), ("ORG", 30, 40)], &[("NAME", 5, 12)]),
        pair(&[("A", 0, 5), ("B", 8, 12)], &[("C", 4, 9), ("D", 50, 60)]),
        pair(&[("PER", 20, 25), ("PER", 70, 75)], &[("PER", 20, 25), ("LOC", 0, 3)]),
    ];
    for input in &cases {
        let forward = reconcile(input);
        let backward = reconcile(&swapped(input));
        assert_eq!(shape(&forward), shape(&backward), "input: {input:?}");

        for (f, b) in forward.entities.iter().zip(&backward.entities) {
            let expected = match f.status {
                ResolutionStatus::Worker1Only => ResolutionStatus::Worker2Only,
                ResolutionStatus::Worker2Only => ResolutionStatus::Worker1Only,
                other => other,
            };
            assert_eq!(b.status, expected);
        }
    }
}

#[test]
fn reconciling_twice_gives_the_same_result() {
    let input = pair(
        &[("DATE", 0, 10), ("ORG", 30, 40), ("PER", 3, 4)],
        &[("NAME", 5, 12), ("ORG", 30, 40)],
    );
    assert_eq!(reconcile(&input), reconcile(&input));
}

#[test]
fn touching_spans_are_not_overlaps() {
    let r = reconcile(&pair(&[("DATE", 0, 10)], &[("NAME", 10, 20)]));
    let statuses: Vec<_> = r.entities.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![ResolutionStatus::Worker1Only, ResolutionStatus::Worker2Only]
    );
}

#[test]
fn output_is_sorted_by_offsets() {
    let r = reconcile(&pair(
        &[("ORG", 60, 70), ("PER", 0, 4)],
        &[("LOC", 30, 35), ("PER", 0, 4)],
    ));
    let begins: Vec<_> = r.entities.iter().map(|e| e.begin_offset).collect();
    assert_eq!(begins, vec![0, 30, 60]);
}

#[test]
fn verification_against_prior_annotation() {
    let mut input = ConsolidationInput::single(set(AnnotationSource::Worker1, &[("ORG", 5, 15)]), 40);
    input.prior = Some(set(AnnotationSource::Prior, &[("ORG", 5, 15)]));
    assert_eq!(reconcile(&input).matches_prior, Some(true));

    input.worker1 = set(AnnotationSource::Worker1, &[("ORG", 5, 16)]);
    assert_eq!(reconcile(&input).matches_prior, Some(false));
}

// ── Batch flow ───────────────────────────────────────────────────────────────

const REQUEST_REF: &str =
    "s3://docs/output/job-1/annotations/consolidation-request/iteration-1/2021-12-14_08:46:41.json";
const BLOCKS_REF: &str =
    "s3://docs/comprehend-semi-structured-docs-intermediate-output/job-1/invoice_1_blocks.json";

fn line(text: &str, top: f64) -> Line {
    let mut geometry = Geometry::default();
    geometry.bounding_box.top = top;
    Line {
        text: text.into(),
        geometry,
        confidence: None,
        words: vec![],
    }
}

fn worker_content(entities: Value) -> Value {
    let document = json!({
        "BlocksS3Ref": BLOCKS_REF,
        "DocumentMetadata": {"Pages": "1", "PageNumber": "1"},
        "Version": "2021-04-30",
        "DocumentType": "NativePDF",
        "Entities": entities,
        "File": "invoice.pdf",
    });
    json!({
        "annotationData": {
            "content": json!({"document": document.to_string()}).to_string()
        }
    })
}

fn event() -> Value {
    json!({
        "version": "2018-10-06",
        "labelingJobArn": "arn:aws:sagemaker:us-west-2:123456789012:labeling-job/job-1",
        "labelAttributeName": "job-1",
        "labelCategories": null,
        "payload": {"s3Uri": REQUEST_REF},
        "outputConfig": "s3://docs/output/job-1/annotations",
    })
}

async fn seeded_store(items: &Value) -> MemoryDocumentStore {
    let store = MemoryDocumentStore::new();
    let mut blocks = lines_to_blocks(1, &[line("Acme Corp", 0.1), line("Jane Doe", 0.2)]);
    assert!(blocks.iter().any(|b| b.block_index.is_some()));
    blocks[0].parent_block_index = Some(-1);
    store
        .insert(BLOCKS_REF, serde_json::to_vec(&blocks).unwrap())
        .await;
    store
        .insert(REQUEST_REF, serde_json::to_vec(items).unwrap())
        .await;
    store
}

#[tokio::test]
async fn single_worker_annotation_is_written_with_blocks() {
    let items = json!([{
        "datasetObjectId": "0",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [worker_content(json!([
            {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9}
        ]))],
    }]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    assert!(output.failures.is_empty(), "{:?}", output.failures);
    assert_eq!(output.reconciled.len(), 1);
    assert_eq!(
        output.reconciled[0].1.count(ResolutionStatus::Worker1Only),
        1
    );
    assert_eq!(output.responses.len(), 1);

    let response = serde_json::to_value(&output.responses[0]).unwrap();
    assert_eq!(response["datasetObjectId"], "0");
    let content = &response["consolidatedAnnotation"]["content"];
    let annotation_ref = content["job-1"]["annotation-ref"].as_str().unwrap();
    assert!(annotation_ref.starts_with(
        "s3://docs/output/job-1/annotations/consolidation-response/iteration-1/annotations/invoice-1-"
    ));
    assert!(annotation_ref.ends_with("-ann.json"));

    let metadata = &content["job-1-metadata"];
    assert_eq!(metadata["job-name"], "labeling-job/job-1");
    assert_eq!(metadata["type"], "groundtruth/pdf-ner");
    assert_eq!(metadata["human-annotated"], "yes");
    assert_eq!(metadata["rejected-entities"], 0);
    assert!(metadata["creation-date"].as_str().unwrap().starts_with("20"));

    let written: SemiStructuredAnnotation =
        serde_json::from_str(&store.text(annotation_ref).await.unwrap()).unwrap();
    assert!(!written.blocks.is_empty());
    assert!(written
        .blocks
        .iter()
        .all(|b| b.block_index.is_none() && b.parent_block_index.is_none()));
    assert_eq!(written.entities.len(), 1);
    assert!(annotation_ref.ends_with(&written.file));
}

#[tokio::test]
async fn two_workers_are_reconciled() {
    let items = json!([{
        "datasetObjectId": "7",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [
            worker_content(json!([
                {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9},
                {"Type": "PER", "BeginOffset": 10, "EndOffset": 18},
            ])),
            worker_content(json!([
                {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9},
                {"Type": "ORG", "BeginOffset": 10, "EndOffset": 14},
            ])),
        ],
    }]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    assert_eq!(output.reconciled.len(), 1);
    let (id, reconciled) = &output.reconciled[0];
    assert_eq!(id, "7");
    assert_eq!(reconciled.count(ResolutionStatus::Agreed), 1);
    assert_eq!(reconciled.count(ResolutionStatus::Conflicting), 1);

    let content = serde_json::to_value(&output.responses[0].consolidated_annotation.content).unwrap();
    assert_eq!(content["job-1-metadata"]["conflicting-entities"], 1);

    // Conflicting spans are left out of the written document.
    let path = content["job-1"]["annotation-ref"].as_str().unwrap();
    let written: SemiStructuredAnnotation =
        serde_json::from_str(&store.text(path).await.unwrap()).unwrap();
    assert_eq!(written.entities.len(), 1);
    assert_eq!(written.entities[0]["Type"], "ORG");
}

/// Written annotation document and metadata of the single response.
async fn written(output: &BatchOutput, store: &MemoryDocumentStore) -> (SemiStructuredAnnotation, Value) {
    let content =
        serde_json::to_value(&output.responses[0].consolidated_annotation.content).unwrap();
    let path = content["job-1"]["annotation-ref"].as_str().unwrap();
    let doc = serde_json::from_str(&store.text(path).await.unwrap()).unwrap();
    (doc, content["job-1-metadata"].clone())
}

fn reasons(reconciled: &ReconciledAnnotation) -> Vec<(AnnotationSource, RejectionReason)> {
    let mut reasons: Vec<_> = reconciled
        .rejected
        .iter()
        .map(|r| (r.source, r.reason))
        .collect();
    reasons.sort_by_key(|(source, reason)| (*source, format!("{:?}", reason)));
    reasons
}

#[tokio::test]
async fn single_worker_malformed_entities_are_rejected() {
    // Page text is "Acme Corp\nJane Doe": 18 chars.
    let items = json!([{
        "datasetObjectId": "0",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [worker_content(json!([
            {"Type": "ORG", "BeginOffset": 5, "EndOffset": 500},
            {"Type": "ORG", "BeginOffset": 3, "EndOffset": 3},
            {"Type": "PER", "BeginOffset": 10, "EndOffset": 18},
        ]))],
    }]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    let (_, reconciled) = &output.reconciled[0];
    assert_eq!(
        reasons(reconciled),
        vec![
            (AnnotationSource::Worker1, RejectionReason::EmptySpan),
            (AnnotationSource::Worker1, RejectionReason::OutOfBounds),
        ]
    );

    let (doc, metadata) = written(&output, &store).await;
    assert_eq!(metadata["rejected-entities"], 2);
    assert_eq!(metadata["conflicting-entities"], 0);
    assert_eq!(doc.entities, vec![json!({"Type": "PER", "BeginOffset": 10, "EndOffset": 18})]);
}

#[tokio::test]
async fn two_workers_boundary_and_unresolvable_entities_are_reported() {
    let items = json!([{
        "datasetObjectId": "4",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [
            worker_content(json!([
                {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9},
                {"Type": "PER", "BlockReferences": [
                    {"BlockId": "no-such-block", "BeginOffset": 0, "EndOffset": 4}
                ]},
            ])),
            worker_content(json!([
                {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9},
                {"Type": "PER", "BeginOffset": 10, "EndOffset": 19},
            ])),
        ],
    }]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    assert!(output.failures.is_empty(), "{:?}", output.failures);
    let (_, reconciled) = &output.reconciled[0];
    assert_eq!(reconciled.count(ResolutionStatus::Agreed), 1);
    assert_eq!(reconciled.entities.len(), 1);
    assert_eq!(
        reasons(reconciled),
        vec![
            (AnnotationSource::Worker1, RejectionReason::Unresolvable),
            (AnnotationSource::Worker2, RejectionReason::OutOfBounds),
        ]
    );
    let unresolved = reconciled
        .rejected
        .iter()
        .find(|r| r.reason == RejectionReason::Unresolvable)
        .unwrap();
    assert_eq!(unresolved.entity.entity_type, "PER");

    let (doc, metadata) = written(&output, &store).await;
    assert_eq!(metadata["rejected-entities"], 2);
    assert_eq!(doc.entities.len(), 1);
    assert_eq!(doc.entities[0]["Type"], "ORG");
}

#[tokio::test]
async fn written_entities_keep_ui_fields() {
    let items = json!([{
        "datasetObjectId": "5",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [
            worker_content(json!([
                {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9, "Text": "Acme Corp", "Score": 0.9},
            ])),
            worker_content(json!([
                {"Type": "ORG", "BeginOffset": 0, "EndOffset": 9},
                {"Type": "PER", "BeginOffset": 10, "EndOffset": 18, "Text": "Jane Doe"},
            ])),
        ],
    }]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    let (doc, _) = written(&output, &store).await;
    assert_eq!(
        doc.entities,
        vec![
            json!({"Type": "ORG", "BeginOffset": 0, "EndOffset": 9, "Text": "Acme Corp", "Score": 0.9}),
            json!({"Type": "PER", "BeginOffset": 10, "EndOffset": 18, "Text": "Jane Doe"}),
        ]
    );
}

#[tokio::test]
async fn worker_without_document_gets_an_empty_ref() {
    let items = json!([{
        "datasetObjectId": "3",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [{"annotationData": {"content": "{}"}}],
    }]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    let content = &output.responses[0].consolidated_annotation.content;
    assert_eq!(content["job-1"]["annotation-ref"], "");
}

#[tokio::test]
async fn a_broken_item_does_not_stop_the_batch() {
    let items = json!([
        {
            "datasetObjectId": "0",
            "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
            "annotations": [{"annotationData": {"content": "not json"}}],
        },
        {
            "datasetObjectId": "1",
            "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
            "annotations": [worker_content(json!([]))],
        }
    ]);
    let store = seeded_store(&items).await;

    let output = consolidate_batch(&event(), &store).await.unwrap();
    assert_eq!(output.responses.len(), 1);
    assert_eq!(output.responses[0].dataset_object_id, "1");
    assert!(matches!(
        &output.failures[..],
        [ItemFailure::DataObject { dataset_object_id, .. }] if dataset_object_id == "0"
    ));
}

#[tokio::test]
async fn inline_payload_uses_output_config() {
    let items = json!([{
        "datasetObjectId": "0",
        "dataObject": {"s3Uri": "s3://docs/invoices/invoice.pdf"},
        "annotations": [worker_content(json!([]))],
    }]);
    let store = seeded_store(&items).await;
    let mut request = event();
    request["payload"] = items;

    let output = consolidate_batch(&request, &store).await.unwrap();
    let content = &output.responses[0].consolidated_annotation.content;
    assert!(content["job-1"]["annotation-ref"]
        .as_str()
        .unwrap()
        .starts_with("s3://docs/output/job-1/annotations/consolidation-response/iteration-1/annotations/"));
}

#[tokio::test]
async fn missing_job_arn_is_fatal() {
    let store = MemoryDocumentStore::new();
    let err = consolidate_batch(&json!({"payload": []}), &store)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("labelingJobArn"));
}
