//! Annotation Consolidator.
//!
//! ## Reconciliation
//!
//! [`reconcile`] merges one or two workers' entity sets for a page:
//!
//! 1. **Validate** every set: empty spans, offsets outside the page text,
//!    unknown types and spans overlapping another span of the *same* worker
//!    are rejected and reported, never reconciled.
//! 2. **Single worker**: every valid entity passes through as `worker1-only`.
//! 3. **Two workers**: exact `(begin, end, type)` matches are `agreed`.
//!    The rest are grouped into connected components of cross-worker
//!    overlap; a component holding entities of both workers becomes one
//!    `conflicting` entry spanning the component, a lone entity becomes
//!    `<worker>-only`.
//! 4. **Sort** by begin, then end.
//!
//! Both sets are indexed before anything is matched and no step depends on
//! which set is scanned first, so swapping the workers only swaps the
//! `-only` labels, and running twice gives the same result.
//!
//! ## Batch flow
//!
//! [`consolidate_batch`] answers the platform's consolidation request: for
//! each data object it loads the workers' annotation documents, restores
//! their blocks, reconciles when two workers answered, writes the final
//! annotation file and returns a reference to it.

use crate::annotation::{
    unresolved_entity, AnnotationSet, AnnotationSource, Candidate, Entity, ReconciledAnnotation,
    ReconciledEntity, ResolutionStatus, ResolvedEntities, SemiStructuredAnnotation,
};
use crate::blocks::{page_text_from_blocks, strip_block_indices, Block};
use crate::error::{AnnotationError, EntityRejection, ItemFailure, RejectionReason};
use crate::pipeline::retry::{with_retry, RetryPolicy};
use crate::storage::{file_name, file_stem, parent, DocumentStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Annotation type recorded in the consolidated metadata.
pub const ANNOTATION_TYPE: &str = "groundtruth/pdf-ner";

/// Everything [`reconcile`] needs for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationInput {
    pub worker1: AnnotationSet,
    pub worker2: Option<AnnotationSet>,
    /// Annotation under review in a verification job.
    pub prior: Option<AnnotationSet>,
    /// Page text length in chars.
    pub text_len: usize,
    /// Configured entity types; `None` skips the type check.
    pub entity_types: Option<Vec<String>>,
}

impl ConsolidationInput {
    pub fn single(worker1: AnnotationSet, text_len: usize) -> Self {
        Self {
            worker1,
            worker2: None,
            prior: None,
            text_len,
            entity_types: None,
        }
    }

    pub fn pair(worker1: AnnotationSet, worker2: AnnotationSet, text_len: usize) -> Self {
        Self {
            worker2: Some(worker2),
            ..Self::single(worker1, text_len)
        }
    }
}

// ── Reconciliation ───────────────────────────────────────────────────────

/// Reconcile the worker sets of one page. Never fails: malformed entities
/// end up in [`ReconciledAnnotation::rejected`].
pub fn reconcile(input: &ConsolidationInput) -> ReconciledAnnotation {
    let types = input.entity_types.as_deref().filter(|t| !t.is_empty());
    let mut rejected = Vec::new();

    let w1 = validate(&input.worker1, input.text_len, types, &mut rejected);
    let mut entities = match &input.worker2 {
        None => w1
            .iter()
            .map(|e| resolved(e, ResolutionStatus::Worker1Only))
            .collect(),
        Some(set2) => {
            let w2 = validate(set2, input.text_len, types, &mut rejected);
            match_pair(input.worker1.source, &w1, set2.source, &w2)
        }
    };
    entities.sort_by(|a, b| {
        (a.begin_offset, a.end_offset, &a.entity_type).cmp(&(
            b.begin_offset,
            b.end_offset,
            &b.entity_type,
        ))
    });

    let matches_prior = input.prior.as_ref().map(|prior| {
        let valid = validate(prior, input.text_len, types, &mut rejected);
        agrees_with_prior(&entities, &valid)
    });

    debug!(
        "Reconciled {} entities ({} rejected)",
        entities.len(),
        rejected.len()
    );
    ReconciledAnnotation {
        entities,
        rejected,
        matches_prior,
    }
}

/// Valid entities of `set`; the others are pushed to `rejected`.
fn validate(
    set: &AnnotationSet,
    text_len: usize,
    types: Option<&[String]>,
    rejected: &mut Vec<EntityRejection>,
) -> Vec<Entity> {
    let len = text_len as i64;
    let mut reject = |entity: &Entity, reason| {
        rejected.push(EntityRejection {
            source: set.source,
            entity: entity.clone(),
            reason,
        })
    };

    let mut valid: Vec<Entity> = Vec::with_capacity(set.entities.len());
    for e in &set.entities {
        if e.begin_offset < 0 || e.end_offset > len {
            reject(e, RejectionReason::OutOfBounds);
        } else if e.begin_offset >= e.end_offset {
            reject(e, RejectionReason::EmptySpan);
        } else if types.is_some_and(|t| !t.contains(&e.entity_type)) {
            reject(e, RejectionReason::UnknownType);
        } else {
            valid.push(e.clone());
        }
    }

    // Sweep for clusters of mutually overlapping spans from this worker.
    valid.sort_by_key(|e| (e.begin_offset, e.end_offset));
    let mut kept = Vec::with_capacity(valid.len());
    let mut cluster: Vec<Entity> = Vec::new();
    let mut cluster_end = i64::MIN;
    for e in valid {
        if e.begin_offset >= cluster_end {
            flush_cluster(&mut cluster, &mut kept, &mut reject);
        }
        cluster_end = cluster_end.max(e.end_offset);
        cluster.push(e);
    }
    flush_cluster(&mut cluster, &mut kept, &mut reject);
    kept
}

fn flush_cluster(
    cluster: &mut Vec<Entity>,
    kept: &mut Vec<Entity>,
    reject: &mut impl FnMut(&Entity, RejectionReason),
) {
    match cluster.len() {
        0 => {}
        1 => kept.append(cluster),
        _ => {
            for e in cluster.drain(..) {
                reject(&e, RejectionReason::SelfOverlap);
            }
        }
    }
}

fn resolved(e: &Entity, status: ResolutionStatus) -> ReconciledEntity {
    ReconciledEntity {
        begin_offset: e.begin_offset,
        end_offset: e.end_offset,
        entity_type: Some(e.entity_type.clone()),
        status,
        candidates: Vec::new(),
    }
}

fn only_status(source: AnnotationSource) -> ResolutionStatus {
    match source {
        AnnotationSource::Worker2 => ResolutionStatus::Worker2Only,
        _ => ResolutionStatus::Worker1Only,
    }
}

/// Symmetric two-worker matching over validated (self-overlap free) sets.
fn match_pair(
    source1: AnnotationSource,
    w1: &[Entity],
    source2: AnnotationSource,
    w2: &[Entity],
) -> Vec<ReconciledEntity> {
    let mut out = Vec::new();

    // Exact matches. Neither set overlaps itself, so a match is unique.
    let mut matched1 = vec![false; w1.len()];
    let mut matched2 = vec![false; w2.len()];
    for (i, a) in w1.iter().enumerate() {
        if let Some(j) = w2.iter().position(|b| a.same_span_and_type(b)) {
            matched1[i] = true;
            matched2[j] = true;
            out.push(resolved(a, ResolutionStatus::Agreed));
        }
    }

    // Union-find over the leftovers; nodes 0..n1 are worker 1, n1.. worker 2.
    let rest1 = unmatched(w1, &matched1);
    let rest2 = unmatched(w2, &matched2);
    let n1 = rest1.len();
    let mut parent: Vec<usize> = (0..n1 + rest2.len()).collect();
    for (i, a) in rest1.iter().enumerate() {
        for (j, b) in rest2.iter().enumerate() {
            if a.overlaps(b) {
                union(&mut parent, i, n1 + j);
            }
        }
    }

    let mut components: Vec<Vec<usize>> = Vec::new();
    let mut slot_of_root = vec![usize::MAX; parent.len()];
    for node in 0..parent.len() {
        let root = find(&mut parent, node);
        if slot_of_root[root] == usize::MAX {
            slot_of_root[root] = components.len();
            components.push(Vec::new());
        }
        components[slot_of_root[root]].push(node);
    }

    let member = |node: usize| {
        if node < n1 {
            (source1, rest1[node])
        } else {
            (source2, rest2[node - n1])
        }
    };

    for nodes in components {
        if let [node] = nodes.as_slice() {
            let (source, e) = member(*node);
            out.push(resolved(e, only_status(source)));
            continue;
        }
        let mut candidates: Vec<Candidate> = nodes
            .iter()
            .map(|&n| {
                let (source, e) = member(n);
                Candidate::from_entity(source, e)
            })
            .collect();
        candidates.sort_by(|a, b| {
            (a.begin_offset, a.end_offset, &a.entity_type, a.source).cmp(&(
                b.begin_offset,
                b.end_offset,
                &b.entity_type,
                b.source,
            ))
        });
        let types: BTreeSet<&str> = candidates.iter().map(|c| c.entity_type.as_str()).collect();
        out.push(ReconciledEntity {
            begin_offset: candidates.iter().map(|c| c.begin_offset).min().unwrap_or(0),
            end_offset: candidates.iter().map(|c| c.end_offset).max().unwrap_or(0),
            entity_type: match types.len() {
                1 => types.into_iter().next().map(str::to_string),
                _ => None,
            },
            status: ResolutionStatus::Conflicting,
            candidates,
        });
    }
    out
}

fn unmatched<'a>(entities: &'a [Entity], matched: &[bool]) -> Vec<&'a Entity> {
    entities
        .iter()
        .zip(matched)
        .filter(|(_, m)| !**m)
        .map(|(e, _)| e)
        .collect()
}

fn find(parent: &mut [usize], mut node: usize) -> usize {
    while parent[node] != node {
        parent[node] = parent[parent[node]];
        node = parent[node];
    }
    node
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}

/// True when the reconciled set has no conflicts and holds exactly the
/// prior's spans and types.
fn agrees_with_prior(entities: &[ReconciledEntity], prior: &[Entity]) -> bool {
    if entities.iter().any(|e| e.status == ResolutionStatus::Conflicting) {
        return false;
    }
    let ours: BTreeSet<(i64, i64, &str)> = entities
        .iter()
        .filter_map(|e| {
            e.entity_type
                .as_deref()
                .map(|t| (e.begin_offset, e.end_offset, t))
        })
        .collect();
    let theirs: BTreeSet<(i64, i64, &str)> = prior
        .iter()
        .map(|e| (e.begin_offset, e.end_offset, e.entity_type.as_str()))
        .collect();
    ours == theirs
}

// ── Batch flow ───────────────────────────────────────────────────────────

/// `consolidatedAnnotation` of one response item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedAnnotation {
    /// `{<label attribute>: {annotation-ref}, <label attribute>-metadata: {...}}`.
    pub content: Map<String, Value>,
}

/// One item of the consolidation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationResponse {
    pub dataset_object_id: String,
    pub consolidated_annotation: ConsolidatedAnnotation,
}

/// Result of [`consolidate_batch`].
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    /// Platform response, one item per data object that did not fail.
    pub responses: Vec<ConsolidationResponse>,
    /// Reconciliation results for every data object with at least one
    /// worker document, keyed by dataset object id.
    pub reconciled: Vec<(String, ReconciledAnnotation)>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataObjectResponse {
    dataset_object_id: String,
    #[serde(default)]
    data_object: Value,
    #[serde(default)]
    annotations: Vec<WorkerAnnotation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerAnnotation {
    #[serde(default)]
    worker_id: Option<String>,
    annotation_data: AnnotationData,
}

#[derive(Debug, Deserialize)]
struct AnnotationData {
    #[serde(default)]
    content: String,
}

/// Where consolidated annotation files go.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutputLocation {
    root: String,
    iteration: String,
}

impl OutputLocation {
    /// `<root>/consolidation-request/<iteration>/<file>` → root + iteration.
    fn from_request_ref(s3_ref: &str) -> Self {
        let request_dir = parent(s3_ref);
        Self {
            root: parent(parent(request_dir)).to_string(),
            iteration: file_name(request_dir).to_string(),
        }
    }

    fn path_for(&self, annotation_file: &str) -> String {
        format!(
            "{}/consolidation-response/{}/annotations/{}",
            self.root, self.iteration, annotation_file
        )
    }
}

/// Answer one consolidation request.
///
/// `request` is the platform event: `labelingJobArn`, `labelAttributeName`,
/// optional `labelCategories`, and `payload` either inline (a list) or as
/// `{"s3Uri": ...}`. Failures of single data objects are collected; the
/// request itself failing to parse or load is fatal.
pub async fn consolidate_batch(
    request: &Value,
    store: &dyn DocumentStore,
) -> Result<BatchOutput, AnnotationError> {
    let context = "consolidation request";
    let arn = request
        .get("labelingJobArn")
        .and_then(Value::as_str)
        .ok_or(AnnotationError::MissingField {
            field: "labelingJobArn",
            context,
        })?;
    let label_attribute = request
        .get("labelAttributeName")
        .and_then(Value::as_str)
        .ok_or(AnnotationError::MissingField {
            field: "labelAttributeName",
            context,
        })?;
    let entity_types: Option<Vec<String>> = request
        .get("labelCategories")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let payload = request.get("payload").ok_or(AnnotationError::MissingField {
        field: "payload",
        context,
    })?;
    let policy = RetryPolicy::default();

    let (items, location) = match payload.get("s3Uri").and_then(Value::as_str) {
        Some(s3_ref) => {
            let obj = with_retry(policy, s3_ref, || store.get(s3_ref))
                .await
                .map_err(|e| AnnotationError::storage(s3_ref, e))?;
            let items: Value = serde_json::from_slice(&obj.bytes)
                .map_err(|e| AnnotationError::malformed("consolidation payload", e))?;
            (items, OutputLocation::from_request_ref(s3_ref))
        }
        None => {
            let root = request
                .get("outputConfig")
                .and_then(Value::as_str)
                .ok_or(AnnotationError::MissingField {
                    field: "outputConfig",
                    context: "consolidation request with inline payload",
                })?;
            let location = OutputLocation {
                root: root.trim_end_matches('/').to_string(),
                iteration: "iteration-1".to_string(),
            };
            (payload.clone(), location)
        }
    };
    let items = match items {
        Value::Array(items) => items,
        other => {
            return Err(AnnotationError::malformed(
                "consolidation payload",
                format!("expected a list, got {}", other),
            ))
        }
    };
    info!("Consolidating {} data objects for {}", items.len(), arn);

    let job_name = arn.split(':').nth(5).unwrap_or(arn);
    let mut output = BatchOutput::default();
    for (i, item) in items.into_iter().enumerate() {
        let id = item
            .get("datasetObjectId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", i));
        let result = consolidate_item(item, store, &location, entity_types.as_deref(), policy).await;
        match result {
            Ok((annotation_ref, reconciled)) => {
                output.responses.push(response(
                    &id,
                    label_attribute,
                    job_name,
                    annotation_ref,
                    reconciled.as_ref(),
                ));
                if let Some(r) = reconciled {
                    output.reconciled.push((id, r));
                }
            }
            Err(e) => {
                warn!("Data object {} failed: {}", id, e);
                output.failures.push(ItemFailure::DataObject {
                    dataset_object_id: id,
                    detail: e.to_string(),
                });
            }
        }
    }
    info!(
        "Consolidation complete: {} responses, {} failures",
        output.responses.len(),
        output.failures.len()
    );
    Ok(output)
}

/// Annotation ref (empty when no worker returned a document) plus the
/// reconciliation of the workers that did.
async fn consolidate_item(
    item: Value,
    store: &dyn DocumentStore,
    location: &OutputLocation,
    entity_types: Option<&[String]>,
    policy: RetryPolicy,
) -> Result<(String, Option<ReconciledAnnotation>), AnnotationError> {
    let item: DataObjectResponse =
        serde_json::from_value(item).map_err(|e| AnnotationError::malformed("data object", e))?;

    let mut documents = Vec::new();
    for annotation in &item.annotations {
        if let Some(doc) = worker_document(&annotation.annotation_data.content)? {
            documents.push(doc);
        } else {
            debug!(
                "Worker {} returned no document",
                annotation.worker_id.as_deref().unwrap_or("?")
            );
        }
    }
    let mut documents = documents.into_iter();
    let Some(mut primary) = documents.next() else {
        return Ok((String::new(), None));
    };
    primary.blocks = load_blocks(store, &primary.blocks_s3_ref, policy).await?;
    let text_len = page_text_from_blocks(&primary.blocks).chars().count();

    // The second worker saw the same blocks file; resolve its
    // block-relative offsets against the primary's blocks.
    let second = documents.next().map(|doc| SemiStructuredAnnotation {
        blocks: primary.blocks.clone(),
        ..doc
    });
    let (reconciled, entities) = {
        let mut workers = vec![(AnnotationSource::Worker1, &primary, primary.resolve_entities())];
        if let Some(doc) = &second {
            workers.push((AnnotationSource::Worker2, doc, doc.resolve_entities()));
        }

        let input = ConsolidationInput {
            worker1: AnnotationSet::new(AnnotationSource::Worker1, workers[0].2.entities()),
            worker2: workers
                .get(1)
                .map(|(source, _, r)| AnnotationSet::new(*source, r.entities())),
            prior: None,
            text_len,
            entity_types: entity_types.map(<[String]>::to_vec),
        };
        let mut reconciled = reconcile(&input);
        for (source, doc, resolved) in &workers {
            reconciled
                .rejected
                .extend(resolved.unresolvable.iter().map(|&i| EntityRejection {
                    source: *source,
                    entity: unresolved_entity(&doc.entities[i]),
                    reason: RejectionReason::Unresolvable,
                }));
        }
        for rejection in &reconciled.rejected {
            debug!("{}", rejection);
        }

        let sources: Vec<(&[Value], &ResolvedEntities)> = workers
            .iter()
            .map(|(_, doc, resolved)| (doc.entities.as_slice(), resolved))
            .collect();
        let entities = merged_entities(&reconciled, &sources);
        (reconciled, entities)
    };
    primary.entities = entities;

    let source = item
        .data_object
        .get("s3Uri")
        .and_then(Value::as_str)
        .map(file_stem)
        .unwrap_or(item.dataset_object_id.as_str());
    let uuid = Uuid::new_v4().to_string();
    primary.file = format!(
        "{}-{}-{}-ann.json",
        source,
        primary.document_metadata.page_number,
        &uuid[..8]
    );

    let path = location.path_for(&primary.file);
    let body = serde_json::to_vec(&primary)
        .map_err(|e| AnnotationError::Internal(format!("annotation serialization: {}", e)))?;
    with_retry(policy, &path, || store.put(&path, body.clone()))
        .await
        .map_err(|e| AnnotationError::storage(path.as_str(), e))?;
    info!("Wrote annotations to {}", path);
    Ok((path, Some(reconciled)))
}

/// The `document` a worker submitted, if any.
fn worker_document(content: &str) -> Result<Option<SemiStructuredAnnotation>, AnnotationError> {
    if content.trim().is_empty() {
        return Ok(None);
    }
    let map: Value = serde_json::from_str(content)
        .map_err(|e| AnnotationError::malformed("annotation content", e))?;
    match map.get("document") {
        Some(Value::String(doc)) => serde_json::from_str(doc)
            .map(Some)
            .map_err(|e| AnnotationError::malformed("annotation document", e)),
        Some(doc @ Value::Object(_)) => serde_json::from_value(doc.clone())
            .map(Some)
            .map_err(|e| AnnotationError::malformed("annotation document", e)),
        _ => Ok(None),
    }
}

async fn load_blocks(
    store: &dyn DocumentStore,
    blocks_ref: &str,
    policy: RetryPolicy,
) -> Result<Vec<Block>, AnnotationError> {
    if blocks_ref.is_empty() {
        return Ok(Vec::new());
    }
    let obj = with_retry(policy, blocks_ref, || store.get(blocks_ref))
        .await
        .map_err(|e| AnnotationError::storage(blocks_ref, e))?;
    let mut blocks: Vec<Block> = serde_json::from_slice(&obj.bytes)
        .map_err(|e| AnnotationError::malformed("blocks file", e))?;
    strip_block_indices(&mut blocks);
    Ok(blocks)
}

/// Entities of the consolidated document: every non-conflicting reconciled
/// entity, as the raw JSON of the worker that supplied it.
fn merged_entities(
    reconciled: &ReconciledAnnotation,
    sources: &[(&[Value], &ResolvedEntities)],
) -> Vec<Value> {
    reconciled
        .entities
        .iter()
        .filter(|r| r.status != ResolutionStatus::Conflicting)
        .filter_map(|r| {
            let t = r.entity_type.as_deref()?;
            sources.iter().find_map(|(raw, resolved)| {
                let i = resolved.index_of(t, r.begin_offset, r.end_offset)?;
                raw.get(i).cloned()
            })
        })
        .collect()
}

fn response(
    dataset_object_id: &str,
    label_attribute: &str,
    job_name: &str,
    annotation_ref: String,
    reconciled: Option<&ReconciledAnnotation>,
) -> ConsolidationResponse {
    let mut metadata = json!({
        "job-name": job_name,
        "type": ANNOTATION_TYPE,
        "creation-date": Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
        "human-annotated": "yes",
    });
    if let (Some(r), Value::Object(map)) = (reconciled, &mut metadata) {
        map.insert(
            "conflicting-entities".into(),
            json!(r.count(ResolutionStatus::Conflicting)),
        );
        map.insert("rejected-entities".into(), json!(r.rejected.len()));
    }

    let mut content = Map::new();
    content.insert(
        label_attribute.to_string(),
        json!({ "annotation-ref": annotation_ref }),
    );
    content.insert(format!("{}-metadata", label_attribute), metadata);
    ConsolidationResponse {
        dataset_object_id: dataset_object_id.to_string(),
        consolidated_annotation: ConsolidatedAnnotation { content },
    }
}
