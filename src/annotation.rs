//! Annotation data model: worker entity sets, the annotation document the
//! labeling UI writes, and the reconciled result.

use crate::blocks::{line_offsets, Block};
use crate::error::EntityRejection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Which annotation pass produced an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSource {
    Worker1,
    Worker2,
    /// Annotation from an earlier job, under review.
    Prior,
}

impl fmt::Display for AnnotationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worker1 => write!(f, "worker1"),
            Self::Worker2 => write!(f, "worker2"),
            Self::Prior => write!(f, "prior"),
        }
    }
}

/// One entity mention. Offsets are char offsets into the page text.
///
/// Offsets are signed so that malformed negative values survive parsing
/// and can be rejected with a reason instead of failing the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entity {
    #[serde(rename = "Type")]
    pub entity_type: String,
    pub begin_offset: i64,
    pub end_offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_references: Option<Value>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, begin_offset: i64, end_offset: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            begin_offset,
            end_offset,
            block_references: None,
        }
    }

    /// `[begin, end)` intersection has positive length.
    pub fn overlaps(&self, other: &Entity) -> bool {
        self.begin_offset < other.end_offset && other.begin_offset < self.end_offset
    }

    pub fn same_span_and_type(&self, other: &Entity) -> bool {
        self.begin_offset == other.begin_offset
            && self.end_offset == other.end_offset
            && self.entity_type == other.entity_type
    }
}

/// A worker's entities for one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationSet {
    pub source: AnnotationSource,
    pub entities: Vec<Entity>,
}

impl AnnotationSet {
    pub fn new(source: AnnotationSource, entities: Vec<Entity>) -> Self {
        Self { source, entities }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DocumentType {
    #[default]
    NativePDF,
    ScannedPDF,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DocumentMetadata {
    #[serde(default = "one")]
    pub pages: String,
    #[serde(default = "one")]
    pub page_number: String,
}

fn one() -> String {
    "1".to_string()
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            pages: one(),
            page_number: one(),
        }
    }
}

/// The annotation document produced by the labeling UI for one page.
///
/// `Entities` are kept as raw JSON so fields this crate does not model
/// survive a read-modify-write cycle untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SemiStructuredAnnotation {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, rename = "BlocksS3Ref")]
    pub blocks_s3_ref: String,
    #[serde(default)]
    pub document_metadata: DocumentMetadata,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub document_type: DocumentType,
    #[serde(default)]
    pub entities: Vec<Value>,
    #[serde(default = "unknown_file")]
    pub file: String,
}

fn unknown_file() -> String {
    "unknown".to_string()
}

impl Default for SemiStructuredAnnotation {
    fn default() -> Self {
        Self {
            blocks: Vec::new(),
            blocks_s3_ref: String::new(),
            document_metadata: DocumentMetadata::default(),
            version: String::new(),
            document_type: DocumentType::default(),
            entities: Vec::new(),
            file: unknown_file(),
        }
    }
}

/// Entities of one annotation document, tied back to their position in
/// [`SemiStructuredAnnotation::entities`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedEntities {
    /// `(raw index, entity)` for every entity with usable offsets.
    pub resolved: Vec<(usize, Entity)>,
    /// Raw indices of entities with neither offsets nor a known `LINE` block.
    pub unresolvable: Vec<usize>,
}

impl ResolvedEntities {
    pub fn entities(&self) -> Vec<Entity> {
        self.resolved.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Raw index of the first entity with exactly this span and type.
    pub fn index_of(&self, entity_type: &str, begin_offset: i64, end_offset: i64) -> Option<usize> {
        self.resolved
            .iter()
            .find(|(_, e)| {
                e.begin_offset == begin_offset
                    && e.end_offset == end_offset
                    && e.entity_type == entity_type
            })
            .map(|(i, _)| *i)
    }
}

impl SemiStructuredAnnotation {
    /// Entities with page-level offsets.
    ///
    /// Entities carrying top-level `BeginOffset`/`EndOffset` are used as-is.
    /// Otherwise offsets are derived from `BlockReferences`: the referenced
    /// `LINE` block's start within the page text plus the line-relative
    /// offsets. Entities that fit neither shape are listed as unresolvable.
    pub fn resolve_entities(&self) -> ResolvedEntities {
        let starts: HashMap<&str, usize> = line_offsets(&self.blocks).into_iter().collect();
        let mut out = ResolvedEntities::default();
        for (i, raw) in self.entities.iter().enumerate() {
            match entity_from_value(raw, &starts) {
                Some(entity) => out.resolved.push((i, entity)),
                None => {
                    warn!("Entity without usable offsets: {}", raw);
                    out.unresolvable.push(i);
                }
            }
        }
        out
    }

    /// Typed entities with page-level offsets; unresolvable ones are skipped.
    pub fn typed_entities(&self) -> Vec<Entity> {
        self.resolve_entities().entities()
    }
}

/// Best-effort typed view of an entity whose offsets could not be resolved,
/// for reporting. Offsets are zero.
pub fn unresolved_entity(raw: &Value) -> Entity {
    Entity {
        entity_type: raw
            .get("Type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        begin_offset: 0,
        end_offset: 0,
        block_references: raw.get("BlockReferences").cloned(),
    }
}

fn entity_from_value(raw: &Value, line_starts: &HashMap<&str, usize>) -> Option<Entity> {
    if let Ok(entity) = serde_json::from_value::<Entity>(raw.clone()) {
        return Some(entity);
    }

    let entity_type = raw.get("Type")?.as_str()?.to_string();
    let refs = raw.get("BlockReferences")?.as_array()?;
    let absolute = |r: &Value, key: &str| -> Option<i64> {
        let start = *line_starts.get(r.get("BlockId")?.as_str()?)? as i64;
        Some(start + r.get(key)?.as_i64()?)
    };
    let begin_offset = absolute(refs.first()?, "BeginOffset")?;
    let end_offset = absolute(refs.last()?, "EndOffset")?;

    Some(Entity {
        entity_type,
        begin_offset,
        end_offset,
        block_references: Some(Value::Array(refs.clone())),
    })
}

// ── Reconciled output ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStatus {
    Agreed,
    #[serde(rename = "worker1-only")]
    Worker1Only,
    #[serde(rename = "worker2-only")]
    Worker2Only,
    Conflicting,
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Agreed => "agreed",
            Self::Worker1Only => "worker1-only",
            Self::Worker2Only => "worker2-only",
            Self::Conflicting => "conflicting",
        };
        f.write_str(s)
    }
}

/// One worker's proposal inside a reconciled entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub source: AnnotationSource,
    pub entity_type: String,
    pub begin_offset: i64,
    pub end_offset: i64,
}

impl Candidate {
    pub fn from_entity(source: AnnotationSource, e: &Entity) -> Self {
        Self {
            source,
            entity_type: e.entity_type.clone(),
            begin_offset: e.begin_offset,
            end_offset: e.end_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledEntity {
    pub begin_offset: i64,
    pub end_offset: i64,
    /// `None` for `conflicting` entries.
    pub entity_type: Option<String>,
    pub status: ResolutionStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
}

/// Output of [`crate::consolidate::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledAnnotation {
    pub entities: Vec<ReconciledEntity>,
    pub rejected: Vec<EntityRejection>,
    /// Whether the reconciled result equals the prior verification set;
    /// `None` when no prior set was supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches_prior: Option<bool>,
}

impl ReconciledAnnotation {
    pub fn count(&self, status: ResolutionStatus) -> usize {
        self.entities.iter().filter(|e| e.status == status).count()
    }
}
