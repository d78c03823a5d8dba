//! Page geometry and the block model consumed by the labeling UI.
//!
//! Coordinates are normalized to the page: `0.0..=1.0`, origin top-left,
//! the same convention on both the native and the OCR path so lines from
//! either source can be drawn on the same canvas.
//!
//! A page becomes a flat list of [`Block`]s: one `LINE` block per line,
//! followed immediately by its `WORD` children, linked through a `CHILD`
//! [`Relationship`]. `blockIndex` / `parentBlockIndex` are positional hints
//! for the UI only and are removed before an annotation is persisted
//! ([`strip_block_indices`]).

use crate::output::Line;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Axis-aligned box in normalized page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
    pub left: f64,
    pub top: f64,
}

impl BoundingBox {
    pub fn new(width: f64, height: f64, left: f64, top: f64) -> Self {
        Self {
            width,
            height,
            left,
            top,
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    /// Grow this box to the union of itself and `other`.
    pub fn extend(&mut self, other: &BoundingBox) {
        let left = self.left.min(other.left);
        let top = self.top.min(other.top);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        *self = Self::new(right - left, bottom - top, left, top);
    }

    /// Smallest box containing every point; `None` for an empty slice.
    pub fn enclosing(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
        for p in &points[1..] {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        Some(Self::new(max_x - min_x, max_y - min_y, min_x, min_y))
    }

    /// Clamp every edge into the unit square.
    pub fn clamped(&self) -> Self {
        let left = self.left.clamp(0.0, 1.0);
        let top = self.top.clamp(0.0, 1.0);
        let right = self.right().clamp(0.0, 1.0);
        let bottom = self.bottom().clamp(0.0, 1.0);
        Self::new((right - left).max(0.0), (bottom - top).max(0.0), left, top)
    }

    /// Clockwise corners starting top-left.
    pub fn corners(&self) -> Vec<Point> {
        vec![
            Point::new(self.left, self.top),
            Point::new(self.right(), self.top),
            Point::new(self.right(), self.bottom()),
            Point::new(self.left, self.bottom()),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Bounding box plus its 4-point polygon.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Geometry {
    pub bounding_box: BoundingBox,
    pub polygon: Vec<Point>,
}

impl Geometry {
    pub fn from_box(bbox: BoundingBox) -> Self {
        Self {
            polygon: bbox.corners(),
            bounding_box: bbox,
        }
    }

    /// Union with another geometry; the polygon is rebuilt from the merged box.
    pub fn extend(&mut self, other: &Geometry) {
        self.bounding_box.extend(&other.bounding_box);
        self.polygon = self.bounding_box.corners();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockType {
    Line,
    Word,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Relationship {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(rename = "Type")]
    pub kind: String,
}

impl Relationship {
    pub fn children(ids: Vec<String>) -> Self {
        Self {
            ids,
            kind: "CHILD".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    pub block_type: BlockType,
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    pub page: usize,
    #[serde(
        rename = "parentBlockIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_block_index: Option<i64>,
    #[serde(rename = "blockIndex", default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<i64>,
}

impl Block {
    /// Ids of this block's `CHILD` relationship, if any.
    pub fn child_ids(&self) -> &[String] {
        self.relationships
            .iter()
            .find(|r| r.kind == "CHILD")
            .map(|r| r.ids.as_slice())
            .unwrap_or(&[])
    }
}

/// Flatten lines into `LINE` + `WORD` blocks with fresh ids and block indices.
///
/// A line without words still gets its `LINE` block (with an empty `CHILD`
/// relationship) so the UI can render and reference it.
pub fn lines_to_blocks(page: usize, lines: &[Line]) -> Vec<Block> {
    let word_count: usize = lines.iter().map(|l| l.words.len()).sum();
    let mut blocks = Vec::with_capacity(lines.len() + word_count);
    let mut index: i64 = -1;

    for line in lines {
        index += 1;
        let line_index = index;
        let line_slot = blocks.len();
        blocks.push(Block {
            block_type: BlockType::Line,
            id: Uuid::new_v4().to_string(),
            text: line.text.clone(),
            geometry: Some(line.geometry.clone()),
            relationships: Vec::new(),
            page,
            parent_block_index: Some(-1),
            block_index: Some(line_index),
        });

        let mut child_ids = Vec::with_capacity(line.words.len());
        for word in &line.words {
            index += 1;
            let id = Uuid::new_v4().to_string();
            child_ids.push(id.clone());
            blocks.push(Block {
                block_type: BlockType::Word,
                id,
                text: word.text.clone(),
                geometry: Some(word.geometry.clone()),
                relationships: Vec::new(),
                page,
                parent_block_index: Some(line_index),
                block_index: Some(index),
            });
        }
        blocks[line_slot]
            .relationships
            .push(Relationship::children(child_ids));
    }

    blocks
}

/// Remove the UI-only positional fields.
pub fn strip_block_indices(blocks: &mut [Block]) {
    for b in blocks {
        b.block_index = None;
        b.parent_block_index = None;
    }
}

/// Page text as seen by annotators: `LINE` texts joined by `\n`.
pub fn page_text_from_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .filter(|b| b.block_type == BlockType::Line)
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Char offset at which each `LINE` block starts within [`page_text_from_blocks`].
pub fn line_offsets(blocks: &[Block]) -> Vec<(&str, usize)> {
    let mut offsets = Vec::new();
    let mut cursor = 0usize;
    for b in blocks.iter().filter(|b| b.block_type == BlockType::Line) {
        offsets.push((b.id.as_str(), cursor));
        cursor += b.text.chars().count() + 1;
    }
    offsets
}
