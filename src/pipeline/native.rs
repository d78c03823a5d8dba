//! Text-layer line clustering.
//!
//! pdfium hands back individual glyphs with loose bounds in PDF space
//! (points, origin bottom-left). This module groups them into [`Line`]s:
//!
//! 1. drop whitespace and control glyphs (spaces are re-inferred from gaps)
//! 2. sort by vertical centre, top of page first
//! 3. greedily cluster rows: a glyph joins the current row when its centre is
//!    within half the smaller glyph height of the row's mean centre
//! 4. order each row left to right, insert a space when the horizontal gap
//!    exceeds a fraction of the glyph height, and split the row into separate
//!    lines on column-sized gaps
//! 5. normalize boxes to `0..1` page coordinates with a top-left origin
//!
//! Pure and synchronous; the pdfium side lives in [`super::render`].

use crate::blocks::{BoundingBox, Geometry};
use crate::output::{Line, Word};

/// Gap (in glyph heights) above which a space is inserted.
const SPACE_GAP_RATIO: f64 = 0.2;
/// Gap (in glyph heights) above which a row is split into two lines.
const COLUMN_GAP_RATIO: f64 = 3.0;

/// One character with its PDF-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glyph {
    pub ch: char,
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
}

impl Glyph {
    pub fn new(ch: char, left: f64, bottom: f64, right: f64, top: f64) -> Self {
        Self {
            ch,
            left,
            right,
            bottom,
            top,
        }
    }

    fn height(&self) -> f64 {
        (self.top - self.bottom).abs().max(f64::EPSILON)
    }

    fn centre_y(&self) -> f64 {
        (self.top + self.bottom) / 2.0
    }

    fn is_printable(&self) -> bool {
        !self.ch.is_whitespace()
            && !self.ch.is_control()
            && [self.left, self.right, self.bottom, self.top]
                .iter()
                .all(|v| v.is_finite())
    }
}

struct Row {
    glyphs: Vec<Glyph>,
    centre_sum: f64,
    min_height: f64,
}

impl Row {
    fn start(g: Glyph) -> Self {
        Self {
            centre_sum: g.centre_y(),
            min_height: g.height(),
            glyphs: vec![g],
        }
    }

    fn centre(&self) -> f64 {
        self.centre_sum / self.glyphs.len() as f64
    }

    fn accepts(&self, g: &Glyph) -> bool {
        let tolerance = 0.5 * self.min_height.min(g.height());
        (g.centre_y() - self.centre()).abs() <= tolerance
    }

    fn push(&mut self, g: Glyph) {
        self.centre_sum += g.centre_y();
        self.min_height = self.min_height.min(g.height());
        self.glyphs.push(g);
    }
}

/// Group glyphs into lines, top-to-bottom then left-to-right.
pub fn cluster_lines(glyphs: &[Glyph], page_width: f64, page_height: f64) -> Vec<Line> {
    if page_width <= 0.0 || page_height <= 0.0 {
        return Vec::new();
    }

    let mut printable: Vec<Glyph> = glyphs.iter().copied().filter(Glyph::is_printable).collect();
    printable.sort_by(|a, b| {
        b.centre_y()
            .total_cmp(&a.centre_y())
            .then(a.left.total_cmp(&b.left))
    });

    let mut rows: Vec<Row> = Vec::new();
    for g in printable {
        match rows.last_mut() {
            Some(row) if row.accepts(&g) => row.push(g),
            _ => rows.push(Row::start(g)),
        }
    }

    let mut lines = Vec::new();
    for mut row in rows {
        row.glyphs.sort_by(|a, b| a.left.total_cmp(&b.left));
        for segment in split_columns(&row.glyphs) {
            lines.push(build_line(segment, page_width, page_height));
        }
    }
    lines
}

fn mean_height(glyphs: &[Glyph]) -> f64 {
    glyphs.iter().map(Glyph::height).sum::<f64>() / glyphs.len().max(1) as f64
}

fn split_columns(glyphs: &[Glyph]) -> Vec<&[Glyph]> {
    let threshold = COLUMN_GAP_RATIO * mean_height(glyphs);
    let mut segments = Vec::new();
    let mut start = 0;
    for i in 1..glyphs.len() {
        if glyphs[i].left - glyphs[i - 1].right > threshold {
            segments.push(&glyphs[start..i]);
            start = i;
        }
    }
    if start < glyphs.len() {
        segments.push(&glyphs[start..]);
    }
    segments
}

fn normalize(g: &[Glyph], page_width: f64, page_height: f64) -> Geometry {
    let left = g.iter().map(|c| c.left).fold(f64::INFINITY, f64::min);
    let right = g.iter().map(|c| c.right).fold(f64::NEG_INFINITY, f64::max);
    let top = g.iter().map(|c| c.top).fold(f64::NEG_INFINITY, f64::max);
    let bottom = g.iter().map(|c| c.bottom).fold(f64::INFINITY, f64::min);
    let bbox = BoundingBox::new(
        (right - left) / page_width,
        (top - bottom) / page_height,
        left / page_width,
        (page_height - top) / page_height,
    );
    Geometry::from_box(bbox.clamped())
}

fn build_line(glyphs: &[Glyph], page_width: f64, page_height: f64) -> Line {
    let space_gap = SPACE_GAP_RATIO * mean_height(glyphs);
    let mut words: Vec<&[Glyph]> = Vec::new();
    let mut start = 0;
    for i in 1..glyphs.len() {
        if glyphs[i].left - glyphs[i - 1].right > space_gap {
            words.push(&glyphs[start..i]);
            start = i;
        }
    }
    words.push(&glyphs[start..]);

    let words: Vec<Word> = words
        .into_iter()
        .map(|w| Word {
            text: w.iter().map(|g| g.ch).collect(),
            geometry: normalize(w, page_width, page_height),
        })
        .collect();

    Line {
        text: words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        geometry: normalize(glyphs, page_width, page_height),
        confidence: None,
        words,
    }
}
