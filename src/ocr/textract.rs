//! AWS Textract OCR backend (`DetectDocumentText`).
//!
//! Textract returns a flat block list. Each `LINE` block lists its `WORD`
//! blocks through a `CHILD` relationship; geometry is already normalized to
//! the submitted image, origin top-left, and confidences are percentages.

use super::{CoordinateSpace, LineDetection, OcrBackend, OcrError, OcrPage, WordDetection};
use crate::blocks::Point;
use async_trait::async_trait;
use aws_sdk_textract::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_textract::primitives::Blob;
use aws_sdk_textract::types::{Block, BlockType, Document, RelationshipType};
use aws_sdk_textract::Client;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TextractOcrBackend {
    client: Client,
}

impl TextractOcrBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the default AWS credential/region chain.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl OcrBackend for TextractOcrBackend {
    fn name(&self) -> &str {
        "textract"
    }

    async fn detect_lines(&self, png: &[u8]) -> Result<OcrPage, OcrError> {
        let document = Document::builder().bytes(Blob::new(png.to_vec())).build();
        let output = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let lines = lines_from_blocks(output.blocks());
        debug!("textract: {} blocks → {} lines", output.blocks().len(), lines.len());
        Ok(OcrPage {
            lines,
            coordinates: CoordinateSpace::Normalized,
        })
    }
}

fn classify_sdk_error<E, R>(err: SdkError<E, R>) -> OcrError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => return OcrError::Timeout(message),
        SdkError::DispatchFailure(_) => return OcrError::Service(message),
        _ => {}
    }
    match err.code() {
        Some(
            "ThrottlingException"
            | "ProvisionedThroughputExceededException"
            | "LimitExceededException",
        ) => OcrError::Throttled(message),
        Some(
            "AccessDeniedException"
            | "UnrecognizedClientException"
            | "InvalidSignatureException"
            | "ExpiredTokenException",
        ) => OcrError::Unauthorized(message),
        Some(
            "InvalidParameterException"
            | "UnsupportedDocumentException"
            | "BadDocumentException"
            | "DocumentTooLargeException",
        ) => OcrError::InvalidRequest(message),
        _ => OcrError::Service(message),
    }
}

fn polygon(block: &Block) -> Vec<Point> {
    block
        .geometry()
        .map(|g| {
            g.polygon()
                .iter()
                .map(|p| Point::new(f64::from(p.x()), f64::from(p.y())))
                .collect()
        })
        .unwrap_or_default()
}

/// `LINE` blocks in service order, each with its `CHILD` words.
fn lines_from_blocks(blocks: &[Block]) -> Vec<LineDetection> {
    let words: HashMap<&str, &Block> = blocks
        .iter()
        .filter(|b| b.block_type() == Some(&BlockType::Word))
        .filter_map(|b| b.id().map(|id| (id, b)))
        .collect();

    blocks
        .iter()
        .filter(|b| b.block_type() == Some(&BlockType::Line))
        .map(|line| {
            let children = line
                .relationships()
                .iter()
                .filter(|r| r.r#type() == Some(&RelationshipType::Child))
                .flat_map(|r| r.ids().iter())
                .filter_map(|id| words.get(id.as_str()))
                .map(|w| WordDetection {
                    text: w.text().unwrap_or_default().to_string(),
                    polygon: polygon(w),
                })
                .collect();
            LineDetection {
                text: line.text().unwrap_or_default().to_string(),
                polygon: polygon(line),
                confidence: line.confidence().map(|c| (c / 100.0).clamp(0.0, 1.0)),
                words: children,
            }
        })
        .collect()
}
