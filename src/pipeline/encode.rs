//! Image encoding: `DynamicImage` → PNG bytes → base64 `ImageData`.
//!
//! PNG is lossless; text crispness matters far more than file size for OCR
//! accuracy. Rendered pages are stored as raw PNG bytes so any OCR backend
//! can consume them, and wrapped as base64 only for the vision-LLM request.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode a rasterised page as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!("Encoded page → {} PNG bytes", buf.len());
    Ok(buf)
}

/// Wrap PNG bytes for a multimodal chat request.
///
/// `detail: "high"` asks GPT-4-class models for the full tile budget;
/// without it small print is lost, and so are its line boxes.
pub fn to_image_data(png: &[u8]) -> ImageData {
    ImageData::new(STANDARD.encode(png), "image/png").with_detail("high")
}
