//! Image encoding: raw worker pixels → base64 PNG wrapped in `ImageData`.
//!
//! The worker ships pages as raw RGBA buffers; model APIs want base64
//! data-URIs in the JSON request body. PNG is chosen over JPEG because it
//! is lossless — text crispness matters far more than file size for
//! transcription accuracy. `detail: "high"` instructs GPT-4-class models
//! to use the full image tile budget; without it fine print and small
//! tables are lost.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, RgbaImage};
use std::io::Cursor;
use tracing::debug;

use crate::pipeline::render::PageImage;

/// Encode a rasterised page as a base64 PNG ready for the model API.
pub fn encode_page(page: &PageImage) -> Result<ImageData, image::ImageError> {
    let rgba = RgbaImage::from_raw(page.width, page.height, page.rgba.clone()).ok_or_else(|| {
        image::ImageError::Parameter(image::error::ParameterError::from_kind(
            image::error::ParameterErrorKind::Generic(format!(
                "page {}: pixel buffer does not match {}x{}",
                page.page_number, page.width, page.height
            )),
        ))
    })?;

    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(rgba).write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(page = page.page_number, "encoded image → {} bytes base64", b64.len());

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}
