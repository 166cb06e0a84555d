//! Image resizing.
//!
//! The transform is pure and deterministic: the same source bytes and target
//! width always produce identical output bytes, which is what makes
//! overwrite-on-redelivery safe for the destination object.

use bytes::Bytes;
use image::ImageFormat;
use snafu::prelude::*;
use std::io::Cursor;

use crate::error::{DecodeSnafu, EncodeSnafu, TransformError, UnknownFormatSnafu, ZeroWidthSnafu};

/// A resized image ready to be written to the destination.
#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

/// Resize an image to exactly `target_width` pixels wide, preserving aspect
/// ratio, and re-encode it in its source format.
///
/// Height is rounded to the nearest pixel with a minimum of 1. No side
/// effects on failure.
pub fn resize_to_width(bytes: &[u8], target_width: u32) -> Result<TransformedImage, TransformError> {
    ensure!(target_width >= 1, ZeroWidthSnafu);

    let format = image::guess_format(bytes).context(UnknownFormatSnafu)?;
    let img = image::load_from_memory_with_format(bytes, format).context(DecodeSnafu)?;

    let (src_width, src_height) = (img.width(), img.height());
    let target_height = scaled_height(src_width, src_height, target_width);

    let resized = img.resize_exact(
        target_width,
        target_height,
        image::imageops::FilterType::Lanczos3,
    );

    let mut buf = Cursor::new(Vec::new());
    resized.write_to(&mut buf, format).context(EncodeSnafu)?;

    Ok(TransformedImage {
        bytes: Bytes::from(buf.into_inner()),
        width: target_width,
        height: target_height,
        format,
    })
}

/// Read the pixel dimensions of an encoded image.
///
/// Used by the idempotency guard to refresh metadata from an output that
/// already exists without re-running the transform.
pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32), TransformError> {
    let format = image::guess_format(bytes).context(UnknownFormatSnafu)?;
    let img = image::load_from_memory_with_format(bytes, format).context(DecodeSnafu)?;
    Ok((img.width(), img.height()))
}

/// Height that preserves the source aspect ratio at the target width.
fn scaled_height(src_width: u32, src_height: u32, target_width: u32) -> u32 {
    let scaled = (src_height as f64 * target_width as f64 / src_width as f64).round() as u32;
    scaled.max(1)
}
