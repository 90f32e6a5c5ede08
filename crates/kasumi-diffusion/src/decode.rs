//! Decoding and size-limiting of input images.
//!
//! The diffusion engine works on whatever resolution it is given, so
//! callers that stream frames cap the longest side first to keep each
//! step cheap.

use image::DynamicImage;
use image::imageops::FilterType;

use crate::types::DiffusionError;

/// Decode an encoded image (PNG, JPEG, BMP, WebP).
///
/// # Errors
///
/// Returns [`DiffusionError::EmptyInput`] for empty input and
/// [`DiffusionError::ImageDecode`] if the bytes are not a supported image.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, DiffusionError> {
    if bytes.is_empty() {
        return Err(DiffusionError::EmptyInput);
    }
    let image = image::load_from_memory(bytes)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        bytes = bytes.len(),
        "decoded input image",
    );
    Ok(image)
}

/// Shrink `image` so its longest side is at most `max_side` pixels,
/// preserving aspect ratio with a Lanczos3 filter.
///
/// `None`, or an image already within the limit, is returned unchanged.
/// The flag reports whether a resize happened.
#[must_use]
pub fn limit_longest_side(image: &DynamicImage, max_side: Option<u32>) -> (DynamicImage, bool) {
    let Some(max_side) = max_side.filter(|&side| side > 0) else {
        return (image.clone(), false);
    };
    if image.width().max(image.height()) <= max_side {
        return (image.clone(), false);
    }
    let resized = image.resize(max_side, max_side, FilterType::Lanczos3);
    tracing::debug!(
        from_width = image.width(),
        from_height = image.height(),
        to_width = resized.width(),
        to_height = resized.height(),
        "limited image size",
    );
    (resized, true)
}
