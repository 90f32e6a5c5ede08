//! kasumi-export: Pure format serializers (sans-IO)
//!
//! Turns diffusion output into bytes: noised frames into PNG/JPEG files
//! or base64 data URLs, and schedules into SVG charts.

pub mod codec;
pub mod svg;

pub use codec::{
    DEFAULT_QUALITY, EncodedFrame, FrameFormat, decode_data_url, encode_frame, to_data_url,
};
pub use svg::{SvgMetadata, schedule_svg};

/// Errors produced while serializing frames.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// The array is not a valid 8-bit image.
    #[error("invalid frame: {0}")]
    Frame(#[from] kasumi_diffusion::DiffusionError),

    /// The image encoder failed.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    /// A `data:` URL without a base64 payload.
    #[error("expected a base64 data URL")]
    InvalidDataUrl,

    /// The base64 payload could not be decoded.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}
