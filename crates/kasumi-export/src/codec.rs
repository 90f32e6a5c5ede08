//! Frame codec: 8-bit frames to PNG/JPEG bytes and base64 data URLs.
//!
//! Single-channel frames are always written as PNG, whatever format was
//! asked for, so grayscale previews never pick up JPEG chroma artifacts.

use std::fmt;

use base64::{Engine as _, engine::general_purpose};
use image::ImageEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use ndarray::Array3;

use crate::ExportError;

/// Default JPEG quality.
pub const DEFAULT_QUALITY: u8 = 90;

/// Output image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    /// Lossy; honours the quality setting.
    #[default]
    Jpeg,
    /// Lossless; quality is ignored.
    Png,
}

impl FrameFormat {
    /// MIME type for data URLs and HTTP headers.
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    /// Conventional file extension, without the dot.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// An encoded frame and the format actually used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Format of `bytes`. May differ from the requested one.
    pub format: FrameFormat,
    /// Encoded image file contents.
    pub bytes: Vec<u8>,
}

impl EncodedFrame {
    /// `data:<mime>;base64,<payload>`.
    #[must_use]
    pub fn to_data_url(&self) -> String {
        to_data_url(self.format, &self.bytes)
    }
}

/// Encode an 8-bit `(height, width, channels)` frame.
///
/// `quality` is clamped to `1..=100` and only affects JPEG.
///
/// # Errors
///
/// Returns [`ExportError::Frame`] if the frame is not a 1- or 3-channel
/// image, and [`ExportError::Encode`] if the encoder fails.
pub fn encode_frame(
    frame: &Array3<u8>,
    format: FrameFormat,
    quality: u8,
) -> Result<EncodedFrame, ExportError> {
    let image = kasumi_diffusion::frame_to_image(frame)?;
    let format = if frame.dim().2 == 1 {
        FrameFormat::Png
    } else {
        format
    };

    let mut bytes = Vec::new();
    let (width, height, color) = (image.width(), image.height(), image.color().into());
    match format {
        FrameFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut bytes, quality.clamp(1, 100));
            encoder.write_image(image.as_bytes(), width, height, color)?;
        }
        FrameFormat::Png => {
            let encoder = PngEncoder::new(&mut bytes);
            encoder.write_image(image.as_bytes(), width, height, color)?;
        }
    }
    Ok(EncodedFrame { format, bytes })
}

/// Wrap encoded bytes in a base64 data URL.
#[must_use]
pub fn to_data_url(format: FrameFormat, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        format.mime(),
        general_purpose::STANDARD.encode(bytes)
    )
}

/// Decode a base64 payload, with or without a `data:...;base64,` prefix.
///
/// # Errors
///
/// Returns [`ExportError::InvalidDataUrl`] for a `data:` URL that is not
/// base64-encoded, and [`ExportError::Base64`] for an invalid payload.
pub fn decode_data_url(input: &str) -> Result<Vec<u8>, ExportError> {
    let input = input.trim();
    let payload = match input.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest.split_once(',').ok_or(ExportError::InvalidDataUrl)?;
            if !header.ends_with(";base64") {
                return Err(ExportError::InvalidDataUrl);
            }
            payload
        }
        None => input,
    };
    Ok(general_purpose::STANDARD.decode(payload)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rgb_frame() -> Array3<u8> {
        Array3::from_shape_fn((12, 16, 3), |(y, x, c)| {
            u8::try_from((y * 20 + x * 15 + c * 60) % 256).unwrap()
        })
    }

    #[test]
    fn format_displays_as_extension() {
        assert_eq!(FrameFormat::Jpeg.to_string(), "jpg");
        assert_eq!(format!("frame.{}", FrameFormat::Png), "frame.png");
    }

    #[test]
    fn png_is_lossless() {
        let frame = rgb_frame();
        let encoded = encode_frame(&frame, FrameFormat::Png, DEFAULT_QUALITY).unwrap();
        assert_eq!(encoded.format, FrameFormat::Png);
        let decoded = image::load_from_memory(&encoded.bytes).unwrap().to_rgb8();
        let expected: Vec<u8> = frame.iter().copied().collect();
        assert_eq!(decoded.as_raw(), &expected);
    }

    #[test]
    fn jpeg_keeps_dimensions() {
        let encoded = encode_frame(&rgb_frame(), FrameFormat::Jpeg, 75).unwrap();
        assert_eq!(encoded.format, FrameFormat::Jpeg);
        assert_eq!(&encoded.bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
    }

    #[test]
    fn lower_quality_is_smaller() {
        let frame = Array3::from_shape_fn((64, 64, 3), |(y, x, c)| {
            u8::try_from((y * 31 + x * 17 + c * 89) % 256).unwrap()
        });
        let high = encode_frame(&frame, FrameFormat::Jpeg, 100).unwrap();
        let low = encode_frame(&frame, FrameFormat::Jpeg, 10).unwrap();
        assert!(low.bytes.len() < high.bytes.len());
    }

    #[test]
    fn out_of_range_quality_is_clamped() {
        assert!(encode_frame(&rgb_frame(), FrameFormat::Jpeg, 0).is_ok());
        assert!(encode_frame(&rgb_frame(), FrameFormat::Jpeg, 255).is_ok());
    }

    #[test]
    fn grayscale_forces_png() {
        let frame = Array3::from_elem((4, 4, 1), 200_u8);
        let encoded = encode_frame(&frame, FrameFormat::Jpeg, 90).unwrap();
        assert_eq!(encoded.format, FrameFormat::Png);
        let decoded = image::load_from_memory(&encoded.bytes).unwrap();
        assert!(matches!(decoded, image::DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn four_channel_frame_rejected() {
        let frame = Array3::<u8>::zeros((2, 2, 4));
        assert!(matches!(
            encode_frame(&frame, FrameFormat::Png, 90),
            Err(ExportError::Frame(_))
        ));
    }

    #[test]
    fn data_url_has_mime_prefix() {
        let url = to_data_url(FrameFormat::Png, &[1, 2, 3]);
        assert_eq!(url, "data:image/png;base64,AQID");
        let url = to_data_url(FrameFormat::Jpeg, b"hi");
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn decode_accepts_data_url_and_bare_base64() {
        assert_eq!(decode_data_url("data:image/png;base64,AQID").unwrap(), [1, 2, 3]);
        assert_eq!(decode_data_url("AQID").unwrap(), [1, 2, 3]);
        assert_eq!(decode_data_url("  AQID\n").unwrap(), [1, 2, 3]);
    }

    #[test]
    fn decode_rejects_non_base64_data_url() {
        assert!(matches!(
            decode_data_url("data:text/plain,hello"),
            Err(ExportError::InvalidDataUrl)
        ));
        assert!(matches!(
            decode_data_url("data:image/png;base64"),
            Err(ExportError::InvalidDataUrl)
        ));
    }

    #[test]
    fn decode_rejects_bad_payload() {
        assert!(matches!(
            decode_data_url("not base64!"),
            Err(ExportError::Base64(_))
        ));
    }

    #[test]
    fn encoded_frame_roundtrips_through_data_url() {
        let encoded = encode_frame(&rgb_frame(), FrameFormat::Png, 90).unwrap();
        let back = decode_data_url(&encoded.to_data_url()).unwrap();
        assert_eq!(back, encoded.bytes);
    }
}
