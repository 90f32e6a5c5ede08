//! Seam between a session and the image codec.

use ndarray::Array3;

use kasumi_export::{FrameFormat, encode_frame};

use crate::StreamError;

/// Turns an emitted 8-bit frame into the `image` payload of a message.
///
/// The payload is opaque to the session: a data URL, a file path, an
/// object-store key.
pub trait FrameEncoder {
    /// Encode the frame of step `t`.
    ///
    /// # Errors
    ///
    /// Any error aborts the session with an `"error"` terminal message.
    fn encode(&mut self, t: usize, frame: &Array3<u8>, quality: u8) -> Result<String, StreamError>;
}

/// Encodes frames as base64 data URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataUrlEncoder {
    format: FrameFormat,
}

impl DataUrlEncoder {
    /// An encoder producing `format` (grayscale frames are always PNG).
    #[must_use]
    pub const fn new(format: FrameFormat) -> Self {
        Self { format }
    }

    /// The requested format.
    #[must_use]
    pub const fn format(&self) -> FrameFormat {
        self.format
    }
}

impl FrameEncoder for DataUrlEncoder {
    fn encode(&mut self, _t: usize, frame: &Array3<u8>, quality: u8) -> Result<String, StreamError> {
        Ok(encode_frame(frame, self.format, quality)?.to_data_url())
    }
}
