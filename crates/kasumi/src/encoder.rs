//! Frame encoders for `kasumi stream`.

use std::path::PathBuf;

use ndarray::Array3;

use kasumi_export::{FrameFormat, encode_frame};
use kasumi_stream::{DataUrlEncoder, FrameEncoder, StreamError};

/// Writes each emitted frame to `<dir>/frame-<t>.<ext>` and reports the
/// path as the message payload.
#[derive(Debug)]
pub struct FileEncoder {
    dir: PathBuf,
    format: FrameFormat,
}

impl FileEncoder {
    pub const fn new(dir: PathBuf, format: FrameFormat) -> Self {
        Self { dir, format }
    }
}

impl FrameEncoder for FileEncoder {
    fn encode(&mut self, t: usize, frame: &Array3<u8>, quality: u8) -> Result<String, StreamError> {
        let encoded = encode_frame(frame, self.format, quality)?;
        let path = self
            .dir
            .join(format!("frame-{t:04}.{}", encoded.format));
        std::fs::write(&path, &encoded.bytes)
            .map_err(|e| StreamError::Encoder(format!("writing {}: {e}", path.display())))?;
        Ok(path.display().to_string())
    }
}

/// The encoder picked on the command line.
#[derive(Debug)]
pub enum CliEncoder {
    DataUrl(DataUrlEncoder),
    Files(FileEncoder),
}

impl FrameEncoder for CliEncoder {
    fn encode(&mut self, t: usize, frame: &Array3<u8>, quality: u8) -> Result<String, StreamError> {
        match self {
            Self::DataUrl(encoder) => encoder.encode(t, frame, quality),
            Self::Files(encoder) => encoder.encode(t, frame, quality),
        }
    }
}
