//! kasumi-stream: streamed, cancellable diffusion sessions.
//!
//! One session turns a start directive into an ordered stream of frame
//! messages and exactly one terminal message, while listening for a
//! cancel command. The transport (WebSocket, stdin/stdout, in-process
//! channels) is the caller's concern: a session only sees an inbound
//! `mpsc` channel of raw text and an outbound channel of
//! [`StreamMessage`]s.

pub mod encoder;
pub mod protocol;
pub mod session;
pub mod slot;

pub use encoder::{DataUrlEncoder, FrameEncoder};
pub use protocol::{Command, FrameUpdate, StartDirective, StreamConfig, StreamMessage, Terminal};
pub use session::{SessionOutcome, SessionReport, StreamOrchestrator};
pub use slot::ScheduleSlot;

use kasumi_diffusion::{DiffusionError, ErrorKind};
use kasumi_export::ExportError;

/// Errors produced by a streamed session.
///
/// Cancellation and disconnects are not errors; they are
/// [`SessionOutcome`]s.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Invalid parameters, image, or step.
    #[error(transparent)]
    Diffusion(#[from] DiffusionError),

    /// The image payload or a frame could not be (de)serialized.
    #[error(transparent)]
    Export(#[from] ExportError),

    /// A message was not valid protocol JSON.
    #[error("malformed message: {0}")]
    Malformed(serde_json::Error),

    /// A custom frame encoder failed.
    #[error("frame encoder failed: {0}")]
    Encoder(String),

    /// The run finished without emitting a frame.
    #[error("diffusion produced no frames")]
    NoFrames,
}

impl StreamError {
    /// Classify this error for reporting.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Diffusion(err) => err.kind(),
            Self::Export(ExportError::Frame(err)) => err.kind(),
            Self::Export(ExportError::InvalidDataUrl | ExportError::Base64(_))
            | Self::Malformed(_) => ErrorKind::Validation,
            Self::Export(ExportError::Encode(_)) | Self::Encoder(_) | Self::NoFrames => {
                ErrorKind::Internal
            }
        }
    }
}
