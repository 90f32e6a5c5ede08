//! Wire protocol of a streamed diffusion session.
//!
//! Message protocol, all JSON text:
//!
//! 1. The client opens with a [`StartDirective`].
//! 2. The server answers with zero or more progress messages
//!    ([`FrameUpdate`]), strictly ordered by increasing `t`.
//! 3. At any time the client may send `{"action": "cancel"}`; any other
//!    text is ignored.
//! 4. The session ends with exactly one terminal message:
//!    - `{"status": "completed", ...last frame fields}`
//!    - `{"status": "canceled"}`
//!    - `{"status": "error", "detail": "..."}`
//!
//! A transport that goes away mid-run gets no terminal message.

use serde::{Deserialize, Serialize};

use kasumi_diffusion::{DiffusionConfig, FrameMetrics, ScheduleKind};
use kasumi_export::DEFAULT_QUALITY;

use crate::StreamError;

/// Options that shape a streamed run but not the noise itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Emit every `preview_every`-th step. Zero is treated as 1.
    pub preview_every: usize,

    /// Attach [`FrameMetrics`] against the clean image to each frame.
    pub include_metrics: bool,

    /// Encoder quality hint, passed through to the frame encoder.
    pub quality: u8,

    /// Longest-side cap applied to the input image before diffusion.
    pub max_side: Option<u32>,
}

impl StreamConfig {
    /// Default longest-side cap for streamed images.
    pub const DEFAULT_MAX_SIDE: u32 = 512;

    /// Emission stride, at least 1.
    #[must_use]
    pub const fn stride(&self) -> usize {
        if self.preview_every == 0 {
            1
        } else {
            self.preview_every
        }
    }

    /// Whether step `t` of a `steps`-step run is sent to the client.
    ///
    /// Stride hits are emitted, and the last step always is.
    #[must_use]
    pub const fn emits(&self, t: usize, steps: usize) -> bool {
        t % self.stride() == 0 || t + 1 == steps
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            preview_every: 1,
            include_metrics: false,
            quality: DEFAULT_QUALITY,
            max_side: Some(Self::DEFAULT_MAX_SIDE),
        }
    }
}

/// First message of a session.
///
/// Missing fields take the same defaults as [`DiffusionConfig`] and
/// [`StreamConfig`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDirective {
    /// Encoded image, as bare base64 or a `data:` URL.
    pub image: String,

    /// Number of diffusion steps.
    #[serde(default = "default_steps")]
    pub steps: usize,

    /// First `beta` of the linear schedule.
    #[serde(default = "default_beta_start")]
    pub beta_start: f64,

    /// Last `beta` of the linear schedule.
    #[serde(default = "default_beta_end")]
    pub beta_end: f64,

    /// Schedule kind.
    #[serde(default, alias = "scheduleKind")]
    pub schedule: ScheduleKind,

    /// Base seed; absent means one is drawn from system entropy. Any JSON
    /// integer is accepted, negative ones included; only the low 32 bits
    /// are used.
    #[serde(default)]
    pub seed: Option<i64>,

    /// Emission stride.
    #[serde(default = "default_preview_every")]
    pub preview_every: usize,

    /// Attach metrics to each emitted frame.
    #[serde(default)]
    pub include_metrics: bool,

    /// Encoder quality hint.
    #[serde(default = "default_quality")]
    pub quality: u8,
}

const fn default_steps() -> usize {
    DiffusionConfig::DEFAULT_STEPS
}

const fn default_beta_start() -> f64 {
    DiffusionConfig::DEFAULT_BETA_START
}

const fn default_beta_end() -> f64 {
    DiffusionConfig::DEFAULT_BETA_END
}

const fn default_preview_every() -> usize {
    1
}

const fn default_quality() -> u8 {
    DEFAULT_QUALITY
}

/// Bits of a client seed that reach the generator.
const SEED_MASK: u64 = 0xFFFF_FFFF;

impl StartDirective {
    /// Parse the opening message of a session.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Malformed`] if `text` is not a valid
    /// directive.
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        serde_json::from_str(text).map_err(StreamError::Malformed)
    }

    /// The diffusion parameters of this directive.
    #[must_use]
    pub fn diffusion_config(&self) -> DiffusionConfig {
        DiffusionConfig {
            steps: self.steps,
            schedule: self.schedule,
            beta_start: self.beta_start,
            beta_end: self.beta_end,
            seed: self.seed.map(|seed| seed.cast_unsigned() & SEED_MASK),
            ..DiffusionConfig::default()
        }
    }

    /// The streaming options of this directive, with `max_side` capping
    /// the input image.
    #[must_use]
    pub const fn stream_config(&self, max_side: Option<u32>) -> StreamConfig {
        StreamConfig {
            preview_every: self.preview_every,
            include_metrics: self.include_metrics,
            quality: self.quality,
            max_side,
        }
    }
}

/// An inbound message received while a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `{"action": "cancel"}`.
    Cancel,
    /// Anything else, including invalid JSON.
    Ignored,
}

impl Command {
    /// Interpret a client message. Never fails.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let action = serde_json::from_str::<serde_json::Value>(text)
            .ok()
            .and_then(|value| value.get("action")?.as_str().map(str::to_owned));
        match action.as_deref() {
            Some("cancel") => Self::Cancel,
            _ => Self::Ignored,
        }
    }
}

/// One emitted frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameUpdate {
    /// Zero-based step index.
    pub t: usize,
    /// Noise variance of this step.
    pub beta: f64,
    /// One-based step count, `t + 1`.
    pub step: usize,
    /// `(t + 1) / steps`.
    pub progress: f64,
    /// Encoded frame, opaque to the session.
    pub image: String,
    /// Similarity to the clean image, when requested and defined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<FrameMetrics>,
}

impl FrameUpdate {
    /// Build the update for step `t` of a `steps`-step run.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(
        t: usize,
        beta: f64,
        steps: usize,
        image: String,
        metrics: Option<FrameMetrics>,
    ) -> Self {
        Self {
            t,
            beta,
            step: t + 1,
            progress: (t + 1) as f64 / steps.max(1) as f64,
            image,
            metrics,
        }
    }
}

/// Final message of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Terminal {
    /// The last step was processed; carries the final frame.
    Completed(FrameUpdate),
    /// The client canceled the run.
    Canceled,
    /// The run failed.
    Error {
        /// Human-readable reason.
        detail: String,
    },
}

/// Any outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamMessage {
    /// A frame emitted while running.
    Progress(FrameUpdate),
    /// The one message that ends the session.
    Terminal(Terminal),
}

impl StreamMessage {
    /// Whether this message ends the session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Serialize to the JSON text sent over the wire.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Malformed`] if serialization fails. Non-finite
    /// floats do not fail: they are written as `null`.
    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(StreamError::Malformed)
    }
}

impl From<Terminal> for StreamMessage {
    fn from(terminal: Terminal) -> Self {
        Self::Terminal(terminal)
    }
}
