//! Shared types for the kasumi diffusion core.

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleKind;

/// Re-export `DynamicImage` so downstream crates can hand decoded
/// images around without depending on `image` directly.
pub use image::DynamicImage;

/// Configuration for one forward-diffusion run.
///
/// Serialized with camelCase keys so the same JSON shape is accepted by
/// the CLI (`--config-json`) and the stream protocol.
///
/// Validation happens in [`ScheduleBuilder::build`](crate::ScheduleBuilder::build),
/// not here: a config can be deserialized with any values and is only
/// rejected once a schedule is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiffusionConfig {
    /// Number of diffusion steps (T).
    pub steps: usize,

    /// Which noise-variance schedule to build.
    pub schedule: ScheduleKind,

    /// First `beta` of the linear schedule. Must lie in (0, 1).
    pub beta_start: f64,

    /// Last `beta` of the linear schedule. Must lie in (0, 1).
    pub beta_end: f64,

    /// Offset `s` of the cosine schedule (Nichol & Dhariwal).
    pub cosine_shift: f64,

    /// Base seed for the deterministic single-step accessors.
    ///
    /// `None` draws one from system entropy when the forward process is
    /// constructed; it then stays fixed for that process.
    pub seed: Option<u64>,
}

impl DiffusionConfig {
    /// Default number of diffusion steps.
    pub const DEFAULT_STEPS: usize = 1000;
    /// Default first `beta` of the linear schedule.
    pub const DEFAULT_BETA_START: f64 = 1e-3;
    /// Default last `beta` of the linear schedule.
    pub const DEFAULT_BETA_END: f64 = 2e-2;
    /// Default cosine schedule offset.
    pub const DEFAULT_COSINE_SHIFT: f64 = 8e-3;
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            steps: Self::DEFAULT_STEPS,
            schedule: ScheduleKind::default(),
            beta_start: Self::DEFAULT_BETA_START,
            beta_end: Self::DEFAULT_BETA_END,
            cosine_shift: Self::DEFAULT_COSINE_SHIFT,
            seed: None,
        }
    }
}

/// Broad classification of a [`DiffusionError`].
///
/// Outer layers use this to decide how a failure is reported (e.g. a
/// validation error is the caller's fault and is never retried).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Bad input: step counts, step indices, schedule bounds, images.
    Validation,
    /// A computation is undefined for the given (valid) inputs.
    Numerical,
    /// Something outside the caller's control failed.
    Internal,
}

/// Errors produced by the diffusion core.
#[derive(Debug, thiserror::Error)]
pub enum DiffusionError {
    /// Step count is zero or above the configured maximum.
    #[error("step count must be between 1 and {max}, got {steps}")]
    InvalidSteps {
        /// Requested step count.
        steps: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A schedule bound lies outside the open interval (0, 1).
    #[error("{name} must lie in (0, 1), got {value}")]
    InvalidBeta {
        /// Which bound was rejected (`beta_start` or `beta_end`).
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// The cosine offset is negative or not finite.
    #[error("cosine shift must be finite and non-negative, got {0}")]
    InvalidCosineShift(f64),

    /// A step index at or beyond the number of steps.
    #[error("step index {t} is out of range for {steps} steps")]
    StepOutOfRange {
        /// Requested step index.
        t: usize,
        /// Number of steps in the schedule.
        steps: usize,
    },

    /// A negative step index arrived from an untyped surface.
    #[error("step index must be non-negative, got {0}")]
    NegativeStep(i64),

    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// Failed to decode the input image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// An image tensor with a channel count other than 1 or 3.
    #[error("image tensors must have 1 or 3 channels, got {0}")]
    UnsupportedChannels(usize),

    /// An image tensor with a zero-sized axis.
    #[error("image tensor has no pixels")]
    EmptyImage,

    /// Two tensors that must share a shape do not.
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch {
        /// Shape of the first operand as (height, width, channels).
        left: (usize, usize, usize),
        /// Shape of the second operand as (height, width, channels).
        right: (usize, usize, usize),
    },

    /// Cosine similarity is undefined when either operand is all zeros.
    #[error("cosine similarity is undefined for a zero-norm tensor")]
    ZeroNorm,

    /// Raw pixel data did not fit the requested shape.
    #[error("invalid tensor layout: {0}")]
    Layout(#[from] ndarray::ShapeError),

    /// System entropy was unavailable when a seed had to be generated.
    #[error("failed to gather entropy for a seed: {0}")]
    Entropy(#[from] getrandom::Error),

    /// Configuration could not be interpreted.
    #[error("invalid diffusion configuration: {0}")]
    InvalidConfig(String),
}

impl DiffusionError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSteps { .. }
            | Self::InvalidBeta { .. }
            | Self::InvalidCosineShift(_)
            | Self::StepOutOfRange { .. }
            | Self::NegativeStep(_)
            | Self::EmptyInput
            | Self::ImageDecode(_)
            | Self::UnsupportedChannels(_)
            | Self::EmptyImage
            | Self::ShapeMismatch { .. }
            | Self::InvalidConfig(_) => ErrorKind::Validation,
            Self::ZeroNorm => ErrorKind::Numerical,
            Self::Layout(_) | Self::Entropy(_) => ErrorKind::Internal,
        }
    }
}
