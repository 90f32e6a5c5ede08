//! kasumi-diffusion: DDPM forward-process engine (sans-IO).
//!
//! Builds a noise-variance schedule, binds it to one clean image and
//! produces noised versions of that image:
//! decode -> size limit -> normalize -> schedule -> forward process ->
//! quantize -> metrics.
//!
//! This crate has **no I/O dependencies**. It operates on in-memory byte
//! slices and arrays; encoding frames lives in `kasumi-export` and the
//! streamed session lives in `kasumi-stream`.

pub mod decode;
pub mod forward;
pub mod metrics;
pub mod schedule;
pub mod tensor;
pub mod types;

pub use decode::{decode_image, limit_longest_side};
pub use forward::{ForwardProcess, Frame, Frames, mix_seed};
pub use metrics::{FrameMetrics, MetricFailure, compare};
pub use schedule::{Schedule, ScheduleBuilder, ScheduleKind};
pub use tensor::{ImageTensor, Shape, frame_to_image};
pub use types::{DiffusionConfig, DiffusionError, DynamicImage, ErrorKind};

/// Decode an image and bind it to the schedule described by `config`.
///
/// # Steps
///
/// 1. Decode (PNG, JPEG, BMP, WebP)
/// 2. Optionally cap the longest side at `max_side` pixels
/// 3. Normalize to an [`ImageTensor`] (grayscale stays single-channel)
/// 4. Build the schedule and the [`ForwardProcess`]
///
/// # Errors
///
/// Returns [`DiffusionError::EmptyInput`] or [`DiffusionError::ImageDecode`]
/// for unusable image bytes, and schedule validation errors for a bad
/// `config`.
pub fn prepare(
    image_bytes: &[u8],
    config: &DiffusionConfig,
    builder: &ScheduleBuilder,
    max_side: Option<u32>,
) -> Result<ForwardProcess, DiffusionError> {
    // Validate the schedule before paying for decode and resize.
    let schedule = builder.from_config(config)?;

    let image = decode_image(image_bytes)?;
    let (image, _) = limit_longest_side(&image, max_side);
    let x0 = ImageTensor::from_image(&image)?;

    ForwardProcess::new(x0, schedule, config.seed)
}
