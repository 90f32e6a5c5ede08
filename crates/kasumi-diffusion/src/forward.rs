//! Forward (noising) diffusion process over one clean image.
//!
//! [`ForwardProcess`] binds a clean tensor `x0`, a [`Schedule`] and a base
//! seed, and offers three ways to look at the noised image:
//!
//! - [`sample_closed_form`](ForwardProcess::sample_closed_form): O(1),
//!   `x_t = sqrt(alpha_bar[t]) * x0 + sqrt(1 - alpha_bar[t]) * eps`.
//! - [`sample_iterative`](ForwardProcess::sample_iterative): O(t), applies
//!   `x_{i+1} = sqrt(1 - beta[i]) * x_i + sqrt(beta[i]) * eps_i` from `x0`.
//! - [`frames`](ForwardProcess::frames): lazy walk over every step.
//!
//! The two single-step accessors are deterministic: both seed their
//! generator with [`mix_seed`]`(base_seed, t)`, so repeated calls return
//! bit-identical tensors. They do not agree with each other bit-for-bit,
//! since one draws a single noise tensor and the other draws `t + 1`.
//!
//! [`frames`](ForwardProcess::frames) deliberately ignores the base seed
//! and draws from a freshly seeded generator on every call, so two walks
//! over the same process show different noise.

use std::iter::FusedIterator;

use ndarray::{Array3, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::schedule::{Schedule, ScheduleBuilder};
use crate::tensor::{ImageTensor, Shape};
use crate::types::{DiffusionConfig, DiffusionError};

/// Odd 32-bit multiplier mixed into the base seed per step.
pub const SEED_MULTIPLIER: u64 = 0x9E37_79B1;

/// Per-step seed: `(base_seed XOR (t * 0x9E3779B1)) AND 0xFFFFFFFF`.
#[must_use]
pub const fn mix_seed(base_seed: u64, t: usize) -> u64 {
    (base_seed ^ (t as u64).wrapping_mul(SEED_MULTIPLIER)) & 0xFFFF_FFFF
}

/// Draw a fresh base seed from system entropy.
///
/// # Errors
///
/// Returns [`DiffusionError::Entropy`] if the platform has no entropy
/// source.
pub fn entropy_seed() -> Result<u64, DiffusionError> {
    let mut bytes = [0_u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// One step of a [`Frames`] walk.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Zero-based step index.
    pub t: usize,
    /// Noise variance injected at this step.
    pub beta: f64,
    /// The noised image after this step.
    pub image: ImageTensor,
}

/// Forward-diffusion state for one clean image.
///
/// `x0` is never modified; every accessor returns a new tensor.
#[derive(Debug, Clone)]
pub struct ForwardProcess {
    x0: ImageTensor,
    schedule: Schedule,
    base_seed: u64,
}

impl ForwardProcess {
    /// Bind a clean image to a schedule.
    ///
    /// `seed: None` draws a base seed from system entropy once; it then
    /// stays fixed for the lifetime of this process.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::Entropy`] if a seed had to be generated
    /// and no entropy source was available.
    pub fn new(
        x0: ImageTensor,
        schedule: Schedule,
        seed: Option<u64>,
    ) -> Result<Self, DiffusionError> {
        let base_seed = match seed {
            Some(seed) => seed,
            None => entropy_seed()?,
        };
        let shape = x0.shape();
        tracing::info!(
            steps = schedule.steps(),
            height = shape.height,
            width = shape.width,
            channels = shape.channels,
            base_seed,
            "forward process ready",
        );
        Ok(Self {
            x0,
            schedule,
            base_seed,
        })
    }

    /// Build the schedule described by `config` and bind `x0` to it.
    ///
    /// # Errors
    ///
    /// Propagates schedule validation errors from
    /// [`ScheduleBuilder::from_config`] and seed errors from
    /// [`new`](Self::new).
    pub fn from_config(
        x0: ImageTensor,
        config: &DiffusionConfig,
        builder: &ScheduleBuilder,
    ) -> Result<Self, DiffusionError> {
        let schedule = builder.from_config(config)?;
        Self::new(x0, schedule, config.seed)
    }

    /// The clean image.
    #[must_use]
    pub const fn x0(&self) -> &ImageTensor {
        &self.x0
    }

    /// Shape shared by `x0` and every sample.
    #[must_use]
    pub fn shape(&self) -> Shape {
        self.x0.shape()
    }

    /// Number of steps (T).
    #[must_use]
    pub const fn steps(&self) -> usize {
        self.schedule.steps()
    }

    /// The schedule this process samples from.
    #[must_use]
    pub const fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Base seed of the deterministic accessors.
    #[must_use]
    pub const fn base_seed(&self) -> u64 {
        self.base_seed
    }

    /// Convert an untyped step index (e.g. from a URL or CLI flag).
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::NegativeStep`] for `raw < 0` and
    /// [`DiffusionError::StepOutOfRange`] for `raw >= steps()`.
    pub fn check_step(&self, raw: i64) -> Result<usize, DiffusionError> {
        let t = usize::try_from(raw).map_err(|_| DiffusionError::NegativeStep(raw))?;
        self.ensure_step(t)?;
        Ok(t)
    }

    fn ensure_step(&self, t: usize) -> Result<(), DiffusionError> {
        if t < self.steps() {
            Ok(())
        } else {
            Err(DiffusionError::StepOutOfRange {
                t,
                steps: self.steps(),
            })
        }
    }

    /// Noised sample at step `t` in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::StepOutOfRange`] if `t >= steps()`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn sample_closed_form(&self, t: usize) -> Result<ImageTensor, DiffusionError> {
        self.ensure_step(t)?;
        let mut rng = StdRng::seed_from_u64(mix_seed(self.base_seed, t));

        let signal = self.schedule.sqrt_alpha_bar()[t] as f32;
        let noise = self.schedule.sqrt_one_minus_alpha_bar()[t] as f32;

        let mut xt = gaussian(self.shape(), &mut rng);
        Zip::from(&mut xt)
            .and(self.x0.array())
            .for_each(|x, &clean| *x = signal.mul_add(clean, noise * *x));
        ImageTensor::new(xt)
    }

    /// Noised sample at step `t` by walking the Markov chain from `x0`.
    ///
    /// Draws `t + 1` noise tensors, in order, from one generator seeded
    /// with [`mix_seed`]`(base_seed, t)`.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::StepOutOfRange`] if `t >= steps()`.
    pub fn sample_iterative(&self, t: usize) -> Result<ImageTensor, DiffusionError> {
        self.ensure_step(t)?;
        let mut rng = StdRng::seed_from_u64(mix_seed(self.base_seed, t));

        let mut xt = self.x0.array().clone();
        for i in 0..=t {
            apply_step(&mut xt, &self.schedule, i, &mut rng);
        }
        ImageTensor::new(xt)
    }

    /// Closed-form sample at `t`, quantized to 8-bit.
    ///
    /// # Errors
    ///
    /// See [`sample_closed_form`](Self::sample_closed_form).
    pub fn frame_u8(&self, t: usize) -> Result<Array3<u8>, DiffusionError> {
        Ok(self.sample_closed_form(t)?.quantize())
    }

    /// Iterative sample at `t`, quantized to 8-bit.
    ///
    /// # Errors
    ///
    /// See [`sample_iterative`](Self::sample_iterative).
    pub fn frame_u8_iterative(&self, t: usize) -> Result<Array3<u8>, DiffusionError> {
        Ok(self.sample_iterative(t)?.quantize())
    }

    /// Lazily walk every step `0..steps()`.
    ///
    /// Each call starts a new walk from `x0` with a generator seeded from
    /// system entropy, independent of the base seed.
    #[must_use]
    pub fn frames(&self) -> Frames<'_> {
        Frames {
            process: self,
            rng: StdRng::from_entropy(),
            state: self.x0.array().clone(),
            next: 0,
        }
    }
}

/// One-shot iterator over every step of a forward process.
///
/// Created by [`ForwardProcess::frames`]. Each step updates a running
/// state in place, so producing step `t` costs one noise draw regardless
/// of `t`. The consumer cancels by dropping the iterator.
#[derive(Debug)]
pub struct Frames<'a> {
    process: &'a ForwardProcess,
    rng: StdRng,
    state: Array3<f32>,
    next: usize,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, DiffusionError>;

    fn next(&mut self) -> Option<Self::Item> {
        let t = self.next;
        if t >= self.process.steps() {
            return None;
        }
        self.next += 1;

        let schedule = &self.process.schedule;
        apply_step(&mut self.state, schedule, t, &mut self.rng);
        Some(ImageTensor::new(self.state.clone()).map(|image| Frame {
            t,
            beta: schedule.beta()[t],
            image,
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.process.steps().saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Frames<'_> {}

impl FusedIterator for Frames<'_> {}

/// A standard-normal tensor of `shape`, drawn in row-major order.
fn gaussian(shape: Shape, rng: &mut StdRng) -> Array3<f32> {
    Array3::from_shape_simple_fn(shape.dim(), || rng.sample::<f32, _>(StandardNormal))
}

/// `x <- sqrt(1 - beta[i]) * x + sqrt(beta[i]) * eps`, drawing `eps`
/// element by element in row-major order.
#[allow(clippy::cast_possible_truncation)]
fn apply_step(x: &mut Array3<f32>, schedule: &Schedule, i: usize, rng: &mut StdRng) {
    let keep = schedule.sqrt_one_minus_beta()[i] as f32;
    let inject = schedule.beta()[i].sqrt() as f32;
    let eps = gaussian(Shape::from(x.dim()), rng);
    Zip::from(x)
        .and(&eps)
        .for_each(|v, &e| *v = keep.mul_add(*v, inject * e));
}
