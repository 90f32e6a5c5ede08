//! Noise-variance schedules and their derived arrays.
//!
//! A [`Schedule`] is an immutable set of per-step arrays built once by
//! [`ScheduleBuilder`]:
//!
//! ```text
//! beta[i]                      noise variance injected at step i
//! alpha[i]     = 1 - beta[i]   signal retained at step i
//! alpha_bar[i] = Π_{k≤i} alpha[k]
//! ```
//!
//! plus the square roots the samplers need (`sqrt(alpha_bar)`,
//! `sqrt(1 - alpha_bar)`, `sqrt(1 - beta)`).
//!
//! Every schedule kind ends in the same finishing pass: clamp `beta` to
//! [`BETA_MIN`]..=[`BETA_MAX`], rebuild `alpha` from it, and rebuild
//! `alpha_bar` as the running product of that `alpha`. The cosine
//! schedule starts from an analytic `alpha_bar`, but after clamping the
//! recomputed product is the source of truth, so `alpha_bar` is always
//! literally the cumulative product of the final `alpha`.

use std::f64::consts::FRAC_PI_2;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{DiffusionConfig, DiffusionError};

/// Smallest `beta` any schedule may contain.
pub const BETA_MIN: f64 = 1e-8;

/// Largest `beta` any schedule may contain.
pub const BETA_MAX: f64 = 0.999;

/// Floor for the analytic cosine `alpha_bar` before `beta` is derived.
const ALPHA_BAR_MIN: f64 = 1e-8;

/// Selects which noise-variance schedule to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// `beta` evenly spaced from `beta_start` to `beta_end` inclusive.
    #[default]
    Linear,
    /// Cosine `alpha_bar` curve (Nichol & Dhariwal), offset by `s`.
    Cosine,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Cosine => f.write_str("cosine"),
        }
    }
}

impl FromStr for ScheduleKind {
    type Err = DiffusionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            other => Err(DiffusionError::InvalidConfig(format!(
                "unknown schedule kind '{other}' (expected 'linear' or 'cosine')"
            ))),
        }
    }
}

/// Precomputed per-step diffusion arrays.
///
/// All six arrays have length `steps()`. Only [`ScheduleBuilder`] can
/// construct one, so the clamping and cumulative-product invariants
/// always hold.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    kind: ScheduleKind,
    beta: Vec<f64>,
    alpha: Vec<f64>,
    alpha_bar: Vec<f64>,
    sqrt_alpha_bar: Vec<f64>,
    sqrt_one_minus_alpha_bar: Vec<f64>,
    sqrt_one_minus_beta: Vec<f64>,
}

impl Schedule {
    /// Finish a schedule from raw (unclamped) `beta` values.
    fn from_raw_beta(kind: ScheduleKind, raw_beta: impl IntoIterator<Item = f64>) -> Self {
        let beta: Vec<f64> = raw_beta
            .into_iter()
            .map(|b| b.clamp(BETA_MIN, BETA_MAX))
            .collect();
        let alpha: Vec<f64> = beta.iter().map(|b| 1.0 - b).collect();
        let alpha_bar: Vec<f64> = alpha
            .iter()
            .scan(1.0_f64, |product, a| {
                *product *= a;
                Some(*product)
            })
            .collect();

        let sqrt_alpha_bar = alpha_bar.iter().map(|ab| ab.sqrt()).collect();
        let sqrt_one_minus_alpha_bar = alpha_bar.iter().map(|ab| (1.0 - ab).sqrt()).collect();
        let sqrt_one_minus_beta = beta.iter().map(|b| (1.0 - b).sqrt()).collect();

        Self {
            kind,
            beta,
            alpha,
            alpha_bar,
            sqrt_alpha_bar,
            sqrt_one_minus_alpha_bar,
            sqrt_one_minus_beta,
        }
    }

    /// Which kind of schedule this is.
    #[must_use]
    pub const fn kind(&self) -> ScheduleKind {
        self.kind
    }

    /// Number of steps (T).
    #[must_use]
    pub const fn steps(&self) -> usize {
        self.beta.len()
    }

    /// Noise variance per step.
    #[must_use]
    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    /// Retention factor per step, `1 - beta`.
    #[must_use]
    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    /// Cumulative retention, the running product of `alpha`.
    #[must_use]
    pub fn alpha_bar(&self) -> &[f64] {
        &self.alpha_bar
    }

    /// `sqrt(alpha_bar)` per step.
    #[must_use]
    pub fn sqrt_alpha_bar(&self) -> &[f64] {
        &self.sqrt_alpha_bar
    }

    /// `sqrt(1 - alpha_bar)` per step.
    #[must_use]
    pub fn sqrt_one_minus_alpha_bar(&self) -> &[f64] {
        &self.sqrt_one_minus_alpha_bar
    }

    /// `sqrt(1 - beta)` per step.
    #[must_use]
    pub fn sqrt_one_minus_beta(&self) -> &[f64] {
        &self.sqrt_one_minus_beta
    }
}

/// Builds [`Schedule`]s, enforcing an upper bound on the step count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleBuilder {
    max_steps: usize,
}

impl Default for ScheduleBuilder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_STEPS)
    }
}

impl ScheduleBuilder {
    /// Step limit used by [`ScheduleBuilder::default`].
    pub const DEFAULT_MAX_STEPS: usize = 1000;

    /// Create a builder that accepts at most `max_steps` steps.
    #[must_use]
    pub const fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }

    /// The configured step limit.
    #[must_use]
    pub const fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Build the schedule described by `config`.
    ///
    /// # Errors
    ///
    /// See [`build`](Self::build).
    pub fn from_config(&self, config: &DiffusionConfig) -> Result<Schedule, DiffusionError> {
        self.build(
            config.steps,
            config.schedule,
            config.beta_start,
            config.beta_end,
            config.cosine_shift,
        )
    }

    /// Build a schedule of `steps` entries.
    ///
    /// `beta_start` and `beta_end` are validated for every kind, even
    /// though only the linear schedule reads them. `cosine_shift` is only
    /// validated for the cosine schedule.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::InvalidSteps`] if `steps` is zero or
    /// above [`max_steps`](Self::max_steps).
    /// Returns [`DiffusionError::InvalidBeta`] if either bound is outside
    /// the open interval (0, 1).
    /// Returns [`DiffusionError::InvalidCosineShift`] if the cosine offset
    /// is negative or not finite.
    pub fn build(
        &self,
        steps: usize,
        kind: ScheduleKind,
        beta_start: f64,
        beta_end: f64,
        cosine_shift: f64,
    ) -> Result<Schedule, DiffusionError> {
        if steps == 0 || steps > self.max_steps {
            return Err(DiffusionError::InvalidSteps {
                steps,
                max: self.max_steps,
            });
        }
        check_beta_bound("beta_start", beta_start)?;
        check_beta_bound("beta_end", beta_end)?;

        let schedule = match kind {
            ScheduleKind::Linear => {
                Schedule::from_raw_beta(kind, linspace(beta_start, beta_end, steps))
            }
            ScheduleKind::Cosine => {
                if !cosine_shift.is_finite() || cosine_shift < 0.0 {
                    return Err(DiffusionError::InvalidCosineShift(cosine_shift));
                }
                Schedule::from_raw_beta(kind, cosine_beta(steps, cosine_shift))
            }
        };

        tracing::info!(
            kind = %kind,
            steps,
            beta_first = schedule.beta[0],
            alpha_bar_last = schedule.alpha_bar[steps - 1],
            "built noise schedule",
        );
        Ok(schedule)
    }
}

fn check_beta_bound(name: &'static str, value: f64) -> Result<(), DiffusionError> {
    // Written as two comparisons so NaN falls through to the error.
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(DiffusionError::InvalidBeta { name, value })
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive.
///
/// A single value is `start`; otherwise the last value is exactly `end`.
#[allow(clippy::cast_precision_loss)]
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let last = n - 1;
    let step = (end - start) / last as f64;
    (0..n)
        .map(|i| {
            if i == last {
                end
            } else {
                (i as f64).mul_add(step, start)
            }
        })
        .collect()
}

/// Raw per-step `beta` implied by the cosine `alpha_bar` curve.
#[allow(clippy::cast_precision_loss)]
fn cosine_beta(steps: usize, shift: f64) -> Vec<f64> {
    let f = |u: f64| (((u + shift) / (1.0 + shift)) * FRAC_PI_2).cos().powi(2);
    let denom = f(0.0);
    let total = steps as f64;

    let alpha_bar: Vec<f64> = (0..steps)
        .map(|i| (f(i as f64 / total) / denom).clamp(ALPHA_BAR_MIN, 1.0))
        .collect();

    let mut beta = Vec::with_capacity(steps);
    beta.push(1.0 - alpha_bar[0]);
    beta.extend(alpha_bar.windows(2).map(|w| 1.0 - w[1] / w[0]));
    beta
}
