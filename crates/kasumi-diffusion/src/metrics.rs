//! Frame similarity metrics.
//!
//! Both metrics reduce two same-shaped tensors to one scalar over the whole
//! image. Inputs may be any numeric element type; everything is computed in
//! `f64`.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::types::{DiffusionError, ErrorKind};

/// Dynamic range used for the SSIM stabilizing constants (8-bit pixels).
pub const DYNAMIC_RANGE: f64 = 255.0;

const C1: f64 = (0.01 * DYNAMIC_RANGE) * (0.01 * DYNAMIC_RANGE);
const C2: f64 = (0.03 * DYNAMIC_RANGE) * (0.03 * DYNAMIC_RANGE);

/// Similarity of a noised frame to its reference.
///
/// SSIM is defined for every pair of same-shaped tensors. Cosine
/// similarity is not: when it is undefined, `cosine_similarity` is `None`
/// (serialized as `null`) and `error` says why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMetrics {
    /// Global (single-window) SSIM.
    pub structural_similarity: f64,
    /// Cosine of the angle between the flattened tensors.
    pub cosine_similarity: Option<f64>,
    /// The metric that could not be computed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MetricFailure>,
}

/// A metric that is undefined for one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricFailure {
    /// Classification of the underlying error.
    pub kind: ErrorKind,
    /// Human-readable reason.
    pub detail: String,
}

impl From<&DiffusionError> for MetricFailure {
    fn from(err: &DiffusionError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// Compute both metrics for `a` against `b`.
///
/// A zero-norm operand does not fail the comparison: the SSIM is still
/// returned, with the cosine reported through [`FrameMetrics::error`].
///
/// # Errors
///
/// Returns [`DiffusionError::ShapeMismatch`] if the shapes differ and
/// [`DiffusionError::EmptyImage`] for empty tensors.
pub fn compare<A, B>(a: &Array3<A>, b: &Array3<B>) -> Result<FrameMetrics, DiffusionError>
where
    A: Copy + Into<f64>,
    B: Copy + Into<f64>,
{
    let ssim = structural_similarity(a, b)?;
    let (cosine, error) = match cosine_similarity(a, b) {
        Ok(cosine) => (Some(cosine), None),
        Err(err @ DiffusionError::ZeroNorm) => (None, Some(MetricFailure::from(&err))),
        Err(err) => return Err(err),
    };
    Ok(FrameMetrics {
        structural_similarity: ssim,
        cosine_similarity: cosine,
        error,
    })
}

/// Whole-image SSIM with `L = 255`.
///
/// ```text
/// ((2 mu_a mu_b + C1)(2 cov_ab + C2)) / ((mu_a^2 + mu_b^2 + C1)(var_a + var_b + C2))
/// ```
///
/// Means, variances and covariance are population statistics over every
/// element. This is not the windowed reference SSIM.
///
/// # Errors
///
/// Returns [`DiffusionError::ShapeMismatch`] or
/// [`DiffusionError::EmptyImage`].
#[allow(clippy::cast_precision_loss)]
pub fn structural_similarity<A, B>(a: &Array3<A>, b: &Array3<B>) -> Result<f64, DiffusionError>
where
    A: Copy + Into<f64>,
    B: Copy + Into<f64>,
{
    check_shapes(a, b)?;
    let n = a.len() as f64;

    let mean_a = a.iter().map(|&v| v.into()).sum::<f64>() / n;
    let mean_b = b.iter().map(|&v| v.into()).sum::<f64>() / n;

    let (mut var_a, mut var_b, mut cov) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x.into() - mean_a;
        let dy = y.into() - mean_b;
        var_a += dx * dx;
        var_b += dy * dy;
        cov += dx * dy;
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    let numerator = 2.0_f64.mul_add(mean_a * mean_b, C1) * 2.0_f64.mul_add(cov, C2);
    let denominator =
        mean_a.mul_add(mean_a, mean_b.mul_add(mean_b, C1)) * (var_a + var_b + C2);
    Ok(numerator / denominator)
}

/// Dot product of the flattened tensors over the product of their L2 norms.
///
/// # Errors
///
/// Returns [`DiffusionError::ShapeMismatch`],
/// [`DiffusionError::EmptyImage`], or [`DiffusionError::ZeroNorm`] when
/// either tensor is all zeros.
pub fn cosine_similarity<A, B>(a: &Array3<A>, b: &Array3<B>) -> Result<f64, DiffusionError>
where
    A: Copy + Into<f64>,
    B: Copy + Into<f64>,
{
    check_shapes(a, b)?;

    let (mut dot, mut norm_a, mut norm_b) = (0.0_f64, 0.0_f64, 0.0_f64);
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y): (f64, f64) = (x.into(), y.into());
        dot = x.mul_add(y, dot);
        norm_a = x.mul_add(x, norm_a);
        norm_b = y.mul_add(y, norm_b);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Err(DiffusionError::ZeroNorm);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn check_shapes<A, B>(a: &Array3<A>, b: &Array3<B>) -> Result<(), DiffusionError> {
    if a.dim() != b.dim() {
        return Err(DiffusionError::ShapeMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    if a.is_empty() {
        return Err(DiffusionError::EmptyImage);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gradient() -> Array3<u8> {
        Array3::from_shape_fn((6, 5, 3), |(y, x, c)| {
            u8::try_from(y * 30 + x * 12 + c * 5).unwrap()
        })
    }

    #[test]
    fn identical_frames_score_one() {
        let frame = gradient();
        let metrics = compare(&frame, &frame).unwrap();
        assert!((metrics.structural_similarity - 1.0).abs() < 1e-12);
        assert!((metrics.cosine_similarity.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_constant_frames_score_one() {
        let frame = Array3::from_elem((4, 4, 1), 128_u8);
        let metrics = compare(&frame, &frame).unwrap();
        assert!((metrics.structural_similarity - 1.0).abs() < 1e-12);
        assert!((metrics.cosine_similarity.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn works_on_float_tensors() {
        let a = gradient().mapv(|v| f32::from(v) / 255.0);
        let metrics = compare(&a, &a).unwrap();
        assert!((metrics.cosine_similarity.unwrap() - 1.0).abs() < 1e-9);
        assert!((metrics.structural_similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mixed_element_types() {
        let a = gradient();
        let b = a.mapv(f64::from);
        let metrics = compare(&a, &b).unwrap();
        assert!((metrics.cosine_similarity.unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn inverted_frame_scores_low_ssim() {
        let a = gradient();
        let b = a.mapv(|v| 255 - v);
        let ssim = structural_similarity(&a, &b).unwrap();
        assert!(ssim < 0.0, "anti-correlated frames gave ssim {ssim}");
    }

    #[test]
    fn scaled_frame_keeps_cosine() {
        let a = gradient().mapv(f64::from);
        let b = a.mapv(|v| v * 0.5);
        let cos = cosine_similarity(&a, &b).unwrap();
        assert!((cos - 1.0).abs() < 1e-12);
        assert!(structural_similarity(&a, &b).unwrap() < 1.0);
    }

    #[test]
    fn orthogonal_vectors_have_zero_cosine() {
        let a = Array3::from_shape_vec((1, 2, 1), vec![1.0_f64, 0.0]).unwrap();
        let b = Array3::from_shape_vec((1, 2, 1), vec![0.0_f64, 1.0]).unwrap();
        assert!(cosine_similarity(&a, &b).unwrap().abs() < 1e-12);
    }

    #[test]
    fn ssim_matches_hand_computation() {
        // a = [0, 255], b = [255, 255]:
        // mu_a = 127.5, mu_b = 255, var_a = 127.5^2, var_b = 0, cov = 0.
        let a = Array3::from_shape_vec((1, 2, 1), vec![0_u8, 255]).unwrap();
        let b = Array3::from_shape_vec((1, 2, 1), vec![255_u8, 255]).unwrap();
        let expected = ((2.0 * 127.5 * 255.0 + C1) * C2)
            / ((127.5_f64.powi(2) + 255.0_f64.powi(2) + C1) * (127.5_f64.powi(2) + C2));
        let ssim = structural_similarity(&a, &b).unwrap();
        assert!((ssim - expected).abs() < 1e-12, "{ssim} vs {expected}");
    }

    #[test]
    fn zero_tensor_has_undefined_cosine() {
        let zero = Array3::<u8>::zeros((3, 3, 3));
        let other = gradient().slice_move(ndarray::s![..3, ..3, ..]);
        assert!(matches!(
            cosine_similarity(&zero, &other),
            Err(DiffusionError::ZeroNorm)
        ));
        // SSIM stays defined thanks to the stabilizing constants.
        assert!(structural_similarity(&zero, &other).unwrap().is_finite());
    }

    #[test]
    fn zero_norm_keeps_ssim_and_reports_cosine() {
        let zero = Array3::<u8>::zeros((3, 3, 3));
        let other = gradient().slice_move(ndarray::s![..3, ..3, ..]);
        let metrics = compare(&zero, &other).unwrap();

        assert!(
            (metrics.structural_similarity - structural_similarity(&zero, &other).unwrap()).abs()
                < 1e-12
        );
        assert!(metrics.cosine_similarity.is_none());
        let failure = metrics.error.unwrap();
        assert_eq!(failure.kind, ErrorKind::Numerical);
        assert!(failure.detail.contains("zero-norm"), "got {}", failure.detail);
    }

    #[test]
    fn undefined_cosine_serializes_as_null_with_reason() {
        let zero = Array3::<u8>::zeros((2, 2, 1));
        let metrics = compare(&zero, &zero).unwrap();
        let value = serde_json::to_value(&metrics).unwrap();
        assert!(value["cosineSimilarity"].is_null());
        assert_eq!(value["error"]["kind"], "numerical");
        assert!(value["structuralSimilarity"].as_f64().unwrap().is_finite());
    }

    #[test]
    fn shape_mismatch_rejected() {
        let a = Array3::<u8>::zeros((2, 2, 3));
        let b = Array3::<u8>::zeros((2, 2, 1));
        assert!(matches!(
            compare(&a, &b),
            Err(DiffusionError::ShapeMismatch {
                left: (2, 2, 3),
                right: (2, 2, 1),
            })
        ));
    }

    #[test]
    fn empty_tensors_rejected() {
        let a = Array3::<u8>::zeros((0, 2, 3));
        assert!(matches!(
            structural_similarity(&a, &a),
            Err(DiffusionError::EmptyImage)
        ));
    }

    #[test]
    fn metrics_serialize_camel_case() {
        let metrics = FrameMetrics {
            structural_similarity: 0.5,
            cosine_similarity: Some(0.25),
            error: None,
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert_eq!(json, r#"{"structuralSimilarity":0.5,"cosineSimilarity":0.25}"#);
    }

    #[test]
    fn inputs_are_not_mutated() {
        let a = gradient();
        let copy = a.clone();
        let _ = compare(&a, &a).unwrap();
        assert_eq!(a, copy);
    }
}
