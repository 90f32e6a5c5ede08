//! Normalized image tensors.
//!
//! An [`ImageTensor`] is a `(height, width, channels)` array of `f32`
//! intensities, with 1 (grayscale) or 3 (RGB) channels. Clean images are
//! normalized to [0, 1]; noised samples may leave that range, and are
//! brought back to 8-bit with [`ImageTensor::quantize`] before encoding
//! or comparison.

use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::types::DiffusionError;

/// Shape of an image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    /// Rows.
    pub height: usize,
    /// Columns.
    pub width: usize,
    /// 1 for grayscale, 3 for RGB.
    pub channels: usize,
}

impl Shape {
    /// Total number of scalar elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// Returns `true` if any axis is zero-sized.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shape as an `ndarray` dimension tuple.
    #[must_use]
    pub const fn dim(&self) -> (usize, usize, usize) {
        (self.height, self.width, self.channels)
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((height, width, channels): (usize, usize, usize)) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }
}

/// A `(height, width, channels)` float image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor(Array3<f32>);

impl ImageTensor {
    /// Wrap an existing array.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::UnsupportedChannels`] if the channel axis
    /// is not 1 or 3, and [`DiffusionError::EmptyImage`] if any axis is
    /// zero-sized.
    pub fn new(array: Array3<f32>) -> Result<Self, DiffusionError> {
        let shape = Shape::from(array.dim());
        if shape.channels != 1 && shape.channels != 3 {
            return Err(DiffusionError::UnsupportedChannels(shape.channels));
        }
        if shape.is_empty() {
            return Err(DiffusionError::EmptyImage);
        }
        Ok(Self(array))
    }

    /// A tensor where every element is `value`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn filled(shape: Shape, value: f32) -> Result<Self, DiffusionError> {
        Self::new(Array3::from_elem(shape.dim(), value))
    }

    /// Normalize an 8-bit frame to [0, 1].
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_u8(frame: &Array3<u8>) -> Result<Self, DiffusionError> {
        Self::new(frame.mapv(|v| f32::from(v) / 255.0))
    }

    /// Normalize a decoded image.
    ///
    /// 8-bit grayscale stays single-channel; every other pixel format is
    /// converted to 8-bit RGB first.
    ///
    /// # Errors
    ///
    /// Returns [`DiffusionError::EmptyImage`] for a zero-sized image.
    pub fn from_image(image: &DynamicImage) -> Result<Self, DiffusionError> {
        let frame = match image {
            DynamicImage::ImageLuma8(gray) => {
                raw_to_frame(gray.width(), gray.height(), 1, gray.as_raw().clone())?
            }
            other => {
                let rgb = other.to_rgb8();
                raw_to_frame(rgb.width(), rgb.height(), 3, rgb.into_raw())?
            }
        };
        Self::from_u8(&frame)
    }

    /// The tensor's shape.
    #[must_use]
    pub fn shape(&self) -> Shape {
        Shape::from(self.0.dim())
    }

    /// Borrow the underlying array.
    #[must_use]
    pub const fn array(&self) -> &Array3<f32> {
        &self.0
    }

    /// Clip to [0, 1] and round to 8-bit (`x * 255 + 0.5`, truncated).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn quantize(&self) -> Array3<u8> {
        self.0.mapv(|v| v.clamp(0.0, 1.0).mul_add(255.0, 0.5) as u8)
    }

    /// Quantize and convert to a [`DynamicImage`].
    ///
    /// # Errors
    ///
    /// See [`frame_to_image`].
    pub fn to_image(&self) -> Result<DynamicImage, DiffusionError> {
        frame_to_image(&self.quantize())
    }
}

/// Convert an 8-bit `(height, width, channels)` frame to a [`DynamicImage`].
///
/// # Errors
///
/// Returns [`DiffusionError::UnsupportedChannels`] if the channel axis is
/// not 1 or 3, and [`DiffusionError::InvalidConfig`] if a side does not
/// fit in `u32`.
pub fn frame_to_image(frame: &Array3<u8>) -> Result<DynamicImage, DiffusionError> {
    let (height, width, channels) = frame.dim();
    let w = u32::try_from(width)
        .map_err(|_| DiffusionError::InvalidConfig(format!("width {width} exceeds u32")))?;
    let h = u32::try_from(height)
        .map_err(|_| DiffusionError::InvalidConfig(format!("height {height} exceeds u32")))?;
    // Logical iteration order is row-major (h, w, c), which is the
    // interleaved layout `image` expects.
    let raw: Vec<u8> = frame.iter().copied().collect();

    let image = match channels {
        1 => GrayImage::from_raw(w, h, raw).map(DynamicImage::ImageLuma8),
        3 => RgbImage::from_raw(w, h, raw).map(DynamicImage::ImageRgb8),
        other => return Err(DiffusionError::UnsupportedChannels(other)),
    };
    image.ok_or(DiffusionError::EmptyImage)
}

fn raw_to_frame(
    width: u32,
    height: u32,
    channels: usize,
    raw: Vec<u8>,
) -> Result<Array3<u8>, DiffusionError> {
    if width == 0 || height == 0 {
        return Err(DiffusionError::EmptyImage);
    }
    Ok(Array3::from_shape_vec(
        (height as usize, width as usize, channels),
        raw,
    )?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_two_channels() {
        let result = ImageTensor::new(Array3::zeros((4, 4, 2)));
        assert!(matches!(result, Err(DiffusionError::UnsupportedChannels(2))));
    }

    #[test]
    fn new_rejects_empty() {
        let result = ImageTensor::new(Array3::zeros((0, 4, 3)));
        assert!(matches!(result, Err(DiffusionError::EmptyImage)));
    }

    #[test]
    fn shape_reports_axes() {
        let tensor = ImageTensor::filled(Shape::from((8, 6, 3)), 0.5).unwrap();
        let shape = tensor.shape();
        assert_eq!(shape.height, 8);
        assert_eq!(shape.width, 6);
        assert_eq!(shape.channels, 3);
        assert_eq!(shape.len(), 144);
    }

    #[test]
    fn rgb_image_becomes_three_channels() {
        let img = RgbImage::from_fn(5, 3, |x, _| image::Rgb([u8::try_from(x).unwrap() * 50, 0, 255]));
        let tensor = ImageTensor::from_image(&DynamicImage::ImageRgb8(img)).unwrap();
        assert_eq!(tensor.shape(), Shape::from((3, 5, 3)));
        assert!((tensor.array()[[0, 2, 0]] - 100.0 / 255.0).abs() < 1e-6);
        assert!((tensor.array()[[1, 4, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gray_image_stays_single_channel() {
        let img = GrayImage::from_pixel(4, 2, image::Luma([51]));
        let tensor = ImageTensor::from_image(&DynamicImage::ImageLuma8(img)).unwrap();
        assert_eq!(tensor.shape(), Shape::from((2, 4, 1)));
        assert!((tensor.array()[[1, 3, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn rgba_image_drops_alpha() {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 0]));
        let tensor = ImageTensor::from_image(&DynamicImage::ImageRgba8(img)).unwrap();
        assert_eq!(tensor.shape().channels, 3);
    }

    #[test]
    fn quantize_clips_and_rounds() {
        let array = Array3::from_shape_vec((1, 1, 3), vec![-0.5_f32, 0.5, 1.7]).unwrap();
        let frame = ImageTensor::new(array).unwrap().quantize();
        assert_eq!(frame.as_slice().unwrap(), &[0, 128, 255]);
    }

    #[test]
    fn u8_roundtrip_is_lossless() {
        let frame = Array3::from_shape_fn((3, 4, 3), |(y, x, c)| {
            u8::try_from((y * 40 + x * 10 + c * 3) % 256).unwrap()
        });
        let back = ImageTensor::from_u8(&frame).unwrap().quantize();
        assert_eq!(back, frame);
    }

    #[test]
    fn to_image_preserves_layout() {
        let img = RgbImage::from_fn(3, 2, |x, y| {
            image::Rgb([u8::try_from(x * 80).unwrap(), u8::try_from(y * 100).unwrap(), 7])
        });
        let tensor = ImageTensor::from_image(&DynamicImage::ImageRgb8(img.clone())).unwrap();
        let back = tensor.to_image().unwrap().to_rgb8();
        assert_eq!(back.as_raw(), img.as_raw());
    }

    #[test]
    fn frame_to_image_rejects_four_channels() {
        let frame = Array3::<u8>::zeros((2, 2, 4));
        assert!(matches!(
            frame_to_image(&frame),
            Err(DiffusionError::UnsupportedChannels(4))
        ));
    }
}
