use std::path::Path;

use burn::tensor::{Tensor, TensorData, backend::Backend};
use image::{RgbImage, imageops::FilterType};

use crate::error::{InversionError, Result};
use crate::{IMAGE_CHANNELS, PIXEL_MAX, PIXEL_MIN};

// --- TARGET IMAGE ---

/// The image an inversion tries to reproduce.
///
/// Stored as a `[1, 3, R, R]` tensor with pixels normalized to
/// `[PIXEL_MIN, PIXEL_MAX]`, the range the generator produces.
#[derive(Clone, Debug)]
pub struct TargetImage<B: Backend> {
    tensor: Tensor<B, 4>,
    resolution: usize,
}

impl<B: Backend> TargetImage<B> {
    /// Resizes `image` to `resolution` (bilinear) when needed and normalizes it.
    pub fn from_rgb(image: &RgbImage, resolution: usize, device: &B::Device) -> Self {
        let resized = resize_rgb(image, resolution as u32);
        Self {
            tensor: rgb_to_tensor(&resized, device),
            resolution,
        }
    }

    /// Wraps an already normalized `[1, 3, R, R]` tensor.
    pub fn from_tensor(tensor: Tensor<B, 4>) -> Result<Self> {
        let [batch, channels, height, width] = tensor.dims();
        if batch != 1 || channels != IMAGE_CHANNELS || height != width {
            return Err(InversionError::InvalidTarget(format!(
                "expected a 1x{IMAGE_CHANNELS}xRxR tensor, got {batch}x{channels}x{height}x{width}"
            )));
        }
        Ok(Self {
            tensor: tensor.detach(),
            resolution: height,
        })
    }

    pub fn tensor(&self) -> Tensor<B, 4> {
        self.tensor.clone()
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }
}

// --- CONVERSIONS ---

/// Converts an RGB image into a `[1, 3, H, W]` tensor in `[PIXEL_MIN, PIXEL_MAX]`.
///
/// Channel-major layout:
/// ```text
/// value = pixel / 255 * (max - min) + min
/// ```
pub fn rgb_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 4> {
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let scale = (PIXEL_MAX - PIXEL_MIN) / 255.0;

    let mut values = vec![0.0f32; IMAGE_CHANNELS * h * w];
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..IMAGE_CHANNELS {
            values[c * h * w + y * w + x] = pixel.0[c] as f32 * scale + PIXEL_MIN;
        }
    }

    Tensor::from_floats(TensorData::new(values, [1, IMAGE_CHANNELS, h, w]), device)
}

/// Converts the first image of a `[N, 3, H, W]` tensor back into 8-bit RGB.
///
/// Values outside `[PIXEL_MIN, PIXEL_MAX]` are clamped.
pub fn tensor_to_rgb<B: Backend>(tensor: Tensor<B, 4>) -> Result<RgbImage> {
    let [_, channels, height, width] = tensor.dims();
    if channels != IMAGE_CHANNELS {
        return Err(InversionError::InvalidTarget(format!(
            "cannot render a {channels}-channel image as RGB"
        )));
    }

    let first = tensor.slice([0..1, 0..channels, 0..height, 0..width]);
    let values: Vec<f32> = first
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|err| InversionError::TensorData(format!("{err:?}")))?;

    let scale = 255.0 / (PIXEL_MAX - PIXEL_MIN);
    let plane = height * width;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let idx = y as usize * width + x as usize;
        let mut rgb = [0u8; 3];
        for (c, out) in rgb.iter_mut().enumerate() {
            let v = (values[c * plane + idx] - PIXEL_MIN) * scale;
            *out = v.round().clamp(0.0, 255.0) as u8;
        }
        image::Rgb(rgb)
    }))
}

// --- FILE I/O ---

pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)?.to_rgb8())
}

pub fn save_rgb(path: &Path, image: &RgbImage) -> Result<()> {
    image.save(path)?;
    Ok(())
}

/// Square resize; returns a copy when the image already has the requested size.
pub fn resize_rgb(image: &RgbImage, size: u32) -> RgbImage {
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    image::imageops::resize(image, size, size, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn rgb_survives_tensor_conversion() {
        let device = Default::default();
        let image = RgbImage::from_fn(5, 3, |x, y| image::Rgb([x as u8 * 50, y as u8 * 100, 255]));

        let tensor = rgb_to_tensor::<B>(&image, &device);
        assert_eq!(tensor.dims(), [1, 3, 3, 5]);

        let back = tensor_to_rgb(tensor).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn target_is_resized_to_generator_resolution() {
        let device = Default::default();
        let image = RgbImage::from_pixel(20, 12, image::Rgb([0, 128, 255]));

        let target = TargetImage::<B>::from_rgb(&image, 8, &device);
        assert_eq!(target.resolution(), 8);
        assert_eq!(target.tensor().dims(), [1, 3, 8, 8]);
    }

    #[test]
    fn malformed_target_tensor_is_rejected() {
        let device = Default::default();
        let tensor = Tensor::<B, 4>::zeros([1, 1, 8, 8], &device);
        assert!(matches!(
            TargetImage::from_tensor(tensor),
            Err(InversionError::InvalidTarget(_))
        ));
    }
}
