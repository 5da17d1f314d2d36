//! Numeric hand-offs between the raster world and the two networks.
//!
//! The generator consumes mean/std-normalized channel-first data while the
//! classifier consumes plain `/255` scaled pixels. Keep the two separate.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4};
use tch::{Device, Kind, TchError, Tensor};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Scales the shorter side to `size` and crops the centered `size`×`size` square.
pub fn resize_and_center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let side = width.min(height).max(1);
    let left = (width.saturating_sub(side)) / 2;
    let top = (height.saturating_sub(side)) / 2;
    let window = imageops::crop_imm(image, left, top, side, side).to_image();
    imageops::resize(&window, size, size, FilterType::Triangle)
}

/// Channel-first, `(pixel / 255 - mean) / std` per channel.
pub fn normalize_chw(image: &RgbImage, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((3, height as usize, width as usize), |(c, y, x)| {
        let value = image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0;
        (value - mean[c]) / std[c]
    })
}

/// Inverse of [`normalize_chw`] followed by a clamp to [0, 1].
pub fn denormalize_chw(data: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut restored = data.clone();
    for (c, mut channel) in restored.outer_iter_mut().enumerate() {
        channel.mapv_inplace(|v| (v * std[c] + mean[c]).clamp(0.0, 1.0));
    }
    restored
}

/// Converts [0, 1] channel-first data to an 8-bit raster, truncating like a
/// `mul(255).byte()` cast.
pub fn chw_to_rgb(data: &Array3<f32>) -> RgbImage {
    let (_, height, width) = data.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_byte(data[[0, y, x]]),
            to_byte(data[[1, y, x]]),
            to_byte(data[[2, y, x]]),
        ])
    })
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0).clamp(0.0, 255.0) as u8
}

/// Bilinear resize to `size`×`size`, then channel-last `pixel / 255`.
pub fn scale_hwc(image: &RgbImage, size: u32) -> Array3<f32> {
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    Array3::from_shape_fn((size as usize, size as usize, 3), |(y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
}

pub fn batch_tensor(data: Array3<f32>) -> Tensor {
    let batch: Array4<f32> = data.insert_axis(ndarray::Axis(0));
    let shape: Vec<i64> = batch.shape().iter().map(|&d| d as i64).collect();
    let values: Vec<f32> = batch.iter().copied().collect();
    Tensor::from_slice(&values).view(shape.as_slice())
}

/// Reads a `[1, C, H, W]` batch back into a channel-first array.
pub fn unbatch_chw(tensor: &Tensor) -> Result<Array3<f32>, TchError> {
    let size = tensor.size();
    let (channels, height, width) = match size.as_slice() {
        [1, c, h, w] => (*c as usize, *h as usize, *w as usize),
        _ => {
            return Err(TchError::Shape(format!(
                "expected a [1, C, H, W] batch, got {:?}",
                size
            )));
        }
    };
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .reshape([-1]);
    let values = Vec::<f32>::try_from(&flat)?;
    Array3::from_shape_vec((channels, height, width), values)
        .map_err(|e| TchError::Shape(e.to_string()))
}

pub fn flatten_probabilities(tensor: &Tensor) -> Result<Vec<f32>, TchError> {
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .reshape([-1]);
    Vec::<f32>::try_from(&flat)
}
