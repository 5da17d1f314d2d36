//! Perceptual touch-ups applied to the generator output before classification.
//!
//! Both operations extrapolate from a degenerate image:
//! `out = degenerate + factor * (image - degenerate)`, truncated to 8 bits.

use image::{Rgb, RgbImage};

/// Pushes pixels away from the mean gray level.
pub fn contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let gray = (grayscale_mean(image) + 0.5).floor();
    let degenerate = RgbImage::from_pixel(
        image.width(),
        image.height(),
        Rgb([gray as u8, gray as u8, gray as u8]),
    );
    blend(&degenerate, image, factor)
}

/// Pushes pixels away from a 3×3 smoothed copy of the image.
pub fn sharpness(image: &RgbImage, factor: f32) -> RgbImage {
    let degenerate = smooth(image);
    blend(&degenerate, image, factor)
}

fn luma(pixel: &Rgb<u8>) -> u32 {
    (pixel[0] as u32 * 19595 + pixel[1] as u32 * 38470 + pixel[2] as u32 * 7471 + 0x8000) >> 16
}

fn grayscale_mean(image: &RgbImage) -> f32 {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0.0;
    }
    let total: u64 = image.pixels().map(|p| luma(p) as u64).sum();
    (total as f64 / count as f64) as f32
}

fn blend(degenerate: &RgbImage, image: &RgbImage, factor: f32) -> RgbImage {
    let mut out = image.clone();
    for (target, (base, source)) in out
        .pixels_mut()
        .zip(degenerate.pixels().zip(image.pixels()))
    {
        for c in 0..3 {
            let base = base[c] as f32;
            let value = base + factor * (source[c] as f32 - base);
            target[c] = value.clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Weighted 3×3 smoothing (center weight 5, neighbours 1); border pixels are
/// copied unchanged.
fn smooth(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    let mut out = image.clone();
    if width < 3 || height < 3 {
        return out;
    }
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let mut sums = [0f32; 3];
            for dy in 0..3 {
                for dx in 0..3 {
                    let weight = if dx == 1 && dy == 1 { 5.0 } else { 1.0 };
                    let pixel = image.get_pixel(x + dx - 1, y + dy - 1);
                    for c in 0..3 {
                        sums[c] += weight * pixel[c] as f32;
                    }
                }
            }
            let target = out.get_pixel_mut(x, y);
            for c in 0..3 {
                target[c] = (sums[c] / 13.0 + 0.5).clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_factor_is_identity() {
        let image = RgbImage::from_fn(9, 7, |x, y| Rgb([(x * 20) as u8, (y * 30) as u8, 77]));
        assert_eq!(contrast(&image, 1.0), image);
        assert_eq!(sharpness(&image, 1.0), image);
    }

    #[test]
    fn contrast_spreads_values_around_the_mean() {
        let image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 { Rgb([100, 100, 100]) } else { Rgb([150, 150, 150]) }
        });
        let out = contrast(&image, 1.6);

        // mean gray is 125
        assert_eq!(out.get_pixel(0, 0)[0], 85);
        assert_eq!(out.get_pixel(1, 0)[0], 165);
    }

    #[test]
    fn contrast_saturates_instead_of_wrapping() {
        let image = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) }
        });
        let out = contrast(&image, 1.6);
        assert_eq!(out.get_pixel(0, 0)[1], 0);
        assert_eq!(out.get_pixel(1, 0)[1], 255);
    }

    #[test]
    fn sharpness_amplifies_an_isolated_bright_pixel() {
        let mut image = RgbImage::from_pixel(5, 5, Rgb([100, 100, 100]));
        image.put_pixel(2, 2, Rgb([200, 200, 200]));
        let out = sharpness(&image, 1.7);

        assert!(out.get_pixel(2, 2)[0] > 200);
        assert!(out.get_pixel(1, 2)[0] < 100);
        assert_eq!(out.get_pixel(0, 0)[0], 100);
    }

    #[test]
    fn flat_images_are_unchanged() {
        let image = RgbImage::from_pixel(6, 6, Rgb([90, 120, 30]));
        assert_eq!(sharpness(&image, 1.7), image);
    }
}
