//! Rescaling of working images and result masks.
//!
//! Large crops are shrunk so the longest side matches a configured maximum
//! before the expensive stages run, then the binary result is brought back
//! to crop size. Shrinking uses nearest-neighbour sampling so labels and
//! history values stay exact. Growing a binary result interpolates
//! bilinearly and thresholds, which avoids blocky edges.

use image::{GrayImage, ImageBuffer, Luma};

use crate::geometry::raster::{OFF, ON};
use crate::types::Dimensions;

/// Interpolated values this close to 0 or 1 count as settled when picking
/// the binarization threshold.
const SETTLED_MARGIN: f32 = 0.01;

/// Target size and ratio for shrinking `dims` so its longest side is at
/// most `max_size`.
///
/// Returns `None` when no shrinking is needed (`max_size == 0` disables
/// it).
#[must_use]
pub fn fit_within(dims: Dimensions, max_size: u32) -> Option<(Dimensions, f64)> {
    let long_axis = dims.width.max(dims.height);
    if max_size == 0 || long_axis <= max_size {
        return None;
    }
    let ratio = f64::from(max_size) / f64::from(long_axis);
    let scale = |side: u32| ((f64::from(side) * ratio).round() as u32).max(1);
    Some((Dimensions::new(scale(dims.width), scale(dims.height)), ratio))
}

/// Bring a binary mask to `width` x `height` with bilinear interpolation.
///
/// Interpolated values are thresholded at the mean of the ambiguous ones
/// (strictly between 0.01 and 0.99). With no ambiguous values any nonzero
/// value is on.
#[must_use]
pub fn upscale_binary(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        return crate::mask::normalized(mask);
    }
    if mask.width() == 0 || mask.height() == 0 {
        return GrayImage::new(width, height);
    }

    let unit: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(mask.width(), mask.height(), |x, y| {
            Luma([if crate::mask::is_on(mask.get_pixel(x, y)) {
                1.0
            } else {
                0.0
            }])
        });
    let grown = image::imageops::resize(
        &unit,
        width,
        height,
        image::imageops::FilterType::Triangle,
    );

    let (sum, count) = grown
        .pixels()
        .map(|p| p.0[0])
        .filter(|v| *v > SETTLED_MARGIN && *v < 1.0 - SETTLED_MARGIN)
        .fold((0.0_f64, 0_u64), |(s, c), v| (s + f64::from(v), c + 1));
    let threshold = if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    };

    GrayImage::from_fn(width, height, |x, y| {
        if grown.get_pixel(x, y).0[0] > threshold {
            ON
        } else {
            OFF
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn no_resize_when_already_small() {
        assert!(fit_within(Dimensions::new(100, 80), 256).is_none());
        assert!(fit_within(Dimensions::new(256, 200), 256).is_none());
    }

    #[test]
    fn zero_max_size_disables_resize() {
        assert!(fit_within(Dimensions::new(4000, 3000), 0).is_none());
    }

    #[test]
    fn landscape_keeps_aspect() {
        let (dims, ratio) = fit_within(Dimensions::new(1024, 768), 256).unwrap();
        assert_eq!(dims, Dimensions::new(256, 192));
        assert!((ratio - 0.25).abs() < 1e-12);
    }

    #[test]
    fn portrait_keeps_aspect() {
        let (dims, _) = fit_within(Dimensions::new(600, 1200), 256).unwrap();
        assert_eq!(dims, Dimensions::new(128, 256));
    }

    #[test]
    fn upscale_of_block_stays_roughly_in_place() {
        let mut small = GrayImage::new(10, 10);
        for y in 3..7 {
            for x in 3..7 {
                small.put_pixel(x, y, ON);
            }
        }
        let big = upscale_binary(&small, 40, 40);
        assert_eq!(big.dimensions(), (40, 40));
        assert!(crate::mask::is_on(big.get_pixel(20, 20)));
        assert!(!crate::mask::is_on(big.get_pixel(2, 2)));
        assert!(!crate::mask::is_on(big.get_pixel(37, 37)));
    }

    #[test]
    fn upscale_to_same_size_normalizes() {
        let mut m = GrayImage::new(3, 3);
        m.put_pixel(1, 1, Luma([9]));
        let out = upscale_binary(&m, 3, 3);
        assert_eq!(out.get_pixel(1, 1).0[0], 255);
    }
}
