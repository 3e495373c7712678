//! Binary masks and the per-pixel history mask.
//!
//! Masks are `GrayImage`s where 0 is off and any nonzero value reads as on;
//! helpers write 255 for on pixels.

use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::geometry::raster::{OFF, ON};
use crate::types::{Bounds, Dimensions};

/// User intent recorded for a pixel in the history mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum HistoryValue {
    /// No user input.
    #[default]
    Unspecified = 0,
    /// Marked as background.
    Background = 1,
    /// Marked as foreground.
    Foreground = 2,
}

impl HistoryValue {
    /// Pixel value stored in the history mask.
    #[must_use]
    pub const fn luma(self) -> Luma<u8> {
        Luma([self as u8])
    }

    /// Decode a history-mask pixel; unknown values read as unspecified.
    #[must_use]
    pub const fn from_pixel(value: u8) -> Self {
        match value {
            1 => Self::Background,
            2 => Self::Foreground,
            _ => Self::Unspecified,
        }
    }

    /// Swap foreground and background.
    #[must_use]
    pub const fn swapped(self) -> Self {
        match self {
            Self::Background => Self::Foreground,
            Self::Foreground => Self::Background,
            Self::Unspecified => Self::Unspecified,
        }
    }
}

/// Whether a mask pixel is on.
#[must_use]
pub const fn is_on(pixel: &Luma<u8>) -> bool {
    pixel.0[0] != 0
}

/// Number of on pixels.
#[must_use]
pub fn count_on(mask: &GrayImage) -> u64 {
    mask.pixels().filter(|p| is_on(p)).count() as u64
}

/// Copy of `mask` with every pixel normalized to 0 or 255.
#[must_use]
pub fn normalized(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if is_on(mask.get_pixel(x, y)) { ON } else { OFF }
    })
}

/// On pixels become off and vice versa.
#[must_use]
pub fn invert(mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
        if is_on(mask.get_pixel(x, y)) { OFF } else { ON }
    })
}

/// Pixel-wise combination of two same-sized masks; pixels outside the
/// smaller one read as off.
fn combine(a: &GrayImage, b: &GrayImage, op: impl Fn(bool, bool) -> bool) -> GrayImage {
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        let lhs = is_on(a.get_pixel(x, y));
        let rhs = b.get_pixel_checked(x, y).is_some_and(is_on);
        if op(lhs, rhs) { ON } else { OFF }
    })
}

/// `a | b`, sized like `a`.
#[must_use]
pub fn or(a: &GrayImage, b: &GrayImage) -> GrayImage {
    combine(a, b, |l, r| l || r)
}

/// `a & !b`, sized like `a`.
#[must_use]
pub fn and_not(a: &GrayImage, b: &GrayImage) -> GrayImage {
    combine(a, b, |l, r| l && !r)
}

/// Copy of the pixels inside `bounds` (clipped to the image).
#[must_use]
pub fn crop<P>(
    image: &image::ImageBuffer<P, Vec<P::Subpixel>>,
    bounds: Bounds,
) -> image::ImageBuffer<P, Vec<P::Subpixel>>
where
    P: image::Pixel + 'static,
{
    let b = bounds.clip_to(Dimensions::of(image));
    image::imageops::crop_imm(image, b.x0, b.y0, b.width(), b.height()).to_image()
}

/// Write `patch` into `target` with its top-left corner at `(x0, y0)`,
/// dropping whatever falls outside.
pub fn paste(target: &mut GrayImage, patch: &GrayImage, x0: u32, y0: u32) {
    image::imageops::replace(target, patch, i64::from(x0), i64::from(y0));
}

/// Tight half-open window around the on pixels, or `None` when empty.
#[must_use]
pub fn nonzero_bounds(mask: &GrayImage) -> Option<Bounds> {
    let mut found: Option<Bounds> = None;
    for (x, y, p) in mask.enumerate_pixels() {
        if !is_on(p) {
            continue;
        }
        found = Some(match found {
            None => Bounds::new(x, y, x + 1, y + 1),
            Some(b) => Bounds::new(
                b.x0.min(x),
                b.y0.min(y),
                b.x1.max(x + 1),
                b.y1.max(y + 1),
            ),
        });
    }
    found
}

/// Resize with nearest-neighbour sampling.
#[must_use]
pub fn resize_nearest<P>(
    image: &image::ImageBuffer<P, Vec<P::Subpixel>>,
    width: u32,
    height: u32,
) -> image::ImageBuffer<P, Vec<P::Subpixel>>
where
    P: image::Pixel + 'static,
{
    if Dimensions::of(image) == Dimensions::new(width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, image::imageops::FilterType::Nearest)
}

/// Colour-coded difference between an old and a new mask.
///
/// Pixels only in `old` are red, pixels only in `new` green, pixels in both
/// white, and pixels in neither black.
#[must_use]
pub fn diff_visualization(old: &GrayImage, new: &GrayImage) -> RgbImage {
    RgbImage::from_fn(new.width(), new.height(), |x, y| {
        let before = old.get_pixel_checked(x, y).is_some_and(is_on);
        let after = is_on(new.get_pixel(x, y));
        match (before, after) {
            (true, true) => Rgb([255, 255, 255]),
            (true, false) => Rgb([255, 0, 0]),
            (false, true) => Rgb([0, 255, 0]),
            (false, false) => Rgb([0, 0, 0]),
        }
    })
}

/// Grey-level copy of a mask as an RGB image, on pixels white.
#[must_use]
pub fn to_rgb(mask: &GrayImage) -> RgbImage {
    RgbImage::from_fn(mask.width(), mask.height(), |x, y| {
        if is_on(mask.get_pixel(x, y)) {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// Luminance of an RGB image, used when a binary stage runs before any
/// mask exists.
#[must_use]
pub fn luminance(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mask_from(rows: &[&str]) -> GrayImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        GrayImage::from_fn(w, h, |x, y| {
            if rows[y as usize].as_bytes()[x as usize] == b'#' {
                ON
            } else {
                OFF
            }
        })
    }

    #[test]
    fn history_values_match_stored_bytes() {
        assert_eq!(HistoryValue::Unspecified.luma(), Luma([0]));
        assert_eq!(HistoryValue::Background.luma(), Luma([1]));
        assert_eq!(HistoryValue::Foreground.luma(), Luma([2]));
        assert_eq!(HistoryValue::from_pixel(2), HistoryValue::Foreground);
        assert_eq!(HistoryValue::from_pixel(200), HistoryValue::Unspecified);
        assert_eq!(
            HistoryValue::Foreground.swapped(),
            HistoryValue::Background
        );
    }

    #[test]
    fn nonzero_bounds_is_tight() {
        let m = mask_from(&["....", ".#..", "..#.", "...."]);
        assert_eq!(nonzero_bounds(&m), Some(Bounds::new(1, 1, 3, 3)));
        assert_eq!(nonzero_bounds(&GrayImage::new(3, 3)), None);
    }

    #[test]
    fn or_and_not() {
        let a = mask_from(&["##..", "...."]);
        let b = mask_from(&[".##.", "...."]);
        assert_eq!(count_on(&or(&a, &b)), 3);
        let diff = and_not(&a, &b);
        assert_eq!(count_on(&diff), 1);
        assert!(is_on(diff.get_pixel(0, 0)));
    }

    #[test]
    fn crop_then_paste_restores() {
        let m = mask_from(&["#...", ".##.", "..#.", "...#"]);
        let window = Bounds::new(1, 1, 3, 3);
        let patch = crop(&m, window);
        assert_eq!(patch.dimensions(), (2, 2));
        let mut target = GrayImage::new(4, 4);
        paste(&mut target, &patch, 1, 1);
        assert_eq!(count_on(&target), 3);
    }

    #[test]
    fn diff_colours() {
        let old = mask_from(&["##.."]);
        let new = mask_from(&[".##."]);
        let vis = diff_visualization(&old, &new);
        assert_eq!(*vis.get_pixel(0, 0), Rgb([255, 0, 0]));
        assert_eq!(*vis.get_pixel(1, 0), Rgb([255, 255, 255]));
        assert_eq!(*vis.get_pixel(2, 0), Rgb([0, 255, 0]));
        assert_eq!(*vis.get_pixel(3, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn invert_and_normalize() {
        let mut m = GrayImage::new(2, 1);
        m.put_pixel(0, 0, Luma([7]));
        assert_eq!(normalized(&m).get_pixel(0, 0).0[0], 255);
        let inv = invert(&m);
        assert_eq!(inv.get_pixel(0, 0).0[0], 0);
        assert_eq!(inv.get_pixel(1, 0).0[0], 255);
    }
}
