//! Shared types for the s3a region-processing kernel.

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference masks
/// without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can hand the kernel a
/// working image without depending on `image` directly.
pub use image::RgbImage;

/// Per-pixel segment labels produced by segmentation stages.
pub type LabelImage = image::ImageBuffer<image::Luma<u32>, Vec<u32>>;

/// A 2D point in image coordinates.
///
/// `x` is the column and `y` the row; integer values sit on pixel centres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }

    /// The point translated by `(dx, dy)`.
    #[must_use]
    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    /// Nearest pixel `(column, row)`, or `None` when the point rounds to a
    /// negative coordinate.
    #[must_use]
    pub fn to_pixel(self) -> Option<(u32, u32)> {
        let x = self.x.round();
        let y = self.y.round();
        if x < 0.0 || y < 0.0 || !x.is_finite() || !y.is_finite() {
            return None;
        }
        Some((x as u32, y as u32))
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of an image buffer.
    #[must_use]
    pub fn of<P: image::Pixel, C>(image: &image::ImageBuffer<P, C>) -> Self
    where
        C: std::ops::Deref<Target = [P::Subpixel]>,
    {
        Self::new(image.width(), image.height())
    }

    /// The window covering the whole image.
    #[must_use]
    pub const fn full_bounds(self) -> Bounds {
        Bounds::new(0, 0, self.width, self.height)
    }

    /// Total number of pixels.
    #[must_use]
    pub const fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A half-open pixel window: columns `x0..x1`, rows `y0..y1`.
///
/// Stands in for the row/column slice pair that records where a cropped
/// sub-image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    /// First column (inclusive).
    pub x0: u32,
    /// First row (inclusive).
    pub y0: u32,
    /// Last column (exclusive).
    pub x1: u32,
    /// Last row (exclusive).
    pub y1: u32,
}

impl Bounds {
    /// Create a window. Reversed corners collapse to an empty window.
    #[must_use]
    pub const fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        let x1 = if x1 < x0 { x0 } else { x1 };
        let y1 = if y1 < y0 { y0 } else { y1 };
        Self { x0, y0, x1, y1 }
    }

    /// Window width in pixels.
    #[must_use]
    pub const fn width(self) -> u32 {
        self.x1 - self.x0
    }

    /// Window height in pixels.
    #[must_use]
    pub const fn height(self) -> u32 {
        self.y1 - self.y0
    }

    /// Size of the window.
    #[must_use]
    pub const fn dimensions(self) -> Dimensions {
        Dimensions::new(self.width(), self.height())
    }

    /// Whether the window covers no pixels.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.x0 == self.x1 || self.y0 == self.y1
    }

    /// Whether pixel `(x, y)` lies inside the window.
    #[must_use]
    pub const fn contains(self, x: u32, y: u32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// Clip the window so it lies within `dims`.
    #[must_use]
    pub fn clip_to(self, dims: Dimensions) -> Self {
        Self::new(
            self.x0.min(dims.width),
            self.y0.min(dims.height),
            self.x1.min(dims.width),
            self.y1.min(dims.height),
        )
    }
}
