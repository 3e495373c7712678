//! Boundary extraction from binary masks.
//!
//! Wraps Suzuki-Abe border following (`imageproc::contours::find_contours`)
//! and keeps the parent/hole relationships it reports, so a mask with holes
//! comes back as one [`ComplexXYVertices`] that rasterizes to the same
//! pixels.

use image::GrayImage;
use imageproc::contours::{BorderType, Contour, find_contours};

use crate::geometry::{ComplexXYVertices, Hierarchy, XYVertices};
use crate::types::Point;

/// Trace every border in `mask` (nonzero pixels are foreground).
///
/// Loops come back in discovery order, which places each outer border
/// before the holes it contains. Single-pixel regions produce one-point
/// loops.
#[must_use]
pub fn trace_mask(mask: &GrayImage) -> ComplexXYVertices {
    let contours: Vec<Contour<i32>> = find_contours(mask);
    let mut loops = Vec::with_capacity(contours.len());
    let mut hierarchy = Vec::with_capacity(contours.len());
    for contour in contours {
        let points = contour
            .points
            .iter()
            .map(|p| Point::new(f64::from(p.x), f64::from(p.y)))
            .collect();
        loops.push(XYVertices::new(points));
        hierarchy.push(Hierarchy {
            parent: contour.parent,
            is_hole: contour.border_type == BorderType::Hole,
        });
    }
    ComplexXYVertices::from_parts_unchecked(loops, hierarchy)
}
