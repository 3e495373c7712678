//! Regions made of several loops (`ComplexXYVertices`).

use geo::{Area, LineString, Polygon};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::geometry::{GeometryError, XYVertices, contour, raster, simplify};
use crate::types::{Bounds, Dimensions, Point};

/// Nesting information for one loop of a [`ComplexXYVertices`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    /// Index of the enclosing loop, if any.
    pub parent: Option<usize>,
    /// Whether the loop bounds a hole rather than an outer boundary.
    pub is_hole: bool,
}

impl Hierarchy {
    /// An outer boundary with no parent.
    pub const OUTER: Self = Self {
        parent: None,
        is_hole: false,
    };

    /// A hole inside loop `parent`.
    #[must_use]
    pub const fn hole_of(parent: usize) -> Self {
        Self {
            parent: Some(parent),
            is_hole: true,
        }
    }
}

/// A region possibly containing holes: a list of loops plus one
/// [`Hierarchy`] entry per loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplexXYVertices {
    loops: Vec<XYVertices>,
    hierarchy: Vec<Hierarchy>,
}

impl From<XYVertices> for ComplexXYVertices {
    fn from(vertices: XYVertices) -> Self {
        Self::new(vec![vertices])
    }
}

impl ComplexXYVertices {
    /// A region whose loops are all outer boundaries.
    #[must_use]
    pub fn new(loops: Vec<XYVertices>) -> Self {
        let hierarchy = vec![Hierarchy::OUTER; loops.len()];
        Self { loops, hierarchy }
    }

    /// A region with explicit nesting.
    ///
    /// # Errors
    ///
    /// Returns [`GeometryError::HierarchyMismatch`] if the lengths differ,
    /// or [`GeometryError::InvalidParent`] if a parent index is out of
    /// range or refers to the loop itself.
    pub fn with_hierarchy(
        loops: Vec<XYVertices>,
        hierarchy: Vec<Hierarchy>,
    ) -> Result<Self, GeometryError> {
        if loops.len() != hierarchy.len() {
            return Err(GeometryError::HierarchyMismatch {
                loops: loops.len(),
                hierarchy: hierarchy.len(),
            });
        }
        for (index, h) in hierarchy.iter().enumerate() {
            if let Some(parent) = h.parent
                && (parent >= loops.len() || parent == index)
            {
                return Err(GeometryError::InvalidParent { index, parent });
            }
        }
        Ok(Self { loops, hierarchy })
    }

    /// Used by the contour tracer, whose output is consistent by
    /// construction.
    pub(crate) const fn from_parts_unchecked(
        loops: Vec<XYVertices>,
        hierarchy: Vec<Hierarchy>,
    ) -> Self {
        Self { loops, hierarchy }
    }

    /// Trace the borders of a binary mask.
    #[must_use]
    pub fn from_binary_mask(mask: &GrayImage) -> Self {
        contour::trace_mask(mask)
    }

    /// All loops.
    #[must_use]
    pub fn loops(&self) -> &[XYVertices] {
        &self.loops
    }

    /// Nesting entries, parallel to [`loops`](Self::loops).
    #[must_use]
    pub fn hierarchy(&self) -> &[Hierarchy] {
        &self.hierarchy
    }

    /// Whether the region has no points at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.iter().all(XYVertices::is_empty)
    }

    /// Nesting depth of loop `index` (0 for top-level loops).
    #[must_use]
    pub fn depth(&self, index: usize) -> usize {
        let mut depth = 0;
        let mut current = self.hierarchy.get(index).and_then(|h| h.parent);
        while let Some(parent) = current {
            depth += 1;
            if depth > self.hierarchy.len() {
                break;
            }
            current = self.hierarchy.get(parent).and_then(|h| h.parent);
        }
        depth
    }

    /// Every point of every loop in one open list.
    #[must_use]
    pub fn stack(&self) -> XYVertices {
        XYVertices::open(
            self.loops
                .iter()
                .flat_map(|l| l.points().iter().copied())
                .collect(),
        )
    }

    /// Mean of all points, or `None` when empty.
    #[must_use]
    pub fn mean(&self) -> Option<Point> {
        self.stack().mean()
    }

    /// Pixel window covering every point, clipped to `dims`.
    #[must_use]
    pub fn bounds(&self, dims: Dimensions) -> Option<Bounds> {
        self.stack().bounds(dims)
    }

    /// Every loop translated by `(dx, dy)`.
    #[must_use]
    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            loops: self.loops.iter().map(|l| l.offset(dx, dy)).collect(),
            hierarchy: self.hierarchy.clone(),
        }
    }

    /// Every loop simplified with tolerance `epsilon`.
    #[must_use]
    pub fn simplify(&self, epsilon: f64) -> Self {
        Self {
            loops: self
                .loops
                .iter()
                .map(|l| simplify::simplify(l, epsilon))
                .collect(),
            hierarchy: self.hierarchy.clone(),
        }
    }

    /// Enclosed area in square pixels: outer loops add, holes subtract.
    #[must_use]
    pub fn area(&self) -> f64 {
        self.loops
            .iter()
            .zip(&self.hierarchy)
            .filter(|(l, _)| l.len() >= 3)
            .map(|(l, h)| {
                let ring: LineString<f64> =
                    l.points().iter().map(|p| (p.x, p.y)).collect::<Vec<_>>().into();
                let area = Polygon::new(ring, Vec::new()).unsigned_area();
                if h.is_hole { -area } else { area }
            })
            .sum()
    }

    /// Rasterize into a `width` x `height` binary mask.
    ///
    /// Loops are painted in ascending nesting depth: outer loops set their
    /// interior and boundary, holes clear their strict interior.
    #[must_use]
    pub fn to_mask(&self, width: u32, height: u32) -> GrayImage {
        let mut mask = GrayImage::new(width, height);
        self.paint_into(&mut mask);
        mask
    }

    /// Rasterize on top of an existing mask.
    pub fn paint_into(&self, mask: &mut GrayImage) {
        let mut order: Vec<usize> = (0..self.loops.len()).collect();
        order.sort_by_key(|&i| self.depth(i));
        for i in order {
            let vertices = &self.loops[i];
            if self.hierarchy[i].is_hole {
                raster::clear_hole(mask, vertices.points());
            } else {
                raster::fill_loop(mask, vertices.points(), vertices.connected(), raster::ON);
            }
        }
    }

    /// Split into one region per outer boundary, each carrying the holes
    /// that name it as parent.
    #[must_use]
    pub fn split_outer(&self) -> Vec<Self> {
        self.hierarchy
            .iter()
            .enumerate()
            .filter(|(i, h)| !h.is_hole && !self.loops[*i].is_empty())
            .map(|(outer, _)| {
                let mut loops = vec![self.loops[outer].clone()];
                let mut hierarchy = vec![Hierarchy::OUTER];
                for (j, h) in self.hierarchy.iter().enumerate() {
                    if h.is_hole && h.parent == Some(outer) {
                        loops.push(self.loops[j].clone());
                        hierarchy.push(Hierarchy::hole_of(0));
                    }
                }
                Self { loops, hierarchy }
            })
            .collect()
    }

    /// Loops and hierarchy, consumed.
    #[must_use]
    pub fn into_parts(self) -> (Vec<XYVertices>, Vec<Hierarchy>) {
        (self.loops, self.hierarchy)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, side: f64) -> XYVertices {
        XYVertices::from_pairs([
            (x0, y0),
            (x0 + side, y0),
            (x0 + side, y0 + side),
            (x0, y0 + side),
        ])
    }

    fn count_on(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] != 0).count()
    }

    #[test]
    fn hierarchy_length_is_checked() {
        let err = ComplexXYVertices::with_hierarchy(vec![square(0.0, 0.0, 4.0)], vec![]);
        assert!(matches!(
            err,
            Err(GeometryError::HierarchyMismatch {
                loops: 1,
                hierarchy: 0
            })
        ));
    }

    #[test]
    fn self_parent_is_rejected() {
        let err = ComplexXYVertices::with_hierarchy(
            vec![square(0.0, 0.0, 4.0)],
            vec![Hierarchy::hole_of(0)],
        );
        assert!(matches!(
            err,
            Err(GeometryError::InvalidParent {
                index: 0,
                parent: 0
            })
        ));
    }

    #[test]
    fn to_mask_of_square_with_hole() {
        let region = ComplexXYVertices::with_hierarchy(
            vec![square(0.0, 0.0, 9.0), square(3.0, 3.0, 3.0)],
            vec![Hierarchy::OUTER, Hierarchy::hole_of(0)],
        )
        .unwrap();
        let mask = region.to_mask(10, 10);
        assert_eq!(count_on(&mask), 100 - 4);
        assert_eq!(mask.get_pixel(4, 4).0[0], 0);
        assert_eq!(mask.get_pixel(3, 3).0[0], 255);
    }

    #[test]
    fn area_subtracts_holes() {
        let region = ComplexXYVertices::with_hierarchy(
            vec![square(0.0, 0.0, 10.0), square(2.0, 2.0, 4.0)],
            vec![Hierarchy::OUTER, Hierarchy::hole_of(0)],
        )
        .unwrap();
        assert!((region.area() - 84.0).abs() < 1e-9);
    }

    #[test]
    fn mask_round_trip_with_hole_and_island() {
        let mut mask = GrayImage::new(30, 30);
        for y in 2..28 {
            for x in 2..28 {
                mask.put_pixel(x, y, raster::ON);
            }
        }
        for y in 8..22 {
            for x in 8..22 {
                mask.put_pixel(x, y, raster::OFF);
            }
        }
        for y in 12..17 {
            for x in 12..17 {
                mask.put_pixel(x, y, raster::ON);
            }
        }
        let region = ComplexXYVertices::from_binary_mask(&mask);
        assert_eq!(region.loops().len(), 3);
        assert_eq!(region.to_mask(30, 30), mask);
    }

    #[test]
    fn split_outer_keeps_holes_with_their_parent() {
        let region = ComplexXYVertices::with_hierarchy(
            vec![
                square(0.0, 0.0, 10.0),
                square(20.0, 0.0, 5.0),
                square(2.0, 2.0, 3.0),
            ],
            vec![Hierarchy::OUTER, Hierarchy::OUTER, Hierarchy::hole_of(0)],
        )
        .unwrap();
        let parts = region.split_outer();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].loops().len(), 2);
        assert_eq!(parts[0].hierarchy()[1], Hierarchy::hole_of(0));
        assert_eq!(parts[1].loops().len(), 1);
    }

    #[test]
    fn empty_region_produces_empty_mask() {
        let region = ComplexXYVertices::default();
        assert!(region.is_empty());
        assert_eq!(count_on(&region.to_mask(5, 5)), 0);
        assert!(region.bounds(Dimensions::new(5, 5)).is_none());
        assert!((region.area()).abs() < f64::EPSILON);
    }

    #[test]
    fn depth_follows_parent_chain() {
        let region = ComplexXYVertices::with_hierarchy(
            vec![
                square(0.0, 0.0, 10.0),
                square(2.0, 2.0, 6.0),
                square(4.0, 4.0, 2.0),
            ],
            vec![
                Hierarchy::OUTER,
                Hierarchy::hole_of(0),
                Hierarchy {
                    parent: Some(1),
                    is_hole: false,
                },
            ],
        )
        .unwrap();
        assert_eq!(region.depth(0), 0);
        assert_eq!(region.depth(1), 1);
        assert_eq!(region.depth(2), 2);
    }
}
