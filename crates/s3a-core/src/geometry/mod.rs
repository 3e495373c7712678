//! Vertex geometry: point lists, regions with holes, rasterization and
//! boundary extraction.

mod complex;
mod contour;
pub mod raster;
mod simplify;
mod vertices;

pub use complex::{ComplexXYVertices, Hierarchy};
pub use simplify::simplify;
pub use vertices::XYVertices;

use crate::component::InstanceId;
use crate::types::Dimensions;

/// Errors from invalid vertex input.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    /// An operation needed more vertices than were supplied.
    #[error("{operation} needs at least {needed} vertices, got {found}")]
    TooFewVertices {
        /// What was attempted.
        operation: &'static str,
        /// Minimum vertex count.
        needed: usize,
        /// Vertices actually supplied.
        found: usize,
    },

    /// Loop and hierarchy lists differ in length.
    #[error("{loops} loops but {hierarchy} hierarchy entries")]
    HierarchyMismatch {
        /// Number of loops.
        loops: usize,
        /// Number of hierarchy entries.
        hierarchy: usize,
    },

    /// A hierarchy entry names a parent that does not exist.
    #[error("loop {index} has invalid parent {parent}")]
    InvalidParent {
        /// The offending loop.
        index: usize,
        /// The parent it names.
        parent: usize,
    },

    /// A serialized vertex string could not be parsed.
    #[error("malformed vertex string: {0}")]
    Malformed(String),
}

/// Find components whose vertices fall outside a `dims`-sized image.
///
/// Offending IDs are logged at `warn` level and returned; this never fails.
pub fn check_vertices_bounds<'a, I>(components: I, dims: Dimensions) -> Vec<InstanceId>
where
    I: IntoIterator<Item = (InstanceId, &'a ComplexXYVertices)>,
{
    let max_x = f64::from(dims.width);
    let max_y = f64::from(dims.height);
    let offending: Vec<InstanceId> = components
        .into_iter()
        .filter(|(_, vertices)| {
            vertices.loops().iter().any(|l| {
                l.points()
                    .iter()
                    .any(|p| p.x < 0.0 || p.y < 0.0 || p.x >= max_x || p.y >= max_y)
            })
        })
        .map(|(id, _)| id)
        .collect();
    if !offending.is_empty() {
        tracing::warn!(
            ids = ?offending,
            width = dims.width,
            height = dims.height,
            "component vertices exceed image bounds"
        );
    }
    offending
}
