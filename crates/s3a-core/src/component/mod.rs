//! Annotated regions and the table that holds them.
//!
//! Every editing operation returns a [`TableChange`] describing exactly what
//! it removed and added. Applying or reverting a change replays it without
//! recomputing anything, which is what the [`history`] wrappers record.

pub mod history;
pub mod io;

use std::collections::BTreeMap;
use std::fmt;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::geometry::{ComplexXYVertices, GeometryError};
use crate::mask;

/// Identifier of a component, unique within a [`ComponentTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of a free-form component field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A flag.
    Bool(bool),
    /// A whole number.
    Int(i64),
    /// A real number.
    Float(f64),
    /// Text.
    Text(String),
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// One annotated region.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Identifier; assigned by the table on [`ComponentTable::add`].
    pub id: InstanceId,
    /// Region outline, possibly with holes.
    pub vertices: ComplexXYVertices,
    /// Image the region was drawn on.
    pub image_file: Option<String>,
    /// User-defined fields.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Component {
    /// A component with no fields and a placeholder ID.
    #[must_use]
    pub fn new(vertices: ComplexXYVertices) -> Self {
        Self {
            id: InstanceId(0),
            vertices,
            image_file: None,
            fields: BTreeMap::new(),
        }
    }

    /// Set the ID.
    #[must_use]
    pub const fn with_id(mut self, id: InstanceId) -> Self {
        self.id = id;
        self
    }

    /// Set a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set the image file.
    #[must_use]
    pub fn with_image_file(mut self, file: impl Into<String>) -> Self {
        self.image_file = Some(file.into());
        self
    }
}

/// Errors from component edits and import/export.
#[derive(Debug, thiserror::Error)]
pub enum ComponentError {
    /// No component has this ID.
    #[error("no component with ID {0}")]
    UnknownId(InstanceId),

    /// The operation needs more components than were given.
    #[error("{operation} needs at least {needed} components, got {found}")]
    TooFewComponents {
        /// What was attempted.
        operation: &'static str,
        /// Minimum count.
        needed: usize,
        /// Count given.
        found: usize,
    },

    /// A new region is below the minimum area.
    #[error("region area {area:.1} is below the minimum of {min_area:.1}")]
    TooSmall {
        /// Area of the region.
        area: f64,
        /// Required minimum.
        min_area: f64,
    },

    /// Invalid vertex data.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// An imported row could not be understood.
    #[error("row {row}: {message}")]
    InvalidRow {
        /// Zero-based row index.
        row: usize,
        /// What was wrong.
        message: String,
    },

    /// The regions are too far apart to rasterize together.
    #[error("regions span a {width}x{height} area, more than {limit} pixels")]
    CanvasTooLarge {
        /// Canvas width in pixels.
        width: f64,
        /// Canvas height in pixels.
        height: f64,
        /// Largest allowed pixel count.
        limit: u64,
    },

    /// Import data is not valid JSON.
    #[error("invalid component JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a component file failed.
    #[error("failed to access {}: {source}", path.display())]
    Io {
        /// The file.
        path: std::path::PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// What an edit removed and what it put in place.
///
/// A component whose vertices changed appears in both lists under the same
/// ID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableChange {
    /// Components as they were before the edit.
    pub removed: Vec<Component>,
    /// Components as they are after the edit.
    pub added: Vec<Component>,
}

impl TableChange {
    /// Whether the edit did nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// IDs of the added components, in order.
    #[must_use]
    pub fn added_ids(&self) -> Vec<InstanceId> {
        self.added.iter().map(|c| c.id).collect()
    }
}

/// Components by ID, with a monotonic ID counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTable {
    components: BTreeMap<InstanceId, Component>,
    next_id: u64,
}

impl ComponentTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Component with `id`.
    #[must_use]
    pub fn get(&self, id: InstanceId) -> Option<&Component> {
        self.components.get(&id)
    }

    /// Components in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    /// The ID the next [`add`](Self::add) will assign.
    #[must_use]
    pub const fn next_id(&self) -> InstanceId {
        InstanceId(self.next_id)
    }

    fn insert(&mut self, component: Component) {
        self.next_id = self.next_id.max(component.id.0.saturating_add(1));
        self.components.insert(component.id, component);
    }

    fn require(&self, ids: &[InstanceId]) -> Result<(), ComponentError> {
        match ids.iter().find(|id| !self.components.contains_key(id)) {
            Some(&id) => Err(ComponentError::UnknownId(id)),
            None => Ok(()),
        }
    }

    /// Add `components` under fresh IDs.
    pub fn add(&mut self, components: Vec<Component>) -> TableChange {
        let mut added = Vec::with_capacity(components.len());
        for component in components {
            let component = component.with_id(InstanceId(self.next_id));
            self.insert(component.clone());
            added.push(component);
        }
        TableChange {
            removed: Vec::new(),
            added,
        }
    }

    /// Add `components` keeping their IDs; existing components with the
    /// same ID are replaced.
    pub fn add_with_ids(&mut self, components: Vec<Component>) -> TableChange {
        let mut change = TableChange::default();
        for component in components {
            if let Some(old) = self.components.remove(&component.id) {
                change.removed.push(old);
            }
            self.insert(component.clone());
            change.added.push(component);
        }
        change
    }

    /// Remove the components with `ids`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownId`] and removes nothing if any ID
    /// is missing.
    pub fn remove(&mut self, ids: &[InstanceId]) -> Result<TableChange, ComponentError> {
        self.require(ids)?;
        let removed = ids.iter().filter_map(|id| self.components.remove(id)).collect();
        Ok(TableChange {
            removed,
            added: Vec::new(),
        })
    }

    /// Replace the vertices of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownId`] if there is no such component.
    pub fn update_vertices(
        &mut self,
        id: InstanceId,
        vertices: ComplexXYVertices,
    ) -> Result<TableChange, ComponentError> {
        let component = self.components.get_mut(&id).ok_or(ComponentError::UnknownId(id))?;
        let before = component.clone();
        component.vertices = vertices;
        Ok(TableChange {
            removed: vec![before],
            added: vec![component.clone()],
        })
    }

    /// Remove every component. The ID counter keeps counting.
    pub fn clear(&mut self) -> TableChange {
        let removed = std::mem::take(&mut self.components).into_values().collect();
        TableChange {
            removed,
            added: Vec::new(),
        }
    }

    /// Replay `change`: drop what it removed, put back what it added.
    pub fn apply_change(&mut self, change: &TableChange) {
        for component in &change.removed {
            self.components.remove(&component.id);
        }
        for component in &change.added {
            self.insert(component.clone());
        }
    }

    /// Reverse `change`.
    pub fn revert_change(&mut self, change: &TableChange) {
        for component in &change.added {
            self.components.remove(&component.id);
        }
        for component in &change.removed {
            self.insert(component.clone());
        }
    }

    /// Union the regions of `ids` into one component.
    ///
    /// The result keeps the ID and fields of `keep` (default: the first
    /// ID); the others are removed.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::TooFewComponents`] for fewer than two
    /// distinct IDs and [`ComponentError::UnknownId`] for a missing ID or a
    /// `keep` that is not among `ids`.
    pub fn merge(
        &mut self,
        ids: &[InstanceId],
        keep: Option<InstanceId>,
    ) -> Result<TableChange, ComponentError> {
        let mut unique: Vec<InstanceId> = Vec::with_capacity(ids.len());
        for &id in ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        let ids = unique.as_slice();
        if ids.len() < 2 {
            return Err(ComponentError::TooFewComponents {
                operation: "merge",
                needed: 2,
                found: ids.len(),
            });
        }
        self.require(ids)?;
        let keep = keep.unwrap_or(ids[0]);
        if !ids.contains(&keep) {
            return Err(ComponentError::UnknownId(keep));
        }
        let sources: Vec<Component> = ids.iter().filter_map(|id| self.components.get(id).cloned()).collect();
        let Some(canvas) = Canvas::covering(sources.iter().map(|c| &c.vertices))? else {
            return Ok(TableChange::default());
        };
        let mut union = GrayImage::new(canvas.width, canvas.height);
        for source in &sources {
            canvas.paint(&source.vertices, &mut union);
        }
        let mut merged = self.components.get(&keep).cloned().ok_or(ComponentError::UnknownId(keep))?;
        merged.vertices = canvas.trace(&union);
        let change = TableChange {
            removed: sources,
            added: vec![merged],
        };
        self.apply_change(&change);
        tracing::debug!(?ids, %keep, "merged components");
        Ok(change)
    }

    /// Split `id` into one component per outer boundary.
    ///
    /// Parts get fresh IDs and copy the original's fields. A component with
    /// a single outer boundary is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::UnknownId`] if there is no such component.
    pub fn split(&mut self, id: InstanceId) -> Result<TableChange, ComponentError> {
        let original = self.components.get(&id).cloned().ok_or(ComponentError::UnknownId(id))?;
        let parts = original.vertices.split_outer();
        if parts.len() < 2 {
            return Ok(TableChange::default());
        }
        let mut next = self.next_id;
        let added = parts
            .into_iter()
            .map(|vertices| {
                let part = Component {
                    id: InstanceId(next),
                    vertices,
                    ..original.clone()
                };
                next += 1;
                part
            })
            .collect();
        let change = TableChange {
            removed: vec![original],
            added,
        };
        self.apply_change(&change);
        Ok(change)
    }

    /// Make the regions of `ids` disjoint: each component loses the pixels
    /// of the components before it in `ids`. Components left empty are
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::TooFewComponents`] for fewer than two IDs
    /// and [`ComponentError::UnknownId`] for a missing ID.
    pub fn remove_overlap(&mut self, ids: &[InstanceId]) -> Result<TableChange, ComponentError> {
        if ids.len() < 2 {
            return Err(ComponentError::TooFewComponents {
                operation: "remove_overlap",
                needed: 2,
                found: ids.len(),
            });
        }
        self.require(ids)?;
        let sources: Vec<Component> = ids.iter().filter_map(|id| self.components.get(id).cloned()).collect();
        let Some(canvas) = Canvas::covering(sources.iter().map(|c| &c.vertices))? else {
            return Ok(TableChange::default());
        };
        let mut covered = GrayImage::new(canvas.width, canvas.height);
        let mut change = TableChange::default();
        for source in sources {
            let own = canvas.rasterize(&source.vertices);
            let remaining = mask::and_not(&own, &covered);
            if mask::count_on(&remaining) != mask::count_on(&own) {
                let trimmed = canvas.trace(&remaining);
                if !trimmed.is_empty() {
                    change.added.push(Component {
                        vertices: trimmed,
                        ..source.clone()
                    });
                }
                change.removed.push(source);
            }
            covered = mask::or(&covered, &own);
        }
        self.apply_change(&change);
        Ok(change)
    }

    /// Add a component drawn as `roi`, simplified with `epsilon`.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::TooSmall`] if the enclosed area is below
    /// `min_area`.
    pub fn create_from_roi(
        &mut self,
        roi: &ComplexXYVertices,
        min_area: f64,
        epsilon: f64,
    ) -> Result<TableChange, ComponentError> {
        let area = roi.area();
        if area < min_area || roi.is_empty() {
            return Err(ComponentError::TooSmall { area, min_area });
        }
        Ok(self.add(vec![Component::new(roi.simplify(epsilon))]))
    }
}

/// A mask covering some regions with a one-pixel margin.
struct Canvas {
    dx: f64,
    dy: f64,
    width: u32,
    height: u32,
}

impl Canvas {
    /// Largest canvas, in pixels, merge and overlap removal will allocate.
    const MAX_PIXELS: u64 = 1 << 28;

    /// `None` when no region has any points.
    ///
    /// # Errors
    ///
    /// Returns [`ComponentError::CanvasTooLarge`] when the regions span more
    /// than [`Self::MAX_PIXELS`].
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn covering<'a>(
        regions: impl IntoIterator<Item = &'a ComplexXYVertices>,
    ) -> Result<Option<Self>, ComponentError> {
        let extents: Vec<_> = regions.into_iter().filter_map(|r| r.stack().extent()).collect();
        let (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) = (
            extents.iter().map(|(lo, _)| lo.x).reduce(f64::min),
            extents.iter().map(|(lo, _)| lo.y).reduce(f64::min),
            extents.iter().map(|(_, hi)| hi.x).reduce(f64::max),
            extents.iter().map(|(_, hi)| hi.y).reduce(f64::max),
        ) else {
            return Ok(None);
        };
        let dx = 1.0 - min_x.floor();
        let dy = 1.0 - min_y.floor();
        let width = (max_x + dx).ceil() + 2.0;
        let height = (max_y + dy).ceil() + 2.0;
        let fits = width * height <= Self::MAX_PIXELS as f64;
        if !fits {
            return Err(ComponentError::CanvasTooLarge {
                width,
                height,
                limit: Self::MAX_PIXELS,
            });
        }
        Ok(Some(Self {
            dx,
            dy,
            width: width as u32,
            height: height as u32,
        }))
    }

    fn paint(&self, vertices: &ComplexXYVertices, target: &mut GrayImage) {
        vertices.offset(self.dx, self.dy).paint_into(target);
    }

    fn rasterize(&self, vertices: &ComplexXYVertices) -> GrayImage {
        vertices.offset(self.dx, self.dy).to_mask(self.width, self.height)
    }

    fn trace(&self, mask: &GrayImage) -> ComplexXYVertices {
        ComplexXYVertices::from_binary_mask(mask).offset(-self.dx, -self.dy)
    }
}
