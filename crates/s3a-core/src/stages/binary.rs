//! Stages that act on the current binary mask.

use std::collections::HashSet;

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::geometry::raster::{OFF, ON};
use crate::geometry::{ComplexXYVertices, GeometryError};
use crate::mask;
use crate::stages::{StageError, StageIo};
use crate::types::LabelImage;

/// Morphological operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphOp {
    /// Erode then dilate: removes specks.
    Open,
    /// Dilate then erode: closes gaps.
    Close,
    /// Grow the mask.
    Dilate,
    /// Shrink the mask.
    Erode,
}

/// Structuring element shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphShape {
    /// Square of side `2 * radius + 1`.
    #[default]
    Rectangle,
    /// Euclidean disk.
    Disk,
    /// City-block diamond.
    Diamond,
}

impl MorphShape {
    const fn norm(self) -> Norm {
        match self {
            Self::Rectangle => Norm::LInf,
            Self::Disk => Norm::L2,
            Self::Diamond => Norm::L1,
        }
    }
}

/// Hyperparameters for [`Operation::Morphology`](crate::stages::Operation::Morphology).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MorphologyParams {
    /// Which operation.
    pub op: MorphOp,
    /// Structuring element radius in pixels.
    #[serde(default = "default_radius")]
    pub radius: u32,
    /// Structuring element shape.
    #[serde(default)]
    pub shape: MorphShape,
}

const fn default_radius() -> u32 {
    1
}

impl MorphologyParams {
    /// Preset "Opening" stage.
    pub const OPENING: Self = Self {
        op: MorphOp::Open,
        radius: 1,
        shape: MorphShape::Rectangle,
    };

    /// Preset "Closing" stage.
    pub const CLOSING: Self = Self {
        op: MorphOp::Close,
        radius: 1,
        shape: MorphShape::Rectangle,
    };
}

/// Hyperparameters for [`Operation::RemoveSmallComponents`](crate::stages::Operation::RemoveSmallComponents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveSmallParams {
    /// Components with fewer pixels are removed.
    pub size_threshold: u64,
}

impl RemoveSmallParams {
    /// Default minimum component size.
    pub const DEFAULT_SIZE_THRESHOLD: u64 = 30;
}

impl Default for RemoveSmallParams {
    fn default() -> Self {
        Self {
            size_threshold: Self::DEFAULT_SIZE_THRESHOLD,
        }
    }
}

pub(super) fn morphology(io: &mut StageIo, params: &MorphologyParams) -> Result<(), StageError> {
    let input = mask::normalized(&io.binary_input("morphology")?);
    let k = u8::try_from(params.radius).unwrap_or(u8::MAX);
    let norm = params.shape.norm();
    let out = match params.op {
        MorphOp::Open => imageproc::morphology::open(&input, norm, k),
        MorphOp::Close => imageproc::morphology::close(&input, norm, k),
        MorphOp::Dilate => imageproc::morphology::dilate(&input, norm, k),
        MorphOp::Erode => imageproc::morphology::erode(&input, norm, k),
    };
    io.mask = Some(out);
    Ok(())
}

pub(super) fn fill_holes(io: &mut StageIo) -> Result<(), StageError> {
    let input = mask::normalized(&io.binary_input("fill_holes")?);
    let (w, h) = input.dimensions();
    if w == 0 || h == 0 {
        io.mask = Some(input);
        return Ok(());
    }
    // 4-connected background regions touching the border are outside;
    // every other background region is a hole.
    let labels = connected_components(&mask::invert(&input), Connectivity::Four, Luma([0u8]));
    let mut outside = HashSet::new();
    for x in 0..w {
        outside.insert(labels.get_pixel(x, 0).0[0]);
        outside.insert(labels.get_pixel(x, h.saturating_sub(1)).0[0]);
    }
    for y in 0..h {
        outside.insert(labels.get_pixel(0, y).0[0]);
        outside.insert(labels.get_pixel(w.saturating_sub(1), y).0[0]);
    }
    outside.remove(&0);
    io.mask = Some(GrayImage::from_fn(w, h, |x, y| {
        if outside.contains(&labels.get_pixel(x, y).0[0]) { OFF } else { ON }
    }));
    Ok(())
}

/// 8-connected labels and per-label pixel counts (index 0 is background).
fn label_components(input: &GrayImage) -> (LabelImage, Vec<u64>) {
    let labels = connected_components(input, Connectivity::Eight, Luma([0u8]));
    let max = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    let mut areas = vec![0_u64; max as usize + 1];
    for p in labels.pixels() {
        areas[p.0[0] as usize] += 1;
    }
    (labels, areas)
}

fn keep_labels(labels: &LabelImage, keep: impl Fn(u32) -> bool) -> GrayImage {
    GrayImage::from_fn(labels.width(), labels.height(), |x, y| {
        let label = labels.get_pixel(x, y).0[0];
        if label != 0 && keep(label) { ON } else { OFF }
    })
}

pub(super) fn keep_largest_component(io: &mut StageIo) -> Result<(), StageError> {
    let input = mask::normalized(&io.binary_input("keep_largest_component")?);
    if mask::count_on(&input) == 0 {
        io.mask = Some(input);
        return Ok(());
    }
    let (labels, areas) = label_components(&input);
    let largest = areas
        .iter()
        .enumerate()
        .skip(1)
        .fold((0, 0), |best, (label, &area)| {
            if area > best.1 { (label, area) } else { best }
        })
        .0 as u32;
    io.mask = Some(keep_labels(&labels, |l| l == largest));
    Ok(())
}

pub(super) fn remove_small_components(
    io: &mut StageIo,
    params: &RemoveSmallParams,
) -> Result<(), StageError> {
    let input = mask::normalized(&io.binary_input("remove_small_components")?);
    let (labels, areas) = label_components(&input);
    io.mask = Some(keep_labels(&labels, |l| {
        areas.get(l as usize).is_some_and(|&a| a >= params.size_threshold)
    }));
    Ok(())
}

pub(super) fn draw_vertices(io: &mut StageIo) -> Result<(), StageError> {
    let dims = io.image_dims("draw_vertices")?;
    let out = if io.foreground_vertices.is_empty() {
        GrayImage::new(dims.width, dims.height)
    } else {
        ComplexXYVertices::from(io.foreground_vertices.clone()).to_mask(dims.width, dims.height)
    };
    io.mask = Some(out);
    Ok(())
}

pub(super) fn convert_to_squares(io: &mut StageIo) -> Result<(), StageError> {
    let input = mask::normalized(&io.binary_input("convert_to_squares")?);
    let (labels, areas) = label_components(&input);
    let mut boxes: Vec<Option<(u32, u32, u32, u32)>> = vec![None; areas.len()];
    for (x, y, p) in labels.enumerate_pixels() {
        let label = p.0[0] as usize;
        if label == 0 {
            continue;
        }
        boxes[label] = Some(match boxes[label] {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    let mut out = GrayImage::new(input.width(), input.height());
    for (x0, y0, x1, y1) in boxes.into_iter().flatten() {
        for y in y0..=y1 {
            for x in x0..=x1 {
                out.put_pixel(x, y, ON);
            }
        }
    }
    io.mask = Some(out);
    Ok(())
}

pub(super) fn disallow_paint_tool(io: &mut StageIo) -> Result<(), StageError> {
    let found = io.foreground_vertices.len() + io.background_vertices.len();
    if found < 2 {
        return Err(GeometryError::TooFewVertices {
            operation: "this algorithm (an enclosed area is required)",
            needed: 2,
            found,
        }
        .into());
    }
    Ok(())
}
