//! Pipeline stages and the typed bag they pass along.
//!
//! Every stage reads the [`StageIo`] fields it needs and writes the ones it
//! produces; all other fields pass through untouched. Stages are selected
//! by the [`Operation`] enum, whose variants carry each stage's
//! hyperparameters.

mod binary;
mod framing;
mod grabcut;
mod labels;
mod maxflow;
mod region_grow;
mod segmentation;

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

pub use binary::{MorphOp, MorphShape, MorphologyParams, RemoveSmallParams};
pub use framing::{CropParams, CropReference, FormatParams};
pub use grabcut::{ColorModels, GrabcutParams};
pub use labels::BinarizeParams;
pub use region_grow::RegionGrowParams;
pub use segmentation::{KMeansParams, QuickshiftParams};

use crate::geometry::{ComplexXYVertices, GeometryError, XYVertices};
use crate::types::{Bounds, Dimensions, LabelImage};

/// A named diagnostic image emitted by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    /// Display name, e.g. "Selected Area".
    pub name: String,
    /// The diagnostic image.
    pub image: RgbImage,
}

impl Summary {
    /// Create a summary.
    #[must_use]
    pub fn new(name: impl Into<String>, image: RgbImage) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }
}

/// Values flowing between stages.
#[derive(Debug, Clone)]
pub struct StageIo {
    /// Working colour image (cropped after the crop stage).
    pub image: Option<RgbImage>,
    /// Size of the uncropped image.
    pub full_image_size: Option<Dimensions>,
    /// Vertices marking what to add.
    pub foreground_vertices: XYVertices,
    /// Vertices marking what to remove.
    pub background_vertices: XYVertices,
    /// Existing component mask, in working coordinates.
    pub old_component_mask: Option<GrayImage>,
    /// Existing component mask at full size, never inverted.
    pub unformatted_old_component_mask: Option<GrayImage>,
    /// Per-pixel user intent ([`HistoryValue`](crate::mask::HistoryValue)).
    pub history_mask: Option<GrayImage>,
    /// Vertices of the component being edited.
    pub prev_component_vertices: ComplexXYVertices,
    /// Corners of the visible area.
    pub viewbox: XYVertices,
    /// Whether this is the first run for the current cache key.
    pub first_run: bool,
    /// `false` when only background vertices were given.
    pub as_foreground: bool,
    /// Window of the full image the working data covers.
    pub bounds: Option<Bounds>,
    /// Scale applied to the working data (1.0 when not resized).
    pub resize_ratio: f64,
    /// Current binary result.
    pub mask: Option<GrayImage>,
    /// Current label image.
    pub labels: Option<LabelImage>,
    /// Diagnostic images emitted so far in this run.
    pub summaries: Vec<Summary>,
}

impl Default for StageIo {
    fn default() -> Self {
        Self {
            image: None,
            full_image_size: None,
            foreground_vertices: XYVertices::default(),
            background_vertices: XYVertices::default(),
            old_component_mask: None,
            unformatted_old_component_mask: None,
            history_mask: None,
            prev_component_vertices: ComplexXYVertices::default(),
            viewbox: XYVertices::default(),
            first_run: true,
            as_foreground: true,
            bounds: None,
            resize_ratio: 1.0,
            mask: None,
            labels: None,
            summaries: Vec::new(),
        }
    }
}

impl StageIo {
    /// Working image dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::MissingInput`] if there is no image.
    pub fn image_dims(&self, stage: &'static str) -> Result<Dimensions, StageError> {
        self.image
            .as_ref()
            .map(Dimensions::of)
            .ok_or(StageError::MissingInput {
                stage,
                field: "image",
            })
    }

    /// The mask binary stages operate on: the current result if present,
    /// otherwise the luminance of the working image.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::MissingInput`] if neither exists.
    pub fn binary_input(&self, stage: &'static str) -> Result<GrayImage, StageError> {
        if let Some(mask) = &self.mask {
            return Ok(mask.clone());
        }
        self.image
            .as_ref()
            .map(crate::mask::luminance)
            .ok_or(StageError::MissingInput {
                stage,
                field: "image",
            })
    }
}

/// Errors raised by a stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The vertices given cannot drive this stage.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// A required input field was absent.
    #[error("{stage}: missing input `{field}`")]
    MissingInput {
        /// Stage that needed the input.
        stage: &'static str,
        /// Name of the missing field.
        field: &'static str,
    },

    /// The algorithm could not produce a result for this input.
    #[error("{stage}: {message}")]
    Algorithm {
        /// Stage that failed.
        stage: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl StageError {
    /// Whether the failure comes from invalid vertex input rather than the
    /// algorithm itself.
    #[must_use]
    pub const fn is_geometry(&self) -> bool {
        matches!(self, Self::Geometry(_))
    }
}

/// Per-run state a stage may read or update besides the [`StageIo`].
#[derive(Debug)]
pub struct StageContext<'a> {
    /// History mask remembered for the current cache key.
    pub history_cache: &'a mut Option<GrayImage>,
    /// Colour models retained on the stage between runs.
    pub models: &'a mut Option<ColorModels>,
}

/// A stage and its hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Operation {
    /// Fill user polygons into the history mask and normalize the inputs.
    FormatVertices(FormatParams),
    /// Crop (and optionally shrink) the working data around the area of
    /// interest.
    CropToLocalArea(CropParams),
    /// Colour-model graph cut.
    Grabcut(GrabcutParams),
    /// Tolerance flood fill from the foreground vertices.
    RegionGrow(RegionGrowParams),
    /// Colour k-means clustering into a label image.
    KMeans(KMeansParams),
    /// Mode-seeking segmentation into a label image.
    Quickshift(QuickshiftParams),
    /// Morphological filtering of the current mask.
    Morphology(MorphologyParams),
    /// Turn a label image into a binary mask.
    BinarizeLabels(BinarizeParams),
    /// Fill enclosed background regions.
    FillHoles,
    /// Keep only the biggest connected component.
    KeepLargestComponent,
    /// Drop connected components below a size threshold.
    RemoveSmallComponents(RemoveSmallParams),
    /// Rasterize the foreground vertices as the result.
    DrawVertices,
    /// Replace each component by its bounding box.
    ConvertToSquares,
    /// Reject single-point input.
    DisallowPaintTool,
    /// Combine the result with the old component mask.
    ApplyProcessResult,
    /// Re-embed the result into a full-size mask.
    ReturnToFullSize,
}

impl Operation {
    /// Short identifier used in logs and errors.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::FormatVertices(_) => "format_vertices",
            Self::CropToLocalArea(_) => "crop_to_local_area",
            Self::Grabcut(_) => "grabcut",
            Self::RegionGrow(_) => "region_grow",
            Self::KMeans(_) => "k_means",
            Self::Quickshift(_) => "quickshift",
            Self::Morphology(_) => "morphology",
            Self::BinarizeLabels(_) => "binarize_labels",
            Self::FillHoles => "fill_holes",
            Self::KeepLargestComponent => "keep_largest_component",
            Self::RemoveSmallComponents(_) => "remove_small_components",
            Self::DrawVertices => "draw_vertices",
            Self::ConvertToSquares => "convert_to_squares",
            Self::DisallowPaintTool => "disallow_paint_tool",
            Self::ApplyProcessResult => "apply_process_result",
            Self::ReturnToFullSize => "return_to_full_size",
        }
    }

    /// Run the stage on `io`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] when required inputs are missing, the
    /// vertices are unusable, or the algorithm fails.
    pub fn apply(&self, io: &mut StageIo, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        match self {
            Self::FormatVertices(params) => framing::format_vertices(io, params, ctx),
            Self::CropToLocalArea(params) => framing::crop_to_local_area(io, params),
            Self::Grabcut(params) => grabcut::grabcut(io, params, ctx),
            Self::RegionGrow(params) => region_grow::region_grow(io, params),
            Self::KMeans(params) => segmentation::k_means(io, params),
            Self::Quickshift(params) => segmentation::quickshift(io, params),
            Self::Morphology(params) => binary::morphology(io, params),
            Self::BinarizeLabels(params) => labels::binarize_labels(io, params),
            Self::FillHoles => binary::fill_holes(io),
            Self::KeepLargestComponent => binary::keep_largest_component(io),
            Self::RemoveSmallComponents(params) => binary::remove_small_components(io, params),
            Self::DrawVertices => binary::draw_vertices(io),
            Self::ConvertToSquares => binary::convert_to_squares(io),
            Self::DisallowPaintTool => binary::disallow_paint_tool(io),
            Self::ApplyProcessResult => framing::apply_process_result(io),
            Self::ReturnToFullSize => framing::return_to_full_size(io),
        }
    }
}
