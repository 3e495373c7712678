//! Stages that frame every algorithm: input formatting, cropping to the
//! area of interest, merging the result into the old mask, and returning
//! to full size.

use image::{GrayImage, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::geometry::XYVertices;
use crate::geometry::raster;
use crate::mask::{self, HistoryValue};
use crate::resize;
use crate::stages::{StageContext, StageError, StageIo, Summary};
use crate::types::{Bounds, Dimensions, Point};

/// Hyperparameters for the formatting stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatParams {
    /// Replace corner vertices with one vertex per boundary pixel.
    pub use_full_boundary: bool,
    /// Accumulate user polygons in the history mask across runs.
    pub keep_vertices_history: bool,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            use_full_boundary: true,
            keep_vertices_history: true,
        }
    }
}

/// What the crop window is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropReference {
    /// The whole image.
    Image,
    /// The edited component plus the user vertices.
    Component,
    /// The visible area plus the user vertices.
    #[default]
    Viewbox,
    /// Only the user vertices.
    Roi,
}

/// Hyperparameters for the crop stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropParams {
    /// What the window is built around.
    pub reference: CropReference,
    /// Margin added on every side, as a percentage of the longest span.
    pub margin_pct: f64,
    /// Longest side of the working data; larger crops are shrunk.
    /// Zero disables shrinking.
    pub max_size: u32,
    /// With the viewbox reference, shrink the longer side of the viewbox to
    /// the shorter one.
    pub use_min_span: bool,
}

impl CropParams {
    /// Default margin percentage.
    pub const DEFAULT_MARGIN_PCT: f64 = 10.0;
}

impl Default for CropParams {
    fn default() -> Self {
        Self {
            reference: CropReference::default(),
            margin_pct: Self::DEFAULT_MARGIN_PCT,
            max_size: 0,
            use_min_span: false,
        }
    }
}

const FORMAT: &str = "format_vertices";
const CROP: &str = "crop_to_local_area";
const APPLY: &str = "apply_process_result";
const RETURN: &str = "return_to_full_size";

pub(super) fn format_vertices(
    io: &mut StageIo,
    params: &FormatParams,
    ctx: &mut StageContext<'_>,
) -> Result<(), StageError> {
    let dims = io.image_dims(FORMAT)?;

    let cached = ctx
        .history_cache
        .as_ref()
        .filter(|h| Dimensions::of(*h) == dims && mask::count_on(h) > 0);
    let mut history = match cached {
        Some(h) if !io.first_run && params.keep_vertices_history => h.clone(),
        _ => GrayImage::new(dims.width, dims.height),
    };

    let background_only = io.foreground_vertices.is_empty() && !io.background_vertices.is_empty();
    // Nothing past one pixel outside the image can reach a mask.
    let (lo, hi) = (
        Point::new(-1.0, -1.0),
        Point::new(f64::from(dims.width), f64::from(dims.height)),
    );
    for vertices in [&mut io.foreground_vertices, &mut io.background_vertices] {
        if !vertices.is_empty() {
            *vertices = vertices.clip_to(lo, hi);
        }
    }

    for (value, vertices) in [
        (HistoryValue::Background, &io.background_vertices),
        (HistoryValue::Foreground, &io.foreground_vertices),
    ] {
        if !vertices.is_empty() && vertices.connected() {
            raster::fill_loop(&mut history, vertices.points(), true, value.luma());
        }
    }

    if params.use_full_boundary {
        if !io.foreground_vertices.is_empty() {
            io.foreground_vertices = io.foreground_vertices.to_full_boundary(0);
        }
        if !io.background_vertices.is_empty() {
            io.background_vertices = io.background_vertices.to_full_boundary(0);
        }
    }

    *ctx.history_cache = Some(history.clone());

    io.as_foreground = true;
    if background_only {
        io.as_foreground = false;
        for p in history.pixels_mut() {
            *p = HistoryValue::from_pixel(p.0[0]).swapped().luma();
        }
        io.foreground_vertices = std::mem::take(&mut io.background_vertices);
    }

    let old = match io.old_component_mask.take() {
        Some(m) if Dimensions::of(&m) == dims => mask::normalized(&m),
        Some(_) => {
            tracing::debug!("old component mask does not match the image, using an empty one");
            GrayImage::new(dims.width, dims.height)
        }
        None => GrayImage::new(dims.width, dims.height),
    };
    io.old_component_mask = Some(if io.as_foreground {
        old.clone()
    } else {
        mask::invert(&old)
    });
    io.unformatted_old_component_mask = Some(old);
    io.history_mask = Some(history);
    io.full_image_size = Some(dims);
    io.bounds = Some(dims.full_bounds());
    io.resize_ratio = 1.0;
    Ok(())
}

/// The points the crop window must enclose.
fn reference_points(io: &StageIo, params: &CropParams, dims: Dimensions) -> Vec<Point> {
    let roi = io.foreground_vertices.concat(&io.background_vertices);
    match params.reference {
        CropReference::Image => {
            return vec![
                Point::new(0.0, 0.0),
                Point::new(f64::from(dims.width), f64::from(dims.height)),
            ];
        }
        CropReference::Roi if roi.len() > 1 => return roi.into_points(),
        CropReference::Component => {
            let component = io.prev_component_vertices.stack().concat(&roi);
            if component.len() > 1 {
                return component.into_points();
            }
        }
        CropReference::Roi | CropReference::Viewbox => {}
    }

    let viewbox = if params.use_min_span {
        min_span_viewbox(&io.viewbox)
    } else {
        io.viewbox.clone()
    };
    viewbox.concat(&roi).into_points()
}

/// Viewbox corners with the longer side shrunk about the centre to the
/// shorter side.
fn min_span_viewbox(viewbox: &XYVertices) -> XYVertices {
    let Some((lo, hi)) = viewbox.extent() else {
        return viewbox.clone();
    };
    let half_w = (hi.x - lo.x) / 2.0;
    let half_h = (hi.y - lo.y) / 2.0;
    let (cx, cy) = (lo.x + half_w, lo.y + half_h);
    let half = half_w.min(half_h);
    let (half_w, half_h) = if half_w > half_h {
        (half, half_h)
    } else {
        (half_w, half)
    };
    XYVertices::from_pairs([
        (cx - half_w, cy - half_h),
        (cx + half_w, cy - half_h),
        (cx + half_w, cy + half_h),
        (cx - half_w, cy + half_h),
    ])
}

/// Window around `points` plus `margin_pct`, clipped to the image. Falls
/// back to the whole image when that leaves nothing.
fn crop_window(points: &[Point], margin_pct: f64, dims: Dimensions) -> Bounds {
    let vertices = XYVertices::open(points.to_vec());
    let Some((lo, hi)) = vertices.extent() else {
        tracing::debug!("no reference points, cropping to the whole image");
        return dims.full_bounds();
    };
    let (span_x, span_y) = vertices.span();
    let margin = (span_x.max(span_y) * margin_pct / 100.0).round();

    let clip = |v: f64, limit: u32| v.clamp(0.0, f64::from(limit)) as u32;
    let window = Bounds::new(
        clip(lo.x.floor() - margin, dims.width),
        clip(lo.y.floor() - margin, dims.height),
        clip(hi.x.floor() + margin + 1.0, dims.width),
        clip(hi.y.floor() + margin + 1.0, dims.height),
    );
    if window.is_empty() {
        tracing::debug!(?window, "crop window is empty, using the whole image");
        return dims.full_bounds();
    }
    window
}

pub(super) fn crop_to_local_area(io: &mut StageIo, params: &CropParams) -> Result<(), StageError> {
    let Some(image) = io.image.take() else {
        return Err(StageError::MissingInput {
            stage: CROP,
            field: "image",
        });
    };
    let dims = Dimensions::of(&image);
    let points = reference_points(io, params, dims);
    let window = crop_window(&points, params.margin_pct, dims);

    let mut outlined = image.clone();
    let thickness = ((f64::from(dims.width.max(dims.height)) * 0.005) as u32).max(1);
    for inset in 0..thickness {
        let (w, h) = (window.width(), window.height());
        if w <= 2 * inset || h <= 2 * inset {
            break;
        }
        let rect = Rect::at((window.x0 + inset) as i32, (window.y0 + inset) as i32)
            .of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(&mut outlined, rect, Rgb([255, 0, 0]));
    }
    io.summaries.push(Summary::new("Selected Area", outlined));

    let mut cropped = mask::crop(&image, window);
    let mut old = io.old_component_mask.as_ref().map(|m| mask::crop(m, window));
    let mut history = io.history_mask.as_ref().map(|m| mask::crop(m, window));

    let mut ratio = 1.0;
    let mut working = window.dimensions();
    if let Some((target, r)) = resize::fit_within(working, params.max_size) {
        tracing::debug!(?working, ?target, "shrinking working area");
        ratio = r;
        working = target;
        cropped = mask::resize_nearest(&cropped, target.width, target.height);
        old = old.map(|m| mask::resize_nearest(&m, target.width, target.height));
        history = history.map(|m| mask::resize_nearest(&m, target.width, target.height));
    }

    let max_x = f64::from(working.width.saturating_sub(1));
    let max_y = f64::from(working.height.saturating_sub(1));
    let (dx, dy) = (-f64::from(window.x0), -f64::from(window.y0));
    for vertices in [&mut io.foreground_vertices, &mut io.background_vertices] {
        *vertices = vertices
            .offset(dx, dy)
            .scale(ratio)
            .clamp_to_pixels(max_x, max_y);
    }

    io.image = Some(cropped);
    io.old_component_mask = old;
    io.history_mask = history;
    io.bounds = Some(window);
    io.resize_ratio = ratio;
    Ok(())
}

pub(super) fn apply_process_result(io: &mut StageIo) -> Result<(), StageError> {
    let result = io.binary_input(APPLY)?;
    let unformatted = io
        .unformatted_old_component_mask
        .as_ref()
        .ok_or(StageError::MissingInput {
            stage: APPLY,
            field: "unformatted_old_component_mask",
        })?;
    let full = Dimensions::of(unformatted);
    let window = io.bounds.unwrap_or_else(|| full.full_bounds());
    let formatted = io
        .old_component_mask
        .clone()
        .unwrap_or_else(|| GrayImage::new(result.width(), result.height()));

    let merged = mask::or(&formatted, &result);
    let change = if io.as_foreground {
        merged
    } else {
        mask::invert(&merged)
    };
    let change = if io.resize_ratio < 1.0 {
        resize::upscale_binary(&change, window.width(), window.height())
    } else {
        mask::normalized(&change)
    };

    let mut out = unformatted.clone();
    mask::paste(&mut out, &change, window.x0, window.y0);
    let tight = mask::nonzero_bounds(&out).unwrap_or_else(|| Bounds::new(0, 0, 1, 1).clip_to(full));

    io.summaries
        .push(Summary::new("Process Result", mask::to_rgb(&change)));
    io.mask = Some(mask::crop(&out, tight));
    io.bounds = Some(tight);
    Ok(())
}

pub(super) fn return_to_full_size(io: &mut StageIo) -> Result<(), StageError> {
    let result = io.binary_input(RETURN)?;
    let unformatted = io
        .unformatted_old_component_mask
        .as_ref()
        .ok_or(StageError::MissingInput {
            stage: RETURN,
            field: "unformatted_old_component_mask",
        })?;
    let full = Dimensions::of(unformatted);
    let window = io.bounds.unwrap_or_else(|| full.full_bounds());

    let mut out = GrayImage::new(full.width, full.height);
    mask::paste(&mut out, &mask::normalized(&result), window.x0, window.y0);
    let before = mask::crop(unformatted, window);
    io.summaries.push(Summary::new(
        "Finalize Region",
        mask::diff_visualization(&before, &result),
    ));
    io.mask = Some(out);
    io.bounds = Some(full.full_bounds());
    Ok(())
}
