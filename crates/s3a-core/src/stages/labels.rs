//! Label image to binary mask.

use std::collections::{BTreeMap, HashSet};

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use serde::{Deserialize, Serialize};

use crate::geometry::raster::{OFF, ON};
use crate::mask::HistoryValue;
use crate::stages::region_grow::{flood, seed_pixels};
use crate::stages::{StageError, StageIo, Summary};
use crate::types::{Dimensions, LabelImage};

const STAGE: &str = "binarize_labels";

/// Hyperparameters for [`Operation::BinarizeLabels`](crate::stages::Operation::BinarizeLabels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarizeParams {
    /// Keep only label regions connected to a seed vertex.
    pub touching_roi_only: bool,
    /// Colour the summary by mean label colour instead of drawing label
    /// boundaries.
    pub use_mean_color: bool,
    /// Thickness of boundary lines in the summary.
    pub line_thickness: u32,
}

impl Default for BinarizeParams {
    fn default() -> Self {
        Self {
            touching_roi_only: true,
            use_mean_color: true,
            line_thickness: 2,
        }
    }
}

pub(super) fn binarize_labels(io: &mut StageIo, params: &BinarizeParams) -> Result<(), StageError> {
    let labels = io.labels.as_ref().ok_or(StageError::MissingInput {
        stage: STAGE,
        field: "labels",
    })?;
    let (w, h) = labels.dimensions();
    let seeds = seed_pixels(io.foreground_vertices.points(), w, h);
    let history = io
        .history_mask
        .as_ref()
        .filter(|m| Dimensions::of(*m) == Dimensions::new(w, h));

    let keep: Vec<bool> = if params.touching_roi_only && !seeds.is_empty() {
        let mut out = vec![false; (w as usize) * (h as usize)];
        for &(sx, sy) in &seeds {
            let target = labels.get_pixel(sx, sy).0[0];
            let filled = flood(w, h, sx, sy, |x, y| labels.get_pixel(x, y).0[0] == target);
            for (o, f) in out.iter_mut().zip(filled) {
                *o |= f;
            }
        }
        out
    } else if seeds.is_empty() && history.is_none() {
        return Err(StageError::Algorithm {
            stage: STAGE,
            message: "cannot binarize labels without vertices and with a misshapen history mask"
                .to_owned(),
        });
    } else if seeds.is_empty() {
        labels.pixels().map(|p| p.0[0] > 0).collect()
    } else {
        let wanted: HashSet<u32> = seeds
            .iter()
            .map(|&(x, y)| labels.get_pixel(x, y).0[0])
            .collect();
        labels.pixels().map(|p| wanted.contains(&p.0[0])).collect()
    };

    let mut out = GrayImage::from_fn(w, h, |x, y| {
        if keep[(y as usize) * (w as usize) + x as usize] {
            ON
        } else {
            OFF
        }
    });
    if let Some(history) = history {
        for (o, hv) in out.pixels_mut().zip(history.pixels()) {
            if HistoryValue::from_pixel(hv.0[0]) == HistoryValue::Background {
                *o = OFF;
            }
        }
    }

    if let Some(image) = io.image.as_ref().filter(|i| i.dimensions() == (w, h)) {
        let mut summary = if params.use_mean_color {
            mean_color_image(image, labels)
        } else {
            boundary_image(image, labels, params.line_thickness)
        };
        let points = io.foreground_vertices.points();
        if points.len() > 1 {
            for i in 0..points.len() {
                let a = points[i];
                let b = points[(i + 1) % points.len()];
                draw_line_segment_mut(
                    &mut summary,
                    (a.x as f32, a.y as f32),
                    (b.x as f32, b.y as f32),
                    Rgb([255, 0, 0]),
                );
            }
        }
        io.summaries.push(Summary::new("Binarize Labels", summary));
    }

    io.mask = Some(out);
    Ok(())
}

/// Every pixel painted with the mean colour of its label.
fn mean_color_image(image: &RgbImage, labels: &LabelImage) -> RgbImage {
    let mut sums: BTreeMap<u32, ([u64; 3], u64)> = BTreeMap::new();
    for (p, l) in image.pixels().zip(labels.pixels()) {
        let entry = sums.entry(l.0[0]).or_insert(([0; 3], 0));
        for c in 0..3 {
            entry.0[c] += u64::from(p.0[c]);
        }
        entry.1 += 1;
    }
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let label = labels.get_pixel(x, y).0[0];
        sums.get(&label).map_or(Rgb([0, 0, 0]), |(s, n)| {
            Rgb([
                (s[0] / n) as u8,
                (s[1] / n) as u8,
                (s[2] / n) as u8,
            ])
        })
    })
}

/// Copy of `image` with label boundaries drawn in white.
///
/// A pixel is on a boundary when the labels in its `thickness` window
/// (odd, at least 3) are not all equal.
fn boundary_image(image: &RgbImage, labels: &LabelImage, thickness: u32) -> RgbImage {
    let thickness = (thickness | 1).max(3);
    let r = i64::from(thickness / 2);
    let (w, h) = labels.dimensions();
    let mut out = image.clone();
    for y in 0..h {
        for x in 0..w {
            let mut lo = u32::MAX;
            let mut hi = 0;
            for dy in -r..=r {
                for dx in -r..=r {
                    let nx = i64::from(x) + dx;
                    let ny = i64::from(y) + dy;
                    if nx < 0 || ny < 0 || nx >= i64::from(w) || ny >= i64::from(h) {
                        continue;
                    }
                    let v = labels.get_pixel(nx as u32, ny as u32).0[0];
                    lo = lo.min(v);
                    hi = hi.max(v);
                }
            }
            if lo != hi {
                out.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::geometry::XYVertices;
    use crate::types::Point;
    use image::Luma;

    fn labels_from(rows: &[&str]) -> LabelImage {
        let h = rows.len() as u32;
        let w = rows[0].len() as u32;
        LabelImage::from_fn(w, h, |x, y| {
            Luma([u32::from(rows[y as usize].as_bytes()[x as usize] - b'0')])
        })
    }

    fn io_for(labels: LabelImage) -> StageIo {
        let (w, h) = labels.dimensions();
        StageIo {
            image: Some(RgbImage::new(w, h)),
            history_mask: Some(GrayImage::new(w, h)),
            labels: Some(labels),
            ..StageIo::default()
        }
    }

    fn on(io: &StageIo) -> u64 {
        crate::mask::count_on(io.mask.as_ref().unwrap())
    }

    #[test]
    fn touching_roi_keeps_connected_region_only() {
        let mut io = io_for(labels_from(&["1100", "1100", "0011", "0011"]));
        io.foreground_vertices = XYVertices::open(vec![Point::new(0.0, 0.0)]);
        binarize_labels(&mut io, &BinarizeParams::default()).unwrap();
        // The two 1-regions touch diagonally, so 8-connectivity joins them.
        assert_eq!(on(&io), 8);
    }

    #[test]
    fn label_match_keeps_disconnected_regions() {
        let mut io = io_for(labels_from(&["1200", "2200", "0000", "0001"]));
        io.foreground_vertices = XYVertices::open(vec![Point::new(0.0, 0.0)]);
        let params = BinarizeParams {
            touching_roi_only: false,
            ..BinarizeParams::default()
        };
        binarize_labels(&mut io, &params).unwrap();
        assert_eq!(on(&io), 2);
    }

    #[test]
    fn no_seeds_keeps_nonzero_labels_minus_background_history() {
        let mut io = io_for(labels_from(&["12", "30"]));
        let mut history = GrayImage::new(2, 2);
        history.put_pixel(1, 0, HistoryValue::Background.luma());
        io.history_mask = Some(history);
        binarize_labels(&mut io, &BinarizeParams::default()).unwrap();
        assert_eq!(on(&io), 2);
    }

    #[test]
    fn no_seeds_and_misshapen_history_fails() {
        let mut io = io_for(labels_from(&["12", "30"]));
        io.history_mask = Some(GrayImage::new(5, 5));
        let err = binarize_labels(&mut io, &BinarizeParams::default()).unwrap_err();
        assert!(matches!(err, StageError::Algorithm { .. }));
    }

    #[test]
    fn boundary_summary_marks_label_edges() {
        let labels = labels_from(&["1122", "1122"]);
        let img = RgbImage::new(4, 2);
        let out = boundary_image(&img, &labels, 1);
        assert_eq!(*out.get_pixel(1, 0), Rgb([255, 255, 255]));
        assert_eq!(*out.get_pixel(2, 0), Rgb([255, 255, 255]));
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
    }
}
