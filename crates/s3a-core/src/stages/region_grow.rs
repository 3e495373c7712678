//! Seeded region growing by tolerance flood fill.

use std::collections::VecDeque;

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::geometry::XYVertices;
use crate::geometry::raster::ON;
use crate::stages::{StageError, StageIo};
use crate::types::Point;

/// Hyperparameters for [`Operation::RegionGrow`](crate::stages::Operation::RegionGrow).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionGrowParams {
    /// Largest per-channel difference from the seed value that still
    /// joins the region.
    pub seed_threshold: f64,
}

impl RegionGrowParams {
    /// Default per-channel tolerance.
    pub const DEFAULT_SEED_THRESHOLD: f64 = 10.0;
}

impl Default for RegionGrowParams {
    fn default() -> Self {
        Self {
            seed_threshold: Self::DEFAULT_SEED_THRESHOLD,
        }
    }
}

/// Pixels 8-connected to `(sx, sy)` whose `value` is within `accept` of the
/// seed's, as a `width * height` row-major flag vector.
pub(super) fn flood<F>(width: u32, height: u32, sx: u32, sy: u32, accept: F) -> Vec<bool>
where
    F: Fn(u32, u32) -> bool,
{
    let idx = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;
    let mut filled = vec![false; (width as usize) * (height as usize)];
    if sx >= width || sy >= height {
        return filled;
    }
    let mut queue = VecDeque::from([(sx, sy)]);
    filled[idx(sx, sy)] = true;
    while let Some((x, y)) = queue.pop_front() {
        for dy in -1_i64..=1 {
            for dx in -1_i64..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let nx = i64::from(x) + dx;
                let ny = i64::from(y) + dy;
                if nx < 0 || ny < 0 || nx >= i64::from(width) || ny >= i64::from(height) {
                    continue;
                }
                let (nx, ny) = (nx as u32, ny as u32);
                if !filled[idx(nx, ny)] && accept(nx, ny) {
                    filled[idx(nx, ny)] = true;
                    queue.push_back((nx, ny));
                }
            }
        }
    }
    filled
}

/// Most boundary points a closed seed outline is densified to.
const SEED_SIZE_LIMIT: usize = 50_000;

/// Points to seed from: the densified outline of a closed list, or the
/// points themselves otherwise.
fn seed_points(vertices: &XYVertices) -> Vec<Point> {
    if vertices.connected() && vertices.len() > 1 {
        vertices.to_full_boundary(SEED_SIZE_LIMIT).into_points()
    } else {
        vertices.points().to_vec()
    }
}

/// In-image seed pixels, deduplicated, in input order.
pub(super) fn seed_pixels(points: &[Point], width: u32, height: u32) -> Vec<(u32, u32)> {
    let mut seen = std::collections::HashSet::new();
    points
        .iter()
        .filter(|p| p.x >= 0.0 && p.y >= 0.0)
        .map(|p| (p.x as u32, p.y as u32))
        .filter(|&(x, y)| x < width && y < height)
        .filter(|s| seen.insert(*s))
        .collect()
}

/// Union of per-seed, per-channel tolerance floods.
#[must_use]
pub fn grow_seed_points(image: &RgbImage, seeds: &[(u32, u32)], threshold: f64) -> GrayImage {
    let (w, h) = image.dimensions();
    let mut out = vec![false; (w as usize) * (h as usize)];
    for &(sx, sy) in seeds {
        for channel in 0..3 {
            let seed_value = f64::from(image.get_pixel(sx, sy).0[channel]);
            let filled = flood(w, h, sx, sy, |x, y| {
                (f64::from(image.get_pixel(x, y).0[channel]) - seed_value).abs() <= threshold
            });
            for (o, f) in out.iter_mut().zip(filled) {
                *o |= f;
            }
        }
    }
    GrayImage::from_fn(w, h, |x, y| {
        if out[(y as usize) * (w as usize) + x as usize] {
            ON
        } else {
            image::Luma([0])
        }
    })
}

pub(super) fn region_grow(io: &mut StageIo, params: &RegionGrowParams) -> Result<(), StageError> {
    let Some(image) = io.image.as_ref() else {
        return Err(StageError::MissingInput {
            stage: "region_grow",
            field: "image",
        });
    };
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || io.foreground_vertices.is_empty() {
        io.mask = Some(GrayImage::new(w, h));
        return Ok(());
    }

    let seeds = seed_pixels(&seed_points(&io.foreground_vertices), w, h);
    tracing::debug!(seeds = seeds.len(), "growing regions");
    io.mask = Some(grow_seed_points(image, &seeds, params.seed_threshold));
    Ok(())
}
