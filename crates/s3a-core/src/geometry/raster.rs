//! Polygon rasterization at pixel centres.
//!
//! A loop covers two pixel sets: its *interior* (pixel centres inside the
//! polygon by the even-odd rule, with a half-open rule on rows so shared
//! vertices are counted once) and its *boundary* (pixels the edges pass
//! through). Outer loops paint both; holes clear the interior minus the
//! boundary, so the foreground pixels that trace a hole border survive.

use image::{GrayImage, Luma};
use imageproc::drawing::draw_line_segment_mut;

use crate::types::Point;

/// Mask value for "on" pixels.
pub const ON: Luma<u8> = Luma([255]);
/// Mask value for "off" pixels.
pub const OFF: Luma<u8> = Luma([0]);

/// Pixel centres inside the closed polygon `points`, row by row.
///
/// Fewer than three points enclose nothing.
#[must_use]
pub fn interior_pixels(points: &[Point], width: u32, height: u32) -> Vec<(u32, u32)> {
    if points.len() < 3 || width == 0 || height == 0 {
        return Vec::new();
    }

    let (min_y, max_y) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.y), hi.max(p.y))
        });
    if !min_y.is_finite() || !max_y.is_finite() {
        return Vec::new();
    }
    let row_start = min_y.ceil().max(0.0) as u32;
    let row_end = max_y.floor().min(f64::from(height - 1));
    if row_end < 0.0 {
        return Vec::new();
    }
    let row_end = row_end as u32;

    let mut pixels = Vec::new();
    let mut crossings: Vec<f64> = Vec::new();
    for row in row_start..=row_end {
        let y = f64::from(row);
        crossings.clear();
        for (i, &a) in points.iter().enumerate() {
            let b = points[(i + 1) % points.len()];
            let spans_row = (a.y <= y && y < b.y) || (b.y <= y && y < a.y);
            if spans_row {
                let t = (y - a.y) / (b.y - a.y);
                crossings.push(t.mul_add(b.x - a.x, a.x));
            }
        }
        crossings.sort_by(f64::total_cmp);
        for pair in crossings.chunks_exact(2) {
            let start = pair[0].ceil().max(0.0);
            let end = pair[1].floor().min(f64::from(width - 1));
            if end < start {
                continue;
            }
            for col in (start as u32)..=(end as u32) {
                pixels.push((col, row));
            }
        }
    }
    pixels
}

/// Pixels the loop's edges pass through, drawn onto a scratch mask.
///
/// Open point lists skip the closing edge. A single point marks its own
/// pixel.
#[must_use]
pub fn boundary_mask(points: &[Point], connected: bool, width: u32, height: u32) -> GrayImage {
    let mut scratch = GrayImage::new(width, height);
    draw_boundary(&mut scratch, points, connected, ON);
    scratch
}

/// Draw the edges of a point list directly onto `mask` with `value`.
pub fn draw_boundary(mask: &mut GrayImage, points: &[Point], connected: bool, value: Luma<u8>) {
    match points {
        [] => {}
        [p] => {
            if let Some((x, y)) = p.to_pixel()
                && x < mask.width()
                && y < mask.height()
            {
                mask.put_pixel(x, y, value);
            }
        }
        _ => {
            let edges = if connected {
                points.len()
            } else {
                points.len() - 1
            };
            let (w, h) = mask.dimensions();
            for i in 0..edges {
                let Some((a, b)) = clip_segment(points[i], points[(i + 1) % points.len()], w, h) else {
                    continue;
                };
                draw_line_segment_mut(
                    mask,
                    (a.x as f32, a.y as f32),
                    (b.x as f32, b.y as f32),
                    value,
                );
            }
        }
    }
}

/// Liang-Barsky clip of segment `a`-`b` to one pixel beyond the
/// `width` x `height` image on every side. Endpoints already inside are
/// returned untouched; `None` when the segment misses the window.
fn clip_segment(a: Point, b: Point, width: u32, height: u32) -> Option<(Point, Point)> {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let (x_max, y_max) = (f64::from(width), f64::from(height));
    let mut t0: f64 = 0.0;
    let mut t1: f64 = 1.0;
    for (p, q) in [(-dx, a.x + 1.0), (dx, x_max - a.x), (-dy, a.y + 1.0), (dy, y_max - a.y)] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return None;
        }
    }
    let at = |t: f64| Point::new(t.mul_add(dx, a.x), t.mul_add(dy, a.y));
    let start = if t0 > 0.0 { at(t0) } else { a };
    let end = if t1 < 1.0 { at(t1) } else { b };
    Some((start, end))
}

/// Paint a loop's interior and boundary with `value`.
pub fn fill_loop(mask: &mut GrayImage, points: &[Point], connected: bool, value: Luma<u8>) {
    let (w, h) = mask.dimensions();
    if connected {
        for (x, y) in interior_pixels(points, w, h) {
            mask.put_pixel(x, y, value);
        }
    }
    draw_boundary(mask, points, connected, value);
}

/// Clear a hole's strict interior: interior pixels not on its boundary.
pub fn clear_hole(mask: &mut GrayImage, points: &[Point]) {
    let (w, h) = mask.dimensions();
    let interior = interior_pixels(points, w, h);
    if interior.is_empty() {
        return;
    }
    let boundary = boundary_mask(points, true, w, h);
    for (x, y) in interior {
        if boundary.get_pixel(x, y).0[0] == 0 {
            mask.put_pixel(x, y, OFF);
        }
    }
}
