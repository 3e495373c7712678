//! Ramer-Douglas-Peucker polygon simplification.
//!
//! Closed loops have no natural endpoints, so they are split at the point
//! farthest from the first vertex and each half is decimated on its own.

use crate::geometry::XYVertices;
use crate::types::Point;

/// Simplify one loop or polyline with tolerance `epsilon` (pixels).
///
/// `epsilon <= 0` returns the input unchanged. A closed loop that would
/// drop below three points keeps its original points instead.
#[must_use = "returns the simplified vertices"]
pub fn simplify(vertices: &XYVertices, epsilon: f64) -> XYVertices {
    let points = vertices.points();
    if epsilon <= 0.0 || points.len() < 3 {
        return vertices.clone();
    }

    let kept = if vertices.connected() {
        simplify_closed(points, epsilon)
    } else {
        simplify_open(points, epsilon)
    };

    if vertices.connected() && kept.len() < 3 {
        return vertices.clone();
    }
    XYVertices::new(kept).with_connected(vertices.connected())
}

fn simplify_open(points: &[Point], epsilon: f64) -> Vec<Point> {
    let mut kept = vec![false; points.len()];
    kept[0] = true;
    kept[points.len() - 1] = true;
    rdp_recurse(points, 0, points.len() - 1, epsilon, &mut kept);
    points
        .iter()
        .zip(&kept)
        .filter(|&(_, k)| *k)
        .map(|(&p, _)| p)
        .collect()
}

fn simplify_closed(points: &[Point], epsilon: f64) -> Vec<Point> {
    let first = points[0];
    let split = points
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|(_, a), (_, b)| {
            a.distance_squared(first)
                .total_cmp(&b.distance_squared(first))
        })
        .map_or(points.len() - 1, |(i, _)| i);

    // First half runs 0..=split, second half split..=0 (wrapping).
    let mut second: Vec<Point> = points[split..].to_vec();
    second.push(first);

    let mut head = simplify_open(&points[..=split], epsilon);
    let tail = simplify_open(&second, epsilon);
    // Drop the duplicated split point and the closing copy of `first`.
    head.extend(tail.iter().skip(1).take(tail.len().saturating_sub(2)));
    head
}

/// Recursive step: keep the farthest point if it is beyond tolerance and
/// recurse into both halves.
fn rdp_recurse(points: &[Point], start: usize, end: usize, epsilon: f64, kept: &mut [bool]) {
    if end <= start + 1 {
        return;
    }

    let mut max_dist = 0.0;
    let mut max_idx = start;
    for i in (start + 1)..end {
        let d = perpendicular_distance(points[i], points[start], points[end]);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }

    if max_dist > epsilon {
        kept[max_idx] = true;
        rdp_recurse(points, start, max_idx, epsilon, kept);
        rdp_recurse(points, max_idx, end, epsilon, kept);
    }
}

/// Distance from `p` to the line through `a` and `b`, or to `a` when the
/// two coincide.
fn perpendicular_distance(p: Point, a: Point, b: Point) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let length_sq = dx.mul_add(dx, dy * dy);
    if length_sq == 0.0 {
        return p.distance(a);
    }
    let cross = dx.mul_add(a.y - p.y, -(dy * (a.x - p.x)));
    cross.abs() / length_sq.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_square() -> XYVertices {
        XYVertices::new(
            XYVertices::from_pairs([(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)])
                .to_full_boundary(0)
                .into_points(),
        )
    }

    #[test]
    fn zero_epsilon_is_identity() {
        let sq = dense_square();
        assert_eq!(simplify(&sq, 0.0), sq);
        assert_eq!(simplify(&sq, -1.0), sq);
    }

    #[test]
    fn dense_square_collapses_to_corners() {
        let simplified = simplify(&dense_square(), 0.5);
        assert_eq!(simplified.len(), 4);
        for corner in [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ] {
            assert!(simplified.points().contains(&corner));
        }
    }

    #[test]
    fn open_collinear_points_keep_endpoints() {
        let line = XYVertices::open(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(2.0, 2.0),
            Point::new(3.0, 3.0),
        ]);
        let simplified = simplify(&line, 0.1);
        assert_eq!(
            simplified.points(),
            &[Point::new(0.0, 0.0), Point::new(3.0, 3.0)]
        );
        assert!(!simplified.connected());
    }

    #[test]
    fn zigzag_retains_peaks() {
        let zigzag = XYVertices::open(vec![
            Point::new(0.0, 0.0),
            Point::new(2.0, 5.0),
            Point::new(4.0, 0.0),
            Point::new(6.0, 5.0),
            Point::new(8.0, 0.0),
        ]);
        assert_eq!(simplify(&zigzag, 1.0).len(), 5);
        assert_eq!(simplify(&zigzag, 10.0).len(), 2);
    }

    #[test]
    fn degenerate_loop_keeps_original_points() {
        let sliver = XYVertices::from_pairs([(0.0, 0.0), (5.0, 0.1), (10.0, 0.0), (5.0, -0.1)]);
        assert_eq!(simplify(&sliver, 50.0), sliver);
    }
}
