//! Ordered point lists (`XYVertices`).

use serde::{Deserialize, Serialize};

use crate::types::{Bounds, Dimensions, Point};

/// An ordered sequence of image-space points.
///
/// When `connected` is `true` the last point joins back to the first and the
/// points describe a closed loop that can be filled. Fill-based operations
/// need at least three points; shorter loops rasterize to nothing but their
/// own pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XYVertices {
    points: Vec<Point>,
    connected: bool,
}

impl Default for XYVertices {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl XYVertices {
    /// A connected loop from the given points.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self {
            points,
            connected: true,
        }
    }

    /// An open (not closed) sequence of points, e.g. paint-brush samples.
    #[must_use]
    pub const fn open(points: Vec<Point>) -> Self {
        Self {
            points,
            connected: false,
        }
    }

    /// Build a connected loop from `(x, y)` pairs.
    #[must_use]
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        Self::new(pairs.into_iter().map(|(x, y)| Point::new(x, y)).collect())
    }

    /// Whether consecutive points form a closed loop.
    #[must_use]
    pub const fn connected(&self) -> bool {
        self.connected
    }

    /// Copy of these points with a different `connected` flag.
    #[must_use]
    pub fn with_connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Returns `true` if there are no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of points.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.points.len()
    }

    /// All points in order.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Consumes the list and returns the underlying points.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Points concatenated with another list. The result keeps this list's
    /// `connected` flag.
    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        let mut points = self.points.clone();
        points.extend_from_slice(&other.points);
        Self {
            points,
            connected: self.connected,
        }
    }

    /// Every point translated by `(dx, dy)`.
    #[must_use]
    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self {
            points: self.points.iter().map(|p| p.offset(dx, dy)).collect(),
            connected: self.connected,
        }
    }

    /// Every point scaled about the origin.
    #[must_use]
    pub fn scale(&self, ratio: f64) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| Point::new(p.x * ratio, p.y * ratio))
                .collect(),
            connected: self.connected,
        }
    }

    /// Mean of all points, or `None` when empty.
    #[must_use]
    pub fn mean(&self) -> Option<Point> {
        if self.points.is_empty() {
            return None;
        }
        let n = self.points.len() as f64;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        Some(Point::new(sx / n, sy / n))
    }

    /// Axis-aligned `(min, max)` corners, or `None` when empty.
    #[must_use]
    pub fn extent(&self) -> Option<(Point, Point)> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (
                Point::new(lo.x.min(p.x), lo.y.min(p.y)),
                Point::new(hi.x.max(p.x), hi.y.max(p.y)),
            )
        }))
    }

    /// Peak-to-peak span `(width, height)` of the points; zero when empty.
    #[must_use]
    pub fn span(&self) -> (f64, f64) {
        self.extent()
            .map_or((0.0, 0.0), |(lo, hi)| (hi.x - lo.x, hi.y - lo.y))
    }

    /// Pixel window covering every point, clipped to `dims`.
    #[must_use]
    pub fn bounds(&self, dims: Dimensions) -> Option<Bounds> {
        let (lo, hi) = self.extent()?;
        let x0 = lo.x.floor().max(0.0) as u32;
        let y0 = lo.y.floor().max(0.0) as u32;
        let x1 = (hi.x.floor() + 1.0).max(0.0) as u32;
        let y1 = (hi.y.floor() + 1.0).max(0.0) as u32;
        Some(Bounds::new(x0, y0, x1, y1).clip_to(dims))
    }

    /// Clamp every point into `[0, max_x] x [0, max_y]`, rounding to whole
    /// pixels.
    #[must_use]
    pub fn clamp_to_pixels(&self, max_x: f64, max_y: f64) -> Self {
        Self {
            points: self
                .points
                .iter()
                .map(|p| {
                    Point::new(
                        p.x.trunc().clamp(0.0, max_x.max(0.0)),
                        p.y.trunc().clamp(0.0, max_y.max(0.0)),
                    )
                })
                .collect(),
            connected: self.connected,
        }
    }

    /// Restrict the points to the rectangle `[min, max]`.
    ///
    /// Closed loops of three or more points are clipped edge by edge, so the
    /// part of the outline inside the rectangle keeps its shape and the rest
    /// is replaced by runs along the rectangle's sides; a loop entirely
    /// outside comes back empty. Open lists and shorter loops have each
    /// point clamped instead.
    #[must_use]
    pub fn clip_to(&self, min: Point, max: Point) -> Self {
        let clamp = |p: &Point| Point::new(p.x.clamp(min.x, max.x), p.y.clamp(min.y, max.y));
        if self.connected && self.points.len() >= 3 {
            let clipped = clip_side(&self.points, |p| p.x >= min.x, |a, b| cross_x(a, b, min.x));
            let clipped = clip_side(&clipped, |p| p.x <= max.x, |a, b| cross_x(a, b, max.x));
            let clipped = clip_side(&clipped, |p| p.y >= min.y, |a, b| cross_y(a, b, min.y));
            let clipped = clip_side(&clipped, |p| p.y <= max.y, |a, b| cross_y(a, b, max.y));
            return Self::new(clipped);
        }
        Self {
            points: self.points.iter().map(clamp).collect(),
            connected: self.connected,
        }
    }

    /// Dense boundary samples from corner vertices.
    ///
    /// Walks the closed outline and emits one point per unit of arc length,
    /// so straight edges between sparse corners become one vertex per
    /// boundary pixel. A nonzero `size_limit` caps the result: outlines that
    /// would need more points are resampled to `size_limit` evenly spaced
    /// points instead.
    #[must_use]
    pub fn to_full_boundary(&self, size_limit: usize) -> Self {
        if self.points.len() < 2 {
            return self.clone();
        }
        let mut closed = self.points.clone();
        closed.push(self.points[0]);

        let mut cumulative = Vec::with_capacity(closed.len());
        cumulative.push(0.0);
        for pair in closed.windows(2) {
            let last = cumulative.last().copied().unwrap_or(0.0);
            cumulative.push(last + pair[0].distance(pair[1]));
        }
        let total = cumulative.last().copied().unwrap_or(0.0);
        if total <= 0.0 {
            return Self::new(vec![self.points[0]]).with_connected(self.connected);
        }

        let samples: Vec<f64> = if size_limit > 0 && total.ceil() > size_limit as f64 {
            if size_limit == 1 {
                vec![0.0]
            } else {
                let step = total / (size_limit - 1) as f64;
                (0..size_limit).map(|i| step * i as f64).collect()
            }
        } else {
            let count = total.ceil() as usize;
            (0..count).map(|i| i as f64).filter(|d| *d < total).collect()
        };

        let mut segment = 0;
        let points = samples
            .into_iter()
            .map(|d| {
                while segment + 1 < cumulative.len() - 1 && cumulative[segment + 1] < d {
                    segment += 1;
                }
                let start = cumulative[segment];
                let length = cumulative[segment + 1] - start;
                let t = if length > 0.0 { (d - start) / length } else { 0.0 };
                let a = closed[segment];
                let b = closed[segment + 1];
                Point::new(t.mul_add(b.x - a.x, a.x), t.mul_add(b.y - a.y, a.y))
            })
            .collect();
        Self {
            points,
            connected: self.connected,
        }
    }
}

/// One Sutherland-Hodgman pass: keep the part of the closed loop `input`
/// on the `inside` side of a single clip line.
fn clip_side(input: &[Point], inside: impl Fn(&Point) -> bool, cross: impl Fn(Point, Point) -> Point) -> Vec<Point> {
    let Some(&last) = input.last() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(input.len() + 2);
    let mut prev = last;
    for &p in input {
        match (inside(&prev), inside(&p)) {
            (true, true) => out.push(p),
            (true, false) => out.push(cross(prev, p)),
            (false, true) => {
                out.push(cross(prev, p));
                out.push(p);
            }
            (false, false) => {}
        }
        prev = p;
    }
    out
}

fn cross_x(a: Point, b: Point, x: f64) -> Point {
    let t = (x - a.x) / (b.x - a.x);
    Point::new(x, t.mul_add(b.y - a.y, a.y))
}

fn cross_y(a: Point, b: Point, y: f64) -> Point {
    let t = (y - a.y) / (b.y - a.y);
    Point::new(t.mul_add(b.x - a.x, a.x), y)
}

impl FromIterator<Point> for XYVertices {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
