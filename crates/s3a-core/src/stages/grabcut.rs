//! GrabCut: iterated colour-model graph cut.
//!
//! Each class (foreground, background) is modelled by a Gaussian mixture
//! over RGB. Every iteration reassigns pixels to mixture components, refits
//! the mixtures, and relabels the undecided pixels with a minimum s-t cut
//! over the 8-connected pixel graph.

use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::geometry::raster::{OFF, ON};
use crate::mask::{HistoryValue, is_on};
use crate::stages::maxflow::FlowGraph;
use crate::stages::region_grow::seed_pixels;
use crate::stages::segmentation::{Color, cluster_colors};
use crate::stages::{StageContext, StageError, StageIo};
use crate::types::{Dimensions, LabelImage};

const STAGE: &str = "grabcut";

/// Mixture components per class.
const COMPONENTS: usize = 5;
/// Smoothness weight between equal-colour neighbours.
const GAMMA: f64 = 50.0;
/// Weight tying hard-labelled pixels to their terminal.
const LAMBDA: f64 = 9.0 * GAMMA;
/// Added to each covariance diagonal to keep it invertible.
const COVARIANCE_FLOOR: f64 = 0.01;

/// Hyperparameters for [`Operation::Grabcut`](crate::stages::Operation::Grabcut).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrabcutParams {
    /// Graph-cut refinement rounds.
    pub iterations: u32,
}

impl GrabcutParams {
    /// Default number of refinement rounds.
    pub const DEFAULT_ITERATIONS: u32 = 5;
}

impl Default for GrabcutParams {
    fn default() -> Self {
        Self {
            iterations: Self::DEFAULT_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Gaussian {
    weight: f64,
    mean: Color,
    inverse: [[f64; 3]; 3],
    determinant: f64,
}

impl Gaussian {
    fn density(&self, x: &Color) -> f64 {
        if self.weight <= 0.0 {
            return 0.0;
        }
        let d = [x[0] - self.mean[0], x[1] - self.mean[1], x[2] - self.mean[2]];
        let mut mahalanobis = 0.0;
        for (i, row) in self.inverse.iter().enumerate() {
            mahalanobis += d[i] * (row[0] * d[0] + row[1] * d[1] + row[2] * d[2]);
        }
        self.weight / self.determinant.sqrt() * (-0.5 * mahalanobis).exp()
    }
}

/// Gaussian mixture colour model for one class.
#[derive(Debug, Clone, PartialEq)]
struct Gmm {
    components: Vec<Gaussian>,
}

impl Gmm {
    /// Fit one Gaussian per assignment index; `None` without samples.
    fn fit(samples: &[Color], assignment: &[usize]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sums = [[0.0_f64; 3]; COMPONENTS];
        let mut products = [[[0.0_f64; 3]; 3]; COMPONENTS];
        let mut counts = [0_usize; COMPONENTS];
        for (x, &k) in samples.iter().zip(assignment) {
            counts[k] += 1;
            for i in 0..3 {
                sums[k][i] += x[i];
                for j in 0..3 {
                    products[k][i][j] += x[i] * x[j];
                }
            }
        }
        let total = samples.len() as f64;
        let components = (0..COMPONENTS)
            .map(|k| {
                let n = counts[k] as f64;
                if counts[k] == 0 {
                    return Gaussian {
                        weight: 0.0,
                        mean: [0.0; 3],
                        inverse: [[0.0; 3]; 3],
                        determinant: 1.0,
                    };
                }
                let mean = [sums[k][0] / n, sums[k][1] / n, sums[k][2] / n];
                let mut cov = [[0.0; 3]; 3];
                for i in 0..3 {
                    for j in 0..3 {
                        cov[i][j] = mean[i].mul_add(-mean[j], products[k][i][j] / n);
                    }
                    cov[i][i] += COVARIANCE_FLOOR;
                }
                let (inverse, determinant) = invert(&cov);
                Gaussian {
                    weight: n / total,
                    mean,
                    inverse,
                    determinant,
                }
            })
            .collect();
        Some(Self { components })
    }

    /// Initial fit from a k-means clustering of the samples.
    fn initial(samples: &[Color]) -> Option<Self> {
        let clusters: Vec<usize> = cluster_colors(samples, COMPONENTS, 1)
            .into_iter()
            .map(|c| c as usize)
            .collect();
        Self::fit(samples, &clusters)
    }

    fn likelihood(&self, x: &Color) -> f64 {
        self.components.iter().map(|g| g.density(x)).sum()
    }

    fn most_likely(&self, x: &Color) -> usize {
        self.components
            .iter()
            .enumerate()
            .map(|(k, g)| (k, g.density(x)))
            .fold((0, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best })
            .0
    }

    /// Negative log-likelihood, finite even where the density underflows.
    fn cost(&self, x: &Color) -> f64 {
        -self.likelihood(x).max(f64::MIN_POSITIVE).ln()
    }
}

/// 3x3 inverse and determinant; the floor on the diagonal keeps the
/// determinant positive for any real covariance.
fn invert(m: &[[f64; 3]; 3]) -> ([[f64; 3]; 3], f64) {
    let c00 = m[1][1].mul_add(m[2][2], -m[1][2] * m[2][1]);
    let c01 = m[1][2].mul_add(m[2][0], -m[1][0] * m[2][2]);
    let c02 = m[1][0].mul_add(m[2][1], -m[1][1] * m[2][0]);
    let det = m[0][2].mul_add(c02, m[0][0].mul_add(c00, m[0][1] * c01));
    let det = if det.abs() < f64::EPSILON { f64::EPSILON } else { det };
    let inv = [
        [
            c00 / det,
            m[0][2].mul_add(m[2][1], -m[0][1] * m[2][2]) / det,
            m[0][1].mul_add(m[1][2], -m[0][2] * m[1][1]) / det,
        ],
        [
            c01 / det,
            m[0][0].mul_add(m[2][2], -m[0][2] * m[2][0]) / det,
            m[0][2].mul_add(m[1][0], -m[0][0] * m[1][2]) / det,
        ],
        [
            c02 / det,
            m[0][1].mul_add(m[2][0], -m[0][0] * m[2][1]) / det,
            m[0][0].mul_add(m[1][1], -m[0][1] * m[1][0]) / det,
        ],
    ];
    (inv, det.abs())
}

/// Foreground and background colour models learned by a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorModels {
    foreground: Gmm,
    background: Gmm,
}

/// Per-pixel cut state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trimap {
    Background,
    Foreground,
    ProbablyBackground,
    ProbablyForeground,
}

impl Trimap {
    const fn is_foreground(self) -> bool {
        matches!(self, Self::Foreground | Self::ProbablyForeground)
    }

    const fn is_fixed(self) -> bool {
        matches!(self, Self::Foreground | Self::Background)
    }
}

/// Build the trimap from user history, the old component mask, and the
/// foreground vertex rectangle. `None` means nothing can be cut.
fn initial_trimap(io: &StageIo, dims: Dimensions) -> Option<Vec<Trimap>> {
    let (w, h) = (dims.width, dims.height);
    let seeds = seed_pixels(io.foreground_vertices.points(), w, h);
    let history = io
        .history_mask
        .as_ref()
        .filter(|m| Dimensions::of(*m) == dims);

    if let Some(history) = history {
        let old = io.old_component_mask.as_ref().filter(|m| Dimensions::of(*m) == dims);
        let mut trimap: Vec<Trimap> = (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| match HistoryValue::from_pixel(history.get_pixel(x, y).0[0]) {
                HistoryValue::Foreground => Trimap::Foreground,
                HistoryValue::Background => Trimap::Background,
                HistoryValue::Unspecified => {
                    if old.is_some_and(|m| is_on(m.get_pixel(x, y))) {
                        Trimap::ProbablyForeground
                    } else {
                        Trimap::ProbablyBackground
                    }
                }
            })
            .collect();
        for (x, y) in seeds {
            trimap[(y as usize) * (w as usize) + x as usize] = Trimap::Foreground;
        }
        return Some(trimap);
    }

    let (lo, hi) = io.foreground_vertices.extent()?;
    if hi.x - lo.x <= 1.0 || hi.y - lo.y <= 1.0 {
        return None;
    }
    let x0 = lo.x.max(0.0) as u32;
    let y0 = lo.y.max(0.0) as u32;
    let x1 = (hi.x.max(0.0) as u32).min(w);
    let y1 = (hi.y.max(0.0) as u32).min(h);
    tracing::debug!(x0, y0, x1, y1, "grabcut initialized from rectangle");
    Some(
        (0..h)
            .flat_map(|y| (0..w).map(move |x| (x, y)))
            .map(|(x, y)| {
                if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
                    Trimap::ProbablyForeground
                } else {
                    Trimap::Background
                }
            })
            .collect(),
    )
}

/// Neighbour offsets in the pixel graph with their distance weights.
const NEIGHBOURS: [(i64, i64, f64); 4] = [
    (-1, 0, 1.0),
    (-1, -1, std::f64::consts::FRAC_1_SQRT_2),
    (0, -1, 1.0),
    (1, -1, std::f64::consts::FRAC_1_SQRT_2),
];

fn smoothness_beta(colors: &[Color], w: usize, h: usize) -> f64 {
    let mut sum = 0.0;
    let mut count = 0_usize;
    for y in 0..h {
        for x in 0..w {
            for &(dx, dy, _) in &NEIGHBOURS {
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 {
                    continue;
                }
                let a = &colors[y * w + x];
                let b = &colors[ny as usize * w + nx as usize];
                sum += crate::stages::segmentation::squared_distance(a, b);
                count += 1;
            }
        }
    }
    if sum <= f64::EPSILON || count == 0 {
        0.0
    } else {
        1.0 / (2.0 * sum / count as f64)
    }
}

fn class_samples(colors: &[Color], trimap: &[Trimap], foreground: bool) -> Vec<Color> {
    colors
        .iter()
        .zip(trimap)
        .filter(|(_, t)| t.is_foreground() == foreground)
        .map(|(c, _)| *c)
        .collect()
}

fn refit(model: &Gmm, samples: &[Color]) -> Gmm {
    let assignment: Vec<usize> = samples.iter().map(|x| model.most_likely(x)).collect();
    Gmm::fit(samples, &assignment).unwrap_or_else(|| model.clone())
}

/// One min-cut pass; relabels the undecided pixels in place.
fn cut(colors: &[Color], trimap: &mut [Trimap], models: &ColorModels, w: usize, h: usize, beta: f64) {
    let n = colors.len();
    let (source, sink) = (n, n + 1);
    let mut graph = FlowGraph::new(n + 2);
    for (p, (color, label)) in colors.iter().zip(trimap.iter()).enumerate() {
        let (from_source, to_sink) = match label {
            Trimap::Foreground => (LAMBDA, 0.0),
            Trimap::Background => (0.0, LAMBDA),
            _ => {
                // Unnormalized densities can exceed one; shifting both
                // terminal costs by their minimum keeps capacities
                // non-negative without changing the cut.
                let (s, t) = (models.background.cost(color), models.foreground.cost(color));
                let floor = s.min(t);
                (s - floor, t - floor)
            }
        };
        graph.add_edge(source, p, from_source, 0.0);
        graph.add_edge(p, sink, to_sink, 0.0);
    }
    for y in 0..h {
        for x in 0..w {
            for &(dx, dy, scale) in &NEIGHBOURS {
                let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                if nx < 0 || ny < 0 || nx >= w as i64 {
                    continue;
                }
                let p = y * w + x;
                let q = ny as usize * w + nx as usize;
                let diff = crate::stages::segmentation::squared_distance(&colors[p], &colors[q]);
                let weight = GAMMA * scale * (-beta * diff).exp();
                graph.add_edge(p, q, weight, weight);
            }
        }
    }
    graph.max_flow(source, sink);
    let side = graph.source_side(source);
    for (label, &in_source) in trimap.iter_mut().zip(&side) {
        if !label.is_fixed() {
            *label = if in_source {
                Trimap::ProbablyForeground
            } else {
                Trimap::ProbablyBackground
            };
        }
    }
}

/// Segment `image` from an initial trimap.
fn segment(
    image: &RgbImage,
    trimap: &mut [Trimap],
    iterations: u32,
    retained: Option<ColorModels>,
) -> Result<ColorModels, StageError> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let colors: Vec<Color> = image
        .pixels()
        .map(|p| [f64::from(p.0[0]), f64::from(p.0[1]), f64::from(p.0[2])])
        .collect();
    let fg = class_samples(&colors, trimap, true);
    let bg = class_samples(&colors, trimap, false);
    let mut models = match retained {
        Some(models) => models,
        None => {
            let (Some(foreground), Some(background)) = (Gmm::initial(&fg), Gmm::initial(&bg))
            else {
                return Err(StageError::Algorithm {
                    stage: STAGE,
                    message: format!(
                        "need both foreground and background samples, got {} and {}",
                        fg.len(),
                        bg.len()
                    ),
                });
            };
            ColorModels {
                foreground,
                background,
            }
        }
    };
    let beta = smoothness_beta(&colors, w, h);
    for _ in 0..iterations {
        let fg = class_samples(&colors, trimap, true);
        let bg = class_samples(&colors, trimap, false);
        models = ColorModels {
            foreground: refit(&models.foreground, &fg),
            background: refit(&models.background, &bg),
        };
        cut(&colors, trimap, &models, w, h, beta);
    }
    Ok(models)
}

pub(super) fn grabcut(
    io: &mut StageIo,
    params: &GrabcutParams,
    ctx: &mut StageContext<'_>,
) -> Result<(), StageError> {
    let dims = io.image_dims(STAGE)?;
    let empty = || {
        let shape = io.old_component_mask.as_ref().map_or(dims, Dimensions::of);
        GrayImage::new(shape.width, shape.height)
    };
    if dims.pixel_count() == 0 {
        io.mask = Some(empty());
        return Ok(());
    }
    let Some(mut trimap) = initial_trimap(io, dims) else {
        tracing::debug!("grabcut has no usable seeds");
        io.mask = Some(empty());
        return Ok(());
    };

    let retained = if io.first_run { None } else { ctx.models.take() };
    let image = io.image.as_ref().ok_or(StageError::MissingInput {
        stage: STAGE,
        field: "image",
    })?;
    let models = segment(image, &mut trimap, params.iterations, retained)?;
    *ctx.models = Some(models);

    let (w, h) = (dims.width, dims.height);
    let mask = GrayImage::from_fn(w, h, |x, y| {
        if trimap[(y as usize) * (w as usize) + x as usize].is_foreground() {
            ON
        } else {
            OFF
        }
    });
    io.labels = Some(LabelImage::from_fn(w, h, |x, y| {
        Luma([u32::from(is_on(mask.get_pixel(x, y)))])
    }));
    io.mask = Some(mask);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::geometry::XYVertices;
    use image::Rgb;

    /// Dark square on a bright background.
    fn square_scene() -> RgbImage {
        RgbImage::from_fn(24, 24, |x, y| {
            if (8..16).contains(&x) && (8..16).contains(&y) {
                Rgb([30, 40, 160])
            } else {
                Rgb([220, 210, 40])
            }
        })
    }

    fn run(io: &mut StageIo, models: &mut Option<ColorModels>) -> Result<(), StageError> {
        let mut history = None;
        let mut ctx = StageContext {
            history_cache: &mut history,
            models,
        };
        grabcut(io, &GrabcutParams::default(), &mut ctx)
    }

    #[test]
    fn rectangle_init_recovers_square() {
        let mut io = StageIo {
            image: Some(square_scene()),
            foreground_vertices: XYVertices::from_pairs([(5.0, 5.0), (19.0, 5.0), (19.0, 19.0), (5.0, 19.0)]),
            ..StageIo::default()
        };
        let mut models = None;
        run(&mut io, &mut models).unwrap();
        let mask = io.mask.as_ref().unwrap();
        assert!(is_on(mask.get_pixel(12, 12)));
        assert!(!is_on(mask.get_pixel(6, 6)));
        assert_eq!(crate::mask::count_on(mask), 64);
        assert!(models.is_some());
        assert_eq!(io.labels.as_ref().unwrap().get_pixel(12, 12).0[0], 1);
    }

    #[test]
    fn history_marks_are_respected() {
        let mut history = GrayImage::new(24, 24);
        history.put_pixel(0, 0, HistoryValue::Background.luma());
        history.put_pixel(10, 10, HistoryValue::Foreground.luma());
        let mut old = GrayImage::new(24, 24);
        for y in 6..18 {
            for x in 6..18 {
                old.put_pixel(x, y, ON);
            }
        }
        let mut io = StageIo {
            image: Some(square_scene()),
            history_mask: Some(history),
            old_component_mask: Some(old),
            ..StageIo::default()
        };
        let mut models = None;
        run(&mut io, &mut models).unwrap();
        let mask = io.mask.as_ref().unwrap();
        assert!(is_on(mask.get_pixel(10, 10)));
        assert!(!is_on(mask.get_pixel(0, 0)));
        assert!(!is_on(mask.get_pixel(6, 6)));
    }

    #[test]
    fn degenerate_vertices_give_empty_mask() {
        let mut io = StageIo {
            image: Some(square_scene()),
            foreground_vertices: XYVertices::open(vec![crate::types::Point::new(3.0, 3.0)]),
            ..StageIo::default()
        };
        let mut models = None;
        run(&mut io, &mut models).unwrap();
        assert_eq!(crate::mask::count_on(io.mask.as_ref().unwrap()), 0);
        assert!(models.is_none());
    }

    #[test]
    fn rectangle_covering_everything_fails() {
        let mut io = StageIo {
            image: Some(square_scene()),
            foreground_vertices: XYVertices::from_pairs([(0.0, 0.0), (30.0, 0.0), (30.0, 30.0), (0.0, 30.0)]),
            ..StageIo::default()
        };
        let err = run(&mut io, &mut None).unwrap_err();
        assert!(matches!(err, StageError::Algorithm { .. }));
    }

    #[test]
    fn retained_models_are_reused_after_first_run() {
        let mut io = StageIo {
            image: Some(square_scene()),
            foreground_vertices: XYVertices::from_pairs([(5.0, 5.0), (19.0, 5.0), (19.0, 19.0), (5.0, 19.0)]),
            ..StageIo::default()
        };
        let mut models = None;
        run(&mut io, &mut models).unwrap();
        let first = io.mask.clone();
        io.first_run = false;
        run(&mut io, &mut models).unwrap();
        assert_eq!(io.mask, first);
    }

    #[test]
    fn inverse_of_diagonal_matrix() {
        let (inv, det) = invert(&[[2.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 5.0]]);
        assert!((det - 40.0).abs() < 1e-12);
        assert!((inv[0][0] - 0.5).abs() < 1e-12);
        assert!((inv[1][1] - 0.25).abs() < 1e-12);
        assert!(inv[0][1].abs() < 1e-12);
    }
}
