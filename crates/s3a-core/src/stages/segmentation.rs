//! Colour segmentation into label images: k-means and quickshift.

use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::stages::{StageError, StageIo};
use crate::types::LabelImage;

/// Hyperparameters for [`Operation::KMeans`](crate::stages::Operation::KMeans).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansParams {
    /// Number of clusters.
    pub k: u32,
    /// Independent initializations; the most compact result wins.
    pub attempts: u32,
}

impl KMeansParams {
    /// Lloyd iterations per attempt.
    pub const MAX_ITERATIONS: usize = 10;
    /// Stop an attempt once no centre moves further than this.
    pub const CENTER_EPSILON: f64 = 1.0;
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self { k: 5, attempts: 10 }
    }
}

/// Hyperparameters for [`Operation::Quickshift`](crate::stages::Operation::Quickshift).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickshiftParams {
    /// Weight of colour distance against spatial distance.
    pub ratio: f64,
    /// Gaussian kernel width for the density estimate.
    pub kernel_size: f64,
    /// Links longer than this start a new segment. Zero skips segmentation
    /// and labels by mean intensity.
    pub max_dist: f64,
    /// Pre-smoothing width; zero disables it.
    pub sigma: f64,
}

impl Default for QuickshiftParams {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            kernel_size: 5.0,
            max_dist: 10.0,
            sigma: 0.0,
        }
    }
}

pub(super) type Color = [f64; 3];

pub(super) fn squared_distance(a: &Color, b: &Color) -> f64 {
    (a[0] - b[0]).mul_add(
        a[0] - b[0],
        (a[1] - b[1]).mul_add(a[1] - b[1], (a[2] - b[2]) * (a[2] - b[2])),
    )
}

/// Result of one k-means attempt.
struct Clustering {
    labels: Vec<u32>,
    compactness: f64,
}

fn nearest(centers: &[Color], color: &Color) -> (usize, f64) {
    centers
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_distance(c, color)))
        .fold((0, f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best })
}

fn lloyd(colors: &[Color], mut centers: Vec<Color>) -> Clustering {
    let mut labels = vec![0_u32; colors.len()];
    for _ in 0..KMeansParams::MAX_ITERATIONS {
        for (label, color) in labels.iter_mut().zip(colors) {
            *label = nearest(&centers, color).0 as u32;
        }
        let mut sums = vec![([0.0; 3], 0_u64); centers.len()];
        for (label, color) in labels.iter().zip(colors) {
            let entry = &mut sums[*label as usize];
            for c in 0..3 {
                entry.0[c] += color[c];
            }
            entry.1 += 1;
        }
        let mut shift: f64 = 0.0;
        for (center, (sum, n)) in centers.iter_mut().zip(&sums) {
            if *n == 0 {
                continue;
            }
            let updated = [
                sum[0] / *n as f64,
                sum[1] / *n as f64,
                sum[2] / *n as f64,
            ];
            shift = shift.max(squared_distance(center, &updated).sqrt());
            *center = updated;
        }
        if shift <= KMeansParams::CENTER_EPSILON {
            break;
        }
    }
    let mut compactness = 0.0;
    for (label, color) in labels.iter_mut().zip(colors) {
        let (best, d) = nearest(&centers, color);
        *label = best as u32;
        compactness += d;
    }
    Clustering {
        labels,
        compactness,
    }
}

/// Cluster pixel colours; returns one label per pixel in row-major order.
#[must_use]
pub fn k_means_labels(image: &RgbImage, k: u32, attempts: u32) -> Vec<u32> {
    let colors: Vec<Color> = image
        .pixels()
        .map(|p| [f64::from(p.0[0]), f64::from(p.0[1]), f64::from(p.0[2])])
        .collect();
    cluster_colors(&colors, k as usize, attempts)
}

/// Lloyd k-means over `colors`, keeping the most compact of `attempts`
/// runs.
///
/// Initial centres are taken at evenly spaced luminance quantiles, shifted
/// a little for each attempt, so results are reproducible.
pub(super) fn cluster_colors(colors: &[Color], k: usize, attempts: u32) -> Vec<u32> {
    if colors.is_empty() {
        return Vec::new();
    }
    let k = k.clamp(1, colors.len());
    let attempts = attempts.max(1);

    let luma = |c: &Color| c[0].mul_add(0.299, c[1].mul_add(0.587, c[2] * 0.114));
    let mut by_luma: Vec<usize> = (0..colors.len()).collect();
    by_luma.sort_by(|&a, &b| luma(&colors[a]).total_cmp(&luma(&colors[b])).then(a.cmp(&b)));

    let last = (colors.len() - 1) as f64;
    (0..attempts)
        .map(|attempt| {
            let offset = f64::from(attempt + 1) / f64::from(attempts + 1);
            let centers = (0..k)
                .map(|j| {
                    let q = (j as f64 + offset) / k as f64;
                    colors[by_luma[(q * last).round() as usize]]
                })
                .collect();
            lloyd(colors, centers)
        })
        .fold(None::<Clustering>, |best, cur| match best {
            Some(b) if b.compactness <= cur.compactness => Some(b),
            _ => Some(cur),
        })
        .map(|c| c.labels)
        .unwrap_or_default()
}

pub(super) fn k_means(io: &mut StageIo, params: &KMeansParams) -> Result<(), StageError> {
    let Some(image) = io.image.as_ref() else {
        return Err(StageError::MissingInput {
            stage: "k_means",
            field: "image",
        });
    };
    if params.k == 0 {
        return Err(StageError::Algorithm {
            stage: "k_means",
            message: "k must be at least 1".to_owned(),
        });
    }
    let labels = k_means_labels(image, params.k, params.attempts);
    io.labels = LabelImage::from_raw(image.width(), image.height(), labels);
    Ok(())
}

/// sRGB to CIE L*a*b* (D65).
fn rgb_to_lab(rgb: [u8; 3]) -> Color {
    let linear = |c: u8| {
        let c = f64::from(c) / 255.0;
        if c <= 0.040_45 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    let (r, g, b) = (linear(rgb[0]), linear(rgb[1]), linear(rgb[2]));
    let x = (0.180_423_f64).mul_add(b, 0.412_453_f64.mul_add(r, 0.357_580 * g)) / 0.950_456;
    let y = (0.072_169_f64).mul_add(b, 0.212_671_f64.mul_add(r, 0.715_160 * g));
    let z = (0.950_227_f64).mul_add(b, 0.019_334_f64.mul_add(r, 0.119_193 * g)) / 1.088_754;
    let f = |t: f64| {
        if t > 0.008_856 {
            t.cbrt()
        } else {
            7.787_f64.mul_add(t, 16.0 / 116.0)
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    [116.0_f64.mul_add(fy, -16.0), 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// Gaussian pre-smoothing, one channel at a time.
fn smooth(image: &RgbImage, sigma: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    let channels: [GrayImage; 3] = std::array::from_fn(|c| {
        let channel = GrayImage::from_fn(w, h, |x, y| Luma([image.get_pixel(x, y).0[c]]));
        imageproc::filter::gaussian_blur_f32(&channel, sigma)
    });
    RgbImage::from_fn(w, h, |x, y| {
        image::Rgb(std::array::from_fn(|c| channels[c].get_pixel(x, y).0[0]))
    })
}

/// Quickshift mode seeking; returns one label per pixel in row-major
/// order.
///
/// Each pixel links to its nearest neighbour (within three kernel widths)
/// of higher density, ties broken by pixel index. Links longer than
/// `max_dist` are cut, and every tree becomes one segment.
#[must_use]
pub fn quickshift_labels(image: &RgbImage, params: &QuickshiftParams) -> Vec<u32> {
    let (w, h) = image.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    if wu == 0 || hu == 0 {
        return Vec::new();
    }
    let source = if params.sigma > 0.0 {
        smooth(image, params.sigma as f32)
    } else {
        image.clone()
    };
    let features: Vec<Color> = source
        .pixels()
        .map(|p| {
            let lab = rgb_to_lab(p.0);
            [lab[0] * params.ratio, lab[1] * params.ratio, lab[2] * params.ratio]
        })
        .collect();

    let kernel_size = params.kernel_size.max(f64::MIN_POSITIVE);
    let inv_kernel = -0.5 / (kernel_size * kernel_size);
    let window = (3.0 * kernel_size).ceil() as usize;
    let dist = |i: usize, j: usize| {
        let (ri, ci) = (i / wu, i % wu);
        let (rj, cj) = (j / wu, j % wu);
        let dr = ri as f64 - rj as f64;
        let dc = ci as f64 - cj as f64;
        squared_distance(&features[i], &features[j]) + dr.mul_add(dr, dc * dc)
    };
    let neighbours = |i: usize| {
        let (r, c) = (i / wu, i % wu);
        let rows = r.saturating_sub(window)..(r + window + 1).min(hu);
        let cols = c.saturating_sub(window)..(c + window + 1).min(wu);
        rows.flat_map(move |rr| cols.clone().map(move |cc| rr * wu + cc))
    };

    let density: Vec<f64> = (0..features.len())
        .map(|i| neighbours(i).map(|j| (dist(i, j) * inv_kernel).exp()).sum())
        .collect();
    let higher = |i: usize, j: usize| density[j] > density[i] || (density[j] == density[i] && j > i);

    let mut parent: Vec<usize> = (0..features.len())
        .map(|i| {
            let mut closest = f64::INFINITY;
            let mut link = i;
            for j in neighbours(i) {
                if higher(i, j) {
                    let d = dist(i, j);
                    if d < closest {
                        closest = d;
                        link = j;
                    }
                }
            }
            if closest.sqrt() > params.max_dist { i } else { link }
        })
        .collect();

    // Path-halving until every pixel points at its root.
    loop {
        let mut changed = false;
        for i in 0..parent.len() {
            let grand = parent[parent[i]];
            if grand != parent[i] {
                parent[i] = grand;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut root_label = vec![u32::MAX; parent.len()];
    let mut next = 0;
    parent
        .iter()
        .map(|&root| {
            if root_label[root] == u32::MAX {
                root_label[root] = next;
                next += 1;
            }
            root_label[root]
        })
        .collect()
}

pub(super) fn quickshift(io: &mut StageIo, params: &QuickshiftParams) -> Result<(), StageError> {
    let Some(image) = io.image.as_ref() else {
        return Err(StageError::MissingInput {
            stage: "quickshift",
            field: "image",
        });
    };
    if params.kernel_size < 1.0 {
        return Err(StageError::Algorithm {
            stage: "quickshift",
            message: format!("kernel size must be at least 1, got {}", params.kernel_size),
        });
    }
    let labels = if params.max_dist == 0.0 {
        image
            .pixels()
            .map(|p| (u32::from(p.0[0]) + u32::from(p.0[1]) + u32::from(p.0[2])) / 3)
            .collect()
    } else {
        quickshift_labels(image, params)
    };
    io.labels = LabelImage::from_raw(image.width(), image.height(), labels);
    Ok(())
}
