//! Run diagnostics: per-stage timing, skip flags, and result counts.
//!
//! Every [`RegionProcessor::run`](crate::RegionProcessor::run) collects
//! diagnostics alongside its result. Timestamps come from a [`Clock`] so
//! tests can substitute a deterministic one.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::types::Bounds;

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Monotonic time source.
pub trait Clock: Send {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall-clock [`Clock`] backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// A clock whose origin is the moment of creation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Counts taken from the stage output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    /// On pixels in the mask after the stage, if there is one.
    pub mask_pixels: Option<u64>,
    /// Distinct labels in the label image after the stage, if there is one.
    pub label_count: Option<usize>,
    /// Summary images the stage emitted.
    pub summaries: usize,
}

/// Diagnostics for a single executed (or skipped) stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Stage name, with enclosing pipeline names joined by `/`.
    pub name: String,
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// The stage was disabled and its input forwarded unchanged.
    pub skipped: bool,
    /// Output counts; default for skipped stages.
    pub metrics: StageMetrics,
}

/// High-level summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Full image width in pixels.
    pub image_width: u32,
    /// Full image height in pixels.
    pub image_height: u32,
    /// Bounding box of the on pixels in the returned mask.
    pub bounds: Option<Bounds>,
    /// Scale applied inside the window.
    pub resize_ratio: f64,
    /// On pixels in the returned full-size mask.
    pub result_pixels: u64,
}

/// Diagnostics collected from a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// Stages in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts.
    pub summary: RunSummary,
}

impl RunDiagnostics {
    /// Stages that actually ran.
    pub fn executed(&self) -> impl Iterator<Item = &StageDiagnostics> {
        self.stages.iter().filter(|s| !s.skipped)
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Region Processing Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{}  |  Resize ratio: {:.3}",
            self.summary.image_width, self.summary.image_height, self.summary.resize_ratio,
        ));
        if let Some(b) = self.summary.bounds {
            lines.push(format!("Result bounds: x {}..{}  y {}..{}", b.x0, b.x1, b.y0, b.y1));
        }
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<40} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);
        for stage in &self.stages {
            if stage.skipped {
                lines.push(format!("{:<40} {:>10} {:>10}  skipped", stage.name, "-", "-"));
                continue;
            }
            let ms = duration_ms(stage.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&stage.metrics);
            lines.push(format!("{:<40} {ms:>8.3}ms {pct:>9.1}%  {details}", stage.name));
        }

        lines.push(String::new());
        lines.push(format!("Result pixels: {}", self.summary.result_pixels));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    let mut parts = Vec::new();
    if let Some(n) = metrics.mask_pixels {
        parts.push(format!("mask={n}px"));
    }
    if let Some(n) = metrics.label_count {
        parts.push(format!("labels={n}"));
    }
    if metrics.summaries > 0 {
        parts.push(format!("summaries={}", metrics.summaries));
    }
    parts.join(" ")
}

/// Number of distinct values in a label image.
pub(crate) fn distinct_labels(labels: &crate::types::LabelImage) -> usize {
    let mut values: Vec<u32> = labels.pixels().map(|p| p.0[0]).collect();
    values.sort_unstable();
    values.dedup();
    values.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn stage(name: &str, ms: u64, skipped: bool) -> StageDiagnostics {
        StageDiagnostics {
            name: name.to_owned(),
            duration: Duration::from_millis(ms),
            skipped,
            metrics: StageMetrics {
                mask_pixels: (!skipped).then_some(42),
                label_count: None,
                summaries: 0,
            },
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let ms = duration_ms(Duration::from_millis(1234));
        assert!((ms - 1234.0).abs() < 0.01);
    }

    #[test]
    fn report_lists_every_stage() {
        let diag = RunDiagnostics {
            stages: vec![
                stage("Format Vertices", 2, false),
                stage("Cv Grabcut/Opening", 0, true),
                stage("Return To Full Size", 3, false),
            ],
            total_duration: Duration::from_millis(5),
            summary: RunSummary {
                image_width: 64,
                image_height: 48,
                bounds: Some(Bounds::new(1, 2, 30, 40)),
                resize_ratio: 1.0,
                result_pixels: 42,
            },
        };
        let report = diag.report();
        assert!(report.contains("Region Processing Report"));
        assert!(report.contains("Cv Grabcut/Opening"));
        assert!(report.contains("skipped"));
        assert!(report.contains("mask=42px"));
        assert_eq!(diag.executed().count(), 2);
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(stage("a", 1500, false)).unwrap();
        assert!((json["duration"].as_f64().unwrap() - 1.5).abs() < 1e-9);
        let back: StageDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.duration, Duration::from_millis(1500));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let json = serde_json::json!({
            "name": "x", "duration": -1.0, "skipped": false,
            "metrics": { "mask_pixels": null, "label_count": null, "summaries": 0 }
        });
        assert!(serde_json::from_value::<StageDiagnostics>(json).is_err());
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
