//! The run wrapper around a user pipeline.
//!
//! [`RegionProcessor`] frames a top-level [`Process`] with the stages every
//! edit needs (format inputs, crop to the area of interest, merge into the
//! old mask, return to full size) and applies the error policy: invalid
//! geometry and configuration always fail, while algorithm failures can be
//! recovered by keeping the previous mask.

use image::{GrayImage, RgbImage};

use crate::cache::{CacheKey, ProcessorCache};
use crate::diagnostics::{Clock, RunDiagnostics, RunSummary, SystemClock};
use crate::geometry::{ComplexXYVertices, XYVertices};
use crate::mask;
use crate::process::{AbortFlag, AtomicProcess, ExecContext, Process, ProcessNode};
use crate::stages::{CropParams, FormatParams, Operation, StageError, StageIo, Summary};
use crate::types::Dimensions;

/// Errors that can occur while running a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The run had no image to work on.
    #[error("no image was given to process")]
    MissingImage,

    /// An input raster does not match the image.
    #[error("{field} is {}x{} but the image is {}x{}", found.width, found.height, expected.width, expected.height)]
    ShapeMismatch {
        /// Which input is misshapen.
        field: &'static str,
        /// Image dimensions.
        expected: Dimensions,
        /// Dimensions of the input.
        found: Dimensions,
    },

    /// A stage failed.
    #[error("stage `{stage}` failed: {source}")]
    Stage {
        /// Name path of the failing stage.
        stage: String,
        /// What went wrong.
        #[source]
        source: StageError,
    },

    /// The abort flag was raised.
    #[error("run aborted before stage `{stage}`")]
    Aborted {
        /// First stage that did not run.
        stage: String,
    },

    /// No stage exists at a name path.
    #[error("no stage at path `{path}`")]
    UnknownStage {
        /// The path, joined with `/`.
        path: String,
    },
}

impl ProcessError {
    /// The failure comes from the vertices given.
    #[must_use]
    pub const fn is_geometry(&self) -> bool {
        matches!(self, Self::Stage { source, .. } if source.is_geometry())
    }

    /// The failure comes from how the run was set up.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingImage | Self::ShapeMismatch { .. } | Self::UnknownStage { .. }
        )
    }
}

/// What to do when an algorithm stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log a warning and return the previous mask unchanged.
    #[default]
    Recover,
    /// Return the error to the caller.
    Strict,
}

/// Inputs of one run.
#[derive(Debug, Clone, Default)]
pub struct RunInput {
    /// The full image.
    pub image: Option<RgbImage>,
    /// Vertices marking what to add.
    pub foreground_vertices: XYVertices,
    /// Vertices marking what to remove.
    pub background_vertices: XYVertices,
    /// Full-size mask of the component being edited; zeros when absent.
    pub old_component_mask: Option<GrayImage>,
    /// Vertices of the component being edited.
    pub prev_component_vertices: ComplexXYVertices,
    /// Corners of the visible area; the whole image when absent.
    pub viewbox: Option<XYVertices>,
}

impl RunInput {
    /// Input with an image and foreground vertices.
    #[must_use]
    pub fn new(image: RgbImage, foreground_vertices: XYVertices) -> Self {
        Self {
            image: Some(image),
            foreground_vertices,
            ..Self::default()
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// The component's new full-size mask.
    pub mask: GrayImage,
    /// Diagnostic images in emission order.
    pub summaries: Vec<Summary>,
    /// Timing and counts per stage.
    pub diagnostics: RunDiagnostics,
    /// Set when a stage failed and the previous mask was returned.
    pub recovered: Option<String>,
}

impl RunOutput {
    /// The mask as component vertices: one component for a local estimate,
    /// otherwise one per outer boundary (with its holes).
    #[must_use]
    pub fn as_vertices(&self, local_estimate: bool) -> Vec<ComplexXYVertices> {
        let all = ComplexXYVertices::from_binary_mask(&self.mask);
        if all.is_empty() {
            return Vec::new();
        }
        if local_estimate {
            vec![all]
        } else {
            all.split_outer()
        }
    }
}

/// Stage names of the fixed framing stages.
pub const FORMAT_STAGE: &str = "Format Vertices";
/// See [`FORMAT_STAGE`].
pub const CROP_STAGE: &str = "Crop To Local Area";
/// See [`FORMAT_STAGE`].
pub const APPLY_STAGE: &str = "Apply Process Result";
/// See [`FORMAT_STAGE`].
pub const RETURN_STAGE: &str = "Return To Full Size";

/// A user pipeline wrapped in the framing stages.
pub struct RegionProcessor {
    process: Process,
    clock: Box<dyn Clock>,
    abort: AbortFlag,
    last: Option<RunOutput>,
}

impl std::fmt::Debug for RegionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionProcessor")
            .field("process", &self.process.name)
            .field("aborted", &self.abort.is_aborted())
            .finish_non_exhaustive()
    }
}

impl RegionProcessor {
    /// Wrap `top` as `[format, crop] + top.stages + [apply, return]`.
    #[must_use]
    pub fn new(top: Process) -> Self {
        Self::with_framing(top, FormatParams::default(), CropParams::default())
    }

    /// Like [`new`](Self::new) with explicit framing parameters.
    #[must_use]
    pub fn with_framing(top: Process, format: FormatParams, crop: CropParams) -> Self {
        let mut stages: Vec<ProcessNode> = vec![
            AtomicProcess::required(FORMAT_STAGE, Operation::FormatVertices(format)).into(),
            AtomicProcess::required(CROP_STAGE, Operation::CropToLocalArea(crop)).into(),
        ];
        stages.extend(top.stages);
        stages.push(AtomicProcess::required(APPLY_STAGE, Operation::ApplyProcessResult).into());
        stages.push(AtomicProcess::required(RETURN_STAGE, Operation::ReturnToFullSize).into());
        Self {
            process: Process {
                name: top.name,
                stages,
                enabled: true,
                allow_disable: false,
            },
            clock: Box::new(SystemClock::new()),
            abort: AbortFlag::new(),
            last: None,
        }
    }

    /// Replace the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Name of the wrapped pipeline.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.process.name
    }

    /// The framed pipeline.
    #[must_use]
    pub const fn process(&self) -> &Process {
        &self.process
    }

    /// The framed pipeline, e.g. to toggle stages.
    pub const fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    /// Handle that aborts the current run at the next stage boundary.
    #[must_use]
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Output of the last successful run.
    #[must_use]
    pub const fn last_output(&self) -> Option<&RunOutput> {
        self.last.as_ref()
    }

    /// Drop colour models and results retained by the stages.
    pub fn reset_state(&mut self) {
        self.process.reset_state();
        self.last = None;
    }

    /// Components from the last output; see [`RunOutput::as_vertices`].
    #[must_use]
    pub fn result_as_vertices(&self, local_estimate: bool) -> Vec<ComplexXYVertices> {
        self.last
            .as_ref()
            .map(|out| out.as_vertices(local_estimate))
            .unwrap_or_default()
    }

    /// Run the framed pipeline with the history stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::MissingImage`] or
    /// [`ProcessError::ShapeMismatch`] for unusable input, a geometry
    /// [`ProcessError::Stage`] error whatever the policy, any stage error
    /// under [`ErrorPolicy::Strict`], and [`ProcessError::Aborted`] when
    /// the abort flag was raised.
    pub fn run(
        &mut self,
        input: RunInput,
        key: CacheKey,
        cache: &mut ProcessorCache,
        policy: ErrorPolicy,
    ) -> Result<RunOutput, ProcessError> {
        let image = input.image.ok_or(ProcessError::MissingImage)?;
        let dims = Dimensions::of(&image);
        let old = match input.old_component_mask {
            Some(m) if Dimensions::of(&m) == dims => m,
            Some(m) => {
                return Err(ProcessError::ShapeMismatch {
                    field: "old_component_mask",
                    expected: dims,
                    found: Dimensions::of(&m),
                });
            }
            None => GrayImage::new(dims.width, dims.height),
        };
        let viewbox = input.viewbox.unwrap_or_else(|| {
            let (w, h) = (f64::from(dims.width), f64::from(dims.height));
            XYVertices::from_pairs([(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)])
        });

        let mut io = StageIo {
            image: Some(image),
            foreground_vertices: input.foreground_vertices,
            background_vertices: input.background_vertices,
            old_component_mask: Some(old.clone()),
            prev_component_vertices: input.prev_component_vertices,
            viewbox,
            first_run: cache.is_first_run(key),
            ..StageIo::default()
        };

        tracing::debug!(pipeline = %self.process.name, ?key, first_run = io.first_run, "starting run");
        let start = self.clock.now();
        let mut stages = Vec::new();
        let outcome = self.process.execute(
            &mut io,
            &mut ExecContext {
                history_cache: cache.slot(key),
                abort: &self.abort,
                clock: self.clock.as_ref(),
                diagnostics: &mut stages,
            },
        );

        let (result, recovered) = match outcome {
            Ok(()) => match io.mask.take() {
                Some(m) if Dimensions::of(&m) == dims => (m, None),
                _ => {
                    return Err(ProcessError::Stage {
                        stage: RETURN_STAGE.to_owned(),
                        source: StageError::MissingInput {
                            stage: "return_to_full_size",
                            field: "mask",
                        },
                    });
                }
            },
            Err(err @ ProcessError::Stage { .. })
                if policy == ErrorPolicy::Recover && !err.is_geometry() =>
            {
                tracing::warn!(error = %err, "stage failed, keeping the previous mask");
                (mask::normalized(&old), Some(err.to_string()))
            }
            Err(err) => return Err(err),
        };

        let diagnostics = RunDiagnostics {
            stages,
            total_duration: self.clock.now().saturating_sub(start),
            summary: RunSummary {
                image_width: dims.width,
                image_height: dims.height,
                bounds: mask::nonzero_bounds(&result),
                resize_ratio: io.resize_ratio,
                result_pixels: mask::count_on(&result),
            },
        };
        let output = RunOutput {
            mask: result,
            summaries: io.summaries,
            diagnostics,
            recovered,
        };
        self.last = Some(output.clone());
        Ok(output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::geometry::GeometryError;
    use crate::stages::{BinarizeParams, KMeansParams};
    use image::Rgb;

    fn square() -> XYVertices {
        XYVertices::from_pairs([(5.0, 5.0), (14.0, 5.0), (14.0, 14.0), (5.0, 14.0)])
    }

    fn draw_pipeline() -> Process {
        Process::new("Basic Shapes").with_stage(AtomicProcess::new("Draw Vertices", Operation::DrawVertices))
    }

    #[test]
    fn framing_stages_wrap_the_pipeline() {
        let p = RegionProcessor::new(draw_pipeline());
        let names: Vec<_> = p.process().stages.iter().map(ProcessNode::name).collect();
        assert_eq!(
            names,
            [FORMAT_STAGE, CROP_STAGE, "Draw Vertices", APPLY_STAGE, RETURN_STAGE]
        );
        assert!(!p.process().stages[0].allow_disable());
        assert!(p.process().stages[2].allow_disable());
    }

    #[test]
    fn draw_vertices_run_produces_full_size_mask() {
        let mut p = RegionProcessor::new(draw_pipeline());
        let mut cache = ProcessorCache::new();
        let out = p
            .run(
                RunInput::new(RgbImage::new(30, 20), square()),
                CacheKey::Unassigned,
                &mut cache,
                ErrorPolicy::Strict,
            )
            .unwrap();
        assert_eq!(out.mask.dimensions(), (30, 20));
        assert_eq!(mask::count_on(&out.mask), 100);
        assert!(out.recovered.is_none());
        assert!(out.summaries.iter().any(|s| s.name == "Finalize Region"));
        assert_eq!(out.diagnostics.stages.len(), 5);
        assert!(!cache.is_first_run(CacheKey::Unassigned));
        assert_eq!(p.result_as_vertices(true).len(), 1);
    }

    #[test]
    fn missing_image_is_a_configuration_error() {
        let mut p = RegionProcessor::new(draw_pipeline());
        let err = p
            .run(RunInput::default(), CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Recover)
            .unwrap_err();
        assert!(matches!(err, ProcessError::MissingImage));
        assert!(err.is_configuration());
    }

    #[test]
    fn misshapen_old_mask_is_rejected() {
        let mut p = RegionProcessor::new(draw_pipeline());
        let input = RunInput {
            old_component_mask: Some(GrayImage::new(3, 3)),
            ..RunInput::new(RgbImage::new(8, 8), square())
        };
        let err = p
            .run(input, CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Recover)
            .unwrap_err();
        assert!(matches!(err, ProcessError::ShapeMismatch { .. }));
    }

    fn failing_pipeline() -> Process {
        // Binarizing without a label image fails inside the algorithm part.
        Process::new("Broken").with_stage(AtomicProcess::new(
            "Binarize",
            Operation::BinarizeLabels(BinarizeParams::default()),
        ))
    }

    #[test]
    fn recover_policy_keeps_previous_mask() {
        let mut old = GrayImage::new(10, 10);
        old.put_pixel(3, 3, image::Luma([255]));
        let input = RunInput {
            old_component_mask: Some(old.clone()),
            ..RunInput::new(RgbImage::new(10, 10), square())
        };
        let mut p = RegionProcessor::new(failing_pipeline());
        let out = p
            .run(input.clone(), CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Recover)
            .unwrap();
        assert_eq!(out.mask, old);
        assert!(out.recovered.unwrap().contains("Binarize"));

        let err = p
            .run(input, CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Strict)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Stage { .. }));
    }

    #[test]
    fn geometry_errors_propagate_under_recover() {
        let top = Process::new("Paint").with_stage(AtomicProcess::new("No Paint", Operation::DisallowPaintTool));
        let mut p = RegionProcessor::new(top);
        let input = RunInput::new(RgbImage::new(10, 10), XYVertices::open(vec![crate::types::Point::new(2.0, 2.0)]));
        let err = p
            .run(input, CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Recover)
            .unwrap_err();
        assert!(err.is_geometry());
        assert!(matches!(
            err,
            ProcessError::Stage { source: StageError::Geometry(GeometryError::TooFewVertices { .. }), .. }
        ));
    }

    #[test]
    fn abort_flag_stops_the_run() {
        let mut p = RegionProcessor::new(draw_pipeline());
        p.abort_flag().abort();
        let err = p
            .run(
                RunInput::new(RgbImage::new(10, 10), square()),
                CacheKey::Unassigned,
                &mut ProcessorCache::new(),
                ErrorPolicy::Recover,
            )
            .unwrap_err();
        assert!(matches!(err, ProcessError::Aborted { .. }));
    }

    #[test]
    fn separate_results_become_separate_components() {
        let top = Process::new("Clusters")
            .with_stage(AtomicProcess::new("K Means", Operation::KMeans(KMeansParams { k: 2, attempts: 2 })))
            .with_stage(AtomicProcess::new(
                "Binarize",
                Operation::BinarizeLabels(BinarizeParams {
                    touching_roi_only: false,
                    ..BinarizeParams::default()
                }),
            ));
        let image = RgbImage::from_fn(20, 10, |x, _| {
            if (2..6).contains(&x) || (12..16).contains(&x) {
                Rgb([250, 250, 250])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let input = RunInput {
            viewbox: None,
            ..RunInput::new(image, XYVertices::open(vec![crate::types::Point::new(3.0, 3.0)]))
        };
        let mut p = RegionProcessor::new(top);
        let out = p
            .run(input, CacheKey::Unassigned, &mut ProcessorCache::new(), ErrorPolicy::Strict)
            .unwrap();
        assert_eq!(out.as_vertices(false).len(), 2);
        assert_eq!(out.as_vertices(true).len(), 1);
    }
}
