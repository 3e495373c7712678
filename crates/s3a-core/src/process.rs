//! Named stages, nested pipelines, and the executor that runs them.
//!
//! A [`Process`] is a linear chain of [`ProcessNode`]s, each either a
//! single [`AtomicProcess`] or a nested [`Process`]. The executor walks the
//! chain in order, forwarding [`StageIo`] unchanged past disabled nodes,
//! timing every stage, and checking an [`AbortFlag`] between stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::diagnostics::{Clock, StageDiagnostics, StageMetrics, distinct_labels};
use crate::processor::ProcessError;
use crate::stages::{ColorModels, Operation, StageContext, StageIo, Summary};

/// Cooperative cancellation shared between a run and its controller.
///
/// Runs check the flag before each stage; a stage already executing
/// finishes first.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    /// A flag that is not raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the current run stop at the next stage boundary.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Lower the flag for the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One stage: an [`Operation`] plus its switches and retained state.
#[derive(Debug, Clone)]
pub struct AtomicProcess {
    /// Display name, unique within its namespace.
    pub name: String,
    /// What the stage does, with its hyperparameters.
    pub operation: Operation,
    /// Disabled stages are skipped when `allow_disable` is set.
    pub enabled: bool,
    /// Whether `enabled = false` is honoured.
    pub allow_disable: bool,
    carry: Option<ColorModels>,
    result: Vec<Summary>,
}

impl AtomicProcess {
    /// An enabled, disableable stage.
    #[must_use]
    pub fn new(name: impl Into<String>, operation: Operation) -> Self {
        Self {
            name: name.into(),
            operation,
            enabled: true,
            allow_disable: true,
            carry: None,
            result: Vec::new(),
        }
    }

    /// A stage that always runs.
    #[must_use]
    pub fn required(name: impl Into<String>, operation: Operation) -> Self {
        Self {
            allow_disable: false,
            ..Self::new(name, operation)
        }
    }

    /// Builder-style `enabled` setter.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Summaries produced by the last run of this stage.
    #[must_use]
    pub fn result(&self) -> &[Summary] {
        &self.result
    }

    /// Whether colour models from an earlier run are retained.
    #[must_use]
    pub const fn has_retained_state(&self) -> bool {
        self.carry.is_some()
    }

    /// A copy with the same definition and no retained state or results.
    #[must_use]
    pub fn fresh(&self) -> Self {
        Self {
            name: self.name.clone(),
            operation: self.operation.clone(),
            enabled: self.enabled,
            allow_disable: self.allow_disable,
            carry: None,
            result: Vec::new(),
        }
    }

    /// Equal name, operation, and switches; retained state is ignored.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.name == other.name
            && self.operation == other.operation
            && self.enabled == other.enabled
            && self.allow_disable == other.allow_disable
    }

    fn reset_state(&mut self) {
        self.carry = None;
        self.result.clear();
    }
}

/// A linear chain of stages and sub-pipelines.
#[derive(Debug, Clone)]
pub struct Process {
    /// Display name, unique within its namespace.
    pub name: String,
    /// Children in execution order.
    pub stages: Vec<ProcessNode>,
    /// Disabled pipelines are skipped when `allow_disable` is set.
    pub enabled: bool,
    /// Whether `enabled = false` is honoured.
    pub allow_disable: bool,
}

/// Either kind of pipeline element.
#[derive(Debug, Clone)]
pub enum ProcessNode {
    /// A single stage.
    Atomic(AtomicProcess),
    /// A nested pipeline.
    Pipeline(Process),
}

impl From<AtomicProcess> for ProcessNode {
    fn from(p: AtomicProcess) -> Self {
        Self::Atomic(p)
    }
}

impl From<Process> for ProcessNode {
    fn from(p: Process) -> Self {
        Self::Pipeline(p)
    }
}

impl ProcessNode {
    /// Name of the stage or pipeline.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Atomic(p) => &p.name,
            Self::Pipeline(p) => &p.name,
        }
    }

    /// Whether the node is enabled.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        match self {
            Self::Atomic(p) => p.enabled,
            Self::Pipeline(p) => p.enabled,
        }
    }

    /// Whether the node may be disabled.
    #[must_use]
    pub const fn allow_disable(&self) -> bool {
        match self {
            Self::Atomic(p) => p.allow_disable,
            Self::Pipeline(p) => p.allow_disable,
        }
    }

    /// Set the enabled flag.
    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            Self::Atomic(p) => p.enabled = enabled,
            Self::Pipeline(p) => p.enabled = enabled,
        }
    }

    const fn is_skipped(&self) -> bool {
        !self.enabled() && self.allow_disable()
    }

    /// A copy with no retained state anywhere inside.
    #[must_use]
    pub fn fresh(&self) -> Self {
        match self {
            Self::Atomic(p) => Self::Atomic(p.fresh()),
            Self::Pipeline(p) => Self::Pipeline(p.fresh()),
        }
    }

    /// Drop retained models and results.
    pub fn reset_state(&mut self) {
        match self {
            Self::Atomic(p) => p.reset_state(),
            Self::Pipeline(p) => p.reset_state(),
        }
    }
}

/// Everything a run needs besides the data flowing through it.
pub struct ExecContext<'a> {
    /// History mask remembered for the cache key of this run.
    pub history_cache: &'a mut Option<GrayImage>,
    /// Checked before every stage.
    pub abort: &'a AbortFlag,
    /// Time source for stage durations.
    pub clock: &'a dyn Clock,
    /// Receives one entry per visited stage.
    pub diagnostics: &'a mut Vec<StageDiagnostics>,
}

impl Process {
    /// An empty, enabled, disableable pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            enabled: true,
            allow_disable: true,
        }
    }

    /// Builder-style append.
    #[must_use]
    pub fn with_stage(mut self, node: impl Into<ProcessNode>) -> Self {
        self.stages.push(node.into());
        self
    }

    /// Append a stage or sub-pipeline.
    pub fn push(&mut self, node: impl Into<ProcessNode>) {
        self.stages.push(node.into());
    }

    /// A copy with no retained state anywhere inside.
    #[must_use]
    pub fn fresh(&self) -> Self {
        Self {
            name: self.name.clone(),
            stages: self.stages.iter().map(ProcessNode::fresh).collect(),
            enabled: self.enabled,
            allow_disable: self.allow_disable,
        }
    }

    /// Drop retained models and results in every stage.
    pub fn reset_state(&mut self) {
        for node in &mut self.stages {
            node.reset_state();
        }
    }

    /// The node at a name path, e.g. `["Basic Region Operations", "Opening"]`.
    #[must_use]
    pub fn find(&self, path: &[&str]) -> Option<&ProcessNode> {
        let (first, rest) = path.split_first()?;
        let node = self.stages.iter().find(|n| n.name() == *first)?;
        match (rest.is_empty(), node) {
            (true, _) => Some(node),
            (false, ProcessNode::Pipeline(p)) => p.find(rest),
            (false, ProcessNode::Atomic(_)) => None,
        }
    }

    fn find_mut(&mut self, path: &[&str]) -> Option<&mut ProcessNode> {
        let (first, rest) = path.split_first()?;
        let node = self.stages.iter_mut().find(|n| n.name() == *first)?;
        if rest.is_empty() {
            return Some(node);
        }
        match node {
            ProcessNode::Pipeline(p) => p.find_mut(rest),
            ProcessNode::Atomic(_) => None,
        }
    }

    /// Toggle the nested stage at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::UnknownStage`] if no node has that path.
    pub fn set_stage_enabled(&mut self, path: &[&str], enabled: bool) -> Result<(), ProcessError> {
        let node = self.find_mut(path).ok_or_else(|| ProcessError::UnknownStage {
            path: path.join("/"),
        })?;
        node.set_enabled(enabled);
        Ok(())
    }

    /// Every atomic stage, depth first, with its name path.
    #[must_use]
    pub fn stage_paths(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        for node in &self.stages {
            match node {
                ProcessNode::Atomic(p) => out.push(vec![p.name.clone()]),
                ProcessNode::Pipeline(p) => {
                    for mut sub in p.stage_paths() {
                        sub.insert(0, p.name.clone());
                        out.push(sub);
                    }
                }
            }
        }
        out
    }

    /// Run the chain on `io`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError::Aborted`] if the abort flag was raised before
    /// a stage, or [`ProcessError::Stage`] with the failing stage's path.
    pub fn execute(&mut self, io: &mut StageIo, ctx: &mut ExecContext<'_>) -> Result<(), ProcessError> {
        self.execute_under("", io, ctx)
    }

    fn execute_under(
        &mut self,
        prefix: &str,
        io: &mut StageIo,
        ctx: &mut ExecContext<'_>,
    ) -> Result<(), ProcessError> {
        for node in &mut self.stages {
            let path = if prefix.is_empty() {
                node.name().to_owned()
            } else {
                format!("{prefix}/{}", node.name())
            };
            if node.is_skipped() {
                tracing::debug!(stage = %path, "stage disabled, forwarding input");
                ctx.diagnostics.push(StageDiagnostics {
                    name: path,
                    duration: std::time::Duration::ZERO,
                    skipped: true,
                    metrics: StageMetrics::default(),
                });
                continue;
            }
            match node {
                ProcessNode::Pipeline(p) => p.execute_under(&path, io, ctx)?,
                ProcessNode::Atomic(p) => run_atomic(p, path, io, ctx)?,
            }
        }
        Ok(())
    }
}

fn run_atomic(
    stage: &mut AtomicProcess,
    path: String,
    io: &mut StageIo,
    ctx: &mut ExecContext<'_>,
) -> Result<(), ProcessError> {
    if ctx.abort.is_aborted() {
        tracing::debug!(stage = %path, "run aborted");
        return Err(ProcessError::Aborted { stage: path });
    }
    tracing::debug!(stage = %path, kind = stage.operation.kind_name(), "running stage");
    let start = ctx.clock.now();
    let emitted_before = io.summaries.len();
    let mut stage_ctx = StageContext {
        history_cache: ctx.history_cache,
        models: &mut stage.carry,
    };
    if let Err(source) = stage.operation.apply(io, &mut stage_ctx) {
        return Err(ProcessError::Stage {
            stage: path,
            source,
        });
    }
    let duration = ctx.clock.now().saturating_sub(start);
    stage.result = io.summaries[emitted_before..].to_vec();
    ctx.diagnostics.push(StageDiagnostics {
        name: path,
        duration,
        skipped: false,
        metrics: StageMetrics {
            mask_pixels: io.mask.as_ref().map(crate::mask::count_on),
            label_count: io.labels.as_ref().map(distinct_labels),
            summaries: stage.result.len(),
        },
    });
    Ok(())
}

/// Serialized form of a stage inside a saved pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicSpec {
    /// Stage name.
    pub name: String,
    /// Operation and hyperparameters.
    pub operation: Operation,
    /// Enabled flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the stage may be disabled.
    #[serde(default = "default_true")]
    pub allow_disable: bool,
}

const fn default_true() -> bool {
    true
}

impl From<&AtomicProcess> for AtomicSpec {
    fn from(p: &AtomicProcess) -> Self {
        Self {
            name: p.name.clone(),
            operation: p.operation.clone(),
            enabled: p.enabled,
            allow_disable: p.allow_disable,
        }
    }
}

impl From<AtomicSpec> for AtomicProcess {
    fn from(spec: AtomicSpec) -> Self {
        Self {
            enabled: spec.enabled,
            allow_disable: spec.allow_disable,
            ..Self::new(spec.name, spec.operation)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stages::{MorphologyParams, RemoveSmallParams};
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Advances one millisecond per reading.
    struct StepClock(AtomicU64);

    impl Clock for StepClock {
        fn now(&self) -> Duration {
            Duration::from_millis(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn square_io() -> StageIo {
        let mut mask = GrayImage::new(10, 10);
        for y in 2..8 {
            for x in 2..8 {
                mask.put_pixel(x, y, image::Luma([255]));
            }
        }
        mask.put_pixel(0, 9, image::Luma([255]));
        StageIo {
            image: Some(image::RgbImage::new(10, 10)),
            mask: Some(mask),
            ..StageIo::default()
        }
    }

    fn pipeline() -> Process {
        Process::new("Cleanup")
            .with_stage(AtomicProcess::new(
                "Remove Small",
                Operation::RemoveSmallComponents(RemoveSmallParams { size_threshold: 5 }),
            ))
            .with_stage(
                Process::new("Basic Region Operations")
                    .with_stage(AtomicProcess::new(
                        "Opening",
                        Operation::Morphology(MorphologyParams::OPENING),
                    ))
                    .with_stage(AtomicProcess::new("Fill Holes", Operation::FillHoles)),
            )
    }

    fn run(process: &mut Process, io: &mut StageIo, abort: &AbortFlag) -> (Result<(), ProcessError>, Vec<StageDiagnostics>) {
        let clock = StepClock(AtomicU64::new(0));
        let mut history = None;
        let mut diagnostics = Vec::new();
        let mut ctx = ExecContext {
            history_cache: &mut history,
            abort,
            clock: &clock,
            diagnostics: &mut diagnostics,
        };
        let result = process.execute(io, &mut ctx);
        (result, diagnostics)
    }

    #[test]
    fn runs_nested_stages_in_order() {
        let mut p = pipeline();
        let mut io = square_io();
        let (result, diag) = run(&mut p, &mut io, &AbortFlag::new());
        result.unwrap();
        let names: Vec<_> = diag.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            ["Remove Small", "Basic Region Operations/Opening", "Basic Region Operations/Fill Holes"]
        );
        assert!(diag.iter().all(|d| d.duration == Duration::from_millis(1)));
        assert_eq!(crate::mask::count_on(io.mask.as_ref().unwrap()), 36);
    }

    #[test]
    fn disabled_stage_forwards_input() {
        let mut p = pipeline();
        p.set_stage_enabled(&["Remove Small"], false).unwrap();
        p.set_stage_enabled(&["Basic Region Operations"], false).unwrap();
        let mut io = square_io();
        let before = io.mask.clone();
        let (result, diag) = run(&mut p, &mut io, &AbortFlag::new());
        result.unwrap();
        assert_eq!(io.mask, before);
        assert!(diag.iter().all(|d| d.skipped));
        assert_eq!(diag.len(), 2);
    }

    #[test]
    fn required_stage_ignores_enabled_flag() {
        let mut p = Process::new("p").with_stage(
            AtomicProcess::required(
                "Remove Small",
                Operation::RemoveSmallComponents(RemoveSmallParams { size_threshold: 5 }),
            )
            .with_enabled(false),
        );
        let mut io = square_io();
        run(&mut p, &mut io, &AbortFlag::new()).0.unwrap();
        assert_eq!(crate::mask::count_on(io.mask.as_ref().unwrap()), 36);
    }

    #[test]
    fn abort_stops_before_next_stage() {
        let mut p = pipeline();
        let abort = AbortFlag::new();
        abort.abort();
        let mut io = square_io();
        let (result, diag) = run(&mut p, &mut io, &abort);
        assert!(matches!(result, Err(ProcessError::Aborted { ref stage }) if stage == "Remove Small"));
        assert!(diag.is_empty());
        abort.reset();
        assert!(!abort.is_aborted());
    }

    #[test]
    fn unknown_path_is_reported() {
        let mut p = pipeline();
        let err = p.set_stage_enabled(&["Basic Region Operations", "Nope"], false).unwrap_err();
        assert!(err.to_string().contains("Basic Region Operations/Nope"));
        assert!(p.find(&["Basic Region Operations", "Opening"]).is_some());
        assert!(p.find(&["Remove Small", "Opening"]).is_none());
    }

    #[test]
    fn stage_failure_names_the_path() {
        let mut p = Process::new("p").with_stage(AtomicProcess::new("Bin", Operation::BinarizeLabels(Default::default())));
        let mut io = square_io();
        let (result, _) = run(&mut p, &mut io, &AbortFlag::new());
        assert!(matches!(result, Err(ProcessError::Stage { ref stage, .. }) if stage == "Bin"));
    }

    #[test]
    fn stage_paths_are_depth_first() {
        let paths = pipeline().stage_paths();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[2], vec!["Basic Region Operations".to_owned(), "Fill Holes".to_owned()]);
    }

    #[test]
    fn spec_round_trip_keeps_switches() {
        let stage = AtomicProcess::required("Fill", Operation::FillHoles).with_enabled(false);
        let spec = AtomicSpec::from(&stage);
        let json = serde_json::to_string(&spec).unwrap();
        let back = AtomicProcess::from(serde_json::from_str::<AtomicSpec>(&json).unwrap());
        assert!(back.same_definition(&stage));
    }
}
