//! s3a-core: the region-processing kernel of a semi-supervised polygon
//! annotator (sans-GUI).
//!
//! A user marks an image region with a few foreground (and optionally
//! background) vertices. A [`RegionProcessor`] runs a configurable pipeline
//! of stages over that input:
//!
//! format vertices -> crop to local area -> user stages (segmentation,
//! binarization, morphology, ...) -> apply to old mask -> return to full
//! size
//!
//! and yields the component's new full-size mask, which can be traced back
//! into polygon vertices. Around that core sit the caller-owned
//! [`ProcessorCache`] of user intent, the [`AlgorithmCollection`] of named
//! pipelines with JSON persistence, an undo stack, the component table, and
//! a background [`ProcessingQueue`].
//!
//! The crate installs no logging subscriber; it emits `tracing` events and
//! returns everything a caller needs to react as data.

pub mod cache;
pub mod component;
pub mod diagnostics;
pub mod geometry;
pub mod mask;
pub mod process;
pub mod processor;
pub mod registry;
pub mod resize;
pub mod stages;
pub mod types;
pub mod undo;
pub mod worker;

pub use cache::{CacheKey, ProcessorCache};
pub use component::{Component, ComponentError, ComponentTable, FieldValue, InstanceId, TableChange};
pub use diagnostics::{Clock, RunDiagnostics, StageDiagnostics, SystemClock};
pub use geometry::{ComplexXYVertices, GeometryError, Hierarchy, XYVertices};
pub use process::{AbortFlag, AtomicProcess, Process, ProcessNode};
pub use processor::{ErrorPolicy, ProcessError, RegionProcessor, RunInput, RunOutput};
pub use registry::{AlgorithmCollection, RegistryError, StageLibrary};
pub use stages::{Operation, StageError};
pub use types::{Bounds, Dimensions, LabelImage, Point};
pub use undo::{ActionStack, StackError};
pub use worker::{JobId, JobOutcome, ProcessingQueue, WorkerError};
