//! The algorithm collection: named pipelines, reusable stages, stage
//! libraries, and their persisted form.
//!
//! Pipelines live in two namespaces. `top` holds the full pipelines a user
//! picks from; `primitive` holds reusable stages and sub-pipelines. Names
//! that are in neither are resolved through [`StageLibrary`] factories,
//! either qualified (`imageproc.fill_holes`) or by searching the configured
//! modules in order.
//!
//! Every lookup returns a fresh node: stages handed out never share
//! retained state with the collection or with each other.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::process::{AtomicProcess, AtomicSpec, Process, ProcessNode};
use crate::processor::RegionProcessor;
use crate::stages::{
    BinarizeParams, CropParams, FormatParams, GrabcutParams, KMeansParams, MorphOp, MorphShape,
    MorphologyParams, Operation, QuickshiftParams, RegionGrowParams, RemoveSmallParams,
};

/// Name of the built-in stage library.
pub const BUILTIN_LIBRARY: &str = "imageproc";

/// Name of the cleanup sub-pipeline every default pipeline ends with.
pub const BASIC_REGION_OPERATIONS: &str = "Basic Region Operations";

/// Errors raised while resolving, loading, or saving pipelines.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No namespace or library knows the name.
    #[error("no process named `{name}` (searched: {})", searched.join(", "))]
    UnknownProcess {
        /// The name as given.
        name: String,
        /// Every namespace and library that was searched, in order.
        searched: Vec<String>,
    },

    /// The active pipeline is not in the `top` namespace.
    #[error("`{name}` is not a top-level pipeline")]
    UnknownActive {
        /// The requested name.
        name: String,
    },

    /// A module names a library that was never registered.
    #[error("no stage library named `{name}`")]
    UnknownLibrary {
        /// The library name.
        name: String,
    },

    /// Saved state is structurally invalid.
    #[error("malformed collection state: {0}")]
    Malformed(String),

    /// Saved state is not valid JSON for a collection.
    #[error("invalid collection JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing a collection file failed.
    #[error("failed to access {}: {source}", path.display())]
    Io {
        /// The file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Creates a new stage or sub-pipeline.
pub type StageFactory = fn() -> ProcessNode;

/// Named stage factories.
#[derive(Debug, Clone)]
pub struct StageLibrary {
    name: String,
    factories: BTreeMap<String, StageFactory>,
}

impl StageLibrary {
    /// An empty library.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factories: BTreeMap::new(),
        }
    }

    /// Library name, used in qualified lookups.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `factory` under `symbol`, replacing any previous one.
    pub fn register(&mut self, symbol: impl Into<String>, factory: StageFactory) {
        self.factories.insert(symbol.into(), factory);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, symbol: impl Into<String>, factory: StageFactory) -> Self {
        self.register(symbol, factory);
        self
    }

    /// A new node from the factory under `symbol`.
    #[must_use]
    pub fn create(&self, symbol: &str) -> Option<ProcessNode> {
        self.factories.get(symbol).map(|f| f())
    }

    /// Registered symbols in order.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// The built-in library covering every [`Operation`].
    #[must_use]
    pub fn builtin() -> Self {
        fn atomic(name: &str, operation: Operation) -> ProcessNode {
            AtomicProcess::new(name, operation).into()
        }
        Self::new(BUILTIN_LIBRARY)
            .with("format_vertices", || {
                atomic("Format Vertices", Operation::FormatVertices(FormatParams::default()))
            })
            .with("crop_to_local_area", || {
                atomic("Crop To Local Area", Operation::CropToLocalArea(CropParams::default()))
            })
            .with("grabcut", || atomic("Grabcut", Operation::Grabcut(GrabcutParams::default())))
            .with("region_grow", || {
                atomic("Grow Seedpoint", Operation::RegionGrow(RegionGrowParams::default()))
            })
            .with("k_means", || {
                atomic("K Means Segmentation", Operation::KMeans(KMeansParams::default()))
            })
            .with("quickshift", || {
                atomic(
                    "Quickshift Segmentation",
                    Operation::Quickshift(QuickshiftParams::default()),
                )
            })
            .with("opening", || atomic("Opening", Operation::Morphology(MorphologyParams::OPENING)))
            .with("closing", || atomic("Closing", Operation::Morphology(MorphologyParams::CLOSING)))
            .with("dilate", || {
                atomic(
                    "Dilate",
                    Operation::Morphology(MorphologyParams {
                        op: MorphOp::Dilate,
                        radius: 1,
                        shape: MorphShape::Rectangle,
                    }),
                )
            })
            .with("erode", || {
                atomic(
                    "Erode",
                    Operation::Morphology(MorphologyParams {
                        op: MorphOp::Erode,
                        radius: 1,
                        shape: MorphShape::Rectangle,
                    }),
                )
            })
            .with("binarize_labels", || {
                atomic("Binarize Labels", Operation::BinarizeLabels(BinarizeParams::default()))
            })
            .with("fill_holes", || atomic("Fill Holes", Operation::FillHoles))
            .with("keep_largest_component", || {
                atomic("Keep Largest Component", Operation::KeepLargestComponent)
            })
            .with("remove_small_components", || {
                atomic(
                    "Remove Small Components",
                    Operation::RemoveSmallComponents(RemoveSmallParams::default()),
                )
            })
            .with("draw_vertices", || atomic("Draw Vertices", Operation::DrawVertices))
            .with("convert_to_squares", || atomic("Convert To Squares", Operation::ConvertToSquares))
            .with("disallow_paint_tool", || {
                atomic("Disallow Paint Tool", Operation::DisallowPaintTool)
            })
            .with("apply_process_result", || {
                atomic("Apply Process Result", Operation::ApplyProcessResult)
            })
            .with("return_to_full_size", || {
                atomic("Return To Full Size", Operation::ReturnToFullSize)
            })
            .with("basic_region_operations", basic_region_operations)
    }
}

fn basic_region_operations() -> ProcessNode {
    Process::new(BASIC_REGION_OPERATIONS)
        .with_stage(AtomicProcess::new(
            "Opening",
            Operation::Morphology(MorphologyParams::OPENING),
        ))
        .with_stage(AtomicProcess::new(
            "Closing",
            Operation::Morphology(MorphologyParams::CLOSING),
        ))
        .with_stage(AtomicProcess::new("Fill Holes", Operation::FillHoles))
        .with_stage(AtomicProcess::new(
            "Keep Largest Component",
            Operation::KeepLargestComponent,
        ))
        .into()
}

/// Saved form of a pipeline element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageEntry {
    /// An enabled stage identical to the primitive of this name.
    Reference(String),
    /// A stage saved inline.
    Atomic(AtomicSpec),
    /// A sub-pipeline saved inline.
    Pipeline(PipelineSpec),
}

/// Saved form of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Pipeline name.
    pub name: String,
    /// Children in order.
    pub stages: Vec<StageEntry>,
    /// Enabled flag.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the pipeline may be disabled.
    #[serde(default = "default_true")]
    pub allow_disable: bool,
}

const fn default_true() -> bool {
    true
}

/// The persisted collection document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionState {
    /// User-selectable pipelines by name.
    #[serde(default)]
    pub top: BTreeMap<String, StageEntry>,
    /// Reusable stages by name.
    #[serde(default)]
    pub primitive: BTreeMap<String, StageEntry>,
    /// Libraries searched for bare names, in order.
    #[serde(default)]
    pub modules: Vec<String>,
    /// The selected top pipeline.
    #[serde(default)]
    pub active: Option<String>,
}

/// Registry of pipelines and stage libraries.
#[derive(Debug, Clone)]
pub struct AlgorithmCollection {
    top: BTreeMap<String, ProcessNode>,
    primitive: BTreeMap<String, ProcessNode>,
    modules: Vec<String>,
    libraries: BTreeMap<String, StageLibrary>,
    active: Option<String>,
}

impl Default for AlgorithmCollection {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AlgorithmCollection {
    /// A collection with no pipelines and the built-in library as the only
    /// module.
    #[must_use]
    pub fn empty() -> Self {
        let builtin = StageLibrary::builtin();
        Self {
            top: BTreeMap::new(),
            primitive: BTreeMap::new(),
            modules: vec![builtin.name().to_owned()],
            libraries: BTreeMap::from([(builtin.name().to_owned(), builtin)]),
            active: None,
        }
    }

    /// The default collection: a primitive for every built-in stage and
    /// the standard top pipelines, each ending in
    /// [`BASIC_REGION_OPERATIONS`].
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut collection = Self::empty();
        let builtin = StageLibrary::builtin();
        for node in builtin.factories.values().map(|f| f()) {
            collection.add_process(node, false, false);
        }
        let pipelines: [(&str, &[&str]); 5] = [
            ("Basic Shapes", &["draw_vertices"]),
            ("Cv Grabcut", &["disallow_paint_tool", "grabcut"]),
            ("K Means", &["k_means", "binarize_labels"]),
            ("Quickshift", &["quickshift", "binarize_labels"]),
            ("Region Grow", &["region_grow"]),
        ];
        for (name, symbols) in pipelines {
            let mut process = Process::new(name);
            for node in symbols.iter().filter_map(|s| builtin.create(s)) {
                process.push(node);
            }
            process.push(basic_region_operations());
            collection.add_process(process.into(), true, false);
        }
        collection.active = Some("Basic Shapes".to_owned());
        collection
    }

    /// Make `library` available for lookups; it is searched for bare names
    /// once listed in [`modules`](Self::modules).
    pub fn register_library(&mut self, library: StageLibrary) {
        self.libraries.insert(library.name().to_owned(), library);
    }

    /// Append a registered library to the module search order.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownLibrary`] if it was never registered.
    pub fn add_module(&mut self, name: &str) -> Result<(), RegistryError> {
        if !self.libraries.contains_key(name) {
            return Err(RegistryError::UnknownLibrary {
                name: name.to_owned(),
            });
        }
        if !self.modules.iter().any(|m| m == name) {
            self.modules.push(name.to_owned());
        }
        Ok(())
    }

    /// Module search order.
    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Names in the `top` namespace.
    pub fn top_names(&self) -> impl Iterator<Item = &str> {
        self.top.keys().map(String::as_str)
    }

    /// Names in the `primitive` namespace.
    pub fn primitive_names(&self) -> impl Iterator<Item = &str> {
        self.primitive.keys().map(String::as_str)
    }

    /// Register `node` under its name in `top` or `primitive`.
    ///
    /// An existing entry is kept (and `false` returned) unless `force` is
    /// set.
    pub fn add_process(&mut self, node: ProcessNode, top: bool, force: bool) -> bool {
        let namespace = if top { &mut self.top } else { &mut self.primitive };
        let name = node.name().to_owned();
        if namespace.contains_key(&name) && !force {
            tracing::debug!(%name, top, "process already registered");
            return false;
        }
        namespace.insert(name, node.fresh());
        true
    }

    /// Resolve `name` to a fresh node.
    ///
    /// Searches `top` and `primitive` (in the order `top_first` picks),
    /// then a qualified `library.symbol`, then each module for a bare
    /// symbol.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProcess`] naming `name` and every
    /// place searched.
    pub fn parse_process_name(&self, name: &str, top_first: bool) -> Result<ProcessNode, RegistryError> {
        let namespaces = if top_first {
            [("top", &self.top), ("primitive", &self.primitive)]
        } else {
            [("primitive", &self.primitive), ("top", &self.top)]
        };
        let mut searched = Vec::new();
        for (label, namespace) in namespaces {
            if let Some(node) = namespace.get(name) {
                return Ok(node.fresh());
            }
            searched.push(label.to_owned());
        }
        if let Some((library, symbol)) = name.rsplit_once('.') {
            searched.push(format!("library `{library}`"));
            if let Some(node) = self.libraries.get(library).and_then(|l| l.create(symbol)) {
                return Ok(node);
            }
        }
        for module in &self.modules {
            searched.push(format!("module `{module}`"));
            if let Some(node) = self.libraries.get(module).and_then(|l| l.create(name)) {
                return Ok(node);
            }
        }
        Err(RegistryError::UnknownProcess {
            name: name.to_owned(),
            searched,
        })
    }

    /// Name of the selected top pipeline.
    #[must_use]
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Select a top pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownActive`] if `name` is not in `top`.
    pub fn set_active(&mut self, name: &str) -> Result<(), RegistryError> {
        if !self.top.contains_key(name) {
            return Err(RegistryError::UnknownActive {
                name: name.to_owned(),
            });
        }
        tracing::info!(pipeline = name, "active pipeline changed");
        self.active = Some(name.to_owned());
        Ok(())
    }

    /// A fresh copy of the selected pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownActive`] if nothing valid is
    /// selected.
    pub fn active_process(&self) -> Result<Process, RegistryError> {
        let name = self.active.clone().unwrap_or_default();
        let node = self
            .top
            .get(&name)
            .ok_or(RegistryError::UnknownActive { name })?;
        Ok(into_pipeline(node.fresh()))
    }

    /// The selected pipeline wrapped for running.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownActive`] if nothing valid is
    /// selected.
    pub fn active_processor(&self) -> Result<RegionProcessor, RegistryError> {
        self.active_process().map(RegionProcessor::new)
    }

    /// The persisted form of the collection.
    #[must_use]
    pub fn save_state(&self) -> CollectionState {
        let primitive = self
            .primitive
            .iter()
            .map(|(name, node)| (name.clone(), self.definition_entry(node)))
            .collect();
        let top = self
            .top
            .iter()
            .map(|(name, node)| (name.clone(), self.definition_entry(node)))
            .collect();
        CollectionState {
            top,
            primitive,
            modules: self.modules.clone(),
            active: self.active.clone(),
        }
    }

    /// A namespace entry itself: never a reference to its own name.
    fn definition_entry(&self, node: &ProcessNode) -> StageEntry {
        match node {
            ProcessNode::Atomic(p) => StageEntry::Atomic(AtomicSpec::from(p)),
            ProcessNode::Pipeline(p) => StageEntry::Pipeline(PipelineSpec {
                name: p.name.clone(),
                stages: p.stages.iter().map(|s| self.child_entry(s)).collect(),
                enabled: p.enabled,
                allow_disable: p.allow_disable,
            }),
        }
    }

    /// A child stage: a reference when it is enabled and matches the
    /// primitive of the same name.
    fn child_entry(&self, node: &ProcessNode) -> StageEntry {
        let matches_primitive = node.enabled()
            && self
                .primitive
                .get(node.name())
                .is_some_and(|p| same_definition(p, node));
        if matches_primitive {
            StageEntry::Reference(node.name().to_owned())
        } else {
            self.definition_entry(node)
        }
    }

    /// Rebuild a collection from saved state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownLibrary`] for an unregistered module,
    /// [`RegistryError::UnknownProcess`] for a dangling reference,
    /// [`RegistryError::Malformed`] for reference cycles or a name that
    /// does not match its key, and [`RegistryError::UnknownActive`] if the
    /// active name is not a top pipeline.
    pub fn load_state(&self, state: &CollectionState) -> Result<Self, RegistryError> {
        let mut loaded = Self {
            top: BTreeMap::new(),
            primitive: BTreeMap::new(),
            modules: Vec::new(),
            libraries: self.libraries.clone(),
            active: None,
        };
        for module in &state.modules {
            loaded.add_module(module)?;
        }
        let mut resolver = Resolver {
            state,
            collection: &loaded,
            visiting: BTreeSet::new(),
        };
        let mut primitive = BTreeMap::new();
        for (name, entry) in &state.primitive {
            let node = resolver.definition(name, entry)?;
            primitive.insert(name.clone(), node);
        }
        let mut top = BTreeMap::new();
        for (name, entry) in &state.top {
            let node = resolver.definition(name, entry)?;
            top.insert(name.clone(), node);
        }
        loaded.primitive = primitive;
        loaded.top = top;
        if let Some(active) = &state.active {
            loaded.set_active(active)?;
        }
        tracing::info!(
            top = loaded.top.len(),
            primitive = loaded.primitive.len(),
            "loaded algorithm collection"
        );
        Ok(loaded)
    }

    /// Saved state as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, RegistryError> {
        Ok(serde_json::to_string_pretty(&self.save_state())?)
    }

    /// Load from a JSON document, using this collection's libraries.
    ///
    /// # Errors
    ///
    /// See [`load_state`](Self::load_state); also [`RegistryError::Json`].
    pub fn from_json(&self, json: &str) -> Result<Self, RegistryError> {
        let state: CollectionState = serde_json::from_str(json)?;
        self.load_state(&state)
    }

    /// Write the saved state to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the file cannot be written.
    pub fn save_to_path(&self, path: &Path) -> Result<(), RegistryError> {
        let json = self.to_json()?;
        std::fs::write(path, json).map_err(|source| RegistryError::Io {
            path: path.to_owned(),
            source,
        })?;
        tracing::info!(path = %path.display(), "saved algorithm collection");
        Ok(())
    }

    /// Read saved state from `path`, using this collection's libraries.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] if the file cannot be read, otherwise
    /// as [`from_json`](Self::from_json).
    pub fn load_from_path(&self, path: &Path) -> Result<Self, RegistryError> {
        let json = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_owned(),
            source,
        })?;
        self.from_json(&json)
    }
}

fn into_pipeline(node: ProcessNode) -> Process {
    match node {
        ProcessNode::Pipeline(p) => p,
        ProcessNode::Atomic(a) => Process::new(a.name.clone()).with_stage(a),
    }
}

/// Equal definitions, ignoring retained state.
fn same_definition(a: &ProcessNode, b: &ProcessNode) -> bool {
    match (a, b) {
        (ProcessNode::Atomic(a), ProcessNode::Atomic(b)) => a.same_definition(b),
        (ProcessNode::Pipeline(a), ProcessNode::Pipeline(b)) => {
            a.name == b.name
                && a.enabled == b.enabled
                && a.allow_disable == b.allow_disable
                && a.stages.len() == b.stages.len()
                && a.stages.iter().zip(&b.stages).all(|(x, y)| same_definition(x, y))
        }
        _ => false,
    }
}

/// Follows references in saved state, creating new nodes each time.
struct Resolver<'a> {
    state: &'a CollectionState,
    collection: &'a AlgorithmCollection,
    visiting: BTreeSet<String>,
}

impl Resolver<'_> {
    fn definition(&mut self, key: &str, entry: &StageEntry) -> Result<ProcessNode, RegistryError> {
        let node = self.entry(entry)?;
        if node.name() != key {
            return Err(RegistryError::Malformed(format!(
                "entry `{key}` defines a process named `{}`",
                node.name()
            )));
        }
        Ok(node)
    }

    fn entry(&mut self, entry: &StageEntry) -> Result<ProcessNode, RegistryError> {
        match entry {
            StageEntry::Atomic(spec) => Ok(AtomicProcess::from(spec.clone()).into()),
            StageEntry::Pipeline(spec) => {
                let mut process = Process::new(spec.name.clone());
                process.enabled = spec.enabled;
                process.allow_disable = spec.allow_disable;
                for child in &spec.stages {
                    let node = self.entry(child)?;
                    process.push(node);
                }
                Ok(process.into())
            }
            StageEntry::Reference(name) => self.reference(name),
        }
    }

    fn reference(&mut self, name: &str) -> Result<ProcessNode, RegistryError> {
        let Some(target) = self.state.primitive.get(name) else {
            // Not saved as a primitive: fall back to the libraries.
            return self.collection.parse_process_name(name, false);
        };
        if matches!(target, StageEntry::Reference(r) if r == name) || !self.visiting.insert(name.to_owned()) {
            return Err(RegistryError::Malformed(format!(
                "primitive `{name}` refers to itself"
            )));
        }
        let node = self.entry(target);
        self.visiting.remove(name);
        node
    }
}
