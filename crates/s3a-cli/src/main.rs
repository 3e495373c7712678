//! Run s3a region pipelines on image files and inspect algorithm
//! collections.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use s3a_core::component::io as component_io;
use s3a_core::stages::{CropParams, CropReference, FormatParams};
use s3a_core::{
    AlgorithmCollection, CacheKey, Component, ErrorPolicy, InstanceId, ProcessorCache,
    RegionProcessor, RunInput, XYVertices,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pipeline on an image and print the diagnostics report.
    Run(RunArgs),
    /// List the pipelines, stages, and modules of a collection.
    List {
        /// Saved collection to read instead of the default one.
        #[arg(long, value_name = "FILE")]
        collection: Option<PathBuf>,
    },
    /// Write the default collection as JSON.
    SaveDefault {
        /// Output path.
        file: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Image to process.
    image: PathBuf,

    /// Foreground vertices as "x y,x y,...".
    #[arg(long, value_name = "VERTICES")]
    foreground: String,

    /// Background vertices as "x y,x y,...".
    #[arg(long, value_name = "VERTICES")]
    background: Option<String>,

    /// Top-level pipeline to run (default: the collection's active one).
    #[arg(long, value_name = "NAME")]
    algorithm: Option<String>,

    /// Saved collection to read instead of the default one.
    #[arg(long, value_name = "FILE")]
    collection: Option<PathBuf>,

    /// Existing component mask (same size as the image).
    #[arg(long, value_name = "PNG")]
    old_mask: Option<PathBuf>,

    /// Where to write the resulting mask.
    #[arg(long, value_name = "PNG")]
    out_mask: Option<PathBuf>,

    /// Where to write the resulting components as JSON rows.
    #[arg(long, value_name = "JSON")]
    out_vertices: Option<PathBuf>,

    /// Keep the result as one component instead of one per outer boundary.
    #[arg(long)]
    local_estimate: bool,

    /// What the crop window is built around.
    #[arg(long, value_enum, default_value_t = Reference::Viewbox)]
    reference: Reference,

    /// Crop margin as a percentage of the longest span.
    #[arg(long, default_value_t = CropParams::DEFAULT_MARGIN_PCT)]
    margin_pct: f64,

    /// Shrink crops whose longest side exceeds this (0 = never).
    #[arg(long, default_value_t = 0)]
    max_size: u32,

    /// Disable a stage, given as its path, e.g. "Basic Region Operations/Opening".
    /// May be repeated.
    #[arg(long, value_name = "STAGE")]
    disable: Vec<String>,

    /// Fail on stage errors instead of keeping the previous mask.
    #[arg(long)]
    strict: bool,

    /// Print diagnostics as JSON instead of a report.
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Reference {
    Image,
    Component,
    Viewbox,
    Roi,
}

impl From<Reference> for CropReference {
    fn from(r: Reference) -> Self {
        match r {
            Reference::Image => Self::Image,
            Reference::Component => Self::Component,
            Reference::Viewbox => Self::Viewbox,
            Reference::Roi => Self::Roi,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(&args),
        Command::List { collection } => list(collection.as_deref()),
        Command::SaveDefault { file } => AlgorithmCollection::with_defaults()
            .save_to_path(&file)
            .map_err(Into::into),
    };
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_collection(path: Option<&Path>) -> Result<AlgorithmCollection, Box<dyn Error>> {
    Ok(match path {
        Some(path) => AlgorithmCollection::empty().load_from_path(path)?,
        None => AlgorithmCollection::with_defaults(),
    })
}

fn parse_vertices(text: &str) -> Result<XYVertices, Box<dyn Error>> {
    let (loops, _) = component_io::vertices_from_string(text)?.into_parts();
    match <[XYVertices; 1]>::try_from(loops) {
        Ok([vertices]) => Ok(vertices),
        Err(_) => Err(format!("expected a single vertex list, got `{text}`").into()),
    }
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let mut collection = load_collection(args.collection.as_deref())?;
    if let Some(name) = &args.algorithm {
        collection.set_active(name)?;
    }
    let crop = CropParams {
        reference: args.reference.into(),
        margin_pct: args.margin_pct,
        max_size: args.max_size,
        ..CropParams::default()
    };
    let mut processor =
        RegionProcessor::with_framing(collection.active_process()?, FormatParams::default(), crop);
    for path in &args.disable {
        let path: Vec<&str> = path.split('/').collect();
        processor.process_mut().set_stage_enabled(&path, false)?;
    }

    let image = image::open(&args.image)?.to_rgb8();
    let old_component_mask = match &args.old_mask {
        Some(path) => Some(image::open(path)?.to_luma8()),
        None => None,
    };
    let input = RunInput {
        image: Some(image),
        foreground_vertices: parse_vertices(&args.foreground)?,
        background_vertices: args
            .background
            .as_deref()
            .map(parse_vertices)
            .transpose()?
            .unwrap_or_default(),
        old_component_mask,
        ..RunInput::default()
    };
    let policy = if args.strict {
        ErrorPolicy::Strict
    } else {
        ErrorPolicy::Recover
    };

    tracing::info!(pipeline = processor.name(), image = %args.image.display(), "running");
    let mut cache = ProcessorCache::new();
    let output = processor.run(input, CacheKey::Unassigned, &mut cache, policy)?;
    if let Some(reason) = &output.recovered {
        tracing::warn!(%reason, "pipeline failed, kept the previous mask");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output.diagnostics)?);
    } else {
        println!("{}", output.diagnostics.report());
    }

    if let Some(path) = &args.out_mask {
        output.mask.save(path)?;
        tracing::info!(path = %path.display(), "wrote mask");
    }
    if let Some(path) = &args.out_vertices {
        let image_file = args.image.display().to_string();
        let components: Vec<Component> = output
            .as_vertices(args.local_estimate)
            .into_iter()
            .zip(0..)
            .map(|(vertices, id)| {
                Component::new(vertices)
                    .with_id(InstanceId(id))
                    .with_image_file(image_file.clone())
            })
            .collect();
        component_io::save_to_path(&components, path)?;
        tracing::info!(path = %path.display(), count = components.len(), "wrote components");
    }
    Ok(())
}

fn list(path: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let collection = load_collection(path)?;
    println!("Top-level pipelines:");
    for name in collection.top_names() {
        let marker = if collection.active() == Some(name) { "*" } else { " " };
        println!("  {marker} {name}");
    }
    println!("Primitives:");
    for name in collection.primitive_names() {
        println!("    {name}");
    }
    println!("Modules: {}", collection.modules().join(", "));
    Ok(())
}
