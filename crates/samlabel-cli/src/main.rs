//! Samlabel CLI
//!
//! Headless front end for the annotation engine: inspect an image folder,
//! place prompt points, segment, and replay a reference frame across the
//! whole folder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use samlabel_lib::core::{
    annotations::{
        export::{export_mask_pngs, export_yolo_labels},
        AnnotationStore,
    },
    controller::{AnnotationController, BatchItemStatus},
    images::{FolderImageSource, ImageSource},
    segmentation::{RemoteSam2Provider, Sam2Model, SegmentationProvider},
    settings::{AnnotatorSettings, SettingsManager},
    PointLabel,
};
use samlabel_lib::logging;

#[derive(Parser)]
#[command(name = "samlabel")]
#[command(about = "Point-prompted multi-object segmentation annotator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to the platform config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Override the segmentation service URL
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Override the model size (tiny, small, baseplus, large)
    #[arg(long, global = true)]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List images in a folder with their annotation status
    List {
        /// Image folder
        dir: PathBuf,
    },

    /// Show the annotation of one image
    Show {
        dir: PathBuf,
        /// Image id (file name relative to the folder)
        image: String,
    },

    /// Add prompt objects to an image
    Annotate {
        dir: PathBuf,
        image: String,

        /// One object per flag: "x,y,+;x,y,-" (+ positive, - negative)
        #[arg(long = "object", short, required = true)]
        objects: Vec<String>,

        /// Drop existing objects first
        #[arg(long)]
        replace: bool,

        /// Run segmentation after placing the points
        #[arg(long)]
        segment: bool,
    },

    /// Replay the reference image's points over every image in the folder
    Process {
        dir: PathBuf,

        /// Image whose objects form the recipe
        #[arg(long, short)]
        reference: String,

        /// Parallel segmentation calls (overrides settings)
        #[arg(long)]
        concurrency: Option<u32>,

        /// Write per-object mask PNGs
        #[arg(long)]
        export_masks: bool,

        /// Write YOLO bounding box labels
        #[arg(long)]
        export_labels: bool,
    },

    /// Export saved annotations as mask PNGs and/or YOLO labels
    Export {
        dir: PathBuf,

        /// Output directory for mask PNGs
        #[arg(long)]
        masks: Option<PathBuf>,

        /// Output directory for YOLO label files
        #[arg(long)]
        labels: Option<PathBuf>,
    },

    /// Check that the segmentation service is reachable
    Health,

    /// Settings management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective settings
    Show,
    /// Print the settings file path
    Path,
    /// Delete the settings file and print the defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_dir.as_deref());

    let manager = settings_manager(cli.settings.clone())?;
    let mut settings = manager.load();
    if let Some(endpoint) = &cli.endpoint {
        settings.segmentation.endpoint = endpoint.clone();
    }
    if let Some(model) = &cli.model {
        settings.segmentation.model = model.clone();
    }

    match cli.command {
        Commands::List { dir } => list(&dir, &settings),
        Commands::Show { dir, image } => show(&dir, &image, &settings),
        Commands::Annotate {
            dir,
            image,
            objects,
            replace,
            segment,
        } => annotate(&dir, &image, &objects, replace, segment, settings).await,
        Commands::Process {
            dir,
            reference,
            concurrency,
            export_masks,
            export_labels,
        } => {
            if let Some(concurrency) = concurrency {
                settings.batch.concurrency = concurrency;
            }
            settings.batch.export_masks |= export_masks;
            settings.batch.export_labels |= export_labels;
            process(&dir, &reference, settings).await
        }
        Commands::Export { dir, masks, labels } => export(&dir, masks, labels, &settings),
        Commands::Health => health(&settings).await,
        Commands::Config(cmd) => config(cmd, &manager, &settings),
    }
}

// =============================================================================
// Commands
// =============================================================================

fn list(dir: &Path, settings: &AnnotatorSettings) -> Result<()> {
    let images = FolderImageSource::open_with_extensions(dir, &settings.images.extensions)?;
    let store = AnnotationStore::with_dir_name(dir, &settings.storage.annotations_dir);

    for (index, image_id) in images.list().iter().enumerate() {
        let status = match store.load(image_id) {
            Ok(Some(frame)) => json!(frame.status()),
            Ok(None) => json!("empty"),
            Err(e) => json!(format!("error: {}", e)),
        };
        println!(
            "{}",
            json!({ "index": index, "imageId": image_id, "status": status })
        );
    }
    Ok(())
}

fn show(dir: &Path, image: &str, settings: &AnnotatorSettings) -> Result<()> {
    let store = AnnotationStore::with_dir_name(dir, &settings.storage.annotations_dir);
    let Some(frame) = store.load(image)? else {
        println!("{} has no annotations", image);
        return Ok(());
    };

    println!("{}", frame.summary());
    for object in &frame.objects {
        let marker = if frame.active_object_id.as_deref() == Some(object.id.as_str()) {
            "*"
        } else {
            " "
        };
        let mask = match &object.mask {
            Some(mask) => match mask.bounds() {
                Some(b) => format!(
                    "mask {}px score {:.3} box ({},{})-({},{})",
                    mask.area(),
                    mask.score(),
                    b.x_min,
                    b.y_min,
                    b.x_max,
                    b.y_max
                ),
                None => format!("empty mask score {:.3}", mask.score()),
            },
            None => "no mask".to_string(),
        };
        println!(
            "{} {}: +{} -{} {}",
            marker,
            object.id,
            object.positive_count(),
            object.negative_count(),
            mask
        );
    }
    Ok(())
}

async fn annotate(
    dir: &Path,
    image: &str,
    objects: &[String],
    replace: bool,
    segment: bool,
    settings: AnnotatorSettings,
) -> Result<()> {
    let prompts = objects
        .iter()
        .map(|spec| parse_object_spec(spec))
        .collect::<Result<Vec<_>>>()?;

    let controller = AnnotationController::new(build_provider(&settings)?, settings);
    controller.open_folder(dir)?;
    controller.jump_to(image)?;
    if replace {
        controller.clear_all()?;
    }

    for points in prompts {
        let object_id = controller.new_object()?;
        for (x, y, label) in points {
            controller
                .on_point(x, y, label)
                .with_context(|| format!("Placing point ({}, {}) on {}", x, y, object_id))?;
        }
    }

    if segment {
        let outcome = controller.recompute().await?;
        info!(image_id = image, "Segmentation outcome: {:?}", outcome);
    }

    controller.close_session()?;
    let store = AnnotationStore::with_dir_name(dir, &controller.settings().storage.annotations_dir);
    if let Some(frame) = store.load(image)? {
        println!("{}", frame.summary());
    }
    Ok(())
}

async fn process(dir: &Path, reference: &str, settings: AnnotatorSettings) -> Result<()> {
    let controller = AnnotationController::new(build_provider(&settings)?, settings);
    controller.open_folder(dir)?;
    controller.jump_to(reference)?;
    if !controller.is_ready_for_batch() {
        bail!("{} has no points to replay", reference);
    }

    let mut handle = controller.start_batch()?;
    loop {
        tokio::select! {
            event = handle.progress.recv() => {
                let Some(event) = event else { break };
                let status = match &event.status {
                    BatchItemStatus::Running => continue,
                    BatchItemStatus::Succeeded => "ok".to_string(),
                    BatchItemStatus::Failed { reason } => format!("failed: {}", reason),
                };
                println!(
                    "[{}/{}] {} {}",
                    event.current_index + 1,
                    event.total,
                    event.image_id,
                    status
                );
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling after in-flight images finish...");
                handle.cancel();
            }
        }
    }

    let report = handle.wait().await?;
    controller.close_session()?;
    println!(
        "{}",
        json!({
            "total": report.total,
            "succeeded": report.succeeded(),
            "failed": report.failed(),
            "skipped": report.skipped(),
            "cancelled": report.cancelled,
        })
    );
    report.completed()?;
    if report.failed() > 0 {
        bail!("{} of {} images failed", report.failed(), report.total);
    }
    Ok(())
}

fn export(
    dir: &Path,
    masks: Option<PathBuf>,
    labels: Option<PathBuf>,
    settings: &AnnotatorSettings,
) -> Result<()> {
    if masks.is_none() && labels.is_none() {
        bail!("Nothing to export: pass --masks and/or --labels");
    }

    let store = AnnotationStore::with_dir_name(dir, &settings.storage.annotations_dir);
    let mut exported = 0usize;
    for image_id in store.list_annotated()? {
        let Some(frame) = store.load(&image_id)? else {
            continue;
        };
        if let Some(masks_dir) = &masks {
            export_mask_pngs(&frame, masks_dir)?;
        }
        if let Some(labels_dir) = &labels {
            export_yolo_labels(&frame, labels_dir)?;
        }
        exported += 1;
    }

    println!("Exported {} annotated images", exported);
    Ok(())
}

async fn health(settings: &AnnotatorSettings) -> Result<()> {
    let provider = build_provider(settings)?;
    provider
        .health_check()
        .await
        .with_context(|| format!("{} is not reachable", settings.segmentation.endpoint))?;
    println!("{} ok ({})", settings.segmentation.endpoint, provider.name());
    Ok(())
}

fn config(cmd: ConfigCommands, manager: &SettingsManager, settings: &AnnotatorSettings) -> Result<()> {
    match cmd {
        ConfigCommands::Show => println!("{}", serde_json::to_string_pretty(settings)?),
        ConfigCommands::Path => println!("{}", manager.settings_path().display()),
        ConfigCommands::Reset => {
            let defaults = manager.reset()?;
            println!("{}", serde_json::to_string_pretty(&defaults)?);
        }
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

fn settings_manager(path: Option<PathBuf>) -> Result<SettingsManager> {
    match path {
        Some(path) => Ok(SettingsManager::from_file(path)),
        None => SettingsManager::default_dir()
            .map(SettingsManager::new)
            .context("No platform config directory; pass --settings"),
    }
}

fn build_provider(settings: &AnnotatorSettings) -> Result<Arc<dyn SegmentationProvider>> {
    let segmentation = &settings.segmentation;
    let model: Sam2Model = segmentation.model.parse()?;
    let provider = RemoteSam2Provider::new(
        &segmentation.endpoint,
        model,
        std::time::Duration::from_secs(segmentation.timeout_secs),
    )?
    .with_threshold(segmentation.mask_threshold);
    Ok(Arc::new(provider))
}

/// Parses "x,y,+;x,y,-" into points
fn parse_object_spec(spec: &str) -> Result<Vec<(f32, f32, PointLabel)>> {
    let points = spec
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|point| {
            let parts: Vec<&str> = point.split(',').map(str::trim).collect();
            let [x, y, label] = parts.as_slice() else {
                bail!("Expected x,y,label but got '{}'", point);
            };
            let label = match *label {
                "+" | "pos" | "positive" | "1" => PointLabel::Positive,
                "-" | "neg" | "negative" | "0" => PointLabel::Negative,
                other => bail!("Unknown point label '{}'", other),
            };
            Ok((
                x.parse::<f32>().with_context(|| format!("Bad x in '{}'", point))?,
                y.parse::<f32>().with_context(|| format!("Bad y in '{}'", point))?,
                label,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    if points.is_empty() {
        bail!("Object '{}' has no points", spec);
    }
    Ok(points)
}
