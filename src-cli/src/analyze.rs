//! The `analyze` command

use crate::cli::AnalyzeArgs;
use crate::config::AppConfig;
use crate::summary;
use anyhow::{bail, Context, Result};
use compute_dispatch::{ComputeDispatcher, RayonBackend};
use image_analysis::{
    parse_exiftool_output, AnalysisPipeline, AnalysisSnapshot, CaptureMetadata, ImageAnalysis, ImageInput,
    Stage,
};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use task_scheduler::{ProcessingProgress, SchedulerObserver, TaskError, TaskHandle, TaskId, TaskScheduler};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "webp", "bmp"];

/// Outcome of one `analyze` run
#[derive(Debug)]
pub struct BatchReport {
    pub analyses: Vec<ImageAnalysis>,
    /// Files that never produced an analysis: unreadable, crashed or cleared
    pub failures: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn snapshots(&self) -> Vec<AnalysisSnapshot> {
        self.analyses.iter().map(ImageAnalysis::snapshot).collect()
    }

    /// Files without a usable analysis, including decode failures
    pub fn failed_count(&self) -> usize {
        self.failures.len() + self.analyses.iter().filter(|a| a.is_failed()).count()
    }
}

/// Logs batch progress as tasks finish
struct LoggingObserver;

impl SchedulerObserver for LoggingObserver {
    fn on_progress(&self, task: TaskId, stage: Stage, percent: u8) {
        debug!(%task, ?stage, percent, "Task progress");
    }

    fn on_batch_progress(&self, progress: &ProcessingProgress) {
        info!(
            current = progress.current,
            total = progress.total,
            "Batch {:.0}% complete",
            progress.completion_percentage()
        );
    }
}

/// Run the command: analyze every image, write snapshots, print the summary table
pub fn run_analyze(args: &AnalyzeArgs) -> Result<BatchReport> {
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.scheduler = config.scheduler.with_workers(workers);
        config.validate()?;
    }

    let files = collect_images(&args.paths, args.recursive)?;
    if files.is_empty() {
        bail!("No supported image files found");
    }
    info!(count = files.len(), workers = config.scheduler.workers, "Analyzing images");

    let metadata = match &args.metadata {
        Some(path) => load_metadata(path)?,
        None => HashMap::new(),
    };

    let dispatcher = Arc::new(if args.gpu {
        ComputeDispatcher::with_backend(config.analysis.dispatch.clone(), Arc::new(RayonBackend::new()))?
    } else {
        ComputeDispatcher::cpu_only(config.analysis.dispatch.clone())?
    });

    let pipeline = AnalysisPipeline::with_dispatcher(config.analysis.clone(), dispatcher.clone())?
        .with_use_case(args.use_case);
    let scheduler =
        TaskScheduler::with_observer(config.scheduler.clone(), Arc::new(pipeline), Arc::new(LoggingObserver))?;

    let mut failures = Vec::new();
    let mut pending: Vec<(PathBuf, TaskHandle)> = Vec::with_capacity(files.len());
    for path in files {
        let input = match ImageInput::from_path(&path) {
            Ok(input) => input,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read image");
                failures.push((path, format!("Failed to read file: {e}")));
                continue;
            }
        };
        let input = match metadata.get(&input.name) {
            Some(capture) => input.with_metadata(capture.clone()),
            None => input,
        }
        .with_scene(args.scene);
        pending.push((path, scheduler.submit(input)?));
    }

    let mut analyses = Vec::with_capacity(pending.len());
    for (path, handle) in pending {
        match handle.wait() {
            Ok(analysis) => analyses.push(analysis),
            Err(e) => {
                log_task_error(&path, &e);
                failures.push((path, e.to_string()));
            }
        }
    }
    scheduler.shutdown();

    if args.gpu {
        let report = dispatcher.performance_report();
        info!(
            samples = report.total_samples,
            gpu_deprioritized = report.gpu_deprioritized,
            "Dispatch performance"
        );
        for op in &report.operations {
            debug!(
                operation = ?op.operation,
                samples = op.samples,
                gpu_samples = op.gpu_samples,
                speedup = ?op.mean_speedup,
                "Operation timing"
            );
        }
    }

    let report = BatchReport { analyses, failures };
    write_snapshots(&report.snapshots(), args.output.as_deref(), args.pretty)?;

    let table = summary::render(&report);
    // Keep stdout clean for JSON when no output file is given
    if args.output.is_some() {
        print!("{table}");
    } else {
        eprint!("{table}");
    }
    Ok(report)
}

/// Expand files and directories into a sorted list of image paths
pub fn collect_images(paths: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            walk_dir(path, recursive, &mut files)?;
        } else if path.exists() {
            files.push(path.clone());
        } else {
            bail!("Path does not exist: {}", path.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn walk_dir(dir: &Path, recursive: bool, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if recursive {
                walk_dir(&path, recursive, files)?;
            }
        } else if is_image(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// exiftool records keyed by file name
fn load_metadata(path: &Path) -> Result<HashMap<String, CaptureMetadata>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata file: {}", path.display()))?;
    let records = parse_exiftool_output(&content)
        .with_context(|| format!("Failed to parse metadata file: {}", path.display()))?;

    let by_name: HashMap<_, _> = records
        .into_iter()
        .filter_map(|(source, capture)| {
            let name = source.file_name()?.to_string_lossy().to_string();
            Some((name, capture))
        })
        .collect();
    debug!(records = by_name.len(), "Loaded capture metadata");
    Ok(by_name)
}

fn log_task_error(path: &Path, error: &TaskError) {
    match error {
        TaskError::WorkerCrashed => warn!(path = %path.display(), "Worker crashed while analyzing image"),
        other => warn!(path = %path.display(), error = %other, "Analysis task failed"),
    }
}

fn write_snapshots(snapshots: &[AnalysisSnapshot], output: Option<&Path>, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(snapshots)?
    } else {
        serde_json::to_string(snapshots)?
    };

    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("Failed to write output: {}", path.display()))?;
            info!(path = %path.display(), count = snapshots.len(), "Wrote analysis snapshots");
        }
        None => println!("{json}"),
    }
    Ok(())
}
