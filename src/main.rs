mod application;
mod config;
mod domain;
mod infrastructure;

use std::io::Write as _;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use application::{
    cleanup as maintenance_cleanup, fix_orientation, merge_duplicates, prune, ClusterEngine,
    IngestOptions, Scheduler,
};
use config::Config;
use domain::ports::NullBlobSink;
use domain::{BlobSink, CatalogError, CatalogueStore, DetectedFace, Detector};
use infrastructure::{OrtDetector, ProgressLog, R2BlobSink, SqliteCatalogue};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Stands in for the real detector on the `--upload-only` path (scheduler.md
/// §4.8's `upload_pending` never calls `process_image`, so loading the ONNX
/// sessions up front would be wasted work).
struct UnreachableDetector;

impl Detector for UnreachableDetector {
    fn detect(&self, _image: &image::RgbImage) -> Result<Vec<DetectedFace>, CatalogError> {
        Err(CatalogError::Detect("detector unavailable on --upload-only path".into()))
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gallerynet=info,warn".parse().unwrap()),
        )
        .init();
}

fn print_usage() {
    println!("gallerynet - resumable face-clustering ingestion pipeline");
    println!();
    println!("USAGE:");
    println!("    gallerynet <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    ingest [--disable-upload] [--upload-only]");
    println!("        Walk the import directory, detect faces, cluster, and persist.");
    println!("        --disable-upload   skip pushing originals/thumbnails to the blob sink");
    println!("        --upload-only      skip detection; push images with is_uploaded=false");
    println!();
    println!("    maintenance [--skip-prune] [--skip-merge] [--fix-orientation] [--tolerance T]");
    println!("        Run pruning, duplicate-person merging, and/or orientation fixes.");
    println!();
    println!("    cleanup [--force]");
    println!("        Truncate the catalogue and wipe the thumbnail/upload directories.");
    println!("        --force   skip the interactive confirmation prompt");
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn build_blob_sink(config: &Config, disable_upload: bool) -> Arc<dyn BlobSink> {
    if disable_upload || !config.blob_sink_configured() {
        return Arc::new(NullBlobSink);
    }
    match R2BlobSink::new(
        &config.r2_account_id,
        &config.r2_access_key_id,
        &config.r2_secret_access_key,
        &config.r2_bucket_name,
    ) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, "failed to initialize blob sink, continuing with uploads disabled");
            Arc::new(NullBlobSink)
        }
    }
}

fn run_ingest(config: &Config, args: &[String]) -> Result<(), CatalogError> {
    let disable_upload = has_flag(args, "--disable-upload");
    let upload_only = has_flag(args, "--upload-only");

    let store: Arc<dyn CatalogueStore> = Arc::new(SqliteCatalogue::new(&config.database_path)?);
    let blob = build_blob_sink(config, disable_upload);
    let progress_log = Arc::new(ProgressLog::new(config.processed_log_file.clone()));

    let detector: Arc<dyn Detector> = if upload_only {
        Arc::new(UnreachableDetector)
    } else {
        info!(
            face_detect = %config.face_detect_model_path,
            face_embed = %config.face_embed_model_path,
            "loading detector models"
        );
        Arc::new(OrtDetector::new(
            &config.face_detect_model_path,
            &config.face_embed_model_path,
        )?)
    };

    let cluster = Arc::new(ClusterEngine::new(
        store.clone(),
        blob.clone(),
        config.thumbnail_dir.clone(),
        config.fast_path_tolerance_512,
        config.tolerance_128,
        config.tolerance_512,
    ));

    let scheduler = Scheduler::new(store, detector, blob, cluster, progress_log, config);
    let summary = scheduler.run(IngestOptions { disable_upload, upload_only })?;

    println!(
        "ingest complete: {} processed, {} failed, {} candidates scanned",
        summary.processed, summary.failed, summary.total_candidates
    );
    Ok(())
}

fn run_maintenance(config: &Config, args: &[String]) -> Result<(), CatalogError> {
    let skip_prune = has_flag(args, "--skip-prune");
    let skip_merge = has_flag(args, "--skip-merge");
    let do_fix_orientation = has_flag(args, "--fix-orientation");
    let tolerance_override = flag_value(args, "--tolerance").and_then(|v| v.parse::<f32>().ok());

    let store: Arc<dyn CatalogueStore> = Arc::new(SqliteCatalogue::new(&config.database_path)?);
    let blob = build_blob_sink(config, false);

    if !skip_prune {
        let report = prune(
            store.as_ref(),
            blob.as_ref(),
            &config.thumbnail_dir,
            config.min_score,
            config.edge_margin,
        )?;
        println!(
            "prune: {} faces deleted, {} persons deleted",
            report.faces_deleted, report.persons_deleted
        );
    }

    if !skip_merge {
        let cluster = ClusterEngine::new(
            store.clone(),
            blob.clone(),
            config.thumbnail_dir.clone(),
            config.fast_path_tolerance_512,
            config.tolerance_128,
            config.tolerance_512,
        );
        let (tolerance_512, tolerance_128) = match tolerance_override {
            Some(t) => (t, t),
            None => (config.tolerance_512, config.tolerance_128),
        };
        let report = merge_duplicates(store.as_ref(), &cluster, tolerance_512, tolerance_128)?;
        println!(
            "merge-duplicates: {} merged, {} remaining, {} conflicts skipped",
            report.persons_merged, report.persons_remaining, report.conflicts_skipped
        );
    }

    if do_fix_orientation {
        let report = fix_orientation(store.as_ref(), blob.as_ref(), &config.thumbnail_dir)?;
        println!(
            "fix-orientation: {} fixed, {} skipped (source missing)",
            report.fixed, report.skipped_missing_source
        );
    }

    Ok(())
}

fn run_cleanup(config: &Config, args: &[String]) -> Result<(), CatalogError> {
    let force = has_flag(args, "--force");

    if !force {
        println!("This will permanently delete:");
        println!("  catalogue database: {}", config.database_path);
        println!("  upload directory:   {}", config.upload_dir.display());
        println!("  thumbnail directory: {}", config.thumbnail_dir.display());
        print!("Continue? [y/N] ");
        std::io::stdout().flush().ok();

        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).ok();
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            println!("cleanup aborted");
            return Ok(());
        }
    }

    let store = SqliteCatalogue::new(&config.database_path)?;
    maintenance_cleanup(&store, &config.upload_dir, &config.thumbnail_dir)?;
    println!("cleanup complete");
    Ok(())
}

fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).cloned();

    if command.is_none() || command.as_deref() == Some("--help") || command.as_deref() == Some("-h") {
        print_usage();
        std::process::exit(if command.is_none() { 1 } else { 0 });
    }
    let command = command.unwrap();
    let rest = &args[2..];

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let result = match command.as_str() {
        "ingest" => run_ingest(&config, rest),
        "maintenance" => run_maintenance(&config, rest),
        "cleanup" => run_cleanup(&config, rest),
        other => {
            eprintln!("unknown command: {other}");
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
