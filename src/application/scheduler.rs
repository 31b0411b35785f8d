//! C8: the ingestion scheduler (spec.md §4.8). Grounded in
//! `BatchProcessor.run`/`process_pending_uploads`
//! (`backend/app/services/batch_processor.py`): recursive directory walk
//! with progress-log dedup, an adaptively sized worker pool, and periodic
//! dead-worker replacement. SPEC_FULL.md OQ-2 re-architects the OS-process
//! pool as `std::thread` workers pulling from a shared `mpsc` queue; a
//! worker "crash" is a panic inside `process_image`, caught by
//! `catch_unwind` so the thread itself survives and keeps pulling tasks —
//! the lost-task/no-log-entry behavior the source relies on is unchanged.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use sysinfo::System;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{
    Config, CPU_HIGH_THRESHOLD, INITIAL_WORKERS, MEM_HIGH_THRESHOLD, MEM_LOW_THRESHOLD,
    SCALE_COOLDOWN_SECS,
};
use crate::domain::{BlobSink, CatalogError, CatalogueStore, Detector, Exemplar, ProgressData};

use super::candidates::CandidateSet;
use super::cluster::ClusterEngine;
use super::worker::{process_image, WorkerContext, WorkerOutcome};

pub struct IngestOptions {
    pub disable_upload: bool,
    pub upload_only: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            disable_upload: false,
            upload_only: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestSummary {
    pub processed: usize,
    pub failed: usize,
    pub total_candidates: usize,
}

struct Task {
    absolute_path: PathBuf,
    relative_path: String,
}

pub struct Scheduler {
    store: Arc<dyn CatalogueStore>,
    detector: Arc<dyn Detector>,
    blob: Arc<dyn BlobSink>,
    cluster: Arc<ClusterEngine>,
    progress_log: Arc<crate::infrastructure::ProgressLog>,
    import_dir: PathBuf,
    thumbnail_dir: PathBuf,
    min_score: f32,
    edge_margin: i32,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn CatalogueStore>,
        detector: Arc<dyn Detector>,
        blob: Arc<dyn BlobSink>,
        cluster: Arc<ClusterEngine>,
        progress_log: Arc<crate::infrastructure::ProgressLog>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            detector,
            blob,
            cluster,
            progress_log,
            import_dir: config.import_dir.clone(),
            thumbnail_dir: config.thumbnail_dir.clone(),
            min_score: config.min_score,
            edge_margin: config.edge_margin,
        }
    }

    pub fn run(&self, options: IngestOptions) -> Result<IngestSummary, CatalogError> {
        if options.upload_only {
            let count = self.upload_pending()?;
            return Ok(IngestSummary {
                processed: count,
                failed: 0,
                total_candidates: count,
            });
        }
        self.run_ingest(!options.disable_upload)
    }

    fn run_ingest(&self, upload_enabled: bool) -> Result<IngestSummary, CatalogError> {
        if !self.import_dir.exists() {
            return Err(CatalogError::Config(format!(
                "import directory {} does not exist",
                self.import_dir.display()
            )));
        }

        let processed_log = self.progress_log.load_progress_set()?;
        info!(
            resumed = processed_log.len(),
            "loaded progress log before walk"
        );

        let tasks = self.walk_candidates(&processed_log)?;
        let total_tasks = tasks.len();
        info!(
            total_tasks,
            skipped = processed_log.len(),
            "scanned import directory"
        );
        if tasks.is_empty() {
            return Ok(IngestSummary {
                processed: 0,
                failed: 0,
                total_candidates: 0,
            });
        }

        let candidates = Arc::new(self.load_candidate_snapshot()?);

        let (task_tx, task_rx): (Sender<Task>, Receiver<Task>) = mpsc::channel();
        for task in tasks {
            task_tx.send(task).expect("task receiver outlives scheduler loop");
        }
        drop(task_tx);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let (result_tx, result_rx): (Sender<WorkerOutcome>, Receiver<WorkerOutcome>) = mpsc::channel();

        let worker_ctx = Arc::new(WorkerContext {
            store: self.store.clone(),
            detector: self.detector.clone(),
            blob: self.blob.clone(),
            cluster: self.cluster.clone(),
            thumbnail_dir: self.thumbnail_dir.clone(),
            min_score: self.min_score,
            edge_margin: self.edge_margin,
            upload_enabled,
        });

        let max_workers = std::cmp::max(1, num_cpus() - 1);
        let worker_limit = Arc::new(AtomicUsize::new(INITIAL_WORKERS.min(max_workers)));
        let mut next_id = 0usize;
        let mut handles: Vec<(usize, JoinHandle<()>)> = Vec::new();
        for _ in 0..worker_limit.load(Ordering::Relaxed) {
            handles.push((
                next_id,
                spawn_worker(
                    next_id,
                    task_rx.clone(),
                    result_tx.clone(),
                    worker_limit.clone(),
                    worker_ctx.clone(),
                    candidates.clone(),
                ),
            ));
            next_id += 1;
        }

        let pb = ProgressBar::new(total_tasks as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style);
        }
        pb.set_message(format!("processing [{} workers]", handles.len()));

        let mut sys = System::new();
        let mut last_scale = Instant::now();
        let mut processed = 0usize;
        let mut failed = 0usize;

        while processed + failed < total_tasks {
            loop {
                match result_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(outcome) => {
                        if outcome.success {
                            let data = ProgressData {
                                processed_at: chrono::Utc::now(),
                                thumbnail: outcome.whole_thumbnail_filename.clone(),
                                faces: outcome.faces.clone(),
                            };
                            if let Err(e) = self.progress_log.append_progress(&outcome.relative_path, &data) {
                                warn!(error = %e, "failed to append progress log entry");
                            }
                            processed += 1;
                        } else {
                            failed += 1;
                        }
                        pb.inc(1);
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => break,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }

            // Replace any worker thread that genuinely died (defense in
            // depth; the normal panic path is caught inside the worker loop
            // itself and never actually ends the thread).
            for slot in handles.iter_mut() {
                if slot.1.is_finished() {
                    warn!(worker_id = slot.0, "worker thread ended unexpectedly, respawning");
                    let id = next_id;
                    next_id += 1;
                    worker_limit.fetch_add(1, Ordering::Relaxed);
                    *slot = (
                        id,
                        spawn_worker(
                            id,
                            task_rx.clone(),
                            result_tx.clone(),
                            worker_limit.clone(),
                            worker_ctx.clone(),
                            candidates.clone(),
                        ),
                    );
                }
            }

            if last_scale.elapsed() >= Duration::from_secs(SCALE_COOLDOWN_SECS) {
                sys.refresh_memory();
                sys.refresh_cpu_usage();
                let mem_percent = if sys.total_memory() > 0 {
                    (sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0) as f32
                } else {
                    0.0
                };
                let cpu_percent = sys.global_cpu_usage();
                let current = handles.len();

                if mem_percent > MEM_HIGH_THRESHOLD && current > 1 {
                    warn!(mem_percent, "scaling worker pool down");
                    worker_limit.fetch_sub(1, Ordering::Relaxed);
                    handles.pop();
                    last_scale = Instant::now();
                } else if mem_percent < MEM_LOW_THRESHOLD
                    && cpu_percent < CPU_HIGH_THRESHOLD
                    && current < max_workers
                {
                    let backlog = total_tasks.saturating_sub(processed + failed);
                    if backlog > current * 2 {
                        info!(mem_percent, cpu_percent, "scaling worker pool up");
                        let id = next_id;
                        next_id += 1;
                        worker_limit.fetch_add(1, Ordering::Relaxed);
                        handles.push((
                            id,
                            spawn_worker(
                                id,
                                task_rx.clone(),
                                result_tx.clone(),
                                worker_limit.clone(),
                                worker_ctx.clone(),
                                candidates.clone(),
                            ),
                        ));
                        last_scale = Instant::now();
                    }
                }
                pb.set_message(format!("processing [{} workers]", handles.len()));
            }
        }

        worker_limit.store(0, Ordering::Relaxed);
        for (_, handle) in handles {
            let _ = handle.join();
        }
        pb.finish_with_message(format!("done: {processed} processed, {failed} failed"));

        Ok(IngestSummary {
            processed,
            failed,
            total_candidates: total_tasks,
        })
    }

    fn walk_candidates(
        &self,
        processed_log: &std::collections::HashMap<String, ProgressData>,
    ) -> Result<Vec<Task>, CatalogError> {
        let mut tasks = Vec::new();
        let mut materialized_dirs = HashSet::new();

        for entry in WalkDir::new(&self.import_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if file_name.starts_with('.') {
                continue;
            }

            let mime = mime_guess::from_path(path).first_or_octet_stream();
            if mime.type_() != mime_guess::mime::IMAGE {
                continue;
            }

            let relative = match path.strip_prefix(&self.import_dir) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let log_key = relative.to_string_lossy().replace('\\', "/");
            if processed_log.contains_key(&log_key) {
                continue;
            }

            if let Some(parent) = relative.parent() {
                let parent_str = parent.to_string_lossy().replace('\\', "/");
                if !parent_str.is_empty() && materialized_dirs.insert(parent_str.clone()) {
                    self.store.get_or_create_folder_path(&parent_str)?;
                }
            }

            tasks.push(Task {
                absolute_path: path.to_path_buf(),
                relative_path: log_key,
            });
        }

        Ok(tasks)
    }

    /// Loads every face already assigned to a person as the static snapshot
    /// layer of the candidate set (spec.md §5).
    fn load_candidate_snapshot(&self) -> Result<CandidateSet, CatalogError> {
        let mut exemplars = Vec::new();
        for face in self.store.all_faces()? {
            let Some(person_id) = face.person_id else {
                continue;
            };
            if let Ok((embedding, _kind)) = crate::domain::decode_embedding(&face.embedding) {
                exemplars.push(Exemplar { person_id, embedding });
            }
        }
        Ok(CandidateSet::from_snapshot(exemplars))
    }

    /// `--upload-only` (SPEC_FULL.md §3): re-reads each pending image's
    /// bytes from disk and re-pushes the original and its thumbnail to the
    /// blob sink, regenerating the thumbnail if the on-disk copy went
    /// missing, exactly as `process_pending_uploads` does.
    pub fn upload_pending(&self) -> Result<usize, CatalogError> {
        if !self.blob.enabled() {
            return Ok(0);
        }

        let pending = self.store.find_images_pending_upload()?;
        info!(pending = pending.len(), "uploading pending images");
        let mut count = 0;

        for image in pending {
            let source_path = self.import_dir.join(&image.relative_path);
            let bytes = match std::fs::read(&source_path) {
                Ok(b) => b,
                Err(_) => continue,
            };

            if self
                .blob
                .put(&bytes, &image.stored_filename, &image.mime_type)
                .is_err()
            {
                continue;
            }

            let thumb_rel = image
                .thumbnail_path
                .clone()
                .unwrap_or_else(|| format!("images/{}.thumb.jpg", image.stored_filename));
            let thumb_path = self.thumbnail_dir.join(&thumb_rel);

            let thumb_bytes = if thumb_path.exists() {
                std::fs::read(&thumb_path).ok()
            } else {
                regenerate_whole_thumbnail(&bytes)
            };

            if let Some(thumb_bytes) = thumb_bytes {
                let _ = self.blob.put(&thumb_bytes, &thumb_rel, "image/jpeg");
            }

            if self.store.set_image_uploaded(image.id, true).is_ok() {
                count += 1;
            }
        }

        Ok(count)
    }
}

fn spawn_worker(
    id: usize,
    task_rx: Arc<Mutex<Receiver<Task>>>,
    result_tx: Sender<WorkerOutcome>,
    worker_limit: Arc<AtomicUsize>,
    ctx: Arc<WorkerContext>,
    candidates: Arc<CandidateSet>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if id >= worker_limit.load(Ordering::Relaxed) {
            break;
        }

        let task = {
            let rx = task_rx.lock().unwrap();
            rx.recv_timeout(Duration::from_millis(500))
        };

        let task = match task {
            Ok(task) => task,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            process_image(&ctx, &candidates, &task.absolute_path, &task.relative_path)
        }));

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                // The task is lost; no progress-log entry is written, so it
                // is retried on the next ingestion run (spec.md §7).
                WorkerOutcome {
                    relative_path: task.relative_path,
                    success: false,
                    whole_thumbnail_filename: None,
                    faces: Vec::new(),
                }
            }
        };

        if result_tx.send(outcome).is_err() {
            break;
        }
    })
}

fn regenerate_whole_thumbnail(original_bytes: &[u8]) -> Option<Vec<u8>> {
    let exif = super::exif_meta::extract(original_bytes);
    let decoded = image::load_from_memory(original_bytes).ok()?;
    let oriented = crate::domain::apply_orientation(decoded, exif.orientation);
    crate::domain::whole_image_thumbnail(&oriented.to_rgb8()).ok()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NullBlobSink;
    use crate::infrastructure::sqlite_store::TestDb;
    use crate::infrastructure::ProgressLog;
    use image::{DynamicImage, RgbImage};

    struct EmptyDetector;
    impl Detector for EmptyDetector {
        fn detect(&self, _image: &image::RgbImage) -> Result<Vec<crate::domain::DetectedFace>, CatalogError> {
            Ok(vec![])
        }
    }

    fn write_jpeg(path: &Path) {
        let img = RgbImage::from_pixel(100, 100, image::Rgb([10, 20, 30]));
        DynamicImage::ImageRgb8(img).save(path).unwrap();
    }

    #[test]
    fn walk_skips_dotfiles_and_non_images_and_already_logged() {
        let db = TestDb::new("scheduler_walk");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let import_dir = tmp.path().join("import");
        std::fs::create_dir_all(import_dir.join("sub")).unwrap();
        write_jpeg(&import_dir.join("a.jpg"));
        write_jpeg(&import_dir.join("sub").join("b.jpg"));
        std::fs::write(import_dir.join(".hidden.jpg"), b"x").unwrap();
        std::fs::write(import_dir.join("notes.txt"), b"text").unwrap();

        let progress_path = tmp.path().join("progress.jsonl");
        let progress_log = Arc::new(ProgressLog::new(progress_path.to_string_lossy().to_string()));

        let config = Config {
            database_path: ":memory:".into(),
            import_dir: import_dir.clone(),
            upload_dir: tmp.path().join("uploads"),
            thumbnail_dir: tmp.path().join("thumbs"),
            processed_log_file: progress_path.to_string_lossy().to_string(),
            r2_account_id: String::new(),
            r2_access_key_id: String::new(),
            r2_secret_access_key: String::new(),
            r2_bucket_name: String::new(),
            tolerance_512: 0.4,
            tolerance_128: 0.6,
            fast_path_tolerance_512: 0.45,
            min_score: 0.65,
            edge_margin: 10,
            face_detect_model_path: String::new(),
            face_embed_model_path: String::new(),
        };

        let blob: Arc<dyn BlobSink> = Arc::new(NullBlobSink);
        let cluster = Arc::new(ClusterEngine::new(
            store.clone(),
            blob.clone(),
            config.thumbnail_dir.clone(),
            0.45,
            0.6,
            0.4,
        ));
        let detector: Arc<dyn Detector> = Arc::new(EmptyDetector);
        let scheduler = Scheduler::new(store, detector, blob, cluster, progress_log, &config);

        let tasks = scheduler.walk_candidates(&std::collections::HashMap::new()).unwrap();
        let relative: Vec<String> = tasks.iter().map(|t| t.relative_path.clone()).collect();
        assert!(relative.contains(&"a.jpg".to_string()));
        assert!(relative.contains(&"sub/b.jpg".to_string()));
        assert_eq!(relative.len(), 2);
    }
}
