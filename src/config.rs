//! Runtime configuration (SPEC_FULL.md §2.1). Loaded from environment
//! variables with hardcoded fallbacks, mirroring the teacher's `main.rs`
//! (`std::env::var(...).unwrap_or_else(...)`) rather than a config-file
//! crate, and the shape of original_source's `app/config.py` Settings class.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::similarity::{DEFAULT_TOLERANCE_128, DEFAULT_TOLERANCE_512, FAST_PATH_TOLERANCE_512};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid float for {name}: {value}")]
    InvalidFloat { name: &'static str, value: String },
}

/// C7's face-acceptance filters (spec.md §4.7).
pub const DEFAULT_MIN_SCORE: f32 = 0.65;
pub const DEFAULT_EDGE_MARGIN: i32 = 10;

/// C8's adaptive worker-pool thresholds (spec.md §4.8).
pub const SCALE_COOLDOWN_SECS: u64 = 10;
pub const MEM_HIGH_THRESHOLD: f32 = 85.0;
pub const MEM_LOW_THRESHOLD: f32 = 60.0;
pub const CPU_HIGH_THRESHOLD: f32 = 90.0;
pub const INITIAL_WORKERS: usize = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub import_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub thumbnail_dir: PathBuf,
    pub processed_log_file: String,

    pub r2_account_id: String,
    pub r2_access_key_id: String,
    pub r2_secret_access_key: String,
    pub r2_bucket_name: String,

    pub tolerance_512: f32,
    pub tolerance_128: f32,
    pub fast_path_tolerance_512: f32,

    pub min_score: f32,
    pub edge_margin: i32,

    pub face_detect_model_path: String,
    pub face_embed_model_path: String,
}

impl Config {
    /// Loads configuration from the environment (spec.md §6 Environment
    /// variables), creating `import_dir`'s siblings eagerly the way the
    /// teacher's `main.rs` creates `upload_dir`/`thumbnail_dir` up front.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = env_or("DATABASE_PATH", "gallery.db");
        let import_dir = PathBuf::from(env_or("IMPORT_DIR", "./import_images"));
        let upload_dir = PathBuf::from(env_or("UPLOAD_DIR", "./uploads"));
        let thumbnail_dir = PathBuf::from(env_or("THUMBNAIL_DIR", "./thumbnails"));
        let processed_log_file = env_or("PROCESSED_LOG_FILE", "./uploads/processed_log.jsonl");

        let r2_account_id = env_or("R2_ACCOUNT_ID", "");
        let r2_access_key_id = env_or("R2_ACCESS_KEY_ID", "");
        let r2_secret_access_key = env_or("R2_SECRET_ACCESS_KEY", "");
        let r2_bucket_name = env_or("R2_BUCKET_NAME", "gallerynet");

        let tolerance_512 = env_float("TOLERANCE_512", DEFAULT_TOLERANCE_512)?;
        let tolerance_128 = env_float("TOLERANCE_128", DEFAULT_TOLERANCE_128)?;
        let fast_path_tolerance_512 =
            env_float("FAST_PATH_TOLERANCE_512", FAST_PATH_TOLERANCE_512)?;

        let min_score = env_float("MIN_SCORE", DEFAULT_MIN_SCORE)?;
        let edge_margin = env_float("EDGE_MARGIN", DEFAULT_EDGE_MARGIN as f32)? as i32;

        let face_detect_model_path = env_or(
            "FACE_DETECT_MODEL_PATH",
            "assets/models/ultraface-slim-320.onnx",
        );
        let face_embed_model_path =
            env_or("FACE_EMBED_MODEL_PATH", "assets/models/arcface.onnx");

        if !upload_dir.exists() {
            let _ = std::fs::create_dir_all(&upload_dir);
        }
        if !thumbnail_dir.exists() {
            let _ = std::fs::create_dir_all(thumbnail_dir.join("images"));
            let _ = std::fs::create_dir_all(thumbnail_dir.join("faces"));
        }

        Ok(Self {
            database_path,
            import_dir,
            upload_dir,
            thumbnail_dir,
            processed_log_file,
            r2_account_id,
            r2_access_key_id,
            r2_secret_access_key,
            r2_bucket_name,
            tolerance_512,
            tolerance_128,
            fast_path_tolerance_512,
            min_score,
            edge_margin,
            face_detect_model_path,
            face_embed_model_path,
        })
    }

    /// Blob sink is disabled when R2 credentials are absent (SPEC_FULL.md §2.1).
    pub fn blob_sink_configured(&self) -> bool {
        !self.r2_account_id.is_empty()
            && !self.r2_access_key_id.is_empty()
            && !self.r2_secret_access_key.is_empty()
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_float(name: &'static str, default: f32) -> Result<f32, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<f32>()
            .map_err(|_| ConfigError::InvalidFloat { name, value }),
        Err(_) => Ok(default),
    }
}
