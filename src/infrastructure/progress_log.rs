//! Append-only progress log: one JSON object per line, `{"key": ..., "data":
//! ...}`. Ported line-for-line in spirit from `BatchProcessor.load_processed_log`
//! / `append_to_log`: malformed or truncated lines (a half-written record
//! left by a crash mid-append) are skipped rather than failing the whole
//! load, since a killed worker can leave a torn final line (spec.md §7).
//! Only C8 (the scheduler) ever calls this; C7 workers report completions
//! back to the scheduler, which is the sole writer.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::domain::{CatalogError, ProgressData};

pub struct ProgressLog {
    path: String,
}

impl ProgressLog {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Loads every well-formed entry keyed by `key` (the image's relative
    /// path). Lines that fail to parse, or parse but lack `key`/`data`, are
    /// silently dropped. A missing file is treated as an empty log.
    pub fn load_progress_set(&self) -> Result<HashMap<String, ProgressData>, CatalogError> {
        let mut entries = HashMap::new();

        if !Path::new(&self.path).exists() {
            return Ok(entries);
        }

        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            let Some(key) = value.get("key").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(data) = value.get("data") else {
                continue;
            };
            let Ok(data) = serde_json::from_value::<ProgressData>(data.clone()) else {
                continue;
            };

            entries.insert(key.to_string(), data);
        }

        Ok(entries)
    }

    /// Appends one record. Creates the parent directory on first use.
    pub fn append_progress(&self, key: &str, data: &ProgressData) -> Result<(), CatalogError> {
        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let entry = serde_json::json!({ "key": key, "data": data });
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", entry)?;
        Ok(())
    }

    pub fn truncate(&self) -> Result<(), CatalogError> {
        if Path::new(&self.path).exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FaceSummary;
    use chrono::Utc;
    use std::io::Write as _;
    use uuid::Uuid;

    fn temp_log_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("{name}_{}.jsonl", Uuid::new_v4()))
            .to_string_lossy()
            .to_string()
    }

    #[test]
    fn round_trips_one_entry() {
        let path = temp_log_path("progress_round_trip");
        let log = ProgressLog::new(&path);
        let data = ProgressData {
            processed_at: Utc::now(),
            thumbnail: Some("thumb.jpg".into()),
            faces: vec![FaceSummary {
                face_id: Uuid::new_v4(),
                person_id: Uuid::new_v4(),
                thumbnail_path: Some("face.jpg".into()),
            }],
        };
        log.append_progress("2024/a.jpg", &data).unwrap();

        let loaded = log.load_progress_set().unwrap();
        assert!(loaded.contains_key("2024/a.jpg"));
        assert_eq!(loaded["2024/a.jpg"].faces.len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tolerates_truncated_and_malformed_lines() {
        let path = temp_log_path("progress_malformed");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, r#"{{"key": "good.jpg", "data": {{"processed_at": "2024-01-01T00:00:00Z", "thumbnail": null, "faces": []}}}}"#).unwrap();
            writeln!(file, r#"{{"key": "truncated.jpg", "data": {{"processed"#).unwrap();
            writeln!(file, "not json at all").unwrap();
            write!(file, r#"{{"key": "no_newline.jpg""#).unwrap(); // no trailing newline, mid-object
        }

        let log = ProgressLog::new(&path);
        let loaded = log.load_progress_set().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("good.jpg"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty_log() {
        let path = temp_log_path("progress_missing");
        let log = ProgressLog::new(&path);
        assert!(log.load_progress_set().unwrap().is_empty());
    }
}
