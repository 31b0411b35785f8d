use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Pending,
    Processed,
    Failed,
}

impl ProcessingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingState::Pending => "pending",
            ProcessingState::Processed => "processed",
            ProcessingState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "processed" => ProcessingState::Processed,
            "failed" => ProcessingState::Failed,
            _ => ProcessingState::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub date_time: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
}

/// One ingested photograph. Mirrors spec.md §3 Image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: Uuid,
    pub stored_filename: String,
    pub original_filename: String,
    pub absolute_path: String,
    pub thumbnail_path: Option<String>,
    pub width: u32,
    pub height: u32,
    pub size_bytes: i64,
    pub mime_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub state: ProcessingState,
    pub is_uploaded: bool,
    pub relative_path: String,
    pub metadata: ImageMetadata,
    pub folder_id: Option<Uuid>,
    pub face_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaceMetadata {
    pub det_score: f32,
    pub age: Option<i32>,
    pub gender: Option<i32>,
}

/// A detected face. Mirrors spec.md §3 Face. Bounding box stored as
/// top/right/bottom/left pixel coordinates, matching the wire format used by
/// the progress log and the original detector contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub id: Uuid,
    pub image_id: Uuid,
    pub person_id: Option<Uuid>,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
    pub embedding: Vec<u8>,
    pub thumbnail_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: FaceMetadata,
}

impl Face {
    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn touches_edge(&self, image_width: u32, image_height: u32, margin: i32) -> bool {
        self.left < margin
            || self.top < margin
            || self.right > image_width as i32 - margin
            || self.bottom > image_height as i32 - margin
    }
}

/// A cluster of faces believed to depict one individual. Mirrors spec.md §3
/// Person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub representative_face_id: Option<Uuid>,
    pub best_face_score: f32,
}

/// A node of the materialised folder tree. Mirrors spec.md §3 Folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One face as summarised in a progress-log entry (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceSummary {
    pub face_id: Uuid,
    pub person_id: Uuid,
    pub thumbnail_path: Option<String>,
}

/// The `data` payload of one progress-log line (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressData {
    pub processed_at: DateTime<Utc>,
    pub thumbnail: Option<String>,
    pub faces: Vec<FaceSummary>,
}

/// One line of the append-only progress log: `{"key": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub key: String,
    pub data: ProgressData,
}

/// A face as returned by the external detector/embedder (spec.md §6).
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
    pub embedding: Vec<f32>,
    pub det_score: f32,
    pub age: Option<i32>,
    pub gender: Option<i32>,
}
