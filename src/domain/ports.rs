use thiserror::Error;
use uuid::Uuid;

use super::models::{Face, Folder, Image, Person};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Database(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("detector error: {0}")]
    Detect(String),
    #[error("embedding decode error: {0}")]
    Decode(String),
    #[error("not found")]
    NotFound,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("blob sink error: {0}")]
    Blob(String),
    #[error("merge refused: {0}")]
    MergeRefused(String),
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Database(err.to_string())
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err.to_string())
    }
}

/// C4: typed accessors over the four collections plus the progress log.
/// Each method is a single atomic write or read; no multi-document
/// transaction is ever taken (see SPEC_FULL.md OQ-1).
pub trait CatalogueStore: Send + Sync {
    fn insert_image(&self, image: &Image) -> Result<(), CatalogError>;
    fn update_image_state(
        &self,
        id: Uuid,
        state: super::models::ProcessingState,
    ) -> Result<(), CatalogError>;
    fn set_image_faces(&self, id: Uuid, face_ids: &[Uuid]) -> Result<(), CatalogError>;
    fn set_image_uploaded(&self, id: Uuid, uploaded: bool) -> Result<(), CatalogError>;
    fn get_image(&self, id: Uuid) -> Result<Option<Image>, CatalogError>;
    fn find_images_pending_upload(&self) -> Result<Vec<Image>, CatalogError>;
    fn all_images(&self) -> Result<Vec<Image>, CatalogError>;
    fn delete_image(&self, id: Uuid) -> Result<(), CatalogError>;

    fn insert_face(&self, face: &Face) -> Result<(), CatalogError>;
    fn set_face_thumbnail(&self, id: Uuid, path: &str) -> Result<(), CatalogError>;
    fn set_face_person(&self, id: Uuid, person_id: Option<Uuid>) -> Result<(), CatalogError>;
    fn get_face(&self, id: Uuid) -> Result<Option<Face>, CatalogError>;
    fn faces_for_person(&self, person_id: Uuid) -> Result<Vec<Face>, CatalogError>;
    fn all_faces(&self) -> Result<Vec<Face>, CatalogError>;
    fn delete_face(&self, id: Uuid) -> Result<(), CatalogError>;
    fn remove_face_from_image(&self, image_id: Uuid, face_id: Uuid) -> Result<(), CatalogError>;
    fn count_faces_for_person(&self, person_id: Uuid) -> Result<i64, CatalogError>;
    fn clear_all_face_persons(&self) -> Result<(), CatalogError>;

    fn insert_person(&self, person: &Person) -> Result<(), CatalogError>;
    fn get_person(&self, id: Uuid) -> Result<Option<Person>, CatalogError>;
    fn all_persons(&self) -> Result<Vec<Person>, CatalogError>;
    fn update_person_representative(
        &self,
        id: Uuid,
        representative_face_id: Uuid,
        best_face_score: f32,
    ) -> Result<(), CatalogError>;
    fn rename_person(&self, id: Uuid, name: Option<String>) -> Result<(), CatalogError>;
    fn delete_person(&self, id: Uuid) -> Result<(), CatalogError>;
    fn delete_all_persons(&self) -> Result<(), CatalogError>;

    fn get_or_create_folder_path(&self, relative_path: &str) -> Result<Option<Uuid>, CatalogError>;
    fn all_folders(&self) -> Result<Vec<Folder>, CatalogError>;

    fn truncate_all(&self) -> Result<(), CatalogError>;
}

/// C6 candidate exemplar: a face embedding paired with the person it belongs
/// to, used by the clustering engine for nearest-neighbour matching.
#[derive(Debug, Clone)]
pub struct Exemplar {
    pub person_id: Uuid,
    pub embedding: Vec<f32>,
}

/// External detector/embedder capability (spec.md §6, §9 Design Notes:
/// "wrapped behind a capability interface so test doubles can be
/// substituted").
pub trait Detector: Send + Sync {
    fn detect(&self, rgb_image: &image::RgbImage) -> Result<Vec<super::models::DetectedFace>, CatalogError>;
}

/// External object-storage sink (spec.md §6). `put` is idempotent with
/// respect to `key` (overwrite); `delete` is best-effort.
pub trait BlobSink: Send + Sync {
    fn put(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<(), CatalogError>;
    fn delete(&self, key: &str);
    fn enabled(&self) -> bool;
}

/// A sink that performs no network I/O, used when credentials are absent or
/// `--disable-upload` is passed.
pub struct NullBlobSink;

impl BlobSink for NullBlobSink {
    fn put(&self, _bytes: &[u8], _key: &str, _content_type: &str) -> Result<(), CatalogError> {
        Ok(())
    }

    fn delete(&self, _key: &str) {}

    fn enabled(&self) -> bool {
        false
    }
}
