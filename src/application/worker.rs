//! C7: the per-image worker task (spec.md §4.7). Grounded in the source's
//! `process_image_task` (`backend/app/services/batch_processor.py`), adapted
//! to this crate's typed `CatalogueStore`/`Detector`/`BlobSink` ports and to
//! the richer failure model of spec.md §7: a fatal error from steps 3–9
//! marks the image `processed = failed` rather than silently dropping it.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use image::{DynamicImage, GenericImageView};
use uuid::Uuid;

use crate::domain::embedding::l2_normalize;
use crate::domain::{
    decode_embedding, whole_image_thumbnail, BBox, BlobSink, CatalogError, CatalogueStore,
    DetectedFace, Detector, Face, FaceMetadata, FaceSummary, Image, ProcessingState,
};

use super::candidates::CandidateSet;
use super::cluster::ClusterEngine;
use super::exif_meta;

/// Collaborators a worker task needs; shared across every task a worker
/// thread executes (spec.md §9: "hold the store client as a dependency of
/// the scheduler and pass a read-only handle to workers").
pub struct WorkerContext {
    pub store: Arc<dyn CatalogueStore>,
    pub detector: Arc<dyn Detector>,
    pub blob: Arc<dyn BlobSink>,
    pub cluster: Arc<ClusterEngine>,
    pub thumbnail_dir: std::path::PathBuf,
    pub min_score: f32,
    pub edge_margin: i32,
    pub upload_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub relative_path: String,
    pub success: bool,
    pub whole_thumbnail_filename: Option<String>,
    pub faces: Vec<FaceSummary>,
}

impl WorkerOutcome {
    fn failure(relative_path: &str) -> Self {
        Self {
            relative_path: relative_path.to_string(),
            success: false,
            whole_thumbnail_filename: None,
            faces: Vec::new(),
        }
    }
}

/// Runs the full per-image pipeline (spec.md §4.7's ten steps) and never
/// raises past this boundary: every recoverable error is translated into a
/// failure `WorkerOutcome`.
pub fn process_image(
    ctx: &WorkerContext,
    candidates: &CandidateSet,
    absolute_path: &Path,
    relative_path: &str,
) -> WorkerOutcome {
    // Step 1: read bytes, infer MIME, refuse non-image.
    let bytes = match std::fs::read(absolute_path) {
        Ok(b) => b,
        Err(_) => return WorkerOutcome::failure(relative_path),
    };

    let mime = mime_guess::from_path(absolute_path).first_or_octet_stream();
    if mime.type_() != mime_guess::mime::IMAGE {
        return WorkerOutcome::failure(relative_path);
    }

    // Step 2: decode, apply EXIF transpose, convert to RGB; cache for
    // downstream use.
    let exif = exif_meta::extract(&bytes);
    let decoded = match image::ImageReader::new(std::io::Cursor::new(&bytes))
        .with_guessed_format()
        .ok()
        .and_then(|r| r.decode().ok())
    {
        Some(img) => img,
        None => return WorkerOutcome::failure(relative_path),
    };
    let oriented: DynamicImage = crate::domain::apply_orientation(decoded, exif.orientation);
    let (width, height) = oriented.dimensions();
    let rgb = oriented.to_rgb8();

    let folder_rel = Path::new(relative_path)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("");
    let folder_id = match ctx.store.get_or_create_folder_path(folder_rel) {
        Ok(id) => id,
        Err(_) => return WorkerOutcome::failure(relative_path),
    };

    let original_filename = Path::new(relative_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(relative_path)
        .to_string();
    let extension = Path::new(&original_filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let stored_filename = format!("{}{extension}", Uuid::new_v4());

    let image_id = Uuid::new_v4();

    let body = run_body(
        ctx,
        candidates,
        image_id,
        &rgb,
        width,
        height,
        &bytes,
        &mime,
        &stored_filename,
    );

    match body {
        Ok((thumb_rel, faces)) => {
            let image = Image {
                id: image_id,
                stored_filename: stored_filename.clone(),
                original_filename,
                absolute_path: absolute_path.to_string_lossy().into_owned(),
                thumbnail_path: Some(thumb_rel.clone()),
                width,
                height,
                size_bytes: bytes.len() as i64,
                mime_type: mime.essence_str().to_string(),
                uploaded_at: Utc::now(),
                state: ProcessingState::Processed,
                is_uploaded: ctx.upload_enabled,
                relative_path: relative_path.to_string(),
                metadata: exif.metadata,
                folder_id,
                face_ids: faces.iter().map(|f| f.face_id).collect(),
            };
            match ctx.store.insert_image(&image) {
                Ok(()) => {}
                Err(_) => return WorkerOutcome::failure(relative_path),
            }

            WorkerOutcome {
                relative_path: relative_path.to_string(),
                success: true,
                whole_thumbnail_filename: Some(thumb_rel),
                faces,
            }
        }
        Err(_) => {
            let image = Image {
                id: image_id,
                stored_filename,
                original_filename,
                absolute_path: absolute_path.to_string_lossy().into_owned(),
                thumbnail_path: None,
                width,
                height,
                size_bytes: bytes.len() as i64,
                mime_type: mime.essence_str().to_string(),
                uploaded_at: Utc::now(),
                state: ProcessingState::Failed,
                is_uploaded: false,
                relative_path: relative_path.to_string(),
                metadata: exif.metadata,
                folder_id,
                face_ids: Vec::new(),
            };
            let _ = ctx.store.insert_image(&image);
            WorkerOutcome::failure(relative_path)
        }
    }
}

/// Steps 3–9. Isolated in its own function so a failure anywhere in this
/// range can be told apart from the step 1–2 failures above, which never
/// produce a catalogue record at all (spec.md §7).
#[allow(clippy::too_many_arguments)]
fn run_body(
    ctx: &WorkerContext,
    candidates: &CandidateSet,
    image_id: Uuid,
    rgb: &image::RgbImage,
    width: u32,
    height: u32,
    original_bytes: &[u8],
    mime: &mime_guess::mime::Mime,
    stored_filename: &str,
) -> Result<(String, Vec<FaceSummary>), CatalogError> {
    // Step 3: detect, filter by score and edge margin.
    let detected = ctx.detector.detect(rgb)?;
    let accepted: Vec<DetectedFace> = detected
        .into_iter()
        .filter(|f| f.det_score >= ctx.min_score && !touches_edge(f, width, height, ctx.edge_margin))
        .collect();

    // Step 4: whole-image thumbnail.
    let thumb_bytes = whole_image_thumbnail(rgb)?;
    let thumb_filename = format!("{stored_filename}.thumb.jpg");
    let thumb_rel = format!("images/{thumb_filename}");
    let thumb_path = ctx.thumbnail_dir.join(&thumb_rel);
    if let Some(parent) = thumb_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&thumb_path, &thumb_bytes)?;

    // Step 5: upload original + whole-image thumbnail.
    if ctx.upload_enabled && ctx.blob.enabled() {
        ctx.blob.put(original_bytes, stored_filename, mime.essence_str())?;
        ctx.blob.put(&thumb_bytes, &thumb_rel, "image/jpeg")?;
    }

    // Step 6 (EXIF) already extracted by the caller.

    // Steps 8 (per face) + 9 (patch image's faces list, done by caller via
    // the returned summaries).
    let mut summaries = Vec::with_capacity(accepted.len());
    for detected_face in accepted {
        let encoded = crate::domain::encode_embedding(&detected_face.embedding);
        // decode_embedding validates the byte length round-trips to a
        // supported dimension; an un-decodable embedding leaves the face
        // clustering-inert but still recorded (spec.md §4.1).
        let (mut embedding, kind) = match decode_embedding(&encoded) {
            Ok(v) => v,
            Err(_) => {
                let face = build_face(image_id, &detected_face, None, encoded);
                ctx.store.insert_face(&face)?;
                summaries.push(FaceSummary {
                    face_id: face.id,
                    person_id: Uuid::nil(),
                    thumbnail_path: None,
                });
                continue;
            }
        };
        if kind == crate::domain::EmbeddingKind::ArcFace512 {
            l2_normalize(&mut embedding);
        }

        let (person_id, _is_new) = ctx.cluster.match_or_create(candidates, &embedding)?;

        let face_id = Uuid::new_v4();
        let bbox = BBox {
            top: detected_face.top,
            right: detected_face.right,
            bottom: detected_face.bottom,
            left: detected_face.left,
        };

        let face_thumb_rel = format!("faces/person_{person_id}.jpg");
        ctx.cluster
            .update_representative(person_id, face_id, detected_face.det_score, rgb, bbox)?;

        let face = Face {
            id: face_id,
            image_id,
            person_id: Some(person_id),
            top: bbox.top,
            right: bbox.right,
            bottom: bbox.bottom,
            left: bbox.left,
            embedding: crate::domain::encode_embedding(&embedding),
            thumbnail_path: Some(face_thumb_rel.clone()),
            created_at: Utc::now(),
            metadata: FaceMetadata {
                det_score: detected_face.det_score,
                age: detected_face.age,
                gender: detected_face.gender,
            },
        };
        ctx.store.insert_face(&face)?;

        summaries.push(FaceSummary {
            face_id,
            person_id,
            thumbnail_path: Some(face_thumb_rel),
        });
    }

    Ok((thumb_rel, summaries))
}

/// Mirrors `Face::touches_edge` for a not-yet-persisted `DetectedFace`
/// (spec.md §4.7 step 3 runs this filter before any face document exists).
fn touches_edge(face: &DetectedFace, image_width: u32, image_height: u32, margin: i32) -> bool {
    face.left < margin
        || face.top < margin
        || face.right > image_width as i32 - margin
        || face.bottom > image_height as i32 - margin
}

fn build_face(
    image_id: Uuid,
    detected: &DetectedFace,
    thumbnail_path: Option<String>,
    embedding_bytes: Vec<u8>,
) -> Face {
    Face {
        id: Uuid::new_v4(),
        image_id,
        person_id: None,
        top: detected.top,
        right: detected.right,
        bottom: detected.bottom,
        left: detected.left,
        embedding: embedding_bytes,
        thumbnail_path,
        created_at: Utc::now(),
        metadata: FaceMetadata {
            det_score: detected.det_score,
            age: detected.age,
            gender: detected.gender,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NullBlobSink;
    use crate::infrastructure::sqlite_store::TestDb;
    use std::sync::Mutex;

    struct StubDetector {
        faces: Mutex<Vec<DetectedFace>>,
    }

    impl Detector for StubDetector {
        fn detect(&self, _image: &image::RgbImage) -> Result<Vec<DetectedFace>, CatalogError> {
            Ok(self.faces.lock().unwrap().clone())
        }
    }

    fn write_test_jpeg(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([100, 110, 120]));
        image::DynamicImage::ImageRgb8(img).save(path).unwrap();
    }

    #[test]
    fn unreadable_file_fails_without_catalogue_record() {
        let db = TestDb::new("worker_unreadable");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let detector: Arc<dyn Detector> = Arc::new(StubDetector {
            faces: Mutex::new(vec![]),
        });
        let blob: Arc<dyn BlobSink> = Arc::new(NullBlobSink);
        let cluster = Arc::new(ClusterEngine::new(
            store.clone(),
            blob.clone(),
            tmp.path().to_path_buf(),
            0.45,
            0.6,
            0.4,
        ));
        let ctx = WorkerContext {
            store: store.clone(),
            detector,
            blob,
            cluster,
            thumbnail_dir: tmp.path().to_path_buf(),
            min_score: 0.65,
            edge_margin: 10,
            upload_enabled: false,
        };
        let candidates = CandidateSet::from_snapshot(vec![]);

        let outcome = process_image(
            &ctx,
            &candidates,
            Path::new("/nonexistent/path.jpg"),
            "path.jpg",
        );
        assert!(!outcome.success);
        assert!(store.all_images().unwrap().is_empty());
    }

    #[test]
    fn accepted_face_creates_person_and_processed_image() {
        let db = TestDb::new("worker_happy_path");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let image_path = tmp.path().join("photo.jpg");
        write_test_jpeg(&image_path, 800, 600);

        let mut embedding = vec![0.0f32; 512];
        embedding[0] = 1.0;
        let detected = DetectedFace {
            top: 50,
            right: 250,
            bottom: 250,
            left: 50,
            embedding,
            det_score: 0.9,
            age: None,
            gender: None,
        };
        let detector: Arc<dyn Detector> = Arc::new(StubDetector {
            faces: Mutex::new(vec![detected]),
        });
        let blob: Arc<dyn BlobSink> = Arc::new(NullBlobSink);
        let cluster = Arc::new(ClusterEngine::new(
            store.clone(),
            blob.clone(),
            tmp.path().to_path_buf(),
            0.45,
            0.6,
            0.4,
        ));
        let ctx = WorkerContext {
            store: store.clone(),
            detector,
            blob,
            cluster,
            thumbnail_dir: tmp.path().to_path_buf(),
            min_score: 0.65,
            edge_margin: 10,
            upload_enabled: false,
        };
        let candidates = CandidateSet::from_snapshot(vec![]);

        let outcome = process_image(&ctx, &candidates, &image_path, "photo.jpg");
        assert!(outcome.success);
        assert_eq!(outcome.faces.len(), 1);

        let images = store.all_images().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].state, ProcessingState::Processed);
        assert_eq!(images[0].face_ids.len(), 1);

        let persons = store.all_persons().unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].best_face_score, 0.9);
    }

    #[test]
    fn low_score_face_is_filtered_before_clustering() {
        let db = TestDb::new("worker_low_score");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let image_path = tmp.path().join("photo.jpg");
        write_test_jpeg(&image_path, 800, 600);

        let detected = DetectedFace {
            top: 50,
            right: 250,
            bottom: 250,
            left: 50,
            embedding: vec![1.0; 512],
            det_score: 0.3,
            age: None,
            gender: None,
        };
        let detector: Arc<dyn Detector> = Arc::new(StubDetector {
            faces: Mutex::new(vec![detected]),
        });
        let blob: Arc<dyn BlobSink> = Arc::new(NullBlobSink);
        let cluster = Arc::new(ClusterEngine::new(
            store.clone(),
            blob.clone(),
            tmp.path().to_path_buf(),
            0.45,
            0.6,
            0.4,
        ));
        let ctx = WorkerContext {
            store: store.clone(),
            detector,
            blob,
            cluster,
            thumbnail_dir: tmp.path().to_path_buf(),
            min_score: 0.65,
            edge_margin: 10,
            upload_enabled: false,
        };
        let candidates = CandidateSet::from_snapshot(vec![]);

        let outcome = process_image(&ctx, &candidates, &image_path, "photo.jpg");
        assert!(outcome.success);
        assert!(outcome.faces.is_empty());
        assert!(store.all_persons().unwrap().is_empty());
    }
}
