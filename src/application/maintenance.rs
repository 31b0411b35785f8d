//! C9: maintenance ops (spec.md §4.9). Grounded in `fixup.py`'s
//! `prune_low_quality_faces`, `merge_duplicate_persons`, and
//! `fix_representative_orientations`, and `cleanup.py`'s truncate-everything
//! operation. Each op is idempotent and runs directly against `CatalogueStore`
//! and `ClusterEngine`; none of them touch the progress log (spec.md §5: it
//! is owned by the scheduler alone).

use std::path::{Path, PathBuf};

use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::similarity::distance;
use crate::domain::thumbnail::{apply_orientation, face_thumbnail, BBox};
use crate::domain::{decode_embedding, BlobSink, CatalogError, CatalogueStore};

use super::cluster::ClusterEngine;
use super::exif_meta;

#[derive(Debug, Default, Clone, Copy)]
pub struct PruneReport {
    pub faces_deleted: usize,
    pub persons_deleted: usize,
}

/// Deletes every face whose `det_score` is below `min_score` or whose bbox
/// touches its owning image's edge within `edge_margin` (spec.md §4.9
/// Prune). A person left with zero faces is deleted along with its
/// representative thumbnail, on disk and in the blob sink.
pub fn prune(
    store: &dyn CatalogueStore,
    blob: &dyn BlobSink,
    thumbnail_dir: &Path,
    min_score: f32,
    edge_margin: i32,
) -> Result<PruneReport, CatalogError> {
    let mut report = PruneReport::default();

    for face in store.all_faces()? {
        let Some(image) = store.get_image(face.image_id)? else {
            continue;
        };
        let edge_touch = face.touches_edge(image.width, image.height, edge_margin);
        if face.metadata.det_score >= min_score && !edge_touch {
            continue;
        }

        store.remove_face_from_image(face.image_id, face.id)?;
        let person_id = face.person_id;
        store.delete_face(face.id)?;
        report.faces_deleted += 1;

        if let Some(person_id) = person_id {
            let remaining = store.count_faces_for_person(person_id)?;
            if remaining == 0 {
                delete_person_and_representative(store, blob, thumbnail_dir, person_id)?;
                report.persons_deleted += 1;
            }
        }
    }

    info!(
        faces_deleted = report.faces_deleted,
        persons_deleted = report.persons_deleted,
        "prune complete"
    );
    Ok(report)
}

fn delete_person_and_representative(
    store: &dyn CatalogueStore,
    blob: &dyn BlobSink,
    thumbnail_dir: &Path,
    person_id: Uuid,
) -> Result<(), CatalogError> {
    store.delete_person(person_id)?;
    let rel = format!("faces/person_{person_id}.jpg");
    let _ = std::fs::remove_file(thumbnail_dir.join(&rel));
    blob.delete(&rel);
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeReport {
    pub persons_merged: usize,
    pub persons_remaining: usize,
    pub conflicts_skipped: usize,
}

/// Duplicate-person sweep (spec.md §4.6/§4.9): O(n²) over all persons,
/// comparing representative embeddings under C2. Pairs within `tolerance`
/// are merged via `cluster.merge`, obeying the named/unnamed direction rule;
/// a merge refused for naming conflicts is counted and skipped, leaving both
/// persons intact so the sweep can continue with the rest of the pairs.
pub fn merge_duplicates(
    store: &dyn CatalogueStore,
    cluster: &ClusterEngine,
    tolerance_512: f32,
    tolerance_128: f32,
) -> Result<MergeReport, CatalogError> {
    let mut persons = store.all_persons()?;
    let mut report = MergeReport::default();

    // Representative embeddings, resolved once up front; a person with no
    // representative face or an undecodable embedding never participates.
    let mut embeddings: Vec<Option<Vec<f32>>> = Vec::with_capacity(persons.len());
    for person in &persons {
        let emb = person
            .representative_face_id
            .and_then(|face_id| store.get_face(face_id).ok().flatten())
            .and_then(|face| decode_embedding(&face.embedding).ok())
            .map(|(v, _kind)| v);
        embeddings.push(emb);
    }

    let mut absorbed = vec![false; persons.len()];

    for i in 0..persons.len() {
        if absorbed[i] {
            continue;
        }
        let Some(emb_i) = embeddings[i].clone() else {
            continue;
        };

        // The running survivor for this group of duplicates. Starts at `i`
        // but moves to `j` whenever `cluster.merge` reverses direction
        // (unnamed anchor absorbed into a newly found named duplicate), so a
        // later iteration never calls `cluster.merge` with an id that was
        // already deleted as the "target" of an earlier reversal
        // (fixup.py:172-197's `target_id` reassignment).
        let mut target_idx = i;

        for j in (i + 1)..persons.len() {
            if absorbed[j] {
                continue;
            }
            let Some(emb_j) = &embeddings[j] else {
                continue;
            };
            if emb_i.len() != emb_j.len() {
                continue;
            }
            let tolerance = if emb_i.len() == 512 { tolerance_512 } else { tolerance_128 };
            if distance(&emb_i, emb_j) > tolerance {
                continue;
            }

            // `cluster.merge(source, target)` itself decides which side
            // actually survives (named beats unnamed); reverse is the case
            // where that flips the survivor away from the current anchor.
            let source_named = persons[j].name.is_some();
            let target_named = persons[target_idx].name.is_some();
            let reverse = source_named && !target_named;

            match cluster.merge(persons[j].id, persons[target_idx].id) {
                Ok(()) => {
                    if reverse {
                        absorbed[target_idx] = true;
                        target_idx = j;
                    } else {
                        absorbed[j] = true;
                    }
                    report.persons_merged += 1;
                }
                Err(CatalogError::MergeRefused(reason)) => {
                    warn!(a = %persons[target_idx].id, b = %persons[j].id, reason, "duplicate merge refused");
                    report.conflicts_skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Either side of a merge may have had its name swap direction inside
    // `cluster.merge`; re-read to report the true surviving count rather
    // than trusting the stale `persons` snapshot.
    persons = store.all_persons()?;
    report.persons_remaining = persons.len();

    info!(
        merged = report.persons_merged,
        remaining = report.persons_remaining,
        conflicts = report.conflicts_skipped,
        "duplicate-person sweep complete"
    );
    Ok(report)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OrientationReport {
    pub fixed: usize,
    pub skipped_missing_source: usize,
}

/// Fix orientation (spec.md §4.9): for every person, locates the
/// highest-`det_score` face whose owning image still exists on disk,
/// re-reads the original with EXIF transpose applied, and re-crops/rewrites
/// the representative thumbnail. A person whose best face's source image
/// has been moved or deleted is skipped, not an error.
pub fn fix_orientation(
    store: &dyn CatalogueStore,
    blob: &dyn BlobSink,
    thumbnail_dir: &Path,
) -> Result<OrientationReport, CatalogError> {
    let mut report = OrientationReport::default();

    for person in store.all_persons()? {
        let faces = store.faces_for_person(person.id)?;
        let Some(best) = faces
            .iter()
            .max_by(|a, b| a.metadata.det_score.partial_cmp(&b.metadata.det_score).unwrap())
        else {
            continue;
        };

        let Some(image) = store.get_image(best.image_id)? else {
            report.skipped_missing_source += 1;
            continue;
        };
        let Ok(bytes) = std::fs::read(&image.absolute_path) else {
            report.skipped_missing_source += 1;
            continue;
        };

        let exif = exif_meta::extract(&bytes);
        let Some(decoded) = image::load_from_memory(&bytes).ok() else {
            report.skipped_missing_source += 1;
            continue;
        };
        let oriented = apply_orientation(decoded, exif.orientation).to_rgb8();

        let bbox = BBox {
            top: best.top,
            right: best.right,
            bottom: best.bottom,
            left: best.left,
        };
        let thumb_bytes = match face_thumbnail(&oriented, bbox) {
            Ok(b) => b,
            Err(_) => {
                report.skipped_missing_source += 1;
                continue;
            }
        };

        let rel = format!("faces/person_{}.jpg", person.id);
        let path = thumbnail_dir.join(&rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &thumb_bytes)?;
        if blob.enabled() {
            blob.put(&thumb_bytes, &rel, "image/jpeg")?;
        }
        report.fixed += 1;
    }

    info!(
        fixed = report.fixed,
        skipped = report.skipped_missing_source,
        "fix-orientation complete"
    );
    Ok(report)
}

/// Cleanup (spec.md §4.9): truncates the four catalogue collections and
/// wipes the thumbnail/upload directories. Confirmation (`--force` / the
/// interactive prompt) is the caller's responsibility; this function performs
/// the destructive action unconditionally once called.
pub fn cleanup(
    store: &dyn CatalogueStore,
    upload_dir: &Path,
    thumbnail_dir: &Path,
) -> Result<(), CatalogError> {
    store.truncate_all()?;
    remove_dir_contents(upload_dir)?;
    remove_dir_contents(thumbnail_dir)?;
    info!("cleanup complete: catalogue truncated, thumbnail/upload directories wiped");
    Ok(())
}

fn remove_dir_contents(dir: &Path) -> Result<(), CatalogError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path: PathBuf = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NullBlobSink;
    use crate::domain::{Face, FaceMetadata, Image, ImageMetadata, Person, ProcessingState};
    use crate::infrastructure::sqlite_store::TestDb;
    use chrono::Utc;
    use std::sync::Arc;

    fn sample_image(id: Uuid, width: u32, height: u32) -> Image {
        Image {
            id,
            stored_filename: format!("{id}.jpg"),
            original_filename: "a.jpg".into(),
            absolute_path: "/nonexistent/a.jpg".into(),
            thumbnail_path: None,
            width,
            height,
            size_bytes: 100,
            mime_type: "image/jpeg".into(),
            uploaded_at: Utc::now(),
            state: ProcessingState::Processed,
            is_uploaded: false,
            relative_path: "a.jpg".into(),
            metadata: ImageMetadata::default(),
            folder_id: None,
            face_ids: vec![],
        }
    }

    fn sample_face(id: Uuid, image_id: Uuid, person_id: Option<Uuid>, det_score: f32, bbox: (i32, i32, i32, i32)) -> Face {
        Face {
            id,
            image_id,
            person_id,
            top: bbox.0,
            right: bbox.1,
            bottom: bbox.2,
            left: bbox.3,
            embedding: vec![0u8; 2048],
            thumbnail_path: None,
            created_at: Utc::now(),
            metadata: FaceMetadata { det_score, age: None, gender: None },
        }
    }

    #[test]
    fn prune_deletes_edge_face_and_its_now_empty_person() {
        let db = TestDb::new("maintenance_prune");
        let store = db.open();
        let tmp = tempfile::tempdir().unwrap();

        let image_id = Uuid::new_v4();
        store.insert_image(&sample_image(image_id, 1000, 1000)).unwrap();

        let person = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            representative_face_id: None,
            best_face_score: 0.9,
        };
        store.insert_person(&person).unwrap();

        // Edge-touching face (left = 0, within margin 10).
        let edge_face = sample_face(Uuid::new_v4(), image_id, Some(person.id), 0.9, (100, 100, 200, 0));
        store.insert_face(&edge_face).unwrap();
        store.set_image_faces(image_id, &[edge_face.id]).unwrap();

        let blob = NullBlobSink;
        let report = prune(&store, &blob, tmp.path(), 0.65, 10).unwrap();
        assert_eq!(report.faces_deleted, 1);
        assert_eq!(report.persons_deleted, 1);
        assert!(store.get_person(person.id).unwrap().is_none());
    }

    #[test]
    fn prune_keeps_accepted_face_within_margin() {
        let db = TestDb::new("maintenance_prune_keep");
        let store = db.open();
        let tmp = tempfile::tempdir().unwrap();

        let image_id = Uuid::new_v4();
        store.insert_image(&sample_image(image_id, 1000, 1000)).unwrap();

        let person = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            representative_face_id: None,
            best_face_score: 0.9,
        };
        store.insert_person(&person).unwrap();

        let face = sample_face(Uuid::new_v4(), image_id, Some(person.id), 0.9, (50, 250, 250, 50));
        store.insert_face(&face).unwrap();
        store.set_image_faces(image_id, &[face.id]).unwrap();

        let blob = NullBlobSink;
        let report = prune(&store, &blob, tmp.path(), 0.65, 10).unwrap();
        assert_eq!(report.faces_deleted, 0);
        assert!(store.get_person(person.id).unwrap().is_some());
    }

    #[test]
    fn cleanup_truncates_store_and_wipes_directories() {
        let db = TestDb::new("maintenance_cleanup");
        let store = db.open();
        let tmp = tempfile::tempdir().unwrap();
        let upload_dir = tmp.path().join("uploads");
        let thumbnail_dir = tmp.path().join("thumbnails");
        std::fs::create_dir_all(&upload_dir).unwrap();
        std::fs::create_dir_all(&thumbnail_dir).unwrap();
        std::fs::write(upload_dir.join("x.jpg"), b"data").unwrap();

        let person = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            representative_face_id: None,
            best_face_score: 0.0,
        };
        store.insert_person(&person).unwrap();

        cleanup(&store, &upload_dir, &thumbnail_dir).unwrap();

        assert!(store.all_persons().unwrap().is_empty());
        assert!(std::fs::read_dir(&upload_dir).unwrap().next().is_none());
    }

    #[test]
    fn merge_duplicates_merges_close_representatives() {
        let db = TestDb::new("maintenance_merge_dup");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let blob: Arc<dyn BlobSink> = Arc::new(NullBlobSink);
        let cluster = ClusterEngine::new(store.clone(), blob.clone(), tmp.path().to_path_buf(), 0.45, 0.6, 0.4);

        let now = Utc::now();
        let mut emb_a = vec![0.0f32; 512];
        emb_a[0] = 1.0;
        let mut emb_b = emb_a.clone();
        emb_b[1] = 0.01;
        let norm: f32 = emb_b.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in emb_b.iter_mut() {
            *x /= norm;
        }

        let person_a = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.9,
        };
        let person_b = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.8,
        };
        store.insert_person(&person_a).unwrap();
        store.insert_person(&person_b).unwrap();

        let image_id = Uuid::new_v4();
        store.insert_image(&sample_image(image_id, 500, 500)).unwrap();

        let face_a = Face {
            id: Uuid::new_v4(),
            image_id,
            person_id: Some(person_a.id),
            top: 0,
            right: 50,
            bottom: 50,
            left: 0,
            embedding: crate::domain::encode_embedding(&emb_a),
            thumbnail_path: None,
            created_at: now,
            metadata: FaceMetadata { det_score: 0.9, age: None, gender: None },
        };
        let face_b = Face {
            id: Uuid::new_v4(),
            image_id,
            person_id: Some(person_b.id),
            top: 0,
            right: 50,
            bottom: 50,
            left: 0,
            embedding: crate::domain::encode_embedding(&emb_b),
            thumbnail_path: None,
            created_at: now,
            metadata: FaceMetadata { det_score: 0.8, age: None, gender: None },
        };
        store.insert_face(&face_a).unwrap();
        store.insert_face(&face_b).unwrap();
        store.update_person_representative(person_a.id, face_a.id, 0.9).unwrap();
        store.update_person_representative(person_b.id, face_b.id, 0.8).unwrap();

        let report = merge_duplicates(store.as_ref(), &cluster, 0.4, 0.6).unwrap();
        assert_eq!(report.persons_merged, 1);
        assert_eq!(report.persons_remaining, 1);
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
        v
    }

    fn person_with_face(
        store: &dyn CatalogueStore,
        image_id: Uuid,
        name: Option<&str>,
        embedding: &[f32],
    ) -> Person {
        let now = Utc::now();
        let person = Person {
            id: Uuid::new_v4(),
            name: name.map(|n| n.to_string()),
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.9,
        };
        store.insert_person(&person).unwrap();

        let face = Face {
            id: Uuid::new_v4(),
            image_id,
            person_id: Some(person.id),
            top: 0,
            right: 50,
            bottom: 50,
            left: 0,
            embedding: crate::domain::encode_embedding(embedding),
            thumbnail_path: None,
            created_at: now,
            metadata: FaceMetadata { det_score: 0.9, age: None, gender: None },
        };
        store.insert_face(&face).unwrap();
        store.update_person_representative(person.id, face.id, 0.9).unwrap();
        person
    }

    /// Regression test: an unnamed anchor, followed by a named duplicate
    /// (forcing `cluster.merge` to reverse direction and delete the anchor),
    /// followed by a second unnamed duplicate that must still merge into the
    /// surviving named person rather than hitting the deleted anchor id.
    #[test]
    fn merge_duplicates_follows_survivor_after_reversal() {
        let db = TestDb::new("maintenance_merge_reversal");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let blob: Arc<dyn BlobSink> = Arc::new(NullBlobSink);
        let cluster = ClusterEngine::new(store.clone(), blob.clone(), tmp.path().to_path_buf(), 0.45, 0.6, 0.4);

        let image_id = Uuid::new_v4();
        store.insert_image(&sample_image(image_id, 500, 500)).unwrap();

        let mut emb_a = vec![0.0f32; 512];
        emb_a[0] = 1.0;
        let emb_a = unit(emb_a);

        let mut emb_b = emb_a.clone();
        emb_b[1] = 0.01;
        let emb_b = unit(emb_b);

        let mut emb_c = emb_a.clone();
        emb_c[2] = 0.01;
        let emb_c = unit(emb_c);

        let anchor = person_with_face(store.as_ref(), image_id, None, &emb_a);
        let named = person_with_face(store.as_ref(), image_id, Some("Alice"), &emb_b);
        let other_unnamed = person_with_face(store.as_ref(), image_id, None, &emb_c);

        let report = merge_duplicates(store.as_ref(), &cluster, 0.4, 0.6).unwrap();

        assert_eq!(report.conflicts_skipped, 0);
        assert_eq!(report.persons_merged, 2);
        assert_eq!(report.persons_remaining, 1);

        assert!(store.get_person(anchor.id).unwrap().is_none());
        assert!(store.get_person(other_unnamed.id).unwrap().is_none());
        let survivor = store.get_person(named.id).unwrap().unwrap();
        assert_eq!(survivor.name.as_deref(), Some("Alice"));
    }
}
