//! C6: the online face-clustering engine, plus the two offline operations it
//! exposes to maintenance (§4.6). Grounded in the processor's
//! `find_matching_person_optimized`/`process_image_task` (online
//! match-or-create and representative selection,
//! `backend/app/services/batch_processor.py`) and
//! `clustering_service.py`/`fixup.py` (offline merge and full re-cluster).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::domain::similarity::{match_candidate, DEFAULT_TOLERANCE_128};
use crate::domain::thumbnail::{face_thumbnail, BBox};
use crate::domain::{BlobSink, CatalogError, CatalogueStore, Exemplar, Person};

use super::candidates::CandidateSet;

pub struct ClusterEngine {
    store: Arc<dyn CatalogueStore>,
    blob: Arc<dyn BlobSink>,
    thumbnail_dir: PathBuf,
    /// Fast-path tolerance for 512-d online matching (spec.md §4.2): the
    /// online path matches against both long-lived exemplars and clusters
    /// created moments ago in this same run, so it uses the single looser
    /// threshold the source's `find_matching_person_optimized` applies
    /// uniformly to both layers, rather than the stricter default used by
    /// the offline paths below.
    fast_path_tolerance_512: f32,
    tolerance_128: f32,
    /// Offline tolerance for 512-d faces (merge/recluster), stricter than
    /// the online fast path (spec.md §4.2).
    offline_tolerance_512: f32,
    /// `best_face_score` cache keyed by person id, substituting the
    /// source's per-worker-process global (SPEC_FULL.md §2.1, Design Notes
    /// §9): read once per person then kept warm across faces processed by
    /// any worker thread sharing this engine.
    best_score_cache: Mutex<HashMap<Uuid, f32>>,
}

impl ClusterEngine {
    pub fn new(
        store: Arc<dyn CatalogueStore>,
        blob: Arc<dyn BlobSink>,
        thumbnail_dir: PathBuf,
        fast_path_tolerance_512: f32,
        tolerance_128: f32,
        offline_tolerance_512: f32,
    ) -> Self {
        Self {
            store,
            blob,
            thumbnail_dir,
            fast_path_tolerance_512,
            tolerance_128,
            offline_tolerance_512,
            best_score_cache: Mutex::new(HashMap::new()),
        }
    }

    fn online_tolerance(&self, dim: usize) -> f32 {
        if dim == 512 {
            self.fast_path_tolerance_512
        } else {
            self.tolerance_128
        }
    }

    fn offline_tolerance(&self, dim: usize) -> f32 {
        if dim == 512 {
            self.offline_tolerance_512
        } else {
            DEFAULT_TOLERANCE_128
        }
    }

    /// Online match-or-create (spec.md §4.6). Finds the best matching
    /// cluster under the online tolerance; creates a new singleton cluster
    /// if nothing matches. Every accepted embedding — matched or new — is
    /// published to `candidates` as a fresh exemplar, so later faces in the
    /// same run can match against it.
    pub fn match_or_create(
        &self,
        candidates: &CandidateSet,
        embedding: &[f32],
    ) -> Result<(Uuid, bool), CatalogError> {
        self.match_or_create_with_tolerance(candidates, embedding, self.online_tolerance(embedding.len()))
    }

    /// Same as `match_or_create` but with an explicit tolerance, used by
    /// the offline full re-cluster (spec.md §4.6), which applies the
    /// stricter offline thresholds instead of the online fast path.
    pub fn match_or_create_offline(
        &self,
        candidates: &CandidateSet,
        embedding: &[f32],
    ) -> Result<(Uuid, bool), CatalogError> {
        self.match_or_create_with_tolerance(candidates, embedding, self.offline_tolerance(embedding.len()))
    }

    fn match_or_create_with_tolerance(
        &self,
        candidates: &CandidateSet,
        embedding: &[f32],
        tolerance: f32,
    ) -> Result<(Uuid, bool), CatalogError> {
        let mut pool = Vec::new();
        candidates.for_each(|e| pool.push(e.clone()));

        let found = match_candidate(embedding, &pool, tolerance);

        let (person_id, is_new) = match found {
            Some((person_id, _distance)) => (person_id, false),
            None => {
                let now = Utc::now();
                let person = Person {
                    id: Uuid::new_v4(),
                    name: None,
                    created_at: now,
                    updated_at: now,
                    representative_face_id: None,
                    best_face_score: 0.0,
                };
                self.store.insert_person(&person)?;
                self.best_score_cache.lock().unwrap().insert(person.id, 0.0);
                (person.id, true)
            }
        };

        candidates.publish(Exemplar {
            person_id,
            embedding: embedding.to_vec(),
        });

        Ok((person_id, is_new))
    }

    /// Representative-face update (spec.md §4.6). Regenerates and persists
    /// the cluster's representative thumbnail whenever the new face's
    /// `det_score` beats the cached `best_face_score`, or no on-disk
    /// representative exists yet.
    pub fn update_representative(
        &self,
        person_id: Uuid,
        face_id: Uuid,
        det_score: f32,
        image: &image::RgbImage,
        bbox: BBox,
    ) -> Result<(), CatalogError> {
        let rep_rel = format!("faces/person_{person_id}.jpg");
        let rep_path = self.thumbnail_dir.join(&rep_rel);

        let cached_best = self.cached_best_score(person_id)?;

        if det_score > cached_best || !rep_path.exists() {
            let thumb_bytes = face_thumbnail(image, bbox)?;
            if let Some(parent) = rep_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&rep_path, &thumb_bytes)?;

            if self.blob.enabled() {
                self.blob.put(&thumb_bytes, &rep_rel, "image/jpeg")?;
            }

            self.store
                .update_person_representative(person_id, face_id, det_score)?;
            self.best_score_cache
                .lock()
                .unwrap()
                .insert(person_id, det_score);
        }

        Ok(())
    }

    /// Same bookkeeping as `update_representative` but skips regenerating
    /// the thumbnail file: used by the offline full re-cluster, which (like
    /// the source's `recalculate_all_clusters_sync`) assigns
    /// `representative_face_id`/`best_face_score` without re-opening every
    /// original image (SPEC_FULL.md DESIGN.md records this as a deliberate
    /// scope decision).
    pub fn update_representative_metadata_only(
        &self,
        person_id: Uuid,
        face_id: Uuid,
        det_score: f32,
    ) -> Result<(), CatalogError> {
        let cached_best = self.cached_best_score(person_id)?;
        if det_score > cached_best {
            self.store
                .update_person_representative(person_id, face_id, det_score)?;
            self.best_score_cache
                .lock()
                .unwrap()
                .insert(person_id, det_score);
        }
        Ok(())
    }

    fn cached_best_score(&self, person_id: Uuid) -> Result<f32, CatalogError> {
        if let Some(score) = self.best_score_cache.lock().unwrap().get(&person_id) {
            return Ok(*score);
        }
        let score = self
            .store
            .get_person(person_id)?
            .map(|p| p.best_face_score)
            .unwrap_or(0.0);
        self.best_score_cache.lock().unwrap().insert(person_id, score);
        Ok(score)
    }

    /// Offline merge (spec.md §4.6). Refuses to merge two differently named
    /// persons; merging a named person into an unnamed one reverses
    /// direction so the named record wins (ported from `fixup.py`'s
    /// `merge_duplicate_persons`).
    pub fn merge(&self, source: Uuid, target: Uuid) -> Result<(), CatalogError> {
        let src = self
            .store
            .get_person(source)?
            .ok_or(CatalogError::NotFound)?;
        let tgt = self
            .store
            .get_person(target)?
            .ok_or(CatalogError::NotFound)?;

        if let (Some(a), Some(b)) = (&src.name, &tgt.name) {
            if a != b {
                return Err(CatalogError::MergeRefused(format!(
                    "refusing to merge differently named persons {a:?} and {b:?}"
                )));
            }
        }

        let (final_source, final_target) = if src.name.is_some() && tgt.name.is_none() {
            (target, source)
        } else {
            (source, target)
        };

        let faces = self.store.faces_for_person(final_source)?;
        let target_thumb_rel = format!("faces/person_{final_target}.jpg");
        for face in &faces {
            self.store.set_face_person(face.id, Some(final_target))?;
            self.store.set_face_thumbnail(face.id, &target_thumb_rel)?;
        }

        self.store.delete_person(final_source)?;
        self.best_score_cache.lock().unwrap().remove(&final_source);

        let source_thumb_rel = format!("faces/person_{final_source}.jpg");
        let source_thumb_path = self.thumbnail_dir.join(&source_thumb_rel);
        let _ = std::fs::remove_file(&source_thumb_path);
        self.blob.delete(&source_thumb_rel);

        Ok(())
    }

    /// Offline full re-cluster (spec.md §4.6). Clears every face's person
    /// reference, deletes every person, then streams every face with a
    /// decodable embedding through the offline match-or-create path in the
    /// catalogue's natural (insertion) order.
    pub fn recluster(&self) -> Result<ReclusterStats, CatalogError> {
        self.store.clear_all_face_persons()?;
        self.store.delete_all_persons()?;
        self.best_score_cache.lock().unwrap().clear();

        let faces = self.store.all_faces()?;
        let candidates = CandidateSet::from_snapshot(Vec::new());

        let mut stats = ReclusterStats::default();
        for face in faces {
            let (mut embedding, _kind) = match crate::domain::decode_embedding(&face.embedding) {
                Ok(v) => v,
                Err(_) => {
                    stats.undecodable += 1;
                    continue;
                }
            };
            if embedding.len() == 512 {
                crate::domain::embedding::l2_normalize(&mut embedding);
            }

            let (person_id, is_new) = self.match_or_create_offline(&candidates, &embedding)?;
            self.store.set_face_person(face.id, Some(person_id))?;
            self.update_representative_metadata_only(person_id, face.id, face.metadata.det_score)?;

            stats.faces_assigned += 1;
            if is_new {
                stats.persons_created += 1;
            }
        }

        Ok(stats)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReclusterStats {
    pub faces_assigned: usize,
    pub persons_created: usize,
    pub undecodable: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::NullBlobSink;
    use crate::infrastructure::sqlite_store::TestDb;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
        v
    }

    fn engine(store: Arc<dyn CatalogueStore>, dir: &std::path::Path) -> ClusterEngine {
        ClusterEngine::new(
            store,
            Arc::new(NullBlobSink),
            dir.to_path_buf(),
            0.45,
            0.6,
            0.4,
        )
    }

    #[test]
    fn match_or_create_creates_singleton_then_matches_close_embedding() {
        let db = TestDb::new("cluster_engine_match");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(store, tmp.path());
        let candidates = CandidateSet::from_snapshot(vec![]);

        let a = unit(vec![1.0; 512]);
        let (p1, new1) = engine.match_or_create(&candidates, &a).unwrap();
        assert!(new1);

        let mut b = unit(vec![1.0; 512]);
        b[0] = 0.99;
        let b = unit(b);
        let (p2, new2) = engine.match_or_create(&candidates, &b).unwrap();
        assert!(!new2);
        assert_eq!(p1, p2);
    }

    #[test]
    fn match_or_create_separates_dissimilar_embeddings() {
        let db = TestDb::new("cluster_engine_separate");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(store, tmp.path());
        let candidates = CandidateSet::from_snapshot(vec![]);

        let a = unit(vec![1.0; 512]);
        let mut b = vec![0.0f32; 512];
        b[1] = 1.0;
        let b = unit(b);

        let (p1, _) = engine.match_or_create(&candidates, &a).unwrap();
        let (p2, _) = engine.match_or_create(&candidates, &b).unwrap();
        assert_ne!(p1, p2);
    }

    #[test]
    fn merge_refuses_differently_named_persons() {
        let db = TestDb::new("cluster_engine_merge_refuse");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(store.clone(), tmp.path());

        let now = Utc::now();
        let a = Person {
            id: Uuid::new_v4(),
            name: Some("Alice".into()),
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.0,
        };
        let b = Person {
            id: Uuid::new_v4(),
            name: Some("Bob".into()),
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.0,
        };
        store.insert_person(&a).unwrap();
        store.insert_person(&b).unwrap();

        assert!(engine.merge(a.id, b.id).is_err());
    }

    #[test]
    fn merge_reverses_direction_so_named_wins() {
        let db = TestDb::new("cluster_engine_merge_reverse");
        let store: Arc<dyn CatalogueStore> = Arc::new(db.open());
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(store.clone(), tmp.path());

        let now = Utc::now();
        let named = Person {
            id: Uuid::new_v4(),
            name: Some("Alice".into()),
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.0,
        };
        let unnamed = Person {
            id: Uuid::new_v4(),
            name: None,
            created_at: now,
            updated_at: now,
            representative_face_id: None,
            best_face_score: 0.0,
        };
        store.insert_person(&named).unwrap();
        store.insert_person(&unnamed).unwrap();

        // Merging named -> unnamed should reverse: unnamed gets deleted, named survives.
        engine.merge(named.id, unnamed.id).unwrap();

        assert!(store.get_person(unnamed.id).unwrap().is_none());
        assert!(store.get_person(named.id).unwrap().is_some());
    }
}
