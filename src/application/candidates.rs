//! C6 candidate set (spec.md §5). Two layers, as the source's worker
//! processes maintained them: a read-only snapshot of every pre-existing
//! exemplar loaded once before ingestion starts, and an append-only list of
//! clusters created during the current run. SPEC_FULL.md OQ-2 re-architects
//! the source's multiprocessing-manager list (shared across OS worker
//! processes) as a single `RwLock<Vec<Exemplar>>` shared across worker
//! threads in one process — readers never block each other, writers append
//! without ever removing or reordering existing entries.
//!
//! A newly appended exemplar is visible to every other worker the instant the
//! write lock is released: there is no per-worker lazy-refresh cache to
//! rebuild (unlike the source's per-process `_CACHED_NEW_MATRIX`), since all
//! workers share this one structure in-process. The accepted
//! non-determinism of two workers creating a duplicate cluster for the same
//! person within the same instant (spec.md §5) still holds: each worker reads
//! the list, finds no match, and only then takes the write lock to append —
//! the read and the append are not one atomic step.

use std::sync::RwLock;

use crate::domain::Exemplar;

pub struct CandidateSet {
    snapshot: Vec<Exemplar>,
    live: RwLock<Vec<Exemplar>>,
}

impl CandidateSet {
    /// Loads the snapshot layer once, from every face with a person
    /// reference in the catalogue at ingestion start.
    pub fn from_snapshot(snapshot: Vec<Exemplar>) -> Self {
        Self {
            snapshot,
            live: RwLock::new(Vec::new()),
        }
    }

    /// Appends an exemplar for a cluster created during this run. Visible to
    /// all other workers as soon as this call returns.
    pub fn publish(&self, exemplar: Exemplar) {
        self.live.write().unwrap().push(exemplar);
    }

    /// Runs `f` over every candidate exemplar: the static snapshot followed
    /// by everything published so far this run. Used by the online
    /// match-or-create path (spec.md §4.6) and by offline merge/recluster,
    /// which construct a fresh `CandidateSet` per operation instead of
    /// sharing this one.
    pub fn for_each<F: FnMut(&Exemplar)>(&self, mut f: F) {
        for e in &self.snapshot {
            f(e);
        }
        for e in self.live.read().unwrap().iter() {
            f(e);
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot.len() + self.live.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn published_exemplars_are_visible_immediately() {
        let set = CandidateSet::from_snapshot(vec![]);
        assert!(set.is_empty());
        set.publish(Exemplar {
            person_id: Uuid::new_v4(),
            embedding: vec![1.0; 512],
        });
        assert_eq!(set.len(), 1);
        let mut seen = 0;
        set.for_each(|_| seen += 1);
        assert_eq!(seen, 1);
    }

    #[test]
    fn snapshot_and_live_both_iterated() {
        let pid = Uuid::new_v4();
        let set = CandidateSet::from_snapshot(vec![Exemplar {
            person_id: pid,
            embedding: vec![0.0; 128],
        }]);
        set.publish(Exemplar {
            person_id: Uuid::new_v4(),
            embedding: vec![1.0; 128],
        });
        assert_eq!(set.len(), 2);
    }
}
