//! C2: similarity kernel. Chooses the metric and threshold by embedding
//! dimensionality and finds the best-matching candidate cluster under
//! nearest-neighbour linkage (spec.md §4.2).

use super::ports::Exemplar;

pub const DEFAULT_TOLERANCE_512: f32 = 0.4;
pub const DEFAULT_TOLERANCE_128: f32 = 0.6;
/// Stricter tolerance used by the worker runtime's in-process fast path
/// (§4.7), since it matches against freshly created clusters that have not
/// yet accumulated multiple exemplars.
pub const FAST_PATH_TOLERANCE_512: f32 = 0.45;

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Distance between two embeddings of the same dimensionality: `1 -
/// dot(a, b)` for 512-d (both assumed unit-norm), Euclidean otherwise.
pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() == 512 {
        1.0 - dot(a, b)
    } else {
        euclidean(a, b)
    }
}

/// Tolerance implied by an embedding's dimensionality.
pub fn default_tolerance(dim: usize) -> f32 {
    if dim == 512 {
        DEFAULT_TOLERANCE_512
    } else {
        DEFAULT_TOLERANCE_128
    }
}

/// Finds the best-matching candidate under nearest-neighbour linkage:
/// cluster distance is the minimum over that cluster's exemplars. Candidates
/// of a different dimensionality than `query` are skipped silently. Ties are
/// broken by first-encountered (`<` rather than `<=` below preserves the
/// first candidate seen at an equal distance).
pub fn match_candidate(
    query: &[f32],
    candidates: &[Exemplar],
    tolerance: f32,
) -> Option<(uuid::Uuid, f32)> {
    let mut best: Option<(uuid::Uuid, f32)> = None;

    for candidate in candidates {
        if candidate.embedding.len() != query.len() {
            continue;
        }
        let d = distance(query, &candidate.embedding);
        match &best {
            Some((_, best_d)) if d >= *best_d => {}
            _ => best = Some((candidate.person_id, d)),
        }
    }

    match best {
        Some((person_id, d)) if d <= tolerance => Some((person_id, d)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in v.iter_mut() {
            *x /= norm;
        }
        v
    }

    #[test]
    fn distance_is_symmetric_for_512d_unit_vectors() {
        let a = unit(vec![1.0, 0.5, -0.3, 0.2].into_iter().cycle().take(512).collect());
        let b = unit(vec![0.2, -0.1, 0.9, 0.4].into_iter().cycle().take(512).collect());
        assert!((distance(&a, &b) - distance(&b, &a)).abs() < 1e-5);
    }

    #[test]
    fn matches_nearest_exemplar_under_tolerance() {
        let query = unit(vec![1.0; 512]);
        let close = unit(vec![1.0; 512]);
        let far = unit({
            let mut v = vec![1.0; 512];
            v[0] = -1.0;
            v
        });
        let pid_close = Uuid::new_v4();
        let pid_far = Uuid::new_v4();
        let candidates = vec![
            Exemplar { person_id: pid_far, embedding: far },
            Exemplar { person_id: pid_close, embedding: close },
        ];
        let (matched, d) = match_candidate(&query, &candidates, DEFAULT_TOLERANCE_512).unwrap();
        assert_eq!(matched, pid_close);
        assert!(d < 0.01);
    }

    #[test]
    fn returns_none_when_nothing_within_tolerance() {
        let query = unit(vec![1.0; 512]);
        let orthogonal = {
            let mut v = vec![0.0f32; 512];
            v[1] = 1.0;
            v
        };
        let candidates = vec![Exemplar {
            person_id: Uuid::new_v4(),
            embedding: orthogonal,
        }];
        assert!(match_candidate(&query, &candidates, DEFAULT_TOLERANCE_512).is_none());
    }

    #[test]
    fn skips_mismatched_dimensionality() {
        let query = unit(vec![1.0; 512]);
        let candidates = vec![Exemplar {
            person_id: Uuid::new_v4(),
            embedding: vec![1.0; 128],
        }];
        assert!(match_candidate(&query, &candidates, 100.0).is_none());
    }
}
