use crate::store::WorkingSet;
use crate::types::{Embedding, MatchEntry, MatchResult};

/// Default maximum Euclidean distance for a match.
///
/// Tuned for L2-normalised ArcFace embeddings, where a distance of 1.0
/// corresponds to a cosine similarity of 0.5. Lower is stricter.
pub const DEFAULT_TOLERANCE: f32 = 1.0;

/// Strategy for comparing a query embedding against a working set.
pub trait Matcher {
    fn compare(&self, query: &Embedding, working_set: &WorkingSet, tolerance: f32) -> MatchResult;
}

/// Euclidean distance matcher.
///
/// A photo's distance is that of its closest face; it matches iff that
/// distance is within tolerance. Output is sorted by distance, then identifier,
/// so it never depends on how the working set was built.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, query: &Embedding, working_set: &WorkingSet, tolerance: f32) -> MatchResult {
        let mut entries: Vec<MatchEntry> = working_set
            .iter()
            .filter_map(|(id, faces)| {
                let distance = faces
                    .iter()
                    .filter(|face| face.dimension() == query.dimension())
                    .map(|face| query.euclidean_distance(face))
                    .min_by(f32::total_cmp)?;
                (distance <= tolerance).then(|| MatchEntry {
                    id: id.clone(),
                    distance,
                })
            })
            .collect();

        entries.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        tracing::debug!(candidates = working_set.len(), matched = entries.len(), tolerance, "match complete");
        MatchResult { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncodingRecord;

    fn record(id: &str, values: &[f32]) -> EncodingRecord {
        EncodingRecord {
            id: id.parse().unwrap(),
            embedding: Embedding::new(values.to_vec()),
        }
    }

    fn ids(result: &MatchResult) -> Vec<String> {
        result.iter().map(|e| e.id.to_string()).collect()
    }

    #[test]
    fn test_end_to_end_example() {
        // distance(q, e1) = 0.3, distance(q, e3) = 0.5, e2 far away
        let set = WorkingSet::from_records([
            record("A/1.jpg", &[0.3, 0.0]),
            record("A/2.jpg", &[5.0, 5.0]),
            record("B/3.jpg", &[0.0, 0.5]),
        ]);
        let q = Embedding::new(vec![0.0, 0.0]);
        let result = EuclideanMatcher.compare(&q, &set, 0.4);
        assert_eq!(ids(&result), vec!["A/1.jpg"]);
        assert!((result.entries[0].distance - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_sorted_by_distance_then_identifier() {
        let set = WorkingSet::from_records([
            record("B/x.jpg", &[0.2]),
            record("A/z.jpg", &[0.1]),
            record("A/y.jpg", &[0.2]),
        ]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0]), &set, 1.0);
        assert_eq!(ids(&result), vec!["A/z.jpg", "A/y.jpg", "B/x.jpg"]);
    }

    #[test]
    fn test_photo_uses_closest_face_once() {
        let set = WorkingSet::from_records([
            record("A/group.jpg", &[0.9, 0.0]),
            record("A/group.jpg", &[0.1, 0.0]),
        ]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0, 0.0]), &set, 1.0);
        assert_eq!(result.len(), 1);
        assert!((result.entries[0].distance - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        let set = WorkingSet::from_records([record("A/1.jpg", &[0.5])]);
        let q = Embedding::new(vec![0.0]);
        assert_eq!(EuclideanMatcher.compare(&q, &set, 0.5).len(), 1);
        assert!(EuclideanMatcher.compare(&q, &set, 0.49).is_empty());
    }

    #[test]
    fn test_mismatched_dimension_never_matches() {
        let set = WorkingSet::from_records([record("A/1.jpg", &[0.0, 0.0, 0.0])]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0, 0.0]), &set, 10.0);
        assert!(result.is_empty());
    }

    #[test]
    fn test_empty_working_set() {
        let result = EuclideanMatcher.compare(&Embedding::new(vec![1.0]), &WorkingSet::default(), 1.0);
        assert!(result.is_empty());
    }
}
