//! Nearest-neighbor identity matching over the enrolled gallery.

use crate::types::{Embedding, FaceRecord};

/// Fixed acceptance cutoff: a best score below this is reported as unknown.
pub const RECOGNITION_THRESHOLD: f32 = 0.35;

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Label of the accepted best match; `None` means unknown.
    pub label: Option<String>,
    /// Raw best similarity, kept even when the match is rejected so callers
    /// can see how close the closest record was.
    pub score: f32,
}

/// Strategy for comparing a probe embedding against enrolled records.
pub trait Matcher {
    fn best_match(&self, probe: &Embedding, gallery: &[FaceRecord], threshold: f32) -> MatchResult;
}

/// Linear-scan cosine similarity matcher.
///
/// The running best is updated with a strict `>`, so the first record
/// reaching the maximum wins and later ties do not overwrite it.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, probe: &Embedding, gallery: &[FaceRecord], threshold: f32) -> MatchResult {
        let mut best_score = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, record) in gallery.iter().enumerate() {
            let score = probe.similarity(&record.vector);
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_score >= threshold => MatchResult {
                label: Some(gallery[idx].label.clone()),
                score: best_score,
            },
            _ => MatchResult {
                label: None,
                score: if best_score == f32::NEG_INFINITY {
                    0.0
                } else {
                    best_score
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(label: &str, vector: Vec<f32>) -> FaceRecord {
        FaceRecord {
            label: label.into(),
            vector,
        }
    }

    fn probe(values: Vec<f32>) -> Embedding {
        Embedding { values }
    }

    #[test]
    fn test_exact_vector_scores_one() {
        let gallery = vec![
            record("bob", vec![0.0, 1.0, 0.0]),
            record("alice", vec![1.0, 0.0, 0.0]),
        ];
        let result = CosineMatcher.best_match(&probe(vec![1.0, 0.0, 0.0]), &gallery, RECOGNITION_THRESHOLD);
        assert_eq!(result.label.as_deref(), Some("alice"));
        assert!((result.score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_first_record_wins_ties() {
        // Two records with identical vectors: the earlier one must win.
        let gallery = vec![
            record("first", vec![1.0, 0.0]),
            record("second", vec![1.0, 0.0]),
        ];
        let result = CosineMatcher.best_match(&probe(vec![1.0, 0.0]), &gallery, RECOGNITION_THRESHOLD);
        assert_eq!(result.label.as_deref(), Some("first"));
    }

    #[test]
    fn test_score_at_threshold_is_accepted() {
        // Acceptance is `>=`: a score exactly at the cutoff is a match.
        let gallery = vec![record("alice", vec![0.35, (1.0f32 - 0.35 * 0.35).sqrt()])];
        let query = probe(vec![1.0, 0.0]);
        let boundary = query.similarity(&gallery[0].vector);
        assert!((boundary - 0.35).abs() < 1e-3);

        let result = CosineMatcher.best_match(&query, &gallery, boundary);
        assert_eq!(result.label.as_deref(), Some("alice"));

        // A hair above the best score must reject and keep the raw score.
        let result = CosineMatcher.best_match(&query, &gallery, boundary + 1e-4);
        assert_eq!(result.label, None);
        assert!((result.score - boundary).abs() < 1e-6);
    }

    #[test]
    fn test_score_below_threshold_is_unknown_with_raw_score() {
        let gallery = vec![record("alice", vec![0.0, 1.0, 0.0])];
        let result = CosineMatcher.best_match(&probe(vec![1.0, 0.0, 0.0]), &gallery, RECOGNITION_THRESHOLD);
        assert_eq!(result.label, None);
        assert!(result.score.abs() < 1e-6);
    }

    #[test]
    fn test_empty_gallery_degenerates_to_zero() {
        let result = CosineMatcher.best_match(&probe(vec![1.0, 0.0]), &[], RECOGNITION_THRESHOLD);
        assert_eq!(result.label, None);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_score_stays_in_range_and_label_comes_from_gallery() {
        let gallery = vec![
            record("a", vec![0.3, -0.7, 0.2]),
            record("b", vec![-0.5, 0.5, 0.5]),
            record("c", vec![0.0, 0.0, 1.0]),
        ];
        let probes = [
            vec![1.0, 0.0, 0.0],
            vec![-1.0, -1.0, -1.0],
            vec![0.1, 0.9, -0.3],
        ];
        for values in probes {
            let result = CosineMatcher.best_match(&probe(values), &gallery, RECOGNITION_THRESHOLD);
            assert!(result.score >= -1.0 - 1e-6 && result.score <= 1.0 + 1e-6);
            if let Some(label) = &result.label {
                assert!(gallery.iter().any(|r| &r.label == label));
            }
        }
    }

    #[test]
    fn test_near_match_above_threshold() {
        // [0.9, 0.1, 0] against [1, 0, 0]: cos ≈ 0.9939, well above 0.35.
        let gallery = vec![record("alice", vec![1.0, 0.0, 0.0])];
        let result = CosineMatcher.best_match(&probe(vec![0.9, 0.1, 0.0]), &gallery, RECOGNITION_THRESHOLD);
        assert_eq!(result.label.as_deref(), Some("alice"));
        assert!((result.score - 0.9939).abs() < 1e-3);
    }
}
