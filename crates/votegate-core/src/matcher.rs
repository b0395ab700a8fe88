//! Nearest-identity matching of a probe descriptor against the gallery.

use crate::gallery::GalleryEntry;
use crate::types::{FaceDescriptor, MatchResult, VoterId};
use thiserror::Error;

/// Distance threshold for a positive match in the 128-d embedding space.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Two identities whose best distances differ by no more than this are
/// indistinguishable, and the probe is reported as unmatched.
pub const TIE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    /// The extractor and the gallery disagree on descriptor shape. This is a
    /// defect, never a user error.
    #[error("descriptor length mismatch against voter {voter_id}: expected {expected}, got {actual}")]
    LengthMismatch {
        voter_id: VoterId,
        expected: usize,
        actual: usize,
    },
}

/// Strategy for comparing a probe descriptor against a gallery of enrolled voters.
pub trait Matcher {
    fn compare(
        &self,
        probe: &FaceDescriptor,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Linear-scan Euclidean matcher.
///
/// A distance of exactly `threshold` counts as a match. Every entry is
/// visited, so the result never depends on gallery order.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &FaceDescriptor,
        gallery: &[GalleryEntry],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut best: Option<(usize, f32)> = None;
        // Best distance among identities other than the current leader.
        let mut runner_up: Option<f32> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let distance = entry.min_distance(probe).map_err(|e| MatchError::LengthMismatch {
                voter_id: entry.identity.voter_id.clone(),
                expected: e.expected,
                actual: e.actual,
            })?;

            match best {
                Some((_, best_distance)) if distance >= best_distance => {
                    if runner_up.map_or(true, |r| distance < r) {
                        runner_up = Some(distance);
                    }
                }
                Some((_, best_distance)) => {
                    runner_up = Some(best_distance);
                    best = Some((i, distance));
                }
                None => best = Some((i, distance)),
            }
        }

        let Some((idx, distance)) = best else {
            return Ok(MatchResult::NoMatch);
        };

        if distance > threshold {
            tracing::debug!(distance, threshold, "nearest voter outside threshold");
            return Ok(MatchResult::NoMatch);
        }

        if let Some(second) = runner_up {
            if (second - distance).abs() <= TIE_EPSILON {
                tracing::warn!(distance, "ambiguous match between enrolled voters; treating as no match");
                return Ok(MatchResult::NoMatch);
            }
        }

        Ok(MatchResult::Matched {
            identity: gallery[idx].identity.clone(),
            distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VoterId, VoterIdentity};
    use chrono::Utc;

    fn d(values: &[f32]) -> FaceDescriptor {
        FaceDescriptor::new(values.to_vec()).unwrap()
    }

    fn entry(id: &str, descriptors: &[&[f32]]) -> GalleryEntry {
        GalleryEntry::new(
            VoterIdentity::new(VoterId::new(id).unwrap(), id),
            descriptors.iter().map(|v| d(v)).collect(),
            Utc::now(),
        )
        .unwrap()
    }

    fn matched_id(result: &MatchResult) -> Option<&str> {
        match result {
            MatchResult::Matched { identity, .. } => Some(identity.voter_id.as_str()),
            MatchResult::NoMatch => None,
        }
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let result = EuclideanMatcher.compare(&d(&[0.0, 0.0]), &[], 0.6).unwrap();
        assert_eq!(result, MatchResult::NoMatch);
    }

    #[test]
    fn test_scans_entire_gallery() {
        // Best match is the last entry.
        let gallery = vec![
            entry("decoy1", &[&[1.0, 0.0]]),
            entry("decoy2", &[&[0.0, 1.0]]),
            entry("match", &[&[0.1, 0.1]]),
        ];
        let result = EuclideanMatcher.compare(&d(&[0.1, 0.15]), &gallery, 0.6).unwrap();
        assert_eq!(matched_id(&result), Some("match"));
        if let MatchResult::Matched { distance, .. } = result {
            assert!((distance - 0.05).abs() < 1e-6);
        }
    }

    #[test]
    fn test_uses_closest_descriptor_of_identity() {
        let gallery = vec![
            entry("multi", &[&[5.0, 5.0], &[0.0, 0.2]]),
            entry("single", &[&[0.0, 0.5]]),
        ];
        let result = EuclideanMatcher.compare(&d(&[0.0, 0.0]), &gallery, 0.6).unwrap();
        assert_eq!(matched_id(&result), Some("multi"));
    }

    #[test]
    fn test_threshold_boundary_inclusive() {
        let gallery = vec![entry("edge", &[&[0.0, 0.5]])];
        let probe = d(&[0.0, 0.0]);

        let at = EuclideanMatcher.compare(&probe, &gallery, 0.5).unwrap();
        assert_eq!(matched_id(&at), Some("edge"));

        let below = EuclideanMatcher.compare(&probe, &gallery, 0.5 - 1e-4).unwrap();
        assert_eq!(below, MatchResult::NoMatch);
    }

    #[test]
    fn test_just_outside_threshold() {
        let gallery = vec![entry("far", &[&[0.0, 0.6001]])];
        let result = EuclideanMatcher.compare(&d(&[0.0, 0.0]), &gallery, 0.6).unwrap();
        assert_eq!(result, MatchResult::NoMatch);
    }

    #[test]
    fn test_equidistant_identities_are_ambiguous() {
        let gallery = vec![
            entry("left", &[&[-0.2, 0.0]]),
            entry("right", &[&[0.2, 0.0]]),
        ];
        let result = EuclideanMatcher.compare(&d(&[0.0, 0.0]), &gallery, 0.6).unwrap();
        assert_eq!(result, MatchResult::NoMatch);
    }

    #[test]
    fn test_ambiguity_detected_regardless_of_order() {
        let gallery = vec![
            entry("far", &[&[0.5, 0.0]]),
            entry("left", &[&[-0.2, 0.0]]),
            entry("right", &[&[0.2, 0.0]]),
        ];
        let result = EuclideanMatcher.compare(&d(&[0.0, 0.0]), &gallery, 0.6).unwrap();
        assert_eq!(result, MatchResult::NoMatch);
    }

    #[test]
    fn test_close_but_distinct_runner_up_still_matches() {
        let gallery = vec![
            entry("near", &[&[0.1, 0.0]]),
            entry("nearish", &[&[0.2, 0.0]]),
        ];
        let result = EuclideanMatcher.compare(&d(&[0.0, 0.0]), &gallery, 0.6).unwrap();
        assert_eq!(matched_id(&result), Some("near"));
    }

    #[test]
    fn test_deterministic() {
        let gallery = vec![entry("a", &[&[0.1, 0.2]]), entry("b", &[&[0.3, 0.1]])];
        let probe = d(&[0.15, 0.2]);
        let first = EuclideanMatcher.compare(&probe, &gallery, 0.6).unwrap();
        for _ in 0..10 {
            assert_eq!(EuclideanMatcher.compare(&probe, &gallery, 0.6).unwrap(), first);
        }
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let gallery = vec![entry("a", &[&[0.1, 0.2, 0.3]])];
        let err = EuclideanMatcher.compare(&d(&[0.1, 0.2]), &gallery, 0.6).unwrap_err();
        assert_eq!(
            err,
            MatchError::LengthMismatch {
                voter_id: VoterId::new("a").unwrap(),
                expected: 2,
                actual: 3,
            }
        );
    }
}
