//! Match classifier - labels each detected face known/unknown
//!
//! Stateless: safe to call concurrently for independent frames.
//! A candidate qualifies only when its distance is strictly below the match
//! threshold. Among qualifying candidates the minimum distance wins, ties
//! broken by identity id ascending.

use crate::domain::payload::{CandidateDistance, FacePayload, FramePayload};
use crate::domain::types::{DetectedFace, EnrolledIdentity, FrameClassification, MatchCandidate, Roster};
use std::cmp::Ordering;
use tracing::debug;

/// Policy match threshold in normalized embedding space
pub const MATCH_THRESHOLD: f32 = 0.45;

/// Euclidean distance between two descriptors, `None` on dimension mismatch
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}

/// Deterministic candidate ordering: distance, then identity id
#[inline]
pub fn candidate_order(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    a.distance
        .partial_cmp(&b.distance)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.identity_id.cmp(&b.identity_id))
}

#[derive(Debug, Clone, Copy)]
pub struct MatchClassifier {
    threshold: f32,
}

impl Default for MatchClassifier {
    fn default() -> Self {
        Self::new(MATCH_THRESHOLD)
    }
}

impl MatchClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Classify every face of a frame against the enrolled roster
    pub fn classify(&self, frame: &FramePayload, roster: &Roster) -> FrameClassification {
        FrameClassification::new(frame.faces.iter().map(|face| self.classify_face(face, roster)))
    }

    /// Classify one face, preferring precomputed distances over the raw descriptor
    pub fn classify_face(&self, face: &FacePayload, roster: &Roster) -> DetectedFace {
        let best = match face.distances.as_deref() {
            Some(distances) => self.best_from_distances(distances, roster),
            None => self.best_from_descriptor(&face.descriptor, roster),
        };
        DetectedFace::new(face.bbox, best).with_descriptor(&face.descriptor)
    }

    fn qualify(&self, identity: &EnrolledIdentity, distance: f32) -> Option<MatchCandidate> {
        // NaN never qualifies
        if !(distance >= 0.0 && distance < self.threshold) {
            return None;
        }
        Some(MatchCandidate {
            identity_id: identity.id.clone(),
            label: identity.label.clone(),
            distance,
            banned: identity.banned,
        })
    }

    fn best_from_descriptor(&self, descriptor: &[f32], roster: &Roster) -> Option<MatchCandidate> {
        roster
            .iter()
            .filter_map(|identity| match euclidean_distance(descriptor, &identity.descriptor) {
                Some(d) => self.qualify(identity, d),
                None => {
                    debug!(
                        identity_id = %identity.id,
                        observed_len = %descriptor.len(),
                        enrolled_len = %identity.descriptor.len(),
                        "descriptor_dimension_mismatch"
                    );
                    None
                }
            })
            .min_by(candidate_order)
    }

    fn best_from_distances(&self, distances: &[CandidateDistance], roster: &Roster) -> Option<MatchCandidate> {
        distances
            .iter()
            .filter_map(|c| match roster.get(&c.identity) {
                Some(identity) => self.qualify(identity, c.distance),
                None => {
                    // Roster refresh lag: the match source knows an identity we don't
                    debug!(identity_id = %c.identity, "distance_for_unenrolled_identity");
                    None
                }
            })
            .min_by(candidate_order)
    }
}
