//! Nearest-identity matching over Euclidean distance.

use crate::types::{Embedding, IdentityRecord, MatchResult};

/// Distance below which a face is accepted as a known identity.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Strategy for comparing a probe encoding against the known identities.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[IdentityRecord], threshold: f32) -> MatchResult;
}

/// Minimum-Euclidean-distance matcher.
///
/// A match requires the minimum distance to be strictly below the threshold.
/// When several identities share the minimum distance, the one that comes
/// first in gallery order wins: later candidates only replace the best on a
/// strictly smaller distance.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[IdentityRecord],
        threshold: f32,
    ) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, identity) in gallery.iter().enumerate() {
            let dist = probe.euclidean_distance(&identity.encoding);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < threshold => MatchResult {
                matched: true,
                distance: best_dist,
                identity_id: Some(gallery[idx].id.clone()),
                index: Some(idx),
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}
