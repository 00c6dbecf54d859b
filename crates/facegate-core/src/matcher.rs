//! Majority-vote identity matching.
//!
//! Every gallery entry within the distance threshold casts one vote for
//! its label. A label enrolled with many images therefore outvotes a label
//! enrolled with one image at equal similarity.

use crate::gallery::Gallery;
use crate::types::{Embedding, MatchResult};

/// Strategy for deciding which enrolled label an unknown embedding belongs to.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;
}

/// Counts matching entries per label and picks the label with the most votes.
///
/// Ties go to the label whose first matching entry appears earliest in
/// gallery order.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoteMatcher;

impl Matcher for VoteMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        // Labels in first-encountered order; a gallery holds a handful of
        // labels so a linear scan beats hashing here.
        let mut votes: Vec<(&str, usize)> = Vec::new();

        for entry in gallery.entries() {
            let distance = probe.euclidean_distance(&entry.embedding);
            if distance > threshold {
                continue;
            }
            match votes.iter_mut().find(|(label, _)| *label == entry.label) {
                Some((_, count)) => *count += 1,
                None => votes.push((entry.label.as_str(), 1)),
            }
        }

        let mut winner: Option<(&str, usize)> = None;
        for &(label, count) in &votes {
            if winner.map_or(true, |(_, best)| count > best) {
                winner = Some((label, count));
            }
        }

        match winner {
            Some((label, count)) => MatchResult {
                label: Some(label.to_string()),
                confidence_votes: count,
            },
            None => MatchResult::unknown(),
        }
    }
}

/// Identify `unknown` against `gallery` with the majority-vote policy.
pub fn identify(unknown: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
    VoteMatcher.compare(unknown, gallery, threshold)
}
