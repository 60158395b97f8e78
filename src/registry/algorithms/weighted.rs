//! Weighted random selection.

use super::{Candidate, Random, SelectionStrategy};
use rand::Rng;

/// Weighted load balancer.
///
/// Draws uniformly in `[0, total weight)` and walks the candidates
/// accumulating weight until the draw falls inside one. Candidates with
/// weight 0 are never picked, unless every weight is 0, in which case the
/// draw is uniform over all candidates.
#[derive(Debug, Default)]
pub struct Weighted {
    fallback: Random,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            fallback: Random::new(),
        }
    }
}

impl SelectionStrategy for Weighted {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
        if total == 0 {
            return self.fallback.select(candidates);
        }

        let draw = rand::thread_rng().gen_range(0..total);
        let mut accumulated = 0u64;
        for (idx, candidate) in candidates.iter().enumerate() {
            accumulated += u64::from(candidate.weight);
            if draw < accumulated {
                return Some(idx);
            }
        }

        // draw < total, so the walk always lands
        Some(candidates.len() - 1)
    }
}
