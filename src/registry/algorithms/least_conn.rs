//! Least-connections selection.

use super::{Candidate, SelectionStrategy};

/// Least-connections load balancer.
///
/// Sends calls to the candidate with the fewest calls in flight. Ties go to
/// the first candidate in registration order.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for LeastConnections {
    fn select(&self, candidates: &[Candidate]) -> Option<usize> {
        let mut selected: Option<(usize, u64)> = None;

        for (idx, candidate) in candidates.iter().enumerate() {
            match selected {
                Some((_, min)) if candidate.connections >= min => {}
                _ => selected = Some((idx, candidate.connections)),
            }
        }

        selected.map(|(idx, _)| idx)
    }
}
