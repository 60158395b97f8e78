//! Server selection strategies.
//!
//! Strategies only ever see the healthy subset of the pool, in registration
//! order, and answer with an index into it.

mod least_conn;
mod random;
mod round_robin;
mod weighted;

pub use least_conn::LeastConnections;
pub use random::Random;
pub use round_robin::RoundRobin;
pub use weighted::Weighted;

use crate::config::Algorithm;

/// What a strategy knows about one candidate server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Weight for weighted selection.
    pub weight: u32,
    /// Calls currently in flight.
    pub connections: u64,
}

/// Trait for server selection strategies.
pub trait SelectionStrategy: Send + Sync {
    /// Pick one of `candidates`, returning its index, or `None` if empty.
    fn select(&self, candidates: &[Candidate]) -> Option<usize>;
}

/// Build the strategy for a configured algorithm.
pub fn build(algorithm: Algorithm) -> Box<dyn SelectionStrategy> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobin::new()),
        Algorithm::Random => Box::new(Random::new()),
        Algorithm::Weighted => Box::new(Weighted::new()),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
    }
}

#[cfg(test)]
pub(crate) fn uniform(n: usize) -> Vec<Candidate> {
    vec![
        Candidate {
            weight: 1,
            connections: 0,
        };
        n
    ]
}
