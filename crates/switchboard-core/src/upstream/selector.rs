//! Endpoint selection.
//!
//! Selection works on plain candidate snapshots so it can be exercised without clients:
//!
//! 1. Keep the candidates with the maximum rating.
//! 2. Narrow them to the ones tagged with the remote method name, falling back to the
//!    ones tagged with the operation name, falling back to all of them.
//! 3. Pick one with the network's algorithm.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::Capability;

/// How a network picks among equally qualified endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PickAlgorithm {
    /// The first endpoint marked primary, else the first endpoint.
    Primary,
    /// A random endpoint other than the one used last, when there is a choice.
    #[default]
    RoundRobin,
}

/// Selection-relevant view of an endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub url: &'a str,
    pub tags: &'a [String],
    pub primary: bool,
    pub rating: i64,
}

impl Candidate<'_> {
    fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Returns the index of the chosen candidate, `None` only if `candidates` is empty.
pub fn select<R: Rng + ?Sized>(
    candidates: &[Candidate<'_>],
    capability: &Capability<'_>,
    algorithm: PickAlgorithm,
    last_used: Option<&str>,
    rng: &mut R,
) -> Option<usize> {
    let max_rating = candidates.iter().map(|c| c.rating).max()?;
    let best: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].rating == max_rating)
        .collect();

    let tagged = |tag: &str| -> Vec<usize> {
        best.iter().copied().filter(|&i| candidates[i].has_tag(tag)).collect()
    };

    let mut pool = capability.method.map(&tagged).unwrap_or_default();
    if pool.is_empty() {
        pool = tagged(capability.member);
    }
    if pool.is_empty() {
        pool = best;
    }

    let chosen = match algorithm {
        PickAlgorithm::Primary => pool
            .iter()
            .copied()
            .find(|&i| candidates[i].primary)
            .unwrap_or(pool[0]),
        PickAlgorithm::RoundRobin => {
            let fresh: Vec<usize> = pool
                .iter()
                .copied()
                .filter(|&i| Some(candidates[i].url) != last_used)
                .collect();
            if fresh.is_empty() {
                pool[0]
            } else {
                fresh[rng.gen_range(0..fresh.len())]
            }
        }
    };

    Some(chosen)
}
