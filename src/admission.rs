//! # Neighbour Admission
//!
//! Overlay adjacency is agreed pairwise: a node asks a peer to admit it and
//! the peer decides locally with [`accept_neighbour`]. The decision is
//! probabilistic. Its acceptance score rises with:
//!
//! - **capacity similarity**: `min(local, candidate) / max(local, candidate)`
//! - **spare slots**: the fraction of local neighbour slots still free
//!
//! ```text
//! score = 0.5 + 1.5 · similarity · spare
//! accept  ⇔  score · r > threshold,   r ∈ [0, 1)
//! ```
//!
//! A full neighbour set always rejects. With the default threshold of 0.5 a
//! candidate of identical capacity arriving at an empty node is accepted
//! with probability 0.75; one arriving at a nearly full node with a tenth
//! of our capacity is accepted only rarely.

use rand::Rng;

/// Default acceptance threshold.
pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 0.5;

/// Base score every candidate receives before similarity and spare slots.
const BASE_SCORE: f64 = 0.5;

/// Weight of `similarity × spare` in the score.
const AFFINITY_WEIGHT: f64 = 1.5;

/// Deterministic part of the admission decision, in `[0.5, 2.0]`.
///
/// Returns 0 when there is no spare slot left.
pub fn acceptance_score(local_capacity: u32, candidate_capacity: u32, neighbours: usize) -> f64 {
    let local = local_capacity as f64;
    let used = neighbours as f64;
    if local_capacity == 0 || used >= local {
        return 0.0;
    }

    let candidate = candidate_capacity.max(1) as f64;
    let similarity = local.min(candidate) / local.max(candidate);
    let spare = (local - used) / local;

    BASE_SCORE + AFFINITY_WEIGHT * similarity * spare
}

/// Decide whether to admit a candidate with `candidate_capacity` as a neighbour.
pub fn accept_neighbour<R: Rng + ?Sized>(
    rng: &mut R,
    local_capacity: u32,
    neighbours: usize,
    candidate_capacity: u32,
    threshold: f64,
) -> bool {
    if neighbours >= local_capacity as usize {
        return false;
    }
    let score = acceptance_score(local_capacity, candidate_capacity, neighbours);
    let r: f64 = rng.gen_range(0.0..1.0);
    score * r > threshold
}
