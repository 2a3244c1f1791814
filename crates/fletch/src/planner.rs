//! The query planner decides between pre-filtering (evaluate the predicate
//! first, exact distances on the survivors) and inline filtering (walk the
//! vector graph with the predicate as an acceptance callback).

use crate::config;
use crate::index::VectorKind;

pub fn use_prefiltering(
    estimated_num_of_keys: usize,
    kind: VectorKind,
    tracked_key_count: usize,
) -> bool {
    match kind {
        // a flat scan costs O(N log k); scanning only the filtered space is
        // always at least as good
        VectorKind::Flat => true,
        // for a graph index, prefiltering wins while the candidate set is a
        // small fraction of the index
        VectorKind::Hnsw => {
            estimated_num_of_keys as f64
                <= config::prefilter_threshold_ratio() * tracked_key_count as f64
        }
    }
}
