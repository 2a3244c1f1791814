//! Scatter-gather query fanout: shapes one partition request per shard
//! target, folds the partial results into a bounded heap and completes the
//! query when the last reference to the aggregator drops.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fletch::{config, metrics, IndexSchema, LimitParameter, Neighbor, SearchParameters, SearchResult, UserError};
use tracing::warn;

use crate::cluster::map::{ClusterMap, NodeInfo};
use crate::cluster::rpc::{
    PartitionRequest, PartitionResponse, ShardClient, TransportError, TransportErrorKind,
};
use crate::pool::{Priority, ThreadPool};

/// Max-heap ordering: the furthest neighbor pops first; distance ties pop
/// the lexically smallest key so non-vector results (distance 0) drain into
/// a deterministic key-descending order.
struct FanoutNeighbor(Neighbor);

impl PartialEq for FanoutNeighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for FanoutNeighbor {}

impl PartialOrd for FanoutNeighbor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FanoutNeighbor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .distance
            .total_cmp(&other.0.distance)
            .then_with(|| other.0.key.cmp(&self.0.key))
    }
}

#[derive(Default)]
pub struct FanoutErrors {
    pub index_name_errors: Vec<String>,
    pub communication_errors: Vec<String>,
    pub inconsistent_state_errors: Vec<String>,
}

type Completion = Box<dyn FnOnce(fletch::Result<SearchResult>, SearchParameters) + Send + 'static>;

struct AggregatorState {
    results: BinaryHeap<FanoutNeighbor>,
    parameters: Option<SearchParameters>,
    /// Keep-alive for the local shard's parameter block: its neighbors may
    /// reference strings owned by it, so it lives as long as the aggregator.
    local_responder: Option<SearchParameters>,
    completion: Option<Completion>,
}

/// Shared state across the per-target callbacks. Thread-safe; the heavy
/// mutations run under one mutex, the cancellation plumbing on atomics.
/// When the last clone drops, the heap drains into a `SearchResult` and the
/// completion callback fires on whichever thread performed the final drop.
pub struct SearchFanoutAggregator {
    state: Mutex<AggregatorState>,
    consistency_failed: AtomicBool,
    accumulated_total_count: AtomicUsize,
    errors: Mutex<FanoutErrors>,
}

impl SearchFanoutAggregator {
    pub fn new(parameters: SearchParameters, completion: Completion) -> Arc<Self> {
        Arc::new(SearchFanoutAggregator {
            state: Mutex::new(AggregatorState {
                results: BinaryHeap::new(),
                parameters: Some(parameters),
                local_responder: None,
                completion: Some(completion),
            }),
            consistency_failed: AtomicBool::new(false),
            accumulated_total_count: AtomicUsize::new(0),
            errors: Mutex::new(FanoutErrors::default()),
        })
    }

    pub fn handle_response(
        &self,
        address: &str,
        response: Result<PartitionResponse, TransportError>,
    ) {
        match response {
            Ok(response) => {
                self.accumulated_total_count.fetch_add(response.total_count, Ordering::Relaxed);
                let mut state = self.state.lock().expect("aggregator state lock");
                for neighbor in response.neighbors {
                    Self::add_result(&mut state, neighbor);
                }
            }
            Err(error) => {
                let mut errors = self.errors.lock().expect("aggregator error lock");
                match error.kind {
                    TransportErrorKind::IndexName => {
                        errors.index_name_errors.push(address.to_string())
                    }
                    TransportErrorKind::InconsistentState => {
                        errors.inconsistent_state_errors.push(address.to_string())
                    }
                    _ => errors.communication_errors.push(address.to_string()),
                }
                drop(errors);
                let state = self.state.lock().expect("aggregator state lock");
                let Some(parameters) = state.parameters.as_ref() else { return };
                if parameters.enable_consistency
                    && error.kind == TransportErrorKind::InconsistentState
                {
                    self.consistency_failed.store(true, Ordering::Relaxed);
                }
                let should_cancel = error.kind == TransportErrorKind::ResourceExhausted
                    || !parameters.enable_partial_results
                    || self.consistency_failed.load(Ordering::Relaxed);
                if should_cancel {
                    parameters.token.cancel();
                }
                if !matches!(
                    error.kind,
                    TransportErrorKind::DeadlineExceeded | TransportErrorKind::InconsistentState
                ) {
                    warn!(address, error = %error.message, "error during FT.SEARCH fanout");
                }
            }
        }
    }

    /// Folds the local shard's outcome and stashes its parameter block.
    pub fn handle_local_result(
        &self,
        result: fletch::Result<SearchResult>,
        local_parameters: SearchParameters,
    ) {
        match result {
            Ok(result) => {
                self.accumulated_total_count.fetch_add(result.total_count, Ordering::Relaxed);
                let mut state = self.state.lock().expect("aggregator state lock");
                for neighbor in result.neighbors {
                    Self::add_result(&mut state, neighbor);
                }
                state.local_responder = Some(local_parameters);
            }
            Err(error) => {
                warn!(error = %error, "error during local handling of FT.SEARCH fanout");
                let state = self.state.lock().expect("aggregator state lock");
                if let Some(parameters) = state.parameters.as_ref() {
                    if !parameters.enable_partial_results {
                        parameters.token.cancel();
                    }
                }
            }
        }
    }

    fn add_result(state: &mut AggregatorState, neighbor: Neighbor) {
        let Some(parameters) = state.parameters.as_ref() else { return };
        // non-vector aggregation is unbounded; the result constructor trims
        if parameters.is_non_vector_query() {
            state.results.push(FanoutNeighbor(neighbor));
            return;
        }
        let k = parameters.k;
        if state.results.len() < k {
            state.results.push(FanoutNeighbor(neighbor));
        } else if let Some(worst) = state.results.peek() {
            if neighbor.distance < worst.0.distance {
                state.results.push(FanoutNeighbor(neighbor));
                state.results.pop();
            }
        }
    }
}

impl Drop for SearchFanoutAggregator {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("aggregator state lock");
        let Some(parameters) = state.parameters.take() else { return };
        let Some(completion) = state.completion.take() else { return };
        let outcome = if self.consistency_failed.load(Ordering::Relaxed) {
            Err(UserError::ConsistencyCheckFailed.into())
        } else {
            let mut neighbors: Vec<Neighbor> = Vec::with_capacity(state.results.len());
            while let Some(FanoutNeighbor(neighbor)) = state.results.pop() {
                neighbors.push(neighbor);
            }
            neighbors.reverse();
            let total = self.accumulated_total_count.load(Ordering::Relaxed);
            Ok(SearchResult::new(total, neighbors, &parameters))
        };
        // the local responder's strings stay alive until after completion
        let local_responder = state.local_responder.take();
        drop(state);
        completion(outcome, parameters);
        drop(local_responder);
    }
}

/// Per-shard LIMIT shaping. Non-vector queries that tolerate partial
/// results only need `(offset+count)` candidates across the cluster; the
/// uniformity dial widens the per-shard share toward the full `K` as the
/// operator declares the data more skewed. Vector queries always fetch `k`
/// per shard (the worst case puts all winners on one shard).
pub fn per_shard_limit(
    parameters: &SearchParameters,
    target_count: usize,
    index_size: u64,
) -> LimitParameter {
    if parameters.is_vector_query() {
        return LimitParameter { first_index: 0, number: parameters.k as u64 };
    }
    let k = parameters.limit.first_index + parameters.limit.number;
    let min_index_size = config::FANOUT_UNIFORMITY_MIN_INDEX_SIZE.get();
    if index_size < min_index_size || parameters.requires_complete_results() {
        return LimitParameter { first_index: 0, number: k };
    }
    let n = target_count.max(1) as u64;
    let uniformity = config::FANOUT_DATA_UNIFORMITY_PERCENT.get();
    let fair_share_limit = k.div_ceil(n);
    let skew_gap = k - fair_share_limit;
    let number = fair_share_limit + (100 - uniformity) * skew_gap / 100;
    LimitParameter { first_index: 0, number }
}

/// Dispatches the query to every target and returns the aggregator; the
/// completion fires once every issued callback has run and all clones of
/// the aggregator are gone.
pub fn perform_search_fanout(
    targets: &[NodeInfo],
    map: &ClusterMap,
    client: &Arc<dyn ShardClient>,
    local_schema: Option<&Arc<IndexSchema>>,
    parameters: SearchParameters,
    pool: Option<&ThreadPool>,
    completion: Completion,
) {
    let index_size = local_schema.map_or(0, |schema| schema.read().tracked_key_count() as u64);
    let shard_limit = per_shard_limit(&parameters, targets.len(), index_size);

    let mut request_parameters = parameters.clone();
    request_parameters.limit = shard_limit;
    request_parameters.is_cluster = true;

    let aggregator = SearchFanoutAggregator::new(parameters, completion);
    let async_dispatch = targets.len() as u64
        >= config::ASYNC_FANOUT_THRESHOLD.get()
        && pool.is_some_and(|p| p.size() > 1);

    let mut local_target = None;
    for node in targets {
        if node.is_local {
            // deferred: the local search owns its parameter block
            local_target = Some(node.clone());
            continue;
        }
        let slot_fingerprint = if config::DEBUG_FORCE_INVALID_SLOT_FINGERPRINT.get() {
            0
        } else {
            map.shards().get(node.shard_index).map_or(0, |shard| shard.slots_fingerprint)
        };
        let request = PartitionRequest {
            parameters: request_parameters.clone(),
            slot_fingerprint,
        };
        let address = node.address.to_string();
        let aggregator = Arc::clone(&aggregator);
        let callback_address = address.clone();
        let callback: crate::cluster::rpc::PartitionCallback = Box::new(move |response| {
            aggregator.handle_response(&callback_address, response);
        });
        match (async_dispatch, pool) {
            (true, Some(pool)) => {
                let client = Arc::clone(client);
                pool.schedule(Priority::High, move || {
                    client.search_partition(&address, request, callback);
                });
            }
            _ => client.search_partition(&address, request, callback),
        }
    }

    if let (Some(_node), Some(schema)) = (local_target, local_schema) {
        let schema = Arc::clone(schema);
        let local_parameters = request_parameters.clone();
        let aggregator_for_local = Arc::clone(&aggregator);
        let run_local = move || {
            let result = fletch::search::search(&schema, &local_parameters);
            aggregator_for_local.handle_local_result(result, local_parameters);
        };
        match pool {
            Some(pool) => pool.schedule(Priority::High, run_local),
            None => run_local(),
        }
    }
}

/// Base behavior for retryable fanout rounds (FT.INFO and the create/drop
/// consistency checks). An operation that failed an entire round with
/// deadline remaining re-issues to all targets.
pub trait FanoutOperationBase {
    fn should_retry(&self, failed_targets: usize, total_targets: usize) -> bool {
        failed_targets == total_targets && total_targets > 0
    }

    fn reset_for_retry(&mut self) {}
}

/// Drives a closure-based fanout round with the retry policy above.
pub fn run_with_retries<T: FanoutOperationBase>(
    operation: &mut T,
    max_rounds: u32,
    mut round: impl FnMut(&mut T) -> (usize, usize),
) -> u32 {
    let mut rounds = 0;
    loop {
        let (failed, total) = round(operation);
        rounds += 1;
        if rounds >= max_rounds || !operation.should_retry(failed, total) {
            return rounds;
        }
        metrics::stats().fanout_retries.incr();
        operation.reset_for_retry();
    }
}

#[cfg(test)]
mod tests {
    use fletch::cancel::ManualToken;
    use fletch::index::{DistanceMetric, VectorKind};
    use fletch::intern;

    use super::*;
    use crate::cluster::map::test_topology;
    use crate::cluster::rpc::InProcessClient;

    fn make_schema(points: &[(&str, [f32; 2])]) -> Arc<IndexSchema> {
        let schema = IndexSchema::builder("idx")
            .numeric("num", "num")
            .unwrap()
            .vector("v", "v", VectorKind::Flat, 2, DistanceMetric::L2)
            .unwrap()
            .build()
            .unwrap();
        for (i, (key, point)) in points.iter().enumerate() {
            let key = intern(key);
            schema.upsert_record(&key, &[("num", &format!("{i}"))]);
            schema.upsert_vector(&key, "v", point.to_vec());
        }
        Arc::new(schema)
    }

    fn run_fanout(
        parameters: SearchParameters,
        shards: Vec<Arc<IndexSchema>>,
    ) -> (fletch::Result<SearchResult>, SearchParameters) {
        let topology = test_topology(0, shards.len());
        let map = ClusterMap::from_topology(topology);
        let mut client = InProcessClient::new();
        for (shard, schema) in map.shards().iter().zip(&shards) {
            let primary = shard.primary().unwrap();
            client.register(
                &primary.address.to_string(),
                Arc::clone(schema),
                shard.slots_fingerprint,
            );
        }
        let client: Arc<dyn ShardClient> = Arc::new(client);
        let (tx, rx) = std::sync::mpsc::channel();
        let completion: Completion = Box::new(move |result, parameters| {
            let _ = tx.send((result, parameters));
        });
        let targets = map.targets(crate::cluster::map::FanoutTargetMode::Primary);
        perform_search_fanout(
            &targets,
            &map,
            &client,
            Some(&shards[0]),
            parameters,
            None,
            completion,
        );
        rx.recv().expect("fanout completion")
    }

    #[test]
    fn merges_vector_top_k_across_shards() {
        let shard_a = make_schema(&[("a1", [0.0, 1.0]), ("a2", [0.0, 4.0])]);
        let shard_b = make_schema(&[("b1", [0.0, 2.0]), ("b2", [0.0, 3.0])]);
        let mut parameters = SearchParameters::new("idx", ManualToken::token());
        parameters.attribute_alias = Some("v".to_string());
        parameters.k = 3;
        parameters.limit = LimitParameter { first_index: 0, number: 10 };
        parameters.query_vector = vec![0.0, 0.0];
        let (result, _) = run_fanout(parameters, vec![shard_a, shard_b]);
        let result = result.unwrap();
        let keys: Vec<&str> = result.neighbors.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["a1", "b1", "b2"]);
    }

    #[test]
    fn non_vector_merges_with_key_tiebreak() {
        let shard_a = make_schema(&[("k2", [0.0, 1.0])]);
        let shard_b = make_schema(&[("k1", [0.0, 1.0])]);
        let mut parameters = SearchParameters::new("idx", ManualToken::token());
        parameters.filter = fletch::parse_filter(
            &shard_a,
            "@num:[0 100]",
            fletch::ProximityOptions::default(),
        )
        .unwrap();
        let (result, _) = run_fanout(parameters, vec![shard_a, shard_b]);
        let result = result.unwrap();
        // deterministic order: distance ties resolve by key descending
        let keys: Vec<&str> = result.neighbors.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["k2", "k1"]);
        assert_eq!(result.total_count, 2);
    }

    #[test]
    fn consistency_gate_cancels_and_fails() {
        let shard_a = make_schema(&[("a", [0.0, 1.0])]);
        let shard_b = make_schema(&[("b", [0.0, 2.0])]);
        config::DEBUG_FORCE_INVALID_SLOT_FINGERPRINT.set(true);
        let mut parameters = SearchParameters::new("idx", ManualToken::token());
        parameters.enable_consistency = true;
        parameters.filter =
            fletch::parse_filter(&shard_a, "@num:[0 100]", fletch::ProximityOptions::default())
                .unwrap();
        let (result, parameters) = run_fanout(parameters, vec![shard_a, shard_b]);
        config::DEBUG_FORCE_INVALID_SLOT_FINGERPRINT.set(false);
        assert!(result.is_err());
        assert!(parameters.token.is_cancelled());
    }

    #[test]
    fn per_shard_limits() {
        let token = ManualToken::token();
        let mut parameters = SearchParameters::new("idx", token);
        parameters.limit = LimitParameter { first_index: 0, number: 1000 };
        // uniform data: ceil(1000 / 3) per shard
        config::FANOUT_DATA_UNIFORMITY_PERCENT.set(100).unwrap();
        let limit = per_shard_limit(&parameters, 3, 1_000_000);
        assert_eq!(limit.number, 334);
        // fully skewed data: fetch K everywhere
        config::FANOUT_DATA_UNIFORMITY_PERCENT.set(0).unwrap();
        let limit = per_shard_limit(&parameters, 3, 1_000_000);
        assert_eq!(limit.number, 1000);
        config::FANOUT_DATA_UNIFORMITY_PERCENT.set(100).unwrap();

        // small indexes skip the shaping
        let limit = per_shard_limit(&parameters, 3, 10);
        assert_eq!(limit.number, 1000);

        // complete results (SORTBY) skip the shaping
        parameters.sortby = Some(fletch::SortByParameter {
            field: "num".to_string(),
            order: fletch::SortOrder::Ascending,
        });
        let limit = per_shard_limit(&parameters, 3, 1_000_000);
        assert_eq!(limit.number, 1000);
        parameters.sortby = None;

        // vector queries fetch k per shard
        parameters.attribute_alias = Some("v".to_string());
        parameters.k = 7;
        let limit = per_shard_limit(&parameters, 3, 1_000_000);
        assert_eq!(limit.number, 7);
    }

    #[test]
    fn retry_rounds() {
        struct Op {
            resets: u32,
        }
        impl FanoutOperationBase for Op {
            fn reset_for_retry(&mut self) {
                self.resets += 1;
            }
        }
        let mut op = Op { resets: 0 };
        // every round fails entirely: retries until the cap
        let rounds = run_with_retries(&mut op, 3, |_| (2, 2));
        assert_eq!(rounds, 3);
        assert_eq!(op.resets, 2);

        let mut op = Op { resets: 0 };
        // partial success: no retry
        let rounds = run_with_retries(&mut op, 3, |_| (1, 2));
        assert_eq!(rounds, 1);
        assert_eq!(op.resets, 0);
    }
}
