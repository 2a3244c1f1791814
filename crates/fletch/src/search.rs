//! Local search orchestration: runs the entries-fetcher pipeline, the
//! planner and the vector kernel under the schema's read guard and shapes
//! the outcome into a `SearchResult`.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::cancel;
use crate::config;
use crate::error::{Result, UserError};
use crate::fetch::{self, FetcherQueue};
pub use crate::filter::eval::RecordsMap;
use crate::filter::eval::PrefilterEvaluator;
use crate::filter::{is_unsolved_query, needs_deduplication, FilterParseResults};
use crate::index::vector::{format_vector, CandidateHeap};
use crate::index::{IndexKind, TypedIndex};
use crate::interning::InternedString;
use crate::metrics;
use crate::planner;
use crate::schema::{DataType, IndexSchema, SchemaIndexes};

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub key: InternedString,
    pub distance: f32,
    /// The schema's per-key mutation counter when this neighbor was
    /// produced; the re-validation token for post-fetch verification.
    pub sequence_number: u64,
    /// Populated when every requested attribute was available from the
    /// indexes; otherwise the caller fetches the record on the main thread.
    pub attribute_contents: Option<RecordsMap>,
}

impl Neighbor {
    pub fn new(key: InternedString, distance: f32) -> Self {
        Neighbor { key, distance, sequence_number: 0, attribute_contents: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct SortByParameter {
    pub field: String,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitParameter {
    pub first_index: u64,
    pub number: u64,
}

impl Default for LimitParameter {
    fn default() -> Self {
        LimitParameter { first_index: 0, number: 10 }
    }
}

#[derive(Debug, Clone)]
pub struct ReturnAttribute {
    /// Resolved identifier to fetch.
    pub identifier: Arc<str>,
    /// The schema alias when the identifier is indexed.
    pub attribute_alias: Option<String>,
    /// Property name in the reply (`AS`).
    pub alias: String,
}

/// The per-query control block. Created at parse time on the main thread,
/// moved to a reader-pool worker, dropped after the client is unblocked.
#[derive(Clone)]
pub struct SearchParameters {
    pub db_num: u32,
    pub index_name: String,
    /// Vector attribute alias; None makes this a non-vector query.
    pub attribute_alias: Option<String>,
    pub score_as: Option<String>,
    pub query_vector: Vec<f32>,
    pub dialect: u32,
    pub local_only: bool,
    pub enable_partial_results: bool,
    pub enable_consistency: bool,
    pub k: usize,
    pub ef: Option<usize>,
    pub limit: LimitParameter,
    pub timeout_ms: u64,
    pub no_content: bool,
    pub filter: FilterParseResults,
    pub return_attributes: Vec<ReturnAttribute>,
    pub sortby: Option<SortByParameter>,
    pub inorder: bool,
    pub slop: Option<u32>,
    pub verbatim: bool,
    pub index_fingerprint: u64,
    pub slot_fingerprint: u64,
    /// Cluster-mode execution defers offset trimming to the coordinator.
    pub is_cluster: bool,
    /// Aggregate pipelines sort and group at the coordinator, so every
    /// shard must return its complete candidate set.
    pub force_complete_results: bool,
    pub token: cancel::Token,
}

impl SearchParameters {
    pub fn new(index_name: &str, token: cancel::Token) -> Self {
        SearchParameters {
            db_num: 0,
            index_name: index_name.to_string(),
            attribute_alias: None,
            score_as: None,
            query_vector: Vec::new(),
            dialect: 2,
            local_only: false,
            enable_partial_results: config::ENABLE_PARTIAL_RESULTS.get(),
            enable_consistency: config::ENABLE_CONSISTENT_RESULTS.get(),
            k: 0,
            ef: None,
            limit: LimitParameter::default(),
            timeout_ms: config::DEFAULT_TIMEOUT_MS.get(),
            no_content: false,
            filter: FilterParseResults::default(),
            return_attributes: Vec::new(),
            sortby: None,
            inorder: false,
            slop: None,
            verbatim: false,
            index_fingerprint: 0,
            slot_fingerprint: 0,
            is_cluster: false,
            force_complete_results: false,
            token,
        }
    }

    pub fn is_non_vector_query(&self) -> bool {
        self.attribute_alias.is_none()
    }

    pub fn is_vector_query(&self) -> bool {
        !self.is_non_vector_query()
    }

    /// Sorting needs the complete candidate set at the coordinator; per-shard
    /// and local trimming are disabled for such commands.
    pub fn requires_complete_results(&self) -> bool {
        self.sortby.is_some() || self.force_complete_results
    }
}

// `token` is a `dyn Cancellation` trait object with no `Debug` impl, so
// `Debug` for this struct is implemented manually rather than derived.
impl std::fmt::Debug for SearchParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchParameters")
            .field("db_num", &self.db_num)
            .field("index_name", &self.index_name)
            .field("attribute_alias", &self.attribute_alias)
            .field("score_as", &self.score_as)
            .field("query_vector", &self.query_vector)
            .field("dialect", &self.dialect)
            .field("local_only", &self.local_only)
            .field("enable_partial_results", &self.enable_partial_results)
            .field("enable_consistency", &self.enable_consistency)
            .field("k", &self.k)
            .field("ef", &self.ef)
            .field("limit", &self.limit)
            .field("timeout_ms", &self.timeout_ms)
            .field("no_content", &self.no_content)
            .field("filter", &self.filter)
            .field("return_attributes", &self.return_attributes)
            .field("sortby", &self.sortby)
            .field("inorder", &self.inorder)
            .field("slop", &self.slop)
            .field("verbatim", &self.verbatim)
            .field("index_fingerprint", &self.index_fingerprint)
            .field("slot_fingerprint", &self.slot_fingerprint)
            .field("is_cluster", &self.is_cluster)
            .field("force_complete_results", &self.force_complete_results)
            .finish_non_exhaustive()
    }
}

/// Two cases produce an empty reply regardless of matches: a zero LIMIT
/// count, and a vector query whose offset swallows all k results.
pub fn should_return_no_results(parameters: &SearchParameters) -> bool {
    (parameters.is_vector_query() && parameters.limit.first_index >= parameters.k as u64)
        || parameters.limit.number == 0
}

/// Range of neighbors to serialize in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializationRange {
    pub start_index: usize,
    pub end_index: usize,
}

impl SerializationRange {
    pub fn count(&self) -> usize {
        self.end_index - self.start_index
    }
}

/// The output of the query pipeline.
#[derive(Default)]
pub struct SearchResult {
    pub total_count: usize,
    pub neighbors: Vec<Neighbor>,
    /// True if neighbors were truncated to LIMIT count with a buffer.
    pub is_limited_with_buffer: bool,
    /// True if the LIMIT offset was already applied to the neighbors.
    pub is_offsetted: bool,
}

impl SearchResult {
    pub fn new(
        total_count: usize,
        neighbors: Vec<Neighbor>,
        parameters: &SearchParameters,
    ) -> Self {
        let mut result = SearchResult {
            total_count,
            neighbors: Vec::new(),
            is_limited_with_buffer: false,
            is_offsetted: false,
        };
        if should_return_no_results(parameters) {
            return result;
        }
        result.neighbors = neighbors;
        if !parameters.requires_complete_results() {
            result.trim(parameters);
        }
        result
    }

    fn trim(&mut self, parameters: &SearchParameters) {
        let range = self.serialization_range(parameters);
        let multiplier = config::SEARCH_RESULT_BUFFER_MULTIPLIER.get();
        let mut max_needed = (range.end_index as f64 * multiplier) as usize;
        // In standalone mode the offset can be applied here. In cluster mode
        // every shard produces its own prefix and the coordinator applies
        // the offset after the merge, so only the tail buffer is trimmed.
        if !parameters.is_cluster {
            self.is_offsetted = true;
            if range.start_index > 0 && range.start_index < self.neighbors.len() {
                self.neighbors.drain(..range.start_index);
                let actual_count = range.end_index - range.start_index;
                max_needed = (actual_count as f64 * multiplier) as usize;
            } else if range.start_index >= self.neighbors.len() && range.start_index > 0 {
                self.neighbors.clear();
                return;
            }
        }
        if self.neighbors.len() <= max_needed {
            return;
        }
        self.is_limited_with_buffer = true;
        self.neighbors.truncate(max_needed);
    }

    pub fn serialization_range(&self, parameters: &SearchParameters) -> SerializationRange {
        if should_return_no_results(parameters) {
            return SerializationRange { start_index: 0, end_index: 0 };
        }
        let len = self.neighbors.len();
        let start_index = if self.is_offsetted {
            0
        } else {
            len.min(parameters.limit.first_index as usize)
        };
        let limit_count = parameters.limit.number as usize;
        let count = if parameters.is_non_vector_query() {
            limit_count.min(len)
        } else {
            parameters.k.min(limit_count).min(len)
        };
        let end_index = (start_index + count).min(len);
        SerializationRange { start_index, end_index }
    }
}

/// Streams the fetcher queue through the prefilter evaluator, applying the
/// dedup policy, and hands each surviving key to `appender`.
fn evaluate_prefiltered_keys(
    inner: &SchemaIndexes,
    parameters: &SearchParameters,
    fetchers: FetcherQueue,
    mut appender: impl FnMut(&InternedString),
) {
    let needs_dedup = needs_deduplication(parameters.filter.operations);
    let mut seen: HashSet<InternedString> = HashSet::new();
    let evaluator = PrefilterEvaluator::new(inner);
    let Some(root) = parameters.filter.root.as_ref() else { return };
    for fetcher in fetchers {
        for key in fetcher.into_keys() {
            if parameters.token.is_cancelled() {
                return;
            }
            if needs_dedup && seen.contains(&key) {
                continue;
            }
            if evaluator.evaluate(root, &key) {
                if needs_dedup {
                    seen.insert(key.clone());
                }
                appender(&key);
            }
        }
    }
}

fn search_non_vector(
    inner: &SchemaIndexes,
    parameters: &SearchParameters,
) -> Result<Vec<Neighbor>> {
    let mut neighbors = Vec::new();
    let Some(root) = parameters.filter.root.as_ref() else {
        // match-all: every indexed key exactly once
        for key in inner.all_keys() {
            if parameters.token.is_cancelled() {
                break;
            }
            neighbors.push(Neighbor::new(key.clone(), 0.0));
        }
        return finish_partial(neighbors, parameters);
    };
    let mut fetchers: FetcherQueue = FetcherQueue::new();
    fetch::evaluate_filter_as_primary(root, inner, &mut fetchers, false);
    if is_unsolved_query(parameters.filter.operations) {
        evaluate_prefiltered_keys(inner, parameters, fetchers, |key| {
            neighbors.push(Neighbor::new(key.clone(), 0.0));
        });
        return finish_partial(neighbors, parameters);
    }
    let needs_dedup = needs_deduplication(parameters.filter.operations);
    let mut seen: HashSet<InternedString> = HashSet::new();
    for fetcher in fetchers {
        for key in fetcher.into_keys() {
            if parameters.token.is_cancelled() {
                return finish_partial(neighbors, parameters);
            }
            if needs_dedup {
                if seen.contains(&key) {
                    continue;
                }
                seen.insert(key.clone());
            }
            neighbors.push(Neighbor::new(key, 0.0));
        }
    }
    finish_partial(neighbors, parameters)
}

fn finish_partial(
    neighbors: Vec<Neighbor>,
    parameters: &SearchParameters,
) -> Result<Vec<Neighbor>> {
    if parameters.token.is_cancelled() && !parameters.enable_partial_results {
        return Err(UserError::Timeout.into());
    }
    Ok(neighbors)
}

fn perform_vector_search(
    inner: &SchemaIndexes,
    kernel: &dyn crate::index::vector::VectorKernel,
    parameters: &SearchParameters,
) -> Vec<Neighbor> {
    let filter_closure;
    let filter: Option<&crate::index::vector::InlineFilter<'_>> =
        match parameters.filter.root.as_ref() {
            Some(root) => {
                debug!("performing vector search with inline filter");
                let evaluator = PrefilterEvaluator::new(inner);
                filter_closure =
                    move |key: &InternedString| evaluator.evaluate(root, key);
                Some(&filter_closure)
            }
            None => None,
        };
    kernel
        .search(&parameters.query_vector, parameters.k, &parameters.token, filter, parameters.ef)
        .into_iter()
        .map(|(key, distance)| Neighbor::new(key, distance))
        .collect()
}

fn do_search(inner: &SchemaIndexes, parameters: &SearchParameters) -> Result<Vec<Neighbor>> {
    metrics::stats().time_slice_queries.incr();
    if parameters.is_non_vector_query() {
        return search_non_vector(inner, parameters);
    }
    let alias = parameters.attribute_alias.as_deref().expect("vector query");
    let vector_index = match inner.index(alias) {
        Some(TypedIndex::Vector(index)) => index,
        Some(_) | None => {
            return Err(UserError::NotAVectorIndex(alias.to_string()).into());
        }
    };
    let kernel = vector_index.kernel();
    if parameters.filter.root.is_none() {
        return finish_partial(perform_vector_search(inner, kernel, parameters), parameters);
    }
    let root = parameters.filter.root.as_ref().expect("checked above");
    let mut fetchers: FetcherQueue = FetcherQueue::new();
    let qualified_entries = fetch::evaluate_filter_as_primary(root, inner, &mut fetchers, false);

    if planner::use_prefiltering(qualified_entries, kernel.kind(), kernel.tracked_count()) {
        debug!(qualified_entries, "using pre-filter query execution");
        metrics::stats().query_prefiltering_requests.incr();
        let mut heap = CandidateHeap::new(parameters.k);
        evaluate_prefiltered_keys(inner, parameters, fetchers, |key| {
            kernel.add_prefiltered_key(&parameters.query_vector, key, &mut heap);
        });
        let neighbors = heap
            .into_sorted()
            .into_iter()
            .map(|(key, distance)| Neighbor::new(key, distance))
            .collect();
        return finish_partial(neighbors, parameters);
    }
    metrics::stats().query_inline_filtering_requests.incr();
    finish_partial(perform_vector_search(inner, kernel, parameters), parameters)
}

/// Populates `attribute_contents` from indexed data when every requested
/// attribute is directly available; any unresolvable attribute leaves the
/// neighbor for the main-thread record fetch.
fn maybe_add_indexed_content(
    inner: &SchemaIndexes,
    schema: &IndexSchema,
    parameters: &SearchParameters,
    neighbors: &mut [Neighbor],
) {
    if parameters.no_content || parameters.return_attributes.is_empty() {
        return;
    }
    struct AttributeInfo<'a> {
        attribute: &'a ReturnAttribute,
        kind: IndexKind,
        alias: &'a str,
    }
    let mut attributes = Vec::with_capacity(parameters.return_attributes.len());
    for attribute in &parameters.return_attributes {
        let Some(alias) = attribute.attribute_alias.as_deref() else {
            // a non-indexed attribute forces the full record fetch
            return;
        };
        let Some(schema_attribute) = schema.attribute(alias) else { return };
        attributes.push(AttributeInfo { attribute, kind: schema_attribute.kind, alias });
    }
    for neighbor in neighbors.iter_mut() {
        if neighbor.attribute_contents.is_some() {
            continue;
        }
        let mut contents = RecordsMap::new();
        let mut any_value_missing = false;
        for info in &attributes {
            let value = match (info.kind, inner.index(info.alias)) {
                (IndexKind::Tag, Some(TypedIndex::Tag(index))) => {
                    index.raw_value(&neighbor.key).map(str::to_string)
                }
                (IndexKind::Numeric, Some(TypedIndex::Numeric(index))) => {
                    index.value(&neighbor.key).map(|v| crate::expr::value::format_num(v))
                }
                (IndexKind::Vector, Some(TypedIndex::Vector(index))) => {
                    index.kernel().value(&neighbor.key).map(|v| {
                        if schema.data_type() == DataType::Json {
                            format_vector(&v)
                        } else {
                            // HASH vectors round-trip as their raw blob
                            let mut bytes = Vec::with_capacity(v.len() * 4);
                            for f in &v {
                                bytes.extend_from_slice(&f.to_le_bytes());
                            }
                            String::from_utf8_lossy(&bytes).into_owned()
                        }
                    })
                }
                // text indexes don't store retrievable raw values
                _ => None,
            };
            match value {
                Some(value) => {
                    contents.insert(info.attribute.identifier.clone(), value);
                }
                None => {
                    any_value_missing = true;
                    break;
                }
            }
        }
        if !any_value_missing {
            neighbor.attribute_contents = Some(contents);
        }
    }
}

/// Runs the whole local pipeline under the schema's read guard and shapes
/// the neighbors into a trimmed `SearchResult`.
pub fn search(schema: &IndexSchema, parameters: &SearchParameters) -> Result<SearchResult> {
    let inner = schema.read();
    metrics::stats().query_requests.incr();
    let mut neighbors = do_search(&inner, parameters)?;
    maybe_add_indexed_content(&inner, schema, parameters, &mut neighbors);
    for neighbor in &mut neighbors {
        neighbor.sequence_number = inner.sequence_number(&neighbor.key);
    }
    let total_count = neighbors.len();
    Ok(SearchResult::new(total_count, neighbors, parameters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::ManualToken;
    use crate::filter::resolve::{parse_filter, ProximityOptions};
    use crate::index::{DistanceMetric, VectorKind};
    use crate::interning::intern;
    use crate::schema::IndexSchema;

    fn schema() -> IndexSchema {
        let schema = IndexSchema::builder("idx")
            .numeric("num", "num")
            .unwrap()
            .tag("tag", "tag", ',', false)
            .unwrap()
            .text("body", "body")
            .unwrap()
            .vector("v", "v", VectorKind::Flat, 2, DistanceMetric::L2)
            .unwrap()
            .build()
            .unwrap();
        for (key, num, tag, body, vec) in [
            ("a", "5", "red", "hello world", [0.0, 1.0]),
            ("b", "10", "blue", "world hello", [0.0, 2.0]),
            ("c", "15", "red,blue", "goodbye world", [0.0, 3.0]),
        ] {
            let key = intern(key);
            schema.upsert_record(&key, &[("num", num), ("tag", tag), ("body", body)]);
            schema.upsert_vector(&key, "v", vec.to_vec());
        }
        schema
    }

    fn params(schema: &IndexSchema, query: &str) -> SearchParameters {
        let mut p = SearchParameters::new("idx", ManualToken::token());
        p.filter = parse_filter(schema, query, ProximityOptions::default()).unwrap();
        p
    }

    fn result_keys(result: &SearchResult) -> Vec<&str> {
        let mut keys: Vec<&str> = result.neighbors.iter().map(|n| n.key.as_str()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn non_vector_numeric() {
        let schema = schema();
        let p = params(&schema, "@num:[6 12]");
        let result = search(&schema, &p).unwrap();
        assert_eq!(result.total_count, 1);
        assert_eq!(result_keys(&result), vec!["b"]);
        assert_eq!(result.neighbors[0].distance, 0.0);
    }

    #[test]
    fn match_all_returns_every_key_once() {
        let schema = schema();
        let p = params(&schema, "*");
        let result = search(&schema, &p).unwrap();
        assert_eq!(result.total_count, 3);
        assert_eq!(result_keys(&result), vec!["a", "b", "c"]);
    }

    #[test]
    fn unsolved_and_is_reverified() {
        let schema = schema();
        // min branch is the numeric one; tag membership must still hold
        let p = params(&schema, "@num:[4 11] @tag:{red}");
        let result = search(&schema, &p).unwrap();
        assert_eq!(result_keys(&result), vec!["a"]);
    }

    #[test]
    fn dedup_with_or_and_tags() {
        let schema = schema();
        let p = params(&schema, "@tag:{red|blue}");
        let result = search(&schema, &p).unwrap();
        // c carries both tags but appears once
        assert_eq!(result_keys(&result), vec!["a", "b", "c"]);
    }

    #[test]
    fn vector_knn() {
        let schema = schema();
        let mut p = params(&schema, "*");
        p.attribute_alias = Some("v".to_string());
        p.k = 2;
        p.query_vector = vec![0.0, 0.0];
        let result = search(&schema, &p).unwrap();
        let keys: Vec<&str> = result.neighbors.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(result.neighbors[0].distance <= result.neighbors[1].distance);
    }

    #[test]
    fn vector_with_prefilter() {
        let schema = schema();
        let mut p = params(&schema, "@tag:{red}");
        p.attribute_alias = Some("v".to_string());
        p.k = 10;
        p.query_vector = vec![0.0, 0.0];
        let result = search(&schema, &p).unwrap();
        let keys: Vec<&str> = result.neighbors.iter().map(|n| n.key.as_str()).collect();
        // only a and c carry the tag; both survive, ordered by distance
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn sequence_numbers_are_stamped() {
        let schema = schema();
        let p = params(&schema, "@num:[4 6]");
        let result = search(&schema, &p).unwrap();
        // each key saw two mutations: the hash fields and the vector
        assert_eq!(result.neighbors[0].sequence_number, 2);
    }

    #[test]
    fn limit_trimming_standalone() {
        let schema = schema();
        let mut p = params(&schema, "*");
        p.limit = LimitParameter { first_index: 1, number: 1 };
        let result = search(&schema, &p).unwrap();
        assert_eq!(result.total_count, 3);
        assert!(result.is_offsetted);
        let range = result.serialization_range(&p);
        assert_eq!(range.count(), 1);

        p.limit = LimitParameter { first_index: 0, number: 0 };
        let result = search(&schema, &p).unwrap();
        assert!(result.neighbors.is_empty());

        p.limit = LimitParameter { first_index: 10, number: 5 };
        let result = search(&schema, &p).unwrap();
        assert!(result.neighbors.is_empty());
    }

    #[test]
    fn cluster_mode_keeps_offset() {
        let schema = schema();
        let mut p = params(&schema, "*");
        p.is_cluster = true;
        p.limit = LimitParameter { first_index: 2, number: 1 };
        let result = search(&schema, &p).unwrap();
        assert!(!result.is_offsetted);
        // all three survive locally: the coordinator applies the offset
        assert_eq!(result.neighbors.len(), 3);
    }

    #[test]
    fn indexed_content_population() {
        let schema = schema();
        let mut p = params(&schema, "@num:[4 6]");
        p.return_attributes.push(ReturnAttribute {
            identifier: schema.identifier("num").unwrap(),
            attribute_alias: Some("num".to_string()),
            alias: "num".to_string(),
        });
        let result = search(&schema, &p).unwrap();
        let contents = result.neighbors[0].attribute_contents.as_ref().unwrap();
        assert_eq!(contents.get(&schema.identifier("num").unwrap()), Some(&"5".to_string()));

        // a text attribute cannot be served from the index
        let mut p = params(&schema, "@num:[4 6]");
        p.return_attributes.push(ReturnAttribute {
            identifier: schema.identifier("body").unwrap(),
            attribute_alias: Some("body".to_string()),
            alias: "body".to_string(),
        });
        let result = search(&schema, &p).unwrap();
        assert!(result.neighbors[0].attribute_contents.is_none());
    }

    #[test]
    fn phrase_search_end_to_end() {
        let schema = schema();
        let mut p = SearchParameters::new("idx", ManualToken::token());
        p.filter = parse_filter(
            &schema,
            "@body:\"hello world\"",
            ProximityOptions::default(),
        )
        .unwrap();
        let result = search(&schema, &p).unwrap();
        assert_eq!(result_keys(&result), vec!["a"]);

        // SLOP 2 relaxes the window enough for the swapped order... but
        // INORDER is off by default so "world hello" matches too
        let mut p = SearchParameters::new("idx", ManualToken::token());
        p.filter = parse_filter(
            &schema,
            "@body:hello world",
            ProximityOptions { slop: Some(2), inorder: false },
        )
        .unwrap();
        let result = search(&schema, &p).unwrap();
        assert_eq!(result_keys(&result), vec!["a", "b"]);
    }
}
