//! The coordinator RPC surface. The transport is a collaborator; the query
//! core only needs "send this partition request to that address and call me
//! back". The in-process client below backs the tests: each address maps to
//! a schema and executes the engine directly, including the receiving
//! side's slot-fingerprint validation.

use std::collections::HashMap;
use std::sync::Arc;

use fletch::{IndexSchema, Neighbor, SearchParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    IndexName,
    Communication,
    InconsistentState,
    ResourceExhausted,
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError { kind, message: message.into() }
    }
}

/// One shard's share of a fanned-out search.
pub struct PartitionRequest {
    pub parameters: SearchParameters,
    /// The sender's view of the target shard's slot fingerprint; the
    /// receiver must reject on mismatch when consistency is enabled.
    pub slot_fingerprint: u64,
}

pub struct PartitionResponse {
    pub total_count: usize,
    pub neighbors: Vec<Neighbor>,
}

pub type PartitionCallback =
    Box<dyn FnOnce(Result<PartitionResponse, TransportError>) + Send + 'static>;

/// Per-shard index statistics, merged by the FT.INFO fanout and compared by
/// the create/drop consistency checks.
#[derive(Debug, Clone)]
pub struct IndexInfoResponse {
    pub name: String,
    pub num_docs: u64,
    pub fingerprint: u64,
    pub version: u32,
}

pub type InfoCallback =
    Box<dyn FnOnce(Result<IndexInfoResponse, TransportError>) + Send + 'static>;

pub trait ShardClient: Send + Sync {
    fn search_partition(&self, address: &str, request: PartitionRequest, callback: PartitionCallback);
    fn index_info(&self, address: &str, index_name: &str, callback: InfoCallback);
}

/// Receiving-side handling of a partition request, shared by the real
/// transport endpoint and the in-process client.
pub fn handle_partition_request(
    schema: &IndexSchema,
    local_slot_fingerprint: u64,
    request: PartitionRequest,
) -> Result<PartitionResponse, TransportError> {
    if request.parameters.enable_consistency
        && request.slot_fingerprint != local_slot_fingerprint
    {
        return Err(TransportError::new(
            TransportErrorKind::InconsistentState,
            "slot fingerprint mismatch",
        ));
    }
    match fletch::search::search(schema, &request.parameters) {
        Ok(result) => {
            Ok(PartitionResponse { total_count: result.total_count, neighbors: result.neighbors })
        }
        Err(error) => Err(TransportError::new(
            TransportErrorKind::Communication,
            error.to_string(),
        )),
    }
}

/// Test transport: a map of address to (schema, fingerprint) executed
/// synchronously on the caller's thread.
#[derive(Default)]
pub struct InProcessClient {
    endpoints: HashMap<String, (Arc<IndexSchema>, u64)>,
}

impl InProcessClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: &str, schema: Arc<IndexSchema>, slot_fingerprint: u64) {
        self.endpoints.insert(address.to_string(), (schema, slot_fingerprint));
    }
}

impl ShardClient for InProcessClient {
    fn search_partition(
        &self,
        address: &str,
        request: PartitionRequest,
        callback: PartitionCallback,
    ) {
        match self.endpoints.get(address) {
            Some((schema, fingerprint)) => {
                callback(handle_partition_request(schema, *fingerprint, request));
            }
            None => callback(Err(TransportError::new(
                TransportErrorKind::Communication,
                format!("no endpoint at {address}"),
            ))),
        }
    }

    fn index_info(&self, address: &str, index_name: &str, callback: InfoCallback) {
        match self.endpoints.get(address) {
            Some((schema, _)) if schema.name() == index_name => {
                callback(Ok(IndexInfoResponse {
                    name: schema.name().to_string(),
                    num_docs: schema.read().num_keys() as u64,
                    fingerprint: schema.fingerprint(),
                    version: schema.version(),
                }))
            }
            Some(_) => callback(Err(TransportError::new(
                TransportErrorKind::IndexName,
                format!("index `{index_name}` not found at {address}"),
            ))),
            None => callback(Err(TransportError::new(
                TransportErrorKind::Communication,
                format!("no endpoint at {address}"),
            ))),
        }
    }
}
