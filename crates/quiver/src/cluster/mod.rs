//! Cluster-mode machinery: the topology snapshot, the coordinator RPC
//! surface and the scatter-gather fanout.

pub mod fanout;
pub mod map;
pub mod rpc;

use std::sync::Arc;

use map::{ClusterMap, ClusterMapCache, ShardTopology};
use rpc::ShardClient;

/// Everything the dispatcher needs when the host runs clustered.
pub struct ClusterContext {
    pub client: Arc<dyn ShardClient>,
    pub cache: ClusterMapCache,
    topology: Box<dyn Fn() -> Vec<ShardTopology> + Send + Sync>,
}

impl ClusterContext {
    pub fn new(
        client: Arc<dyn ShardClient>,
        topology: impl Fn() -> Vec<ShardTopology> + Send + Sync + 'static,
    ) -> Self {
        ClusterContext { client, cache: ClusterMapCache::default(), topology: Box::new(topology) }
    }

    pub fn map(&self) -> Arc<ClusterMap> {
        self.cache.get_or_refresh(|| (self.topology)())
    }
}
