//! Immutable cluster-topology snapshot. A snapshot fixes the shard set, the
//! slot interval map, the owned-slot bitmap, the per-mode target vectors
//! and the slot-range fingerprints; in-flight queries keep their snapshot
//! alive while a newer one is installed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hasher;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use roaring::RoaringBitmap;
use tracing::warn;
use twox_hash::XxHash64;

use fletch::config;

pub const SLOT_COUNT: u32 = 16384;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub is_primary: bool,
    pub is_local: bool,
    pub address: SocketAddress,
    /// Weak back-reference into `ClusterMap::shards`; valid once the
    /// snapshot is frozen.
    pub shard_index: usize,
}

#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub shard_id: String,
    pub nodes: Vec<NodeInfo>,
    /// Sorted, non-overlapping (start, end) inclusive slot ranges.
    pub slot_ranges: Vec<(u16, u16)>,
    pub slots_fingerprint: u64,
}

impl ShardInfo {
    pub fn primary(&self) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.is_primary)
    }

    pub fn replicas(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter().filter(|n| !n.is_primary)
    }
}

/// Input description of one shard, as reported by the host topology API.
#[derive(Debug, Clone)]
pub struct ShardTopology {
    pub shard_id: String,
    pub nodes: Vec<(String, SocketAddress, bool, bool)>, // (id, address, is_primary, is_local)
    pub slot_ranges: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutTargetMode {
    All,
    Primary,
    Replicas,
    OneReplicaPerShard,
    Random,
}

pub struct ClusterMap {
    shards: Vec<ShardInfo>,
    shard_by_id: HashMap<String, usize>,
    /// start -> (end, shard index), for slot lookup over frozen intervals.
    slot_to_shard: BTreeMap<u16, (u16, usize)>,
    owned_slots: RoaringBitmap,
    is_consistent: bool,
    cluster_fingerprint: u64,
    expiration: Instant,
}

fn ranges_fingerprint(ranges: &[(u16, u16)]) -> u64 {
    let mut sorted = ranges.to_vec();
    sorted.sort_unstable();
    let mut hasher = XxHash64::with_seed(0);
    for (start, end) in sorted {
        hasher.write_u16(start);
        hasher.write_u16(end);
    }
    hasher.finish()
}

impl ClusterMap {
    /// Builds a snapshot. Topology inconsistencies (missing primary,
    /// duplicate socket address, slot gaps, overlapping ranges) clear
    /// `is_consistent` but do not fail the build; callers may refresh.
    pub fn from_topology(topology: Vec<ShardTopology>) -> ClusterMap {
        let mut shards = Vec::with_capacity(topology.len());
        let mut shard_by_id = HashMap::new();
        let mut slot_to_shard = BTreeMap::new();
        let mut owned_slots = RoaringBitmap::new();
        let mut is_consistent = true;
        let mut seen_addresses: HashSet<String> = HashSet::new();

        for (shard_index, shard) in topology.into_iter().enumerate() {
            let nodes: Vec<NodeInfo> = shard
                .nodes
                .iter()
                .map(|(node_id, address, is_primary, is_local)| NodeInfo {
                    node_id: node_id.clone(),
                    is_primary: *is_primary,
                    is_local: *is_local,
                    address: address.clone(),
                    shard_index,
                })
                .collect();
            if !nodes.iter().any(|n| n.is_primary) {
                warn!(shard = %shard.shard_id, "shard has no primary endpoint");
                is_consistent = false;
            }
            for node in &nodes {
                if !seen_addresses.insert(node.address.to_string()) {
                    warn!(address = %node.address.to_string(), "duplicate socket address in topology");
                    is_consistent = false;
                }
            }
            let mut ranges = shard.slot_ranges.clone();
            ranges.sort_unstable();
            for &(start, end) in &ranges {
                if start > end || u32::from(end) >= SLOT_COUNT {
                    is_consistent = false;
                    continue;
                }
                for covered in slot_to_shard.range(..=end) {
                    let (&other_start, &(other_end, _)) = (covered.0, covered.1);
                    if other_end >= start && other_start <= end {
                        warn!("overlapping slot ranges in topology");
                        is_consistent = false;
                    }
                }
                slot_to_shard.insert(start, (end, shard_index));
                if nodes.iter().any(|n| n.is_local && n.is_primary) {
                    owned_slots.insert_range(u32::from(start)..=u32::from(end));
                }
            }
            let slots_fingerprint = ranges_fingerprint(&ranges);
            shard_by_id.insert(shard.shard_id.clone(), shard_index);
            shards.push(ShardInfo {
                shard_id: shard.shard_id,
                nodes,
                slot_ranges: ranges,
                slots_fingerprint,
            });
        }

        // slot gaps across the whole map
        let mut covered: u32 = 0;
        for (&start, &(end, _)) in &slot_to_shard {
            covered += u32::from(end) - u32::from(start) + 1;
        }
        if covered < SLOT_COUNT {
            is_consistent = false;
        }

        let mut hasher = XxHash64::with_seed(0);
        let mut fingerprints: Vec<u64> = shards.iter().map(|s| s.slots_fingerprint).collect();
        fingerprints.sort_unstable();
        for fingerprint in fingerprints {
            hasher.write_u64(fingerprint);
        }

        ClusterMap {
            shards,
            shard_by_id,
            slot_to_shard,
            owned_slots,
            is_consistent,
            cluster_fingerprint: hasher.finish(),
            expiration: Instant::now()
                + Duration::from_millis(config::CLUSTER_MAP_EXPIRATION_MS.get()),
        }
    }

    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    pub fn shard_by_id(&self, shard_id: &str) -> Option<&ShardInfo> {
        self.shard_by_id.get(shard_id).map(|&idx| &self.shards[idx])
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&ShardInfo> {
        let (_, &(end, shard_index)) = self.slot_to_shard.range(..=slot).next_back()?;
        (slot <= end).then(|| &self.shards[shard_index])
    }

    pub fn is_slot_owned(&self, slot: u16) -> bool {
        self.owned_slots.contains(u32::from(slot))
    }

    pub fn is_consistent(&self) -> bool {
        self.is_consistent
    }

    pub fn cluster_fingerprint(&self) -> u64 {
        self.cluster_fingerprint
    }

    pub fn local_shard_fingerprint(&self) -> u64 {
        self.shards
            .iter()
            .find(|s| s.nodes.iter().any(|n| n.is_local))
            .map_or(0, |s| s.slots_fingerprint)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiration
    }

    /// Target vector for a fanout mode, typically one node per shard.
    pub fn targets(&self, mode: FanoutTargetMode) -> Vec<NodeInfo> {
        let mut out = Vec::new();
        for (shard_index, shard) in self.shards.iter().enumerate() {
            match mode {
                FanoutTargetMode::All => out.extend(shard.nodes.iter().cloned()),
                FanoutTargetMode::Primary => {
                    if let Some(primary) = shard.primary() {
                        out.push(primary.clone());
                    }
                }
                FanoutTargetMode::Replicas => out.extend(shard.replicas().cloned()),
                FanoutTargetMode::OneReplicaPerShard => {
                    match shard.replicas().next() {
                        Some(replica) => out.push(replica.clone()),
                        None => {
                            if let Some(primary) = shard.primary() {
                                out.push(primary.clone());
                            }
                        }
                    }
                }
                FanoutTargetMode::Random => {
                    // deterministic spread: rotate the pick by shard index
                    if !shard.nodes.is_empty() {
                        out.push(shard.nodes[shard_index % shard.nodes.len()].clone());
                    }
                }
            }
        }
        out
    }
}

/// TTL cache around snapshot creation; refreshed on expiry or topology
/// change.
pub struct ClusterMapCache {
    current: Mutex<Option<Arc<ClusterMap>>>,
}

impl Default for ClusterMapCache {
    fn default() -> Self {
        ClusterMapCache { current: Mutex::new(None) }
    }
}

impl ClusterMapCache {
    pub fn get_or_refresh(
        &self,
        refresh: impl FnOnce() -> Vec<ShardTopology>,
    ) -> Arc<ClusterMap> {
        let mut current = self.current.lock().expect("cluster map cache lock");
        match current.as_ref() {
            Some(map) if !map.is_expired() => Arc::clone(map),
            _ => {
                let map = Arc::new(ClusterMap::from_topology(refresh()));
                *current = Some(Arc::clone(&map));
                map
            }
        }
    }

    pub fn invalidate(&self) {
        *self.current.lock().expect("cluster map cache lock") = None;
    }
}

#[cfg(test)]
pub(crate) fn test_topology(local_shard: usize, shard_count: usize) -> Vec<ShardTopology> {
    let span = SLOT_COUNT as u16 / shard_count as u16;
    (0..shard_count)
        .map(|i| {
            let start = i as u16 * span;
            let end = if i == shard_count - 1 { (SLOT_COUNT - 1) as u16 } else { start + span - 1 };
            ShardTopology {
                shard_id: format!("shard-{i}"),
                nodes: vec![
                    (
                        format!("node-{i}-p"),
                        SocketAddress { host: format!("10.0.0.{i}"), port: 7000 },
                        true,
                        i == local_shard,
                    ),
                    (
                        format!("node-{i}-r"),
                        SocketAddress { host: format!("10.0.1.{i}"), port: 7000 },
                        false,
                        false,
                    ),
                ],
                slot_ranges: vec![(start, end)],
            }
        })
        .collect()
}
