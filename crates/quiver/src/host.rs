//! The surface the core consumes from the hosting key-value store. Record
//! fetches, clock reads and client blocking all go through these traits so
//! the query path never links against the host directly.

use std::collections::HashSet;
use std::sync::Arc;

use fletch::RecordsMap;

/// Context flags the host hands the command dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextFlags {
    pub is_replica: bool,
    pub loading_aof: bool,
    pub deny_oom: bool,
}

pub trait Host: Send + Sync {
    /// Fetches the listed identifiers of one record (all of them when
    /// `identifiers` is empty). `None` when the key does not exist.
    fn fetch_records(
        &self,
        db_index: u32,
        key: &str,
        identifiers: &HashSet<Arc<str>>,
    ) -> Option<RecordsMap>;

    /// Monotonic milliseconds.
    fn milliseconds(&self) -> u64;

    fn context_flags(&self) -> ContextFlags {
        ContextFlags::default()
    }

    fn is_cluster(&self) -> bool {
        false
    }

    /// Used-memory check consulted before vector searches.
    fn over_memory_limit(&self) -> bool {
        false
    }

    /// ACL check for the key prefixes a schema covers.
    fn acl_allows(&self, _key_prefixes: &[String]) -> bool {
        true
    }
}

/// Host handle for a blocked client: the fanout completes a query by
/// replying through this and then freeing it.
pub trait BlockedClient: Send {
    fn reply(self: Box<Self>, reply: crate::reply::ReplyValue);
    fn timeout(self: Box<Self>);
}

/// In-memory host used by tests and benches: a flat map of HASH records.
#[derive(Default)]
pub struct MemoryHost {
    records: std::sync::RwLock<std::collections::HashMap<(u32, String), RecordsMap>>,
    start: std::sync::OnceLock<std::time::Instant>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, db_index: u32, key: &str, fields: &[(&str, &str)]) {
        let mut map = RecordsMap::new();
        for (identifier, value) in fields {
            map.insert(Arc::from(*identifier), value.to_string());
        }
        self.records
            .write()
            .expect("host records lock")
            .insert((db_index, key.to_string()), map);
    }

    pub fn remove(&self, db_index: u32, key: &str) {
        self.records.write().expect("host records lock").remove(&(db_index, key.to_string()));
    }
}

impl Host for MemoryHost {
    fn fetch_records(
        &self,
        db_index: u32,
        key: &str,
        identifiers: &HashSet<Arc<str>>,
    ) -> Option<RecordsMap> {
        let records = self.records.read().expect("host records lock");
        let record = records.get(&(db_index, key.to_string()))?;
        if identifiers.is_empty() {
            return Some(record.clone());
        }
        Some(
            record
                .iter()
                .filter(|(id, _)| identifiers.contains(id.as_ref()))
                .map(|(id, value)| (id.clone(), value.clone()))
                .collect(),
        )
    }

    fn milliseconds(&self) -> u64 {
        let start = self.start.get_or_init(std::time::Instant::now);
        start.elapsed().as_millis() as u64
    }
}
