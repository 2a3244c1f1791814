//! Deduplicated immutable keys. Every posting, neighbor and reply entry
//! shares the same allocation for a given key, so clones are refcount bumps
//! and the dedup sets in the query path can hash a pointer-stable value.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::metrics;

#[derive(Clone)]
pub struct InternedString {
    inner: Arc<str>,
}

impl InternedString {
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Stable for the lifetime of this interned value. Only meaningful for
    /// identity checks within one process.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const u8 as usize
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &Self) -> bool {
        // pointer equality is the common case for interned values; contents
        // may still be compared for strings interned by different pools
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner == other.inner
    }
}

impl Eq for InternedString {}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.as_bytes().cmp(other.inner.as_bytes())
    }
}

impl std::hash::Hash for InternedString {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.hash(state)
    }
}

impl Borrow<str> for InternedString {
    fn borrow(&self) -> &str {
        &self.inner
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static POOL: Lazy<Mutex<HashSet<Arc<str>>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Interns a string: one allocation per distinct content process-wide.
pub fn intern(s: &str) -> InternedString {
    let mut pool = POOL.lock().expect("intern pool poisoned");
    if let Some(existing) = pool.get(s) {
        return InternedString { inner: Arc::clone(existing) };
    }
    let arc: Arc<str> = Arc::from(s);
    metrics::track_allocation(s.len());
    pool.insert(Arc::clone(&arc));
    InternedString { inner: arc }
}

/// Drops pool entries nobody references anymore. Called by the utility pool
/// between ingestion batches.
pub fn sweep() {
    let mut pool = POOL.lock().expect("intern pool poisoned");
    pool.retain(|arc| {
        if Arc::strong_count(arc) > 1 {
            true
        } else {
            metrics::track_deallocation(arc.len());
            false
        }
    });
}
