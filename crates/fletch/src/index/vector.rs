use std::collections::{BTreeMap, BinaryHeap, HashSet};

use byteorder::{ByteOrder, LittleEndian};
use ordered_float::OrderedFloat;

use crate::cancel;
use crate::interning::InternedString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorKind {
    Flat,
    Hnsw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    L2,
    InnerProduct,
    Cosine,
}

/// Predicate evaluated inside the kernel's walk; borrows the query state for
/// the duration of the search.
pub type InlineFilter<'a> = dyn Fn(&InternedString) -> bool + 'a;

/// Bounded max-heap of the k best candidates, ordered worst-first so the
/// furthest neighbor pops when a better one arrives.
pub struct CandidateHeap {
    heap: BinaryHeap<HeapEntry>,
    k: usize,
    /// Guards against scoring one key twice across fetchers.
    seen: HashSet<InternedString>,
}

struct HeapEntry {
    distance: OrderedFloat<f32>,
    key: InternedString,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.key == other.key
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap on distance; on ties the lexically smaller key pops
        // first, keeping the kept set deterministic
        self.distance
            .cmp(&other.distance)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl CandidateHeap {
    pub fn new(k: usize) -> Self {
        CandidateHeap { heap: BinaryHeap::with_capacity(k + 1), k, seen: HashSet::new() }
    }

    /// Returns false when the candidate was rejected (seen already or worse
    /// than the current k-th best).
    pub fn push(&mut self, key: InternedString, distance: f32) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        let entry = HeapEntry { distance: OrderedFloat(distance), key };
        if self.heap.len() < self.k {
            self.heap.push(entry);
            return true;
        }
        match self.heap.peek() {
            Some(worst) if entry.cmp(worst) == std::cmp::Ordering::Less => {
                self.heap.push(entry);
                self.heap.pop();
                true
            }
            _ => false,
        }
    }

    /// Drains into ascending distance order, ties broken by key descending.
    pub fn into_sorted(self) -> Vec<(InternedString, f32)> {
        let mut entries: Vec<HeapEntry> = self.heap.into_vec();
        entries.sort_by(|a, b| {
            a.distance.cmp(&b.distance).then_with(|| b.key.cmp(&a.key))
        });
        entries.into_iter().map(|e| (e.key, e.distance.0)).collect()
    }
}

/// The capability set the query path consumes from a vector kernel. The
/// graph-based kernels are collaborators behind this trait; the exact-scan
/// kernel below implements the Flat variant (and doubles for HNSW in tests).
pub trait VectorKernel: Send + Sync {
    fn kind(&self) -> VectorKind;
    fn dimensions(&self) -> usize;
    fn tracked_count(&self) -> usize;
    /// Ingestion surface; rejects vectors of the wrong dimension.
    fn add_record(&mut self, key: &InternedString, vector: Vec<f32>) -> bool;
    fn remove_record(&mut self, key: &InternedString) -> bool;
    fn search(
        &self,
        query: &[f32],
        k: usize,
        token: &cancel::Token,
        filter: Option<&InlineFilter<'_>>,
        ef: Option<usize>,
    ) -> Vec<(InternedString, f32)>;
    /// Scores one prefiltered candidate into the shared heap. Returns false
    /// when the key is not indexed.
    fn add_prefiltered_key(&self, query: &[f32], key: &InternedString, heap: &mut CandidateHeap)
        -> bool;
    fn value(&self, key: &InternedString) -> Option<Vec<f32>>;
}

pub struct VectorIndex {
    kernel: Box<dyn VectorKernel>,
}

impl VectorIndex {
    pub fn new(kernel: Box<dyn VectorKernel>) -> Self {
        VectorIndex { kernel }
    }

    pub fn kernel(&self) -> &dyn VectorKernel {
        &*self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut dyn VectorKernel {
        &mut *self.kernel
    }
}

fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        DistanceMetric::InnerProduct => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                1.0
            } else {
                1.0 - dot / (na * nb)
            }
        }
    }
}

/// Exact-scan kernel: the Flat index implementation. It reports whichever
/// kind it was built as so the planner heuristics can be exercised against
/// both paths.
pub struct ExactScanKernel {
    kind: VectorKind,
    metric: DistanceMetric,
    dimensions: usize,
    vectors: BTreeMap<InternedString, Vec<f32>>,
}

impl ExactScanKernel {
    pub fn flat(dimensions: usize, metric: DistanceMetric) -> Self {
        ExactScanKernel { kind: VectorKind::Flat, metric, dimensions, vectors: BTreeMap::new() }
    }

    pub fn hnsw(dimensions: usize, metric: DistanceMetric) -> Self {
        ExactScanKernel { kind: VectorKind::Hnsw, metric, dimensions, vectors: BTreeMap::new() }
    }

}

impl VectorKernel for ExactScanKernel {
    fn kind(&self) -> VectorKind {
        self.kind
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn tracked_count(&self) -> usize {
        self.vectors.len()
    }

    fn add_record(&mut self, key: &InternedString, vector: Vec<f32>) -> bool {
        if vector.len() != self.dimensions {
            return false;
        }
        self.vectors.insert(key.clone(), vector);
        true
    }

    fn remove_record(&mut self, key: &InternedString) -> bool {
        self.vectors.remove(key).is_some()
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        token: &cancel::Token,
        filter: Option<&InlineFilter<'_>>,
        _ef: Option<usize>,
    ) -> Vec<(InternedString, f32)> {
        let mut heap = CandidateHeap::new(k);
        for (key, vector) in &self.vectors {
            if token.is_cancelled() {
                break;
            }
            if let Some(filter) = filter {
                if !filter(key) {
                    continue;
                }
            }
            heap.push(key.clone(), distance(self.metric, query, vector));
        }
        heap.into_sorted()
    }

    fn add_prefiltered_key(
        &self,
        query: &[f32],
        key: &InternedString,
        heap: &mut CandidateHeap,
    ) -> bool {
        match self.vectors.get(key) {
            Some(vector) => {
                heap.push(key.clone(), distance(self.metric, query, vector));
                true
            }
            None => false,
        }
    }

    fn value(&self, key: &InternedString) -> Option<Vec<f32>> {
        self.vectors.get(key).cloned()
    }
}

/// Decodes a little-endian FLOAT32 blob, e.g. the `$query` PARAMS value.
pub fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % std::mem::size_of::<f32>() != 0 {
        return None;
    }
    let mut out = vec![0f32; bytes.len() / std::mem::size_of::<f32>()];
    LittleEndian::read_f32_into(bytes, &mut out);
    Some(out)
}

/// Renders a vector value the way JSON replies expect it.
pub fn format_vector(vector: &[f32]) -> String {
    let mut out = String::from("[");
    for (i, v) in vector.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::ManualToken;
    use crate::interning::intern;

    fn kernel_with(points: &[(&str, [f32; 2])]) -> ExactScanKernel {
        let mut kernel = ExactScanKernel::flat(2, DistanceMetric::L2);
        for (key, point) in points {
            kernel.add_record(&intern(key), point.to_vec());
        }
        kernel
    }

    #[test]
    fn top_k_in_distance_order() {
        let kernel =
            kernel_with(&[("a", [0.0, 1.0]), ("b", [0.0, 2.0]), ("c", [0.0, 4.0])]);
        let token = ManualToken::token();
        let results = kernel.search(&[0.0, 0.0], 2, &token, None, None);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(results[0].1 <= results[1].1);
    }

    #[test]
    fn ties_break_by_key_descending() {
        let kernel = kernel_with(&[("a", [1.0, 0.0]), ("b", [0.0, 1.0]), ("c", [0.0, -1.0])]);
        let token = ManualToken::token();
        let results = kernel.search(&[0.0, 0.0], 3, &token, None, None);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn inline_filter_excludes() {
        let kernel = kernel_with(&[("a", [0.0, 1.0]), ("b", [0.0, 2.0])]);
        let token = ManualToken::token();
        let filter = |key: &InternedString| key.as_str() != "a";
        let results = kernel.search(&[0.0, 0.0], 2, &token, Some(&filter), None);
        let keys: Vec<&str> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b"]);
    }

    #[test]
    fn prefiltered_heap_is_bounded() {
        let kernel =
            kernel_with(&[("a", [0.0, 1.0]), ("b", [0.0, 2.0]), ("c", [0.0, 3.0])]);
        let mut heap = CandidateHeap::new(2);
        for key in ["a", "b", "c"] {
            assert!(kernel.add_prefiltered_key(&[0.0, 0.0], &intern(key), &mut heap));
        }
        assert!(!kernel.add_prefiltered_key(&[0.0, 0.0], &intern("missing"), &mut heap));
        let sorted = heap.into_sorted();
        let keys: Vec<&str> = sorted.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn blob_roundtrip() {
        let values = [1.5f32, -2.0, 0.25];
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(decode_vector(&bytes), Some(values.to_vec()));
        assert_eq!(decode_vector(&bytes[1..]), None);
        assert_eq!(format_vector(&values), "[1.5,-2,0.25]");
    }
}
