//! Per-word postings: a key-sorted list of (key, field mask, positions).
//! Postings are shared by refcount between the word tree and any live
//! iterators; ingestion mutates them copy-on-write under the tree lock.

use std::sync::Arc;

use crate::interning::InternedString;

pub type FieldMask = u64;
pub type Position = u32;

#[derive(Debug, Clone)]
pub struct PostingEntry {
    pub key: InternedString,
    /// OR of the masks of every position below.
    pub field_mask: FieldMask,
    /// Ascending by position; one entry per distinct position, masks OR-ed.
    pub positions: Vec<(Position, FieldMask)>,
}

#[derive(Debug, Clone, Default)]
pub struct Postings {
    entries: Vec<PostingEntry>,
}

impl Postings {
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PostingEntry] {
        &self.entries
    }

    pub fn find(&self, key: &InternedString) -> Option<&PostingEntry> {
        self.entries.binary_search_by(|e| e.key.cmp(key)).ok().map(|idx| &self.entries[idx])
    }

    /// Index of the first entry with key >= `key`.
    pub fn lower_bound(&self, key: &InternedString) -> usize {
        self.entries.partition_point(|e| e.key < *key)
    }

    pub fn entry(&self, idx: usize) -> Option<&PostingEntry> {
        self.entries.get(idx)
    }

    /// Records one occurrence of the word in `key` at `position` within the
    /// field identified by `field_bit`.
    pub fn add_occurrence(&mut self, key: &InternedString, field_bit: FieldMask, position: Position) {
        let idx = match self.entries.binary_search_by(|e| e.key.cmp(key)) {
            Ok(idx) => idx,
            Err(at) => {
                self.entries.insert(
                    at,
                    PostingEntry { key: key.clone(), field_mask: 0, positions: Vec::new() },
                );
                at
            }
        };
        let entry = &mut self.entries[idx];
        entry.field_mask |= field_bit;
        match entry.positions.binary_search_by_key(&position, |(p, _)| *p) {
            Ok(pos_idx) => entry.positions[pos_idx].1 |= field_bit,
            Err(at) => entry.positions.insert(at, (position, field_bit)),
        }
    }

    /// Drops the key from the postings. Returns true when an entry was
    /// removed.
    pub fn remove_key(&mut self, key: &InternedString) -> bool {
        match self.entries.binary_search_by(|e| e.key.cmp(key)) {
            Ok(idx) => {
                self.entries.remove(idx);
                true
            }
            Err(_) => false,
        }
    }
}

pub type SharedPostings = Arc<Postings>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;

    #[test]
    fn entries_stay_sorted() {
        let mut postings = Postings::default();
        for key in ["kiwi", "apple", "mango"] {
            postings.add_occurrence(&intern(key), 1, 0);
        }
        let keys: Vec<&str> = postings.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["apple", "kiwi", "mango"]);
    }

    #[test]
    fn positions_merge_masks() {
        let mut postings = Postings::default();
        let key = intern("doc");
        postings.add_occurrence(&key, 0b01, 3);
        postings.add_occurrence(&key, 0b10, 3);
        postings.add_occurrence(&key, 0b10, 1);
        let entry = postings.find(&key).unwrap();
        assert_eq!(entry.field_mask, 0b11);
        assert_eq!(entry.positions, vec![(1, 0b10), (3, 0b11)]);
    }

    #[test]
    fn remove_key() {
        let mut postings = Postings::default();
        let key = intern("doc");
        postings.add_occurrence(&key, 1, 0);
        assert!(postings.remove_key(&key));
        assert!(!postings.remove_key(&key));
        assert!(postings.is_empty());
    }
}
