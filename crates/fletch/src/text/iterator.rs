//! The two-level cursor every text iterator implements: keys in ascending
//! order across the iterator's key set, positions in ascending order within
//! the current key.

use smallvec::SmallVec;

use crate::interning::InternedString;
use crate::text::postings::{FieldMask, Position, SharedPostings};

/// Inline capacity for proximity children and posting variants; queries
/// rarely combine more terms than this.
pub const PROXIMITY_TERMS_INLINE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRange {
    pub start: Position,
    pub end: Position,
}

pub trait TextIterator {
    /// The fields this iterator's query was scoped to.
    fn query_field_mask(&self) -> FieldMask;

    // Key-level iteration
    fn done_keys(&self) -> bool;
    fn current_key(&self) -> &InternedString;
    fn next_key(&mut self) -> bool;
    /// Positions on the first key >= `target`; true iff it lands on `target`.
    fn seek_forward_key(&mut self, target: &InternedString) -> bool;

    // Position-level iteration within the current key
    fn done_positions(&self) -> bool;
    fn current_position(&self) -> PositionRange;
    fn next_position(&mut self) -> bool;
    fn seek_forward_position(&mut self, target: Position) -> bool;
    /// OR of the field bits contributing to the current position.
    fn current_field_mask(&self) -> FieldMask;
}

/// Iterator over one term's postings. Stem-equivalent variants fan in here:
/// the iterator merges N postings lists by ordered key, then by ordered
/// position within a key.
pub struct TermIterator {
    variants: SmallVec<[SharedPostings; 1]>,
    cursors: SmallVec<[usize; 1]>,
    query_mask: FieldMask,
    require_positions: bool,
    current_key: Option<InternedString>,
    /// Merged (position, mask) pairs for the current key.
    positions: SmallVec<[(Position, FieldMask); 8]>,
    pos_idx: usize,
}

impl TermIterator {
    pub fn new(
        variants: SmallVec<[SharedPostings; 1]>,
        query_mask: FieldMask,
        require_positions: bool,
    ) -> Self {
        let cursors = variants.iter().map(|_| 0usize).collect();
        let mut iter = TermIterator {
            variants,
            cursors,
            query_mask,
            require_positions,
            current_key: None,
            positions: SmallVec::new(),
            pos_idx: 0,
        };
        iter.skip_masked_entries();
        iter.settle_on_min_key();
        iter
    }

    pub fn single(postings: SharedPostings, query_mask: FieldMask, require_positions: bool) -> Self {
        Self::new(SmallVec::from_iter([postings]), query_mask, require_positions)
    }

    /// Total number of keys across the variants; an upper bound on the
    /// number of distinct keys this iterator yields.
    pub fn size_estimate(&self) -> usize {
        self.variants.iter().map(|p| p.key_count()).sum()
    }

    /// Skips entries whose field mask does not intersect the query mask.
    fn skip_masked_entries(&mut self) {
        for (variant, cursor) in self.variants.iter().zip(self.cursors.iter_mut()) {
            while let Some(entry) = variant.entry(*cursor) {
                if entry.field_mask & self.query_mask != 0 {
                    break;
                }
                *cursor += 1;
            }
        }
    }

    fn settle_on_min_key(&mut self) {
        let mut min: Option<InternedString> = None;
        for (variant, cursor) in self.variants.iter().zip(self.cursors.iter()) {
            if let Some(entry) = variant.entry(*cursor) {
                if min.as_ref().map_or(true, |m| *m > entry.key) {
                    min = Some(entry.key.clone());
                }
            }
        }
        self.current_key = min;
        self.collect_positions();
    }

    fn collect_positions(&mut self) {
        self.positions.clear();
        self.pos_idx = 0;
        let Some(key) = &self.current_key else { return };
        if !self.require_positions {
            return;
        }
        for (variant, cursor) in self.variants.iter().zip(self.cursors.iter()) {
            let Some(entry) = variant.entry(*cursor) else { continue };
            if entry.key != *key {
                continue;
            }
            for &(position, mask) in &entry.positions {
                let masked = mask & self.query_mask;
                if masked == 0 {
                    continue;
                }
                match self.positions.binary_search_by_key(&position, |(p, _)| *p) {
                    Ok(idx) => self.positions[idx].1 |= masked,
                    Err(at) => self.positions.insert(at, (position, masked)),
                }
            }
        }
    }
}

impl TextIterator for TermIterator {
    fn query_field_mask(&self) -> FieldMask {
        self.query_mask
    }

    fn done_keys(&self) -> bool {
        self.current_key.is_none()
    }

    fn current_key(&self) -> &InternedString {
        self.current_key.as_ref().expect("iterator exhausted")
    }

    fn next_key(&mut self) -> bool {
        let Some(current) = self.current_key.clone() else { return false };
        for (variant, cursor) in self.variants.iter().zip(self.cursors.iter_mut()) {
            if let Some(entry) = variant.entry(*cursor) {
                if entry.key == current {
                    *cursor += 1;
                }
            }
        }
        self.skip_masked_entries();
        self.settle_on_min_key();
        self.current_key.is_some()
    }

    fn seek_forward_key(&mut self, target: &InternedString) -> bool {
        match &self.current_key {
            Some(current) if current >= target => return current == target,
            Some(_) => (),
            None => return false,
        }
        for (variant, cursor) in self.variants.iter().zip(self.cursors.iter_mut()) {
            if *cursor < variant.key_count() {
                *cursor = (*cursor).max(variant.lower_bound(target));
            }
        }
        self.skip_masked_entries();
        self.settle_on_min_key();
        matches!(&self.current_key, Some(key) if key == target)
    }

    fn done_positions(&self) -> bool {
        self.pos_idx >= self.positions.len()
    }

    fn current_position(&self) -> PositionRange {
        let (position, _) = self.positions[self.pos_idx];
        PositionRange { start: position, end: position }
    }

    fn next_position(&mut self) -> bool {
        if self.pos_idx < self.positions.len() {
            self.pos_idx += 1;
        }
        self.pos_idx < self.positions.len()
    }

    fn seek_forward_position(&mut self, target: Position) -> bool {
        while self.pos_idx < self.positions.len() && self.positions[self.pos_idx].0 < target {
            self.pos_idx += 1;
        }
        self.pos_idx < self.positions.len() && self.positions[self.pos_idx].0 == target
    }

    fn current_field_mask(&self) -> FieldMask {
        self.positions[self.pos_idx].1
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use smallvec::smallvec;

    use super::*;
    use crate::interning::intern;
    use crate::text::postings::Postings;

    fn postings(entries: &[(&str, u64, &[u32])]) -> SharedPostings {
        let mut p = Postings::default();
        for (key, mask, positions) in entries {
            let key = intern(key);
            for &pos in *positions {
                for bit in 0..64u32 {
                    if mask & (1u64 << bit) != 0 {
                        p.add_occurrence(&key, 1u64 << bit, pos);
                    }
                }
            }
        }
        Arc::new(p)
    }

    #[test]
    fn iterates_keys_in_order() {
        let p = postings(&[("b", 1, &[1]), ("a", 1, &[2]), ("c", 1, &[3])]);
        let mut iter = TermIterator::single(p, 1, true);
        let mut keys = Vec::new();
        while !iter.done_keys() {
            keys.push(iter.current_key().as_str().to_string());
            iter.next_key();
        }
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn field_mask_filters_keys() {
        let p = postings(&[("a", 0b01, &[1]), ("b", 0b10, &[1]), ("c", 0b11, &[1])]);
        let mut iter = TermIterator::single(p, 0b10, false);
        let mut keys = Vec::new();
        while !iter.done_keys() {
            keys.push(iter.current_key().as_str().to_string());
            iter.next_key();
        }
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[test]
    fn merges_stem_variants() {
        let original = postings(&[("a", 1, &[1, 5]), ("c", 1, &[2])]);
        let stemmed = postings(&[("a", 1, &[3]), ("b", 1, &[4])]);
        let mut iter = TermIterator::new(smallvec![original, stemmed], 1, true);

        assert_eq!(iter.current_key().as_str(), "a");
        let mut positions = Vec::new();
        while !iter.done_positions() {
            positions.push(iter.current_position().start);
            iter.next_position();
        }
        assert_eq!(positions, vec![1, 3, 5]);

        assert!(iter.next_key());
        assert_eq!(iter.current_key().as_str(), "b");
        assert!(iter.next_key());
        assert_eq!(iter.current_key().as_str(), "c");
        assert!(!iter.next_key());
        assert!(iter.done_keys());
    }

    #[test]
    fn seek_forward() {
        let p = postings(&[("a", 1, &[1]), ("c", 1, &[1]), ("e", 1, &[1])]);
        let mut iter = TermIterator::single(p, 1, false);
        assert!(!iter.seek_forward_key(&intern("b")));
        assert_eq!(iter.current_key().as_str(), "c");
        assert!(iter.seek_forward_key(&intern("e")));
        assert!(!iter.seek_forward_key(&intern("z")));
        assert!(iter.done_keys());
    }
}
