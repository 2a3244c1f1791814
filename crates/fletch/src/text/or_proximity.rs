//! OR over child text iterators.
//!
//! Unlike [`ProximityIterator`](crate::text::proximity::ProximityIterator),
//! which requires all terms to be present, this iterator yields a key when
//! any child holds it. There is no proximity validation; positions stream
//! out in ascending order merged across the children on the current key.

use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::interning::InternedString;
use crate::text::iterator::{PositionRange, TextIterator, PROXIMITY_TERMS_INLINE_CAPACITY};
use crate::text::postings::{FieldMask, Position};

pub struct OrProximityIterator {
    children: SmallVec<[Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY]>,
    current_key: Option<InternedString>,
    current_position: Option<PositionRange>,
    current_field_mask: FieldMask,
    /// Ordered (key, child) pairs for children not on the current key.
    key_set: BTreeSet<(InternedString, usize)>,
    /// Children positioned on the current key.
    current_key_indices: SmallVec<[usize; PROXIMITY_TERMS_INLINE_CAPACITY]>,
    /// Ordered (position, child) pairs within the current key.
    pos_set: BTreeSet<(Position, usize)>,
    current_pos_indices: SmallVec<[usize; PROXIMITY_TERMS_INLINE_CAPACITY]>,
}

impl OrProximityIterator {
    pub fn new(
        children: SmallVec<[Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY]>,
    ) -> Self {
        debug_assert!(!children.is_empty(), "must have at least one text iterator");
        let mut iter = OrProximityIterator {
            children,
            current_key: None,
            current_position: None,
            current_field_mask: 0,
            key_set: BTreeSet::new(),
            current_key_indices: SmallVec::new(),
            pos_set: BTreeSet::new(),
            current_pos_indices: SmallVec::new(),
        };
        for idx in 0..iter.children.len() {
            iter.insert_valid_key_iterator(idx);
        }
        iter.find_minimum_key();
        iter
    }

    fn insert_valid_key_iterator(&mut self, idx: usize) {
        let child = &self.children[idx];
        if !child.done_keys() {
            self.key_set.insert((child.current_key().clone(), idx));
        }
    }

    fn find_minimum_key(&mut self) -> bool {
        let Some((min_key, _)) = self.key_set.iter().next().cloned() else {
            self.current_key = None;
            self.current_position = None;
            self.current_field_mask = 0;
            return false;
        };
        self.current_key_indices.clear();
        while let Some(entry) = self.key_set.iter().next().cloned() {
            if entry.0 != min_key {
                break;
            }
            self.key_set.remove(&entry);
            self.current_key_indices.push(entry.1);
        }
        self.current_key = Some(min_key);
        self.pos_set.clear();
        self.current_pos_indices.clear();
        self.current_position = None;
        self.next_position();
        true
    }

    fn insert_valid_position_iterator(&mut self, idx: usize) {
        let child = &self.children[idx];
        if !child.done_positions() {
            self.pos_set.insert((child.current_position().start, idx));
        }
    }
}

impl TextIterator for OrProximityIterator {
    fn query_field_mask(&self) -> FieldMask {
        self.children.iter().map(|c| c.query_field_mask()).fold(0, |a, b| a | b)
    }

    fn done_keys(&self) -> bool {
        self.current_key.is_none()
    }

    fn current_key(&self) -> &InternedString {
        self.current_key.as_ref().expect("iterator exhausted")
    }

    fn next_key(&mut self) -> bool {
        if self.current_key.is_some() {
            // advance every child parked on the current key, then re-insert
            let indices = std::mem::take(&mut self.current_key_indices);
            for &idx in &indices {
                self.children[idx].next_key();
            }
            for &idx in &indices {
                self.insert_valid_key_iterator(idx);
            }
        }
        self.find_minimum_key()
    }

    fn seek_forward_key(&mut self, target: &InternedString) -> bool {
        if let Some(current) = &self.current_key {
            if current >= target {
                return current == target;
            }
        }
        // children parked on the (smaller) current key must move too
        let indices = std::mem::take(&mut self.current_key_indices);
        for &idx in &indices {
            self.children[idx].seek_forward_key(target);
            self.insert_valid_key_iterator(idx);
        }
        // pull everything below the target out of the set and re-seek it
        loop {
            let Some(entry) = self.key_set.iter().next().cloned() else { break };
            if entry.0 >= *target {
                break;
            }
            self.key_set.remove(&entry);
            self.children[entry.1].seek_forward_key(target);
            self.insert_valid_key_iterator(entry.1);
        }
        self.find_minimum_key();
        matches!(&self.current_key, Some(key) if key == target)
    }

    fn done_positions(&self) -> bool {
        self.current_position.is_none()
    }

    fn current_position(&self) -> PositionRange {
        self.current_position.expect("no current position")
    }

    fn next_position(&mut self) -> bool {
        if self.current_position.is_some() {
            let indices = std::mem::take(&mut self.current_pos_indices);
            for &idx in &indices {
                self.children[idx].next_position();
            }
            for &idx in &indices {
                self.insert_valid_position_iterator(idx);
            }
        } else {
            // new key: seed with every child on it
            let indices = self.current_key_indices.clone();
            for idx in indices {
                self.insert_valid_position_iterator(idx);
            }
        }

        let Some((min_pos, _)) = self.pos_set.iter().next().cloned() else {
            self.current_position = None;
            self.current_field_mask = 0;
            return false;
        };
        self.current_pos_indices.clear();
        while let Some(entry) = self.pos_set.iter().next().cloned() {
            if entry.0 != min_pos {
                break;
            }
            self.pos_set.remove(&entry);
            self.current_pos_indices.push(entry.1);
        }
        let mut range = self.children[self.current_pos_indices[0]].current_position();
        let mut mask = 0;
        for &idx in &self.current_pos_indices {
            let child_range = self.children[idx].current_position();
            range.end = range.end.max(child_range.end);
            mask |= self.children[idx].current_field_mask();
        }
        self.current_position = Some(range);
        self.current_field_mask = mask;
        true
    }

    fn seek_forward_position(&mut self, target: Position) -> bool {
        while let Some(current) = self.current_position {
            if current.start >= target {
                return current.start == target;
            }
            if !self.next_position() {
                return false;
            }
        }
        false
    }

    fn current_field_mask(&self) -> FieldMask {
        self.current_field_mask
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use smallvec::smallvec;

    use super::*;
    use crate::interning::intern;
    use crate::text::iterator::TermIterator;
    use crate::text::postings::Postings;

    fn term(entries: &[(&str, &[u32])]) -> Box<dyn TextIterator> {
        let mut p = Postings::default();
        for (key, positions) in entries {
            let key = intern(key);
            for &pos in *positions {
                p.add_occurrence(&key, 1, pos);
            }
        }
        Box::new(TermIterator::single(Arc::new(p), 1, true))
    }

    fn all_keys(iter: &mut OrProximityIterator) -> Vec<String> {
        let mut out = Vec::new();
        while !iter.done_keys() {
            out.push(iter.current_key().as_str().to_string());
            iter.next_key();
        }
        out
    }

    #[test]
    fn union_of_keys_in_order() {
        let a = term(&[("k1", &[1]), ("k3", &[1])]);
        let b = term(&[("k2", &[1]), ("k3", &[1])]);
        let c = term(&[("k0", &[1])]);
        let mut iter = OrProximityIterator::new(smallvec![a, b, c]);
        assert_eq!(all_keys(&mut iter), vec!["k0", "k1", "k2", "k3"]);
    }

    #[test]
    fn shared_keys_yield_once() {
        let a = term(&[("dup", &[1])]);
        let b = term(&[("dup", &[2])]);
        let mut iter = OrProximityIterator::new(smallvec![a, b]);
        assert_eq!(all_keys(&mut iter), vec!["dup"]);
    }

    #[test]
    fn positions_merge_across_children() {
        let a = term(&[("doc", &[1, 5])]);
        let b = term(&[("doc", &[3, 5])]);
        let mut iter = OrProximityIterator::new(smallvec![a, b]);
        let mut positions = Vec::new();
        while !iter.done_positions() {
            positions.push(iter.current_position().start);
            iter.next_position();
        }
        assert_eq!(positions, vec![1, 3, 5]);
    }

    #[test]
    fn seek_forward_key_across_children() {
        let a = term(&[("a", &[1]), ("d", &[1])]);
        let b = term(&[("b", &[1]), ("e", &[1])]);
        let mut iter = OrProximityIterator::new(smallvec![a, b]);
        assert!(!iter.seek_forward_key(&intern("c")));
        assert_eq!(iter.current_key().as_str(), "d");
        assert!(iter.seek_forward_key(&intern("e")));
        assert!(!iter.next_key());
    }
}
