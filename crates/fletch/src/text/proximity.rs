//! AND over child text iterators, with optional positional constraints.
//!
//! The key layer yields the intersection of the children's key sets. When a
//! slop or in-order constraint is set (or a parent requested positions), the
//! position layer additionally requires a window of one position per child
//! such that `max - min <= slop + (n - 1)` and, with `inorder`, child i's
//! position precedes child i+1's.

use smallvec::SmallVec;

use crate::interning::InternedString;
use crate::text::iterator::{PositionRange, TextIterator, PROXIMITY_TERMS_INLINE_CAPACITY};
use crate::text::postings::{FieldMask, Position};

pub struct ProximityIterator {
    children: SmallVec<[Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY]>,
    slop: Option<u32>,
    inorder: bool,
    /// True when neither this iterator nor any parent needs position proofs;
    /// key intersection alone is then sufficient.
    skip_positional: bool,
    current_key: Option<InternedString>,
    current_position: Option<PositionRange>,
    current_field_mask: FieldMask,
}

impl ProximityIterator {
    pub fn new(
        children: SmallVec<[Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY]>,
        slop: Option<u32>,
        inorder: bool,
        skip_positional: bool,
    ) -> Self {
        debug_assert!(!children.is_empty(), "must have at least one text iterator");
        let mut iter = ProximityIterator {
            children,
            slop,
            inorder,
            skip_positional,
            current_key: None,
            current_position: None,
            current_field_mask: 0,
        };
        iter.align_keys(false);
        iter
    }

    fn positional_active(&self) -> bool {
        !self.skip_positional && (self.slop.is_some() || self.inorder)
    }

    /// Advances children until they all sit on one key (and, when positional
    /// checks are active, one that has a valid window). `advance_first`
    /// forces one step past the current common key.
    fn align_keys(&mut self, advance_first: bool) {
        if advance_first {
            for child in &mut self.children {
                child.next_key();
            }
        }
        'align: loop {
            let mut max: Option<InternedString> = None;
            for child in &self.children {
                if child.done_keys() {
                    max = None;
                    break;
                }
                let key = child.current_key();
                if max.as_ref().map_or(true, |m| m < key) {
                    max = Some(key.clone());
                }
            }
            let Some(target) = max else {
                self.exhaust();
                return;
            };
            let mut exhausted = false;
            let mut overshot = false;
            for child in &mut self.children {
                if child.current_key() < &target && !child.seek_forward_key(&target) {
                    // either ran out of keys or landed past the target
                    if child.done_keys() {
                        exhausted = true;
                    } else {
                        overshot = true;
                    }
                    break;
                }
            }
            if exhausted {
                self.exhaust();
                return;
            }
            if overshot {
                continue 'align;
            }
            // all children agree on `target`
            if self.positional_active() {
                if !self.first_window() {
                    for child in &mut self.children {
                        child.next_key();
                    }
                    continue 'align;
                }
            } else {
                self.current_position = None;
                self.current_field_mask =
                    self.children.iter().map(|c| c.query_field_mask()).fold(0, |a, b| a | b);
            }
            self.current_key = Some(target);
            return;
        }
    }

    fn exhaust(&mut self) {
        self.current_key = None;
        self.current_position = None;
        self.current_field_mask = 0;
    }

    /// Positions every child on its first position and searches the first
    /// valid window.
    fn first_window(&mut self) -> bool {
        for child in &mut self.children {
            if child.done_positions() {
                return false;
            }
        }
        self.search_window()
    }

    /// Sliding-window search: while the window is invalid, advance the child
    /// holding the minimum position.
    fn search_window(&mut self) -> bool {
        let n = self.children.len() as u32;
        loop {
            let mut min = Position::MAX;
            let mut min_idx = 0;
            let mut max = 0;
            for (idx, child) in self.children.iter().enumerate() {
                if child.done_positions() {
                    self.current_position = None;
                    return false;
                }
                let pos = child.current_position();
                if pos.start < min {
                    min = pos.start;
                    min_idx = idx;
                }
                max = max.max(pos.end);
            }
            let within = match self.slop {
                Some(slop) => max.saturating_sub(min) <= slop + (n - 1),
                None => true,
            };
            let ordered = !self.inorder
                || self
                    .children
                    .windows(2)
                    .all(|w| w[0].current_position().start < w[1].current_position().start);
            if within && ordered {
                self.current_position = Some(PositionRange { start: min, end: max });
                self.current_field_mask =
                    self.children.iter().map(|c| c.current_field_mask()).fold(0, |a, b| a | b);
                return true;
            }
            if !self.children[min_idx].next_position() {
                self.current_position = None;
                return false;
            }
        }
    }
}

impl TextIterator for ProximityIterator {
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
        if self.current_key.is_none() {
            return false;
        }
        self.align_keys(true);
        self.current_key.is_some()
    }

    fn seek_forward_key(&mut self, target: &InternedString) -> bool {
        match &self.current_key {
            Some(current) if current >= target => return current == target,
            Some(_) => (),
            None => return false,
        }
        for child in &mut self.children {
            child.seek_forward_key(target);
        }
        if self.children.iter().any(|c| c.done_keys()) {
            self.exhaust();
            return false;
        }
        self.align_keys(false);
        matches!(&self.current_key, Some(key) if key == target)
    }

    fn done_positions(&self) -> bool {
        self.current_position.is_none()
    }

    fn current_position(&self) -> PositionRange {
        self.current_position.expect("no current position")
    }

    fn next_position(&mut self) -> bool {
        if self.current_position.is_none() {
            return false;
        }
        // slide past the current window's left edge
        let min = self.current_position.expect("checked").start;
        let mut advanced = false;
        for child in &mut self.children {
            if child.current_position().start == min {
                advanced |= child.next_position();
                if child.done_positions() {
                    self.current_position = None;
                    return false;
                }
            }
        }
        if !advanced {
            self.current_position = None;
            return false;
        }
        self.search_window()
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

    fn term(entries: &[(&str, &[u32])], require_positions: bool) -> Box<dyn TextIterator> {
        let mut p = Postings::default();
        for (key, positions) in entries {
            let key = intern(key);
            for &pos in *positions {
                p.add_occurrence(&key, 1, pos);
            }
        }
        Box::new(TermIterator::single(Arc::new(p), 1, require_positions))
    }

    fn keys(iter: &mut ProximityIterator) -> Vec<String> {
        let mut out = Vec::new();
        while !iter.done_keys() {
            out.push(iter.current_key().as_str().to_string());
            iter.next_key();
        }
        out
    }

    #[test]
    fn key_intersection_without_positions() {
        let a = term(&[("k1", &[1]), ("k2", &[1]), ("k4", &[1])], false);
        let b = term(&[("k2", &[5]), ("k3", &[5]), ("k4", &[9])], false);
        let mut iter = ProximityIterator::new(smallvec![a, b], None, false, true);
        assert_eq!(keys(&mut iter), vec!["k2", "k4"]);
    }

    #[test]
    fn phrase_requires_adjacent_in_order() {
        // "hello world": hello at 3, world at 4 -> adjacent, matches
        let hello = term(&[("doc1", &[3]), ("doc2", &[7])], true);
        let world = term(&[("doc1", &[4]), ("doc2", &[5])], true);
        let mut iter = ProximityIterator::new(smallvec![hello, world], Some(0), true, false);
        assert_eq!(keys(&mut iter), vec!["doc1"]);
    }

    #[test]
    fn out_of_order_rejected_when_inorder() {
        let hello = term(&[("doc", &[5])], true);
        let world = term(&[("doc", &[4])], true);
        let mut iter = ProximityIterator::new(smallvec![hello, world], Some(0), true, false);
        assert!(iter.done_keys());
    }

    #[test]
    fn slop_relaxes_distance() {
        // world at 6, hello at 3: gap of 3 > slop 0 + 1 but <= slop 2 + 1
        let hello = term(&[("doc", &[3])], true);
        let world = term(&[("doc", &[6])], true);
        let mut strict = ProximityIterator::new(
            smallvec![term(&[("doc", &[3])], true), term(&[("doc", &[6])], true)],
            Some(0),
            true,
            false,
        );
        assert!(strict.done_keys());
        let mut relaxed = ProximityIterator::new(smallvec![hello, world], Some(2), true, false);
        assert_eq!(keys(&mut relaxed), vec!["doc"]);
    }

    #[test]
    fn window_positions_iterate() {
        let a = term(&[("doc", &[1, 10])], true);
        let b = term(&[("doc", &[2, 11])], true);
        let mut iter = ProximityIterator::new(smallvec![a, b], Some(0), true, false);
        assert!(!iter.done_keys());
        let first = iter.current_position();
        assert_eq!((first.start, first.end), (1, 2));
        assert!(iter.next_position());
        let second = iter.current_position();
        assert_eq!((second.start, second.end), (10, 11));
        assert!(!iter.next_position());
    }

    #[test]
    fn unordered_slop_counts_any_direction() {
        // inorder=false with slop: |4 - 5| fits slop 0 + 1 window
        let a = term(&[("doc", &[5])], true);
        let b = term(&[("doc", &[4])], true);
        let mut iter = ProximityIterator::new(smallvec![a, b], Some(0), false, false);
        assert_eq!(keys(&mut iter), vec!["doc"]);
    }
}
