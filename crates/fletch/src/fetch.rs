//! Entries-fetcher pipeline: converts a predicate tree into fetchers whose
//! union approximates the candidate key set.
//!
//! Composed AND nodes first try to collapse into a single text iterator;
//! failing that, only the minimum-size branch survives (the smallest set
//! drives the intersection, the dropped branches are re-verified by the
//! prefilter evaluator). Composed OR nodes likewise try a single
//! OR-proximity iterator and otherwise concatenate their children.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::config;
use crate::filter::eval::complement_text_keys;
use crate::filter::{Predicate, TextPredicate};
use crate::index::{EntriesFetcher, TextIndexSchema, TypedIndex, VecFetcher};
use crate::interning::InternedString;
use crate::schema::SchemaIndexes;
use crate::text::iterator::{
    PositionRange, TermIterator, TextIterator, PROXIMITY_TERMS_INLINE_CAPACITY,
};
use crate::text::or_proximity::OrProximityIterator;
use crate::text::postings::{FieldMask, Position};
use crate::text::proximity::ProximityIterator;

pub type FetcherQueue = VecDeque<Box<dyn EntriesFetcher>>;

/// Fetcher wrapping a text iterator; yields its key stream.
pub struct TextIteratorFetcher {
    iterator: Box<dyn TextIterator>,
    size: usize,
}

impl TextIteratorFetcher {
    pub fn new(iterator: Box<dyn TextIterator>, size: usize) -> Self {
        TextIteratorFetcher { iterator, size }
    }
}

impl EntriesFetcher for TextIteratorFetcher {
    fn size(&self) -> usize {
        self.size
    }

    fn into_keys(self: Box<Self>) -> Box<dyn Iterator<Item = InternedString>> {
        Box::new(TextKeys { iterator: self.iterator })
    }
}

struct TextKeys {
    iterator: Box<dyn TextIterator>,
}

impl Iterator for TextKeys {
    type Item = InternedString;

    fn next(&mut self) -> Option<InternedString> {
        if self.iterator.done_keys() {
            return None;
        }
        let key = self.iterator.current_key().clone();
        self.iterator.next_key();
        Some(key)
    }
}

/// Key-only text iterator over a precomputed sorted key list. Negated text
/// terms surface through this: the complement carries no positions.
pub struct KeyListIterator {
    keys: Vec<InternedString>,
    idx: usize,
    query_mask: FieldMask,
}

impl KeyListIterator {
    pub fn new(keys: Vec<InternedString>, query_mask: FieldMask) -> Self {
        debug_assert!(keys.windows(2).all(|w| w[0] <= w[1]));
        KeyListIterator { keys, idx: 0, query_mask }
    }
}

impl TextIterator for KeyListIterator {
    fn query_field_mask(&self) -> FieldMask {
        self.query_mask
    }

    fn done_keys(&self) -> bool {
        self.idx >= self.keys.len()
    }

    fn current_key(&self) -> &InternedString {
        &self.keys[self.idx]
    }

    fn next_key(&mut self) -> bool {
        if self.idx < self.keys.len() {
            self.idx += 1;
        }
        self.idx < self.keys.len()
    }

    fn seek_forward_key(&mut self, target: &InternedString) -> bool {
        while self.idx < self.keys.len() && &self.keys[self.idx] < target {
            self.idx += 1;
        }
        self.idx < self.keys.len() && &self.keys[self.idx] == target
    }

    fn done_positions(&self) -> bool {
        true
    }

    fn current_position(&self) -> PositionRange {
        unreachable!("key-list iterators carry no positions")
    }

    fn next_position(&mut self) -> bool {
        false
    }

    fn seek_forward_position(&mut self, _target: Position) -> bool {
        false
    }

    fn current_field_mask(&self) -> FieldMask {
        self.query_mask
    }
}

/// Builds the iterator for one text predicate. `require_positions` controls
/// whether leaf iterators load their position lists.
pub fn build_text_predicate_iterator(
    predicate: &TextPredicate,
    text_schema: &TextIndexSchema,
    require_positions: bool,
) -> (Box<dyn TextIterator>, usize) {
    let cap = config::max_term_expansions();
    match predicate {
        TextPredicate::Term(leaf) => {
            let postings = text_schema.postings_for_term(&leaf.word);
            let iter = TermIterator::new(postings, leaf.field_bit, require_positions);
            let size = iter.size_estimate();
            (Box::new(iter), size)
        }
        TextPredicate::Prefix(leaf) => {
            let postings = text_schema.expand_prefix(&leaf.word, cap);
            let iter =
                TermIterator::new(postings.into(), leaf.field_bit, require_positions);
            let size = iter.size_estimate();
            (Box::new(iter), size)
        }
        TextPredicate::Suffix(leaf) => {
            let postings = text_schema.expand_suffix(&leaf.word, cap);
            let iter =
                TermIterator::new(postings.into(), leaf.field_bit, require_positions);
            let size = iter.size_estimate();
            (Box::new(iter), size)
        }
        TextPredicate::Infix(leaf) => {
            let postings = text_schema.expand_infix(&leaf.word, cap);
            let iter =
                TermIterator::new(postings.into(), leaf.field_bit, require_positions);
            let size = iter.size_estimate();
            (Box::new(iter), size)
        }
        TextPredicate::Fuzzy(leaf, distance) => {
            let postings = text_schema.expand_fuzzy(&leaf.word, *distance, cap);
            let iter =
                TermIterator::new(postings.into(), leaf.field_bit, require_positions);
            let size = iter.size_estimate();
            (Box::new(iter), size)
        }
        TextPredicate::Proximity { children, slop, inorder } => {
            let child_require_positions = slop.is_some() || *inorder;
            let mut iterators: SmallVec<
                [Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY],
            > = SmallVec::new();
            let mut min_size = usize::MAX;
            for child in children {
                let (iter, size) =
                    build_text_predicate_iterator(child, text_schema, child_require_positions);
                min_size = min_size.min(size);
                iterators.push(iter);
            }
            let skip_positional = !child_require_positions && !require_positions;
            let size = if min_size == usize::MAX { 0 } else { min_size };
            (
                Box::new(ProximityIterator::new(iterators, *slop, *inorder, skip_positional)),
                size,
            )
        }
    }
}

/// Attempts to express a predicate subtree as one text iterator. AND nodes
/// cover their text children (non-text members fall back to the unsolved
/// re-evaluation); OR nodes only collapse when every child is text.
pub fn build_text_iterator(
    predicate: &Predicate,
    inner: &SchemaIndexes,
    negate: bool,
    require_positions: bool,
) -> Option<(Box<dyn TextIterator>, usize)> {
    let text_schema = inner.text()?;
    match predicate {
        Predicate::And(children) | Predicate::Or(children) => {
            let effective_and = matches!(predicate, Predicate::And(_)) != negate;
            if effective_and {
                let mut iterators: SmallVec<
                    [Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY],
                > = SmallVec::new();
                let mut min_size = usize::MAX;
                for child in children {
                    if let Some((iter, size)) =
                        build_text_iterator(child, inner, negate, false)
                    {
                        min_size = min_size.min(size);
                        iterators.push(iter);
                    }
                }
                if iterators.is_empty() {
                    return None;
                }
                let size = if min_size == usize::MAX { 0 } else { min_size };
                Some((
                    Box::new(ProximityIterator::new(iterators, None, false, true)),
                    size,
                ))
            } else {
                let mut iterators: SmallVec<
                    [Box<dyn TextIterator>; PROXIMITY_TERMS_INLINE_CAPACITY],
                > = SmallVec::new();
                let mut total = 0usize;
                for child in children {
                    let (iter, size) = build_text_iterator(child, inner, negate, false)?;
                    total += size;
                    iterators.push(iter);
                }
                Some((Box::new(OrProximityIterator::new(iterators)), total))
            }
        }
        Predicate::Negate(child) => build_text_iterator(child, inner, !negate, require_positions),
        Predicate::Text(text) => {
            if negate {
                let keys = complement_text_keys(text, text_schema);
                let size = keys.len();
                Some((Box::new(KeyListIterator::new(keys, text.field_mask())), size))
            } else {
                Some(build_text_predicate_iterator(text, text_schema, require_positions))
            }
        }
        Predicate::Numeric(_) | Predicate::Tag(_) => None,
    }
}

/// Converts a predicate tree into fetchers. Returns the estimated size of
/// the emitted candidate set.
pub fn evaluate_filter_as_primary(
    predicate: &Predicate,
    inner: &SchemaIndexes,
    fetchers: &mut FetcherQueue,
    negate: bool,
) -> usize {
    match predicate {
        Predicate::And(children) | Predicate::Or(children) => {
            let effective_and = matches!(predicate, Predicate::And(_)) != negate;
            if effective_and {
                if let Some((iterator, size)) =
                    build_text_iterator(predicate, inner, negate, false)
                {
                    fetchers.push_back(Box::new(TextIteratorFetcher::new(iterator, size)));
                    return size;
                }
                // keep only the smallest branch; the prefilter evaluator
                // re-verifies its candidates against the full predicate
                let mut min_size = usize::MAX;
                let mut best: FetcherQueue = VecDeque::new();
                for child in children {
                    let mut child_fetchers: FetcherQueue = VecDeque::new();
                    let child_size =
                        evaluate_filter_as_primary(child, inner, &mut child_fetchers, negate);
                    if child_size < min_size {
                        min_size = child_size;
                        best = child_fetchers;
                    }
                }
                fetchers.append(&mut best);
                if min_size == usize::MAX {
                    0
                } else {
                    min_size
                }
            } else {
                if let Some((iterator, size)) =
                    build_text_iterator(predicate, inner, negate, false)
                {
                    fetchers.push_back(Box::new(TextIteratorFetcher::new(iterator, size)));
                    return size;
                }
                let mut total = 0usize;
                for child in children {
                    let mut child_fetchers: FetcherQueue = VecDeque::new();
                    total +=
                        evaluate_filter_as_primary(child, inner, &mut child_fetchers, negate);
                    fetchers.append(&mut child_fetchers);
                }
                total
            }
        }
        Predicate::Negate(child) => {
            evaluate_filter_as_primary(child, inner, fetchers, !negate)
        }
        Predicate::Numeric(numeric) => match inner.index(&numeric.alias) {
            Some(TypedIndex::Numeric(index)) => {
                let fetcher = index.search(&numeric.range, negate);
                let size = fetcher.size();
                fetchers.push_back(fetcher);
                size
            }
            _ => 0,
        },
        Predicate::Tag(tag) => match inner.index(&tag.alias) {
            Some(TypedIndex::Tag(index)) => {
                let fetcher = index.search(&tag.patterns, negate);
                let size = fetcher.size();
                fetchers.push_back(fetcher);
                size
            }
            _ => 0,
        },
        Predicate::Text(text) => {
            let Some(text_schema) = inner.text() else { return 0 };
            if negate {
                let keys = complement_text_keys(text, text_schema);
                let size = keys.len();
                fetchers.push_back(Box::new(VecFetcher::new(keys)));
                size
            } else {
                let (iterator, size) =
                    build_text_predicate_iterator(text, text_schema, false);
                fetchers.push_back(Box::new(TextIteratorFetcher::new(iterator, size)));
                size
            }
        }
    }
}
