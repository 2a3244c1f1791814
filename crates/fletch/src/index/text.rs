//! Schema-wide text index: one word store shared by every text attribute
//! (postings carry per-field masks), plus a per-key positional view used by
//! the prefilter evaluator, plus the stem-equivalence table filled in by
//! ingestion.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::text::postings::{FieldMask, Position, Postings, SharedPostings};
use crate::text::radix::{CountOp, PathIterator, RadixTree};
use crate::interning::InternedString;

/// One text attribute of the schema; its number selects the bit every
/// posting and position of that field carries.
#[derive(Debug, Clone, Copy)]
pub struct TextAttribute {
    field_number: usize,
}

impl TextAttribute {
    pub fn field_bit(&self) -> FieldMask {
        1 << self.field_number
    }
}

#[derive(Debug, Default, Clone)]
pub struct KeyWordEntry {
    pub field_mask: FieldMask,
    /// Ascending, with the contributing field bits per position.
    pub positions: Vec<(Position, FieldMask)>,
}

/// The words of a single key, kept alongside the inverted index so phrase
/// predicates can be re-evaluated per key without touching the record.
#[derive(Debug, Default, Clone)]
pub struct KeyTextIndex {
    words: BTreeMap<String, KeyWordEntry>,
}

impl KeyTextIndex {
    pub fn words(&self) -> impl Iterator<Item = (&str, &KeyWordEntry)> {
        self.words.iter().map(|(w, e)| (w.as_str(), e))
    }

    pub fn entry(&self, word: &str) -> Option<&KeyWordEntry> {
        self.words.get(word)
    }

    pub fn contains_term(&self, word: &str, mask: FieldMask) -> bool {
        self.words.get(word).is_some_and(|e| e.field_mask & mask != 0)
    }

    pub fn contains_prefix(&self, prefix: &str, mask: FieldMask) -> bool {
        self.words
            .range(prefix.to_string()..)
            .take_while(|(w, _)| w.starts_with(prefix))
            .any(|(_, e)| e.field_mask & mask != 0)
    }

    pub fn contains_suffix(&self, suffix: &str, mask: FieldMask) -> bool {
        self.words.iter().any(|(w, e)| w.ends_with(suffix) && e.field_mask & mask != 0)
    }

    pub fn contains_infix(&self, infix: &str, mask: FieldMask) -> bool {
        self.words.iter().any(|(w, e)| w.contains(infix) && e.field_mask & mask != 0)
    }

    pub fn contains_fuzzy(&self, word: &str, distance: u32, mask: FieldMask) -> bool {
        self.words
            .iter()
            .any(|(w, e)| e.field_mask & mask != 0 && within_edit_distance(word, w, distance))
    }

    /// Merged positions of every word matching `matcher` in the masked
    /// fields, ascending. Drives per-key phrase evaluation.
    pub fn positions_matching(
        &self,
        matcher: impl Fn(&str) -> bool,
        mask: FieldMask,
    ) -> Vec<(Position, FieldMask)> {
        let mut out: Vec<(Position, FieldMask)> = Vec::new();
        for (word, entry) in &self.words {
            if entry.field_mask & mask == 0 || !matcher(word) {
                continue;
            }
            for &(position, position_mask) in &entry.positions {
                let masked = position_mask & mask;
                if masked == 0 {
                    continue;
                }
                match out.binary_search_by_key(&position, |(p, _)| *p) {
                    Ok(idx) => out[idx].1 |= masked,
                    Err(at) => out.insert(at, (position, masked)),
                }
            }
        }
        out
    }
}

/// Plain Levenshtein distance, early-exited at `max`.
pub fn within_edit_distance(a: &str, b: &str, max: u32) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len().abs_diff(b.len()) > max as usize {
        return false;
    }
    let mut row: Vec<u32> = (0..=a.len() as u32).collect();
    for (j, &bc) in b.iter().enumerate() {
        let mut prev = row[0];
        row[0] = j as u32 + 1;
        let mut row_min = row[0];
        for i in 1..=a.len() {
            let cost = u32::from(a[i - 1] != bc);
            let next = (prev + cost).min(row[i] + 1).min(row[i - 1] + 1);
            prev = row[i];
            row[i] = next;
            row_min = row_min.min(next);
        }
        if row_min > max {
            return false;
        }
    }
    row[a.len()] <= max
}

pub struct TextIndexSchema {
    words: RadixTree<SharedPostings>,
    /// Reversed words sharing the same postings, present when the schema
    /// asked for suffix support.
    suffix_words: Option<RadixTree<SharedPostings>>,
    per_key: HashMap<InternedString, KeyTextIndex>,
    /// word -> stem-equivalent variants, filled by ingestion. Every variant
    /// is expected to exist in the word store.
    stems: HashMap<String, Vec<String>>,
    field_count: usize,
    untracked: HashSet<InternedString>,
}

impl TextIndexSchema {
    pub fn new(with_suffix_trie: bool) -> Self {
        TextIndexSchema {
            words: RadixTree::new(),
            suffix_words: with_suffix_trie.then(RadixTree::new),
            per_key: HashMap::new(),
            stems: HashMap::new(),
            field_count: 0,
            untracked: HashSet::new(),
        }
    }

    pub fn add_text_field(&mut self) -> TextAttribute {
        let attribute = TextAttribute { field_number: self.field_count };
        self.field_count += 1;
        attribute
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    /// Whitespace/punctuation tokenizer. Stemming and language handling are
    /// an ingestion concern; the query path only consumes the resulting
    /// stem table.
    pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
    }

    /// Indexes one field's text for `key`. Position numbers are the token
    /// ordinals of this field.
    pub fn index_field(&mut self, key: &InternedString, attribute: TextAttribute, text: &str) {
        let field_bit = attribute.field_bit();
        let mut any = false;
        for (position, token) in Self::tokenize(text).enumerate() {
            any = true;
            let position = position as Position;
            self.add_occurrence(key, &token, field_bit, position);
        }
        if any {
            self.untracked.remove(key);
        } else if !self.per_key.contains_key(key) {
            self.untracked.insert(key.clone());
        }
    }

    fn add_occurrence(
        &mut self,
        key: &InternedString,
        word: &str,
        field_bit: FieldMask,
        position: Position,
    ) {
        let first_for_key =
            self.words.get(word.as_bytes()).map_or(true, |p| p.find(key).is_none());
        self.words.mutate(
            word.as_bytes(),
            |existing| {
                let mut postings = existing.unwrap_or_default();
                Arc::make_mut(&mut postings).add_occurrence(key, field_bit, position);
                Some(postings)
            },
            if first_for_key { CountOp::Add } else { CountOp::None },
        );
        if let Some(suffix_words) = &mut self.suffix_words {
            let shared = self.words.get(word.as_bytes()).expect("just inserted").clone();
            let reversed: Vec<u8> = word.as_bytes().iter().rev().copied().collect();
            suffix_words.mutate(&reversed, |_| Some(shared), CountOp::None);
        }
        let entry = self
            .per_key
            .entry(key.clone())
            .or_default()
            .words
            .entry(word.to_string())
            .or_default();
        entry.field_mask |= field_bit;
        match entry.positions.binary_search_by_key(&position, |(p, _)| *p) {
            Ok(idx) => entry.positions[idx].1 |= field_bit,
            Err(at) => entry.positions.insert(at, (position, field_bit)),
        }
    }

    /// Removes every word of `key` from the store.
    pub fn remove_key(&mut self, key: &InternedString) -> bool {
        let Some(key_index) = self.per_key.remove(key) else { return false };
        for (word, _) in key_index.words {
            self.words.mutate(
                word.as_bytes(),
                |existing| {
                    let mut postings = existing?;
                    let inner = Arc::make_mut(&mut postings);
                    inner.remove_key(key);
                    if inner.is_empty() {
                        None
                    } else {
                        Some(postings)
                    }
                },
                CountOp::Sub,
            );
            if let Some(suffix_words) = &mut self.suffix_words {
                let reversed: Vec<u8> = word.as_bytes().iter().rev().copied().collect();
                match self.words.get(word.as_bytes()) {
                    Some(shared) => {
                        let shared = shared.clone();
                        suffix_words.mutate(&reversed, |_| Some(shared), CountOp::None);
                    }
                    None => suffix_words.mutate(&reversed, |_| None, CountOp::None),
                }
            }
        }
        self.untracked.insert(key.clone());
        true
    }

    pub fn add_stem_mapping(&mut self, word: &str, variant: &str) {
        self.stems.entry(word.to_string()).or_default().push(variant.to_string());
    }

    pub fn tracked_key_count(&self) -> usize {
        self.per_key.len()
    }

    pub fn tracked_keys(&self) -> impl Iterator<Item = &InternedString> {
        self.per_key.keys()
    }

    pub fn untracked_keys(&self) -> &HashSet<InternedString> {
        &self.untracked
    }

    pub fn per_key_index(&self, key: &InternedString) -> Option<&KeyTextIndex> {
        self.per_key.get(key)
    }

    pub fn stem_variants(&self, word: &str) -> &[String] {
        self.stems.get(word).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn unique_word_count(&self) -> u64 {
        self.words.total_unique_word_count()
    }

    pub fn subtree_key_count(&self, prefix: &str) -> u64 {
        self.words.subtree_key_count(prefix.as_bytes())
    }

    /// Postings for a term plus its stem-equivalence class. A variant absent
    /// from the word store is an ingestion bug; release builds skip it.
    pub fn postings_for_term(&self, word: &str) -> SmallVec<[SharedPostings; 1]> {
        let mut out = SmallVec::new();
        if let Some(postings) = self.words.get(word.as_bytes()) {
            out.push(postings.clone());
        }
        for variant in self.stem_variants(word) {
            match self.words.get(variant.as_bytes()) {
                Some(postings) => out.push(postings.clone()),
                None => debug_assert!(false, "stem variant `{variant}` missing for `{word}`"),
            }
        }
        out
    }

    pub fn expand_prefix(&self, prefix: &str, cap: usize) -> Vec<SharedPostings> {
        let mut out = Vec::new();
        let mut iter = self.words.word_iter(prefix.as_bytes());
        while !iter.done() && out.len() < cap {
            out.push(iter.target().clone());
            iter.next();
        }
        out
    }

    pub fn expand_suffix(&self, suffix: &str, cap: usize) -> Vec<SharedPostings> {
        match &self.suffix_words {
            Some(suffix_words) => {
                let reversed: Vec<u8> = suffix.as_bytes().iter().rev().copied().collect();
                let mut out = Vec::new();
                let mut iter = suffix_words.word_iter(&reversed);
                while !iter.done() && out.len() < cap {
                    out.push(iter.target().clone());
                    iter.next();
                }
                out
            }
            // no suffix trie: a bounded scan over all words
            None => self.scan_words(|word| word.ends_with(suffix), cap),
        }
    }

    pub fn expand_infix(&self, infix: &str, cap: usize) -> Vec<SharedPostings> {
        self.scan_words(|word| word.contains(infix), cap)
    }

    fn scan_words(&self, matcher: impl Fn(&str) -> bool, cap: usize) -> Vec<SharedPostings> {
        let mut out = Vec::new();
        let mut iter = self.words.word_iter(b"");
        while !iter.done() && out.len() < cap {
            if let Ok(word) = std::str::from_utf8(iter.word()) {
                if matcher(word) {
                    out.push(iter.target().clone());
                }
            }
            iter.next();
        }
        out
    }

    /// Words within `distance` edits of `word`, found by walking the tree
    /// with a Levenshtein row per edge byte; subtrees whose row minimum
    /// exceeds the budget are pruned.
    pub fn expand_fuzzy(&self, word: &str, distance: u32, cap: usize) -> Vec<SharedPostings> {
        let Some(root) = self.words.path_iter(b"") else { return Vec::new() };
        let word = word.as_bytes();
        let row: Vec<u32> = (0..=word.len() as u32).collect();
        let mut out = Vec::new();
        fuzzy_walk(&root, word, &row, distance, cap, &mut out);
        out
    }
}

fn fuzzy_walk(
    it: &PathIterator<'_, SharedPostings>,
    word: &[u8],
    row: &[u32],
    max: u32,
    cap: usize,
    out: &mut Vec<SharedPostings>,
) {
    if out.len() >= cap {
        return;
    }
    if it.is_word() && row[word.len()] <= max {
        if let Some(target) = it.target() {
            out.push(target.clone());
        }
    }
    let mut walker = it.clone();
    while walker.can_descend() && out.len() < cap {
        let byte = walker.current_byte().expect("can_descend checked");
        let mut next_row = vec![0u32; word.len() + 1];
        next_row[0] = row[0] + 1;
        let mut row_min = next_row[0];
        for i in 1..=word.len() {
            let cost = u32::from(word[i - 1] != byte);
            next_row[i] = (row[i - 1] + cost).min(row[i] + 1).min(next_row[i - 1] + 1);
            row_min = row_min.min(next_row[i]);
        }
        if row_min <= max {
            fuzzy_walk(&walker.descend_new(), word, &next_row, max, cap, out);
        }
        walker.next_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;

    fn schema_with(docs: &[(&str, &str)]) -> (TextIndexSchema, TextAttribute) {
        let mut schema = TextIndexSchema::new(true);
        let field = schema.add_text_field();
        for (key, text) in docs {
            schema.index_field(&intern(key), field, text);
        }
        (schema, field)
    }

    fn keys_of(postings: &[SharedPostings]) -> Vec<String> {
        let mut keys: Vec<String> = postings
            .iter()
            .flat_map(|p| p.entries().iter().map(|e| e.key.as_str().to_string()))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    #[test]
    fn term_lookup() {
        let (schema, field) = schema_with(&[("d1", "hello world"), ("d2", "hello rust")]);
        let postings = schema.postings_for_term("hello");
        assert_eq!(keys_of(&postings), vec!["d1", "d2"]);
        assert_eq!(schema.postings_for_term("unknown").len(), 0);
        assert_eq!(schema.unique_word_count(), 3);

        let per_key = schema.per_key_index(&intern("d1")).unwrap();
        assert!(per_key.contains_term("world", field.field_bit()));
        assert!(!per_key.contains_term("rust", field.field_bit()));
    }

    #[test]
    fn prefix_suffix_infix_expansion() {
        let (schema, _) = schema_with(&[
            ("d1", "disagree"),
            ("d2", "disappear"),
            ("d3", "reappear"),
            ("d4", "agree"),
        ]);
        assert_eq!(keys_of(&schema.expand_prefix("dis", 100)), vec!["d1", "d2"]);
        assert_eq!(keys_of(&schema.expand_suffix("appear", 100)), vec!["d2", "d3"]);
        assert_eq!(keys_of(&schema.expand_infix("agre", 100)), vec!["d1", "d4"]);
        // the expansion cap bounds the word count, not the key count
        assert_eq!(schema.expand_prefix("dis", 1).len(), 1);
    }

    #[test]
    fn fuzzy_expansion() {
        let (schema, _) = schema_with(&[
            ("d1", "color"),
            ("d2", "colour"),
            ("d3", "colors"),
            ("d4", "cloud"),
        ]);
        assert_eq!(keys_of(&schema.expand_fuzzy("color", 1, 100)), vec!["d1", "d2", "d3"]);
        assert_eq!(keys_of(&schema.expand_fuzzy("color", 0, 100)), vec!["d1"]);
        assert_eq!(
            keys_of(&schema.expand_fuzzy("color", 3, 100)),
            vec!["d1", "d2", "d3", "d4"]
        );
    }

    #[test]
    fn stem_variants_fan_in() {
        let (mut schema, _) = schema_with(&[("d1", "running"), ("d2", "run")]);
        schema.add_stem_mapping("running", "run");
        let postings = schema.postings_for_term("running");
        assert_eq!(postings.len(), 2);
        assert_eq!(keys_of(&postings), vec!["d1", "d2"]);
    }

    #[test]
    fn remove_key_cleans_postings() {
        let (mut schema, _) = schema_with(&[("d1", "shared unique1"), ("d2", "shared unique2")]);
        assert!(schema.remove_key(&intern("d1")));
        assert_eq!(keys_of(&schema.postings_for_term("shared")), vec!["d2"]);
        assert!(schema.postings_for_term("unique1").is_empty());
        assert!(schema.untracked_keys().contains(&intern("d1")));
        assert_eq!(schema.tracked_key_count(), 1);
    }

    #[test]
    fn subtree_counts() {
        let (schema, _) = schema_with(&[("d1", "car cart"), ("d2", "car dog")]);
        assert_eq!(schema.subtree_key_count("car"), 3);
        assert_eq!(schema.subtree_key_count("dog"), 1);
    }

    #[test]
    fn positions_matching_merges() {
        let (schema, field) = schema_with(&[("d1", "a b a c")]);
        let per_key = schema.per_key_index(&intern("d1")).unwrap();
        let positions = per_key.positions_matching(|w| w == "a", field.field_bit());
        let starts: Vec<u32> = positions.iter().map(|(p, _)| *p).collect();
        assert_eq!(starts, vec![0, 2]);
    }

    #[test]
    fn edit_distance() {
        assert!(within_edit_distance("color", "colour", 1));
        assert!(!within_edit_distance("color", "colour", 0));
        assert!(within_edit_distance("abc", "abc", 0));
        assert!(within_edit_distance("abc", "axc", 1));
        assert!(!within_edit_distance("abc", "xyz", 2));
        assert!(within_edit_distance("abc", "xyz", 3));
    }
}
