//! Two-mode predicate evaluation.
//!
//! Prefilter mode consults the typed indexes' per-key structures, so a
//! candidate can be verified without fetching the record. Record mode runs
//! against a fetched attribute map, used to re-validate a neighbor whose
//! key mutated after the index snapshot produced it. Text predicates always
//! evaluate through the per-key text index, which is the only place phrase
//! positions live.

use crate::filter::{Predicate, TagPredicate, TextPredicate};
use crate::index::text::KeyTextIndex;
use crate::index::{TextIndexSchema, TypedIndex};
use crate::interning::InternedString;
use crate::schema::SchemaIndexes;

/// identifier -> fetched value, as produced by the host record fetch.
pub type RecordsMap = std::collections::BTreeMap<std::sync::Arc<str>, String>;

/// Evaluates predicates on the index side, per candidate key.
pub struct PrefilterEvaluator<'a> {
    inner: &'a SchemaIndexes,
}

impl<'a> PrefilterEvaluator<'a> {
    pub fn new(inner: &'a SchemaIndexes) -> Self {
        PrefilterEvaluator { inner }
    }

    pub fn evaluate(&self, predicate: &Predicate, key: &InternedString) -> bool {
        match predicate {
            Predicate::And(children) => children.iter().all(|c| self.evaluate(c, key)),
            Predicate::Or(children) => children.iter().any(|c| self.evaluate(c, key)),
            Predicate::Negate(inner) => !self.evaluate(inner, key),
            Predicate::Numeric(numeric) => match self.inner.index(&numeric.alias) {
                Some(TypedIndex::Numeric(index)) => {
                    index.value(key).is_some_and(|v| numeric.range.contains(v))
                }
                _ => false,
            },
            Predicate::Tag(tag) => match self.inner.index(&tag.alias) {
                Some(TypedIndex::Tag(index)) => {
                    index.tags_of(key).is_some_and(|tags| index.matches(tags, &tag.patterns))
                }
                _ => false,
            },
            Predicate::Text(text) => {
                let Some(text_schema) = self.inner.text() else { return false };
                text_matches(text, text_schema.per_key_index(key), text_schema)
            }
        }
    }
}

/// Evaluates predicates against a fetched record map. Text still needs the
/// per-key index for positional proof, so the evaluator carries the key.
pub struct RecordEvaluator<'a> {
    inner: &'a SchemaIndexes,
    records: &'a RecordsMap,
    key: &'a InternedString,
}

impl<'a> RecordEvaluator<'a> {
    pub fn new(inner: &'a SchemaIndexes, records: &'a RecordsMap, key: &'a InternedString) -> Self {
        RecordEvaluator { inner, records, key }
    }

    pub fn evaluate(&self, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::And(children) => children.iter().all(|c| self.evaluate(c)),
            Predicate::Or(children) => children.iter().any(|c| self.evaluate(c)),
            Predicate::Negate(inner) => !self.evaluate(inner),
            Predicate::Numeric(numeric) => {
                let Some(value) = self.records.get(&numeric.identifier) else { return false };
                match value.trim().parse::<f64>() {
                    Ok(v) if !v.is_nan() => numeric.range.contains(v),
                    _ => false,
                }
            }
            Predicate::Tag(tag) => self.evaluate_tag(tag),
            Predicate::Text(text) => {
                let Some(text_schema) = self.inner.text() else { return false };
                text_matches(text, text_schema.per_key_index(self.key), text_schema)
            }
        }
    }

    fn evaluate_tag(&self, tag: &TagPredicate) -> bool {
        let Some(TypedIndex::Tag(index)) = self.inner.index(&tag.alias) else { return false };
        let Some(value) = self.records.get(&tag.identifier) else { return false };
        // record data splits on the schema separator, never the query `|`
        let record_tags = crate::index::TagIndex::split_record_tags(value, index.separator());
        let folded: std::collections::HashSet<String> = if index.is_case_sensitive() {
            record_tags
        } else {
            record_tags.into_iter().map(|t| t.to_lowercase()).collect()
        };
        index.matches(&folded, &tag.patterns)
    }
}

/// Positional windows of a text predicate within one key, ascending by
/// window start. Leaves yield single-position windows; proximity nodes run
/// the same sliding-window validation the iterators use.
fn text_windows(
    predicate: &TextPredicate,
    key_index: &KeyTextIndex,
    text_schema: &TextIndexSchema,
) -> Vec<(u32, u32)> {
    match predicate {
        TextPredicate::Term(leaf) => {
            let stems = text_schema.stem_variants(&leaf.word);
            key_index
                .positions_matching(
                    |w| w == leaf.word || stems.iter().any(|s| s == w),
                    leaf.field_bit,
                )
                .into_iter()
                .map(|(p, _)| (p, p))
                .collect()
        }
        TextPredicate::Prefix(leaf) => single_positions(key_index, leaf, |w, p| w.starts_with(p)),
        TextPredicate::Suffix(leaf) => single_positions(key_index, leaf, |w, p| w.ends_with(p)),
        TextPredicate::Infix(leaf) => single_positions(key_index, leaf, |w, p| w.contains(p)),
        TextPredicate::Fuzzy(leaf, distance) => {
            let distance = *distance;
            key_index
                .positions_matching(
                    |w| crate::index::text::within_edit_distance(&leaf.word, w, distance),
                    leaf.field_bit,
                )
                .into_iter()
                .map(|(p, _)| (p, p))
                .collect()
        }
        TextPredicate::Proximity { children, slop, inorder } => {
            let child_windows: Vec<Vec<(u32, u32)>> =
                children.iter().map(|c| text_windows(c, key_index, text_schema)).collect();
            proximity_windows(&child_windows, *slop, *inorder)
        }
    }
}

fn single_positions(
    key_index: &KeyTextIndex,
    leaf: &crate::filter::TextLeaf,
    matcher: impl Fn(&str, &str) -> bool,
) -> Vec<(u32, u32)> {
    key_index
        .positions_matching(|w| matcher(w, &leaf.word), leaf.field_bit)
        .into_iter()
        .map(|(p, _)| (p, p))
        .collect()
}

/// Sliding-window combination of per-child windows under the proximity
/// constraints. Mirrors the streaming iterator's validation.
fn proximity_windows(children: &[Vec<(u32, u32)>], slop: Option<u32>, inorder: bool) -> Vec<(u32, u32)> {
    if children.iter().any(Vec::is_empty) {
        return Vec::new();
    }
    let n = children.len() as u32;
    let mut cursors = vec![0usize; children.len()];
    let mut out = Vec::new();
    loop {
        let mut min = u32::MAX;
        let mut min_idx = 0;
        let mut max = 0;
        for (idx, (windows, &cursor)) in children.iter().zip(cursors.iter()).enumerate() {
            let (start, end) = windows[cursor];
            if start < min {
                min = start;
                min_idx = idx;
            }
            max = max.max(end);
        }
        let within = match slop {
            Some(slop) => max.saturating_sub(min) <= slop + (n - 1),
            None => true,
        };
        let ordered = !inorder
            || cursors
                .iter()
                .zip(children)
                .map(|(&c, w)| w[c].0)
                .collect::<Vec<_>>()
                .windows(2)
                .all(|pair| pair[0] < pair[1]);
        if within && ordered {
            out.push((min, max));
        }
        cursors[min_idx] += 1;
        if cursors[min_idx] >= children[min_idx].len() {
            return out;
        }
    }
}

/// Full text-predicate check against a key's positional view. When the
/// predicate carries no positional constraints, word presence suffices.
pub fn text_matches(
    predicate: &TextPredicate,
    key_index: Option<&KeyTextIndex>,
    text_schema: &TextIndexSchema,
) -> bool {
    let Some(key_index) = key_index else { return false };
    match predicate {
        TextPredicate::Proximity { children, slop, inorder } => {
            if slop.is_none() && !inorder {
                return children.iter().all(|c| text_matches(c, Some(key_index), text_schema));
            }
            !text_windows(predicate, key_index, text_schema).is_empty()
        }
        _ => !text_windows(predicate, key_index, text_schema).is_empty(),
    }
}

/// Re-validation after a record fetch: a neighbor whose key mutated since
/// the index snapshot is re-checked against the fetched record.
pub fn verify_filter(
    inner: &SchemaIndexes,
    root: Option<&Predicate>,
    records: &RecordsMap,
    key: &InternedString,
    captured_sequence: u64,
) -> bool {
    let Some(predicate) = root else { return true };
    if inner.sequence_number(key) == captured_sequence {
        return true;
    }
    crate::metrics::stats().predicate_revalidations.incr();
    RecordEvaluator::new(inner, records, key).evaluate(predicate)
}

/// Keys whose text view does NOT match the predicate, plus the keys text
/// ingestion saw but could not index. Shared by the negated-text fetcher
/// and the complement iterator inside proximity trees.
pub fn complement_text_keys(
    predicate: &TextPredicate,
    text_schema: &TextIndexSchema,
) -> Vec<InternedString> {
    let mut keys: Vec<InternedString> = text_schema
        .tracked_keys()
        .filter(|key| !text_matches(predicate, text_schema.per_key_index(key), text_schema))
        .cloned()
        .collect();
    keys.extend(text_schema.untracked_keys().iter().cloned());
    keys.sort();
    keys
}

/// Convenience for callers juggling identifier-keyed maps.
pub fn records_from_pairs(pairs: &[(&std::sync::Arc<str>, &str)]) -> RecordsMap {
    pairs.iter().map(|(id, value)| ((*id).clone(), value.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::resolve::{parse_filter, ProximityOptions};
    use crate::index::{DistanceMetric, VectorKind};
    use crate::interning::intern;
    use crate::schema::IndexSchema;

    fn schema() -> IndexSchema {
        let schema = IndexSchema::builder("idx")
            .numeric("num", "num")
            .unwrap()
            .tag("tag", "tag", ',', false)
            .unwrap()
            .text("body", "body")
            .unwrap()
            .vector("vec", "vec", VectorKind::Flat, 2, DistanceMetric::L2)
            .unwrap()
            .build()
            .unwrap();
        schema.upsert_record(&intern("a"), &[("num", "5"), ("tag", "red"), ("body", "hello world")]);
        schema.upsert_record(&intern("b"), &[("num", "10"), ("tag", "blue,red"), ("body", "world hello")]);
        schema.upsert_record(&intern("c"), &[("num", "15"), ("tag", "green"), ("body", "goodbye world")]);
        schema
    }

    fn prefilter_matches(schema: &IndexSchema, query: &str, key: &str) -> bool {
        let results = parse_filter(schema, query, ProximityOptions::default()).unwrap();
        let inner = schema.read();
        PrefilterEvaluator::new(&inner).evaluate(results.root.as_ref().unwrap(), &intern(key))
    }

    #[test]
    fn numeric_prefilter() {
        let schema = schema();
        assert!(prefilter_matches(&schema, "@num:[1 7]", "a"));
        assert!(!prefilter_matches(&schema, "@num:[1 7]", "b"));
        assert!(prefilter_matches(&schema, "@num:[(5 15]", "b"));
        assert!(!prefilter_matches(&schema, "@num:[(5 15]", "a"));
    }

    #[test]
    fn tag_prefilter() {
        let schema = schema();
        assert!(prefilter_matches(&schema, "@tag:{red}", "a"));
        assert!(prefilter_matches(&schema, "@tag:{red|green}", "c"));
        assert!(!prefilter_matches(&schema, "@tag:{yellow}", "a"));
        assert!(prefilter_matches(&schema, "@tag:{gr*}", "c"));
    }

    #[test]
    fn boolean_composition() {
        let schema = schema();
        assert!(prefilter_matches(&schema, "@num:[1 7] @tag:{red}", "a"));
        assert!(!prefilter_matches(&schema, "@num:[1 7] @tag:{blue}", "a"));
        assert!(prefilter_matches(&schema, "@num:[1 7] | @tag:{green}", "c"));
        assert!(prefilter_matches(&schema, "-@tag:{red}", "c"));
        assert!(!prefilter_matches(&schema, "-@tag:{red}", "a"));
        // double negation is the identity
        assert!(prefilter_matches(&schema, "--@tag:{red}", "a"));
    }

    #[test]
    fn text_phrase_prefilter() {
        let schema = schema();
        // "hello world" phrase: adjacent in order
        assert!(prefilter_matches(&schema, "@body:\"hello world\"", "a"));
        assert!(!prefilter_matches(&schema, "@body:\"hello world\"", "b"));
        // plain intersection ignores order
        assert!(prefilter_matches(&schema, "@body:hello world", "b"));
        assert!(!prefilter_matches(&schema, "@body:hello world", "c"));
        assert!(prefilter_matches(&schema, "@body:hello*", "a"));
        assert!(prefilter_matches(&schema, "@body:%helo%", "a"));
    }

    #[test]
    fn record_revalidation() {
        let schema = schema();
        let results =
            parse_filter(&schema, "@num:[1 7]", ProximityOptions::default()).unwrap();
        let key = intern("a");
        let captured = schema.read().sequence_number(&key);

        let identifier = schema.identifier("num").unwrap();
        let inner = schema.read();
        // same sequence number: trusted without re-evaluation
        let stale = records_from_pairs(&[(&identifier, "999")]);
        assert!(verify_filter(&inner, results.root.as_ref(), &stale, &key, captured));
        drop(inner);

        // bump the sequence: the fetched value now decides
        schema.upsert_record(&key, &[("num", "999")]);
        let inner = schema.read();
        let fresh = records_from_pairs(&[(&identifier, "999")]);
        assert!(!verify_filter(&inner, results.root.as_ref(), &fresh, &key, captured));
        let fresh = records_from_pairs(&[(&identifier, "5")]);
        assert!(verify_filter(&inner, results.root.as_ref(), &fresh, &key, captured));
    }

    #[test]
    fn complement_keys() {
        let schema = schema();
        let results =
            parse_filter(&schema, "@body:hello", ProximityOptions::default()).unwrap();
        let Some(Predicate::Text(text)) = &results.root else { panic!("expected text") };
        let inner = schema.read();
        let keys = complement_text_keys(text, inner.text().unwrap());
        let names: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["c"]);
    }
}
