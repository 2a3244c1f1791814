use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;

use filter_parser::NumericRange;
use ordered_float::OrderedFloat;

use crate::index::{EntriesFetcher, VecFetcher};
use crate::interning::InternedString;

/// Numeric attribute index: value-ordered keys plus the tracked/untracked
/// bookkeeping needed for negated searches.
#[derive(Default)]
pub struct NumericIndex {
    by_value: BTreeMap<OrderedFloat<f64>, BTreeSet<InternedString>>,
    tracked: HashMap<InternedString, f64>,
    /// Keys seen by ingestion whose value did not parse (or was removed).
    /// They fail every range predicate but match every negated one.
    untracked: HashSet<InternedString>,
}

impl NumericIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, key: &InternedString, data: &str) -> bool {
        match data.trim().parse::<f64>() {
            Ok(value) if !value.is_nan() => {
                self.untracked.remove(key);
                if let Some(previous) = self.tracked.insert(key.clone(), value) {
                    self.detach(key, previous);
                }
                self.by_value.entry(OrderedFloat(value)).or_default().insert(key.clone());
                true
            }
            _ => {
                if !self.tracked.contains_key(key) {
                    self.untracked.insert(key.clone());
                }
                false
            }
        }
    }

    pub fn remove_record(&mut self, key: &InternedString) -> bool {
        match self.tracked.remove(key) {
            Some(value) => {
                self.detach(key, value);
                self.untracked.insert(key.clone());
                true
            }
            None => false,
        }
    }

    pub fn modify_record(&mut self, key: &InternedString, data: &str) -> bool {
        self.remove_record(key);
        self.add_record(key, data)
    }

    fn detach(&mut self, key: &InternedString, value: f64) {
        if let Some(keys) = self.by_value.get_mut(&OrderedFloat(value)) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_value.remove(&OrderedFloat(value));
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn value(&self, key: &InternedString) -> Option<f64> {
        self.tracked.get(key).copied()
    }

    pub fn search(&self, range: &NumericRange, negate: bool) -> Box<dyn EntriesFetcher> {
        let keys = if negate {
            let mut keys: Vec<InternedString> = self
                .tracked
                .iter()
                .filter(|(_, &value)| !range.contains(value))
                .map(|(key, _)| key.clone())
                .collect();
            keys.extend(self.untracked.iter().cloned());
            keys
        } else {
            let start = if range.inclusive_start {
                Bound::Included(OrderedFloat(range.start))
            } else {
                Bound::Excluded(OrderedFloat(range.start))
            };
            let end = if range.inclusive_end {
                Bound::Included(OrderedFloat(range.end))
            } else {
                Bound::Excluded(OrderedFloat(range.end))
            };
            self.by_value
                .range((start, end))
                .flat_map(|(_, keys)| keys.iter().cloned())
                .collect()
        };
        Box::new(VecFetcher::new(keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;

    fn range(start: f64, end: f64, inclusive_start: bool, inclusive_end: bool) -> NumericRange {
        NumericRange { start, end, inclusive_start, inclusive_end }
    }

    fn fetch(fetcher: Box<dyn EntriesFetcher>) -> Vec<String> {
        let mut keys: Vec<String> =
            fetcher.into_keys().map(|k| k.as_str().to_string()).collect();
        keys.sort();
        keys
    }

    #[test]
    fn range_search() {
        let mut index = NumericIndex::new();
        index.add_record(&intern("a"), "5");
        index.add_record(&intern("b"), "10");
        index.add_record(&intern("c"), "15");

        let fetcher = index.search(&range(6.0, 12.0, true, true), false);
        assert_eq!(fetcher.size(), 1);
        assert_eq!(fetch(fetcher), vec!["b"]);

        let fetcher = index.search(&range(5.0, 15.0, false, false), false);
        assert_eq!(fetch(fetcher), vec!["b"]);

        let fetcher = index.search(&range(5.0, 15.0, true, true), false);
        assert_eq!(fetch(fetcher), vec!["a", "b", "c"]);

        let fetcher =
            index.search(&range(f64::NEG_INFINITY, f64::INFINITY, true, true), false);
        assert_eq!(fetch(fetcher), vec!["a", "b", "c"]);
    }

    #[test]
    fn negated_search_includes_untracked() {
        let mut index = NumericIndex::new();
        index.add_record(&intern("a"), "5");
        index.add_record(&intern("b"), "10");
        index.add_record(&intern("junk"), "not-a-number");
        index.add_record(&intern("gone"), "3");
        index.remove_record(&intern("gone"));

        let fetcher = index.search(&range(4.0, 6.0, true, true), true);
        assert_eq!(fetch(fetcher), vec!["b", "gone", "junk"]);
    }

    #[test]
    fn modify_moves_value() {
        let mut index = NumericIndex::new();
        index.add_record(&intern("a"), "5");
        index.modify_record(&intern("a"), "50");
        assert_eq!(index.value(&intern("a")), Some(50.0));
        let fetcher = index.search(&range(0.0, 10.0, true, true), false);
        assert_eq!(fetcher.size(), 0);
    }
}
