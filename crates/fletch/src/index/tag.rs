use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use filter_parser::TagPattern;

use crate::index::{EntriesFetcher, VecFetcher};
use crate::interning::InternedString;

/// Tag attribute index. Record values split on the schema-defined separator;
/// query-side tag lists always split on `|` and arrive here already parsed
/// into [`TagPattern`]s.
pub struct TagIndex {
    separator: char,
    case_sensitive: bool,
    by_tag: BTreeMap<String, BTreeSet<InternedString>>,
    tracked: HashMap<InternedString, HashSet<String>>,
    raw: HashMap<InternedString, String>,
    untracked: HashSet<InternedString>,
}

impl TagIndex {
    pub fn new(separator: char, case_sensitive: bool) -> Self {
        TagIndex {
            separator,
            case_sensitive,
            by_tag: BTreeMap::new(),
            tracked: HashMap::new(),
            raw: HashMap::new(),
            untracked: HashSet::new(),
        }
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Splits a record value on the index separator, trimming whitespace and
    /// dropping empty pieces.
    pub fn split_record_tags(data: &str, separator: char) -> HashSet<String> {
        data.split(separator)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn fold_case(&self, tag: &str) -> String {
        if self.case_sensitive {
            tag.to_string()
        } else {
            tag.to_lowercase()
        }
    }

    pub fn add_record(&mut self, key: &InternedString, data: &str) -> bool {
        let tags = Self::split_record_tags(data, self.separator);
        if tags.is_empty() {
            if !self.tracked.contains_key(key) {
                self.untracked.insert(key.clone());
            }
            return false;
        }
        self.untracked.remove(key);
        if self.tracked.contains_key(key) {
            self.remove_record(key);
            self.untracked.remove(key);
        }
        let folded: HashSet<String> = tags.iter().map(|t| self.fold_case(t)).collect();
        for tag in &folded {
            self.by_tag.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.tracked.insert(key.clone(), folded);
        self.raw.insert(key.clone(), data.to_string());
        true
    }

    pub fn remove_record(&mut self, key: &InternedString) -> bool {
        match self.tracked.remove(key) {
            Some(tags) => {
                for tag in tags {
                    if let Some(keys) = self.by_tag.get_mut(&tag) {
                        keys.remove(key);
                        if keys.is_empty() {
                            self.by_tag.remove(&tag);
                        }
                    }
                }
                self.raw.remove(key);
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

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_tracked(&self, key: &InternedString) -> bool {
        self.tracked.contains_key(key)
    }

    /// The raw string the key was last indexed with.
    pub fn raw_value(&self, key: &InternedString) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    pub fn tags_of(&self, key: &InternedString) -> Option<&HashSet<String>> {
        self.tracked.get(key)
    }

    /// True when any of the query patterns matches any of `tags` (already
    /// case-folded record tags).
    pub fn matches(&self, tags: &HashSet<String>, patterns: &[TagPattern]) -> bool {
        patterns.iter().any(|pattern| {
            let value = self.fold_case(&pattern.value);
            if pattern.is_prefix {
                tags.iter().any(|tag| tag.starts_with(&value))
            } else {
                tags.contains(&value)
            }
        })
    }

    /// The emitted key stream may repeat a key that carries several matching
    /// tags; the caller deduplicates per the query policy.
    pub fn search(&self, patterns: &[TagPattern], negate: bool) -> Box<dyn EntriesFetcher> {
        if negate {
            let mut keys: Vec<InternedString> = self
                .tracked
                .iter()
                .filter(|(_, tags)| !self.matches(tags, patterns))
                .map(|(key, _)| key.clone())
                .collect();
            keys.extend(self.untracked.iter().cloned());
            return Box::new(VecFetcher::new(keys));
        }
        let mut keys = Vec::new();
        for pattern in patterns {
            let value = self.fold_case(&pattern.value);
            if pattern.is_prefix {
                for (_, tagged) in self
                    .by_tag
                    .range(value.clone()..)
                    .take_while(|(tag, _)| tag.starts_with(&value))
                {
                    keys.extend(tagged.iter().cloned());
                }
            } else if let Some(tagged) = self.by_tag.get(&value) {
                keys.extend(tagged.iter().cloned());
            }
        }
        Box::new(VecFetcher::new(keys))
    }
}
