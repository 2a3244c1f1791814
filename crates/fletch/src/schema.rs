//! Read-only view of an index schema as the query path consumes it. The
//! schema is created by the schema manager and mutated only by ingestion;
//! queries hold the reader side of its lock for their whole execution.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use twox_hash::XxHash64;

use crate::config;
use crate::error::{Result, UserError};
use crate::index::{
    DistanceMetric, IndexKind, NumericIndex, TagIndex, TextIndexSchema, TypedIndex, VectorIndex,
    VectorKind,
};
use crate::index::vector::ExactScanKernel;
use crate::interning::InternedString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Hash,
    Json,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub alias: String,
    pub identifier: Arc<str>,
    pub kind: IndexKind,
}

/// The mutable half of a schema, guarded by the schema lock.
pub struct SchemaIndexes {
    indexes: HashMap<String, TypedIndex>,
    text: Option<TextIndexSchema>,
    sequence_numbers: HashMap<InternedString, u64>,
    keys: std::collections::HashSet<InternedString>,
}

impl SchemaIndexes {
    pub fn index(&self, alias: &str) -> Option<&TypedIndex> {
        self.indexes.get(alias)
    }

    pub fn index_mut(&mut self, alias: &str) -> Option<&mut TypedIndex> {
        self.indexes.get_mut(alias)
    }

    pub fn text(&self) -> Option<&TextIndexSchema> {
        self.text.as_ref()
    }

    pub fn text_mut(&mut self) -> Option<&mut TextIndexSchema> {
        self.text.as_mut()
    }

    /// The per-key mutation counter captured into neighbors as the
    /// re-validation token.
    pub fn sequence_number(&self, key: &InternedString) -> u64 {
        self.sequence_numbers.get(key).copied().unwrap_or(0)
    }

    pub fn bump_sequence(&mut self, key: &InternedString) {
        *self.sequence_numbers.entry(key.clone()).or_insert(0) += 1;
    }

    /// Every key the schema currently indexes; the match-all special form
    /// streams these.
    pub fn all_keys(&self) -> impl Iterator<Item = &InternedString> {
        self.keys.iter()
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }

    /// Upper bound on the number of keys the schema tracks, used by the
    /// planner and the fanout limit shaping.
    pub fn tracked_key_count(&self) -> usize {
        let mut max = self.text.as_ref().map_or(0, |t| t.tracked_key_count());
        for index in self.indexes.values() {
            let count = match index {
                TypedIndex::Numeric(n) => n.tracked_count(),
                TypedIndex::Tag(t) => t.tracked_count(),
                TypedIndex::Text(_) => 0,
                TypedIndex::Vector(v) => v.kernel().tracked_count(),
            };
            max = max.max(count);
        }
        max
    }
}

pub struct IndexSchema {
    name: String,
    db_index: u32,
    data_type: DataType,
    key_prefixes: Vec<String>,
    attributes: Vec<Attribute>,
    alias_by_identifier: HashMap<Arc<str>, String>,
    inner: RwLock<SchemaIndexes>,
    version: AtomicU32,
    fingerprint: u64,
}

impl IndexSchema {
    pub fn builder(name: &str) -> IndexSchemaBuilder {
        IndexSchemaBuilder {
            name: name.to_string(),
            db_index: 0,
            data_type: DataType::Hash,
            key_prefixes: Vec::new(),
            attributes: Vec::new(),
            indexes: HashMap::new(),
            text: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_index(&self) -> u32 {
        self.db_index
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn key_prefixes(&self) -> &[String] {
        &self.key_prefixes
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, alias: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.alias == alias)
    }

    pub fn identifier(&self, alias: &str) -> Option<Arc<str>> {
        self.attribute(alias).map(|a| a.identifier.clone())
    }

    pub fn alias_of(&self, identifier: &str) -> Option<&str> {
        self.alias_by_identifier.get(identifier).map(String::as_str)
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Hash of the schema definition, compared across shards by the
    /// consistency-check fanouts.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SchemaIndexes> {
        self.inner.read().expect("schema lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SchemaIndexes> {
        self.version.fetch_add(1, Ordering::Relaxed);
        self.inner.write().expect("schema lock poisoned")
    }

    /// Ingestion entry point for HASH-style records: routes each field value
    /// to the attribute indexing its identifier and bumps the key's mutation
    /// counter.
    pub fn upsert_record(&self, key: &InternedString, fields: &[(&str, &str)]) {
        let mut inner = self.write();
        let inner = &mut *inner;
        for attribute in &self.attributes {
            let Some((_, value)) =
                fields.iter().find(|(identifier, _)| *identifier == &*attribute.identifier)
            else {
                continue;
            };
            match inner.indexes.get_mut(&attribute.alias) {
                Some(TypedIndex::Numeric(index)) => {
                    index.modify_record(key, value);
                }
                Some(TypedIndex::Tag(index)) => {
                    index.modify_record(key, value);
                }
                Some(TypedIndex::Text(field)) => {
                    let field = *field;
                    if let Some(text) = inner.text.as_mut() {
                        text.index_field(key, field, value);
                    }
                }
                Some(TypedIndex::Vector(_)) | None => (),
            }
        }
        inner.keys.insert(key.clone());
        inner.bump_sequence(key);
    }

    pub fn upsert_vector(&self, key: &InternedString, alias: &str, vector: Vec<f32>) -> bool {
        let mut inner = self.write();
        let added = match inner.indexes.get_mut(alias) {
            Some(TypedIndex::Vector(index)) => index.kernel_mut().add_record(key, vector),
            _ => false,
        };
        if added {
            inner.keys.insert(key.clone());
            inner.bump_sequence(key);
        }
        added
    }

    pub fn remove_record(&self, key: &InternedString) {
        let mut inner = self.write();
        for index in inner.indexes.values_mut() {
            match index {
                TypedIndex::Numeric(index) => {
                    index.remove_record(key);
                }
                TypedIndex::Tag(index) => {
                    index.remove_record(key);
                }
                TypedIndex::Vector(index) => {
                    index.kernel_mut().remove_record(key);
                }
                TypedIndex::Text(_) => (),
            }
        }
        if let Some(text) = inner.text.as_mut() {
            text.remove_key(key);
        }
        inner.keys.remove(key);
        inner.bump_sequence(key);
    }
}

pub struct IndexSchemaBuilder {
    name: String,
    db_index: u32,
    data_type: DataType,
    key_prefixes: Vec<String>,
    attributes: Vec<Attribute>,
    indexes: HashMap<String, TypedIndex>,
    text: Option<TextIndexSchema>,
}

impl IndexSchemaBuilder {
    pub fn db_index(mut self, db_index: u32) -> Self {
        self.db_index = db_index;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn key_prefix(mut self, prefix: &str) -> Self {
        self.key_prefixes.push(prefix.to_string());
        self
    }

    fn push_attribute(
        &mut self,
        alias: &str,
        identifier: &str,
        kind: IndexKind,
        index: TypedIndex,
    ) -> Result<()> {
        if self.attributes.iter().any(|a| a.alias == alias) {
            return Err(UserError::InvalidQuerySyntax(format!(
                "Duplicate attribute alias `{alias}`"
            ))
            .into());
        }
        if self.attributes.iter().any(|a| &*a.identifier == identifier) {
            return Err(UserError::InvalidQuerySyntax(format!(
                "Duplicate attribute identifier `{identifier}`"
            ))
            .into());
        }
        self.attributes.push(Attribute {
            alias: alias.to_string(),
            identifier: Arc::from(identifier),
            kind,
        });
        self.indexes.insert(alias.to_string(), index);
        Ok(())
    }

    pub fn numeric(mut self, alias: &str, identifier: &str) -> Result<Self> {
        self.push_attribute(
            alias,
            identifier,
            IndexKind::Numeric,
            TypedIndex::Numeric(NumericIndex::new()),
        )?;
        Ok(self)
    }

    pub fn tag(
        mut self,
        alias: &str,
        identifier: &str,
        separator: char,
        case_sensitive: bool,
    ) -> Result<Self> {
        self.push_attribute(
            alias,
            identifier,
            IndexKind::Tag,
            TypedIndex::Tag(TagIndex::new(separator, case_sensitive)),
        )?;
        Ok(self)
    }

    pub fn text(mut self, alias: &str, identifier: &str) -> Result<Self> {
        let field = self.text.get_or_insert_with(|| TextIndexSchema::new(true)).add_text_field();
        self.push_attribute(alias, identifier, IndexKind::Text, TypedIndex::Text(field))?;
        Ok(self)
    }

    pub fn vector(
        mut self,
        alias: &str,
        identifier: &str,
        kind: VectorKind,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> Result<Self> {
        if dimensions as u64 > config::MAX_VECTOR_DIMENSIONS.get() {
            return Err(UserError::InvalidQuerySyntax(format!(
                "Vector dimensions {dimensions} exceed the configured maximum"
            ))
            .into());
        }
        let kernel = match kind {
            VectorKind::Flat => ExactScanKernel::flat(dimensions, metric),
            VectorKind::Hnsw => ExactScanKernel::hnsw(dimensions, metric),
        };
        self.push_attribute(
            alias,
            identifier,
            IndexKind::Vector,
            TypedIndex::Vector(VectorIndex::new(Box::new(kernel))),
        )?;
        Ok(self)
    }

    pub fn build(self) -> Result<IndexSchema> {
        if self.key_prefixes.len() as u64 > config::MAX_PREFIXES.get() {
            return Err(UserError::InvalidQuerySyntax(
                "Too many key prefixes for this schema".to_string(),
            )
            .into());
        }
        let vector_count =
            self.attributes.iter().filter(|a| a.kind == IndexKind::Vector).count();
        if vector_count as u64 > config::MAX_VECTOR_ATTRIBUTES.get() {
            return Err(UserError::InvalidQuerySyntax(
                "Too many vector attributes for this schema".to_string(),
            )
            .into());
        }
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(self.name.as_bytes());
        for attribute in &self.attributes {
            hasher.write(attribute.alias.as_bytes());
            hasher.write(attribute.identifier.as_bytes());
            hasher.write_u8(attribute.kind as u8);
        }
        let alias_by_identifier = self
            .attributes
            .iter()
            .map(|a| (a.identifier.clone(), a.alias.clone()))
            .collect();
        Ok(IndexSchema {
            name: self.name,
            db_index: self.db_index,
            data_type: self.data_type,
            key_prefixes: self.key_prefixes,
            attributes: self.attributes,
            alias_by_identifier,
            inner: RwLock::new(SchemaIndexes {
                indexes: self.indexes,
                text: self.text,
                sequence_numbers: HashMap::new(),
                keys: std::collections::HashSet::new(),
            }),
            version: AtomicU32::new(0),
            fingerprint: hasher.finish(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;

    #[test]
    fn builder_validates_uniqueness() {
        let result = IndexSchema::builder("idx")
            .numeric("price", "$.price")
            .and_then(|b| b.numeric("price", "$.other"));
        assert!(result.is_err());

        let result = IndexSchema::builder("idx")
            .numeric("a", "$.same")
            .and_then(|b| b.numeric("b", "$.same"));
        assert!(result.is_err());
    }

    #[test]
    fn identifier_round_trip() {
        let schema = IndexSchema::builder("idx")
            .numeric("price", "$.price")
            .unwrap()
            .tag("color", "$.color", ',', false)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(&*schema.identifier("price").unwrap(), "$.price");
        assert_eq!(schema.alias_of("$.color"), Some("color"));
        assert!(schema.identifier("missing").is_none());
        assert_eq!(schema.attribute("color").unwrap().kind, IndexKind::Tag);
    }

    #[test]
    fn ingest_and_sequence_numbers() {
        let schema = IndexSchema::builder("idx")
            .numeric("num", "num")
            .unwrap()
            .text("body", "body")
            .unwrap()
            .build()
            .unwrap();
        let key = intern("doc1");
        schema.upsert_record(&key, &[("num", "42"), ("body", "hello world")]);
        {
            let inner = schema.read();
            assert_eq!(inner.sequence_number(&key), 1);
            match inner.index("num") {
                Some(TypedIndex::Numeric(n)) => assert_eq!(n.value(&key), Some(42.0)),
                _ => panic!("missing numeric index"),
            }
            assert!(inner.text().unwrap().per_key_index(&key).is_some());
        }
        schema.upsert_record(&key, &[("num", "43")]);
        assert_eq!(schema.read().sequence_number(&key), 2);
        schema.remove_record(&key);
        assert_eq!(schema.read().sequence_number(&key), 3);
    }
}
