//! Types the schema-free AST against an index schema: validates every field
//! reference, resolves aliases to identifiers, assigns text field bits and
//! computes the query-operations bitmask.

use std::collections::HashSet;
use std::sync::Arc;

use filter_parser::{FilterAst, ParserLimits, TextAtom, TextToken};

use crate::config;
use crate::error::{Result, UserError};
use crate::filter::{
    FilterParseResults, NumericPredicate, Predicate, QueryOperations, TagPredicate, TextLeaf,
    TextPredicate,
};
use crate::index::{IndexKind, TypedIndex};
use crate::schema::IndexSchema;

/// Proximity parameters from the command line (`SLOP n`, `INORDER`). Quoted
/// phrases ignore them and always use slop 0 in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProximityOptions {
    pub slop: Option<u32>,
    pub inorder: bool,
}

/// Front end for the query string: parse then resolve.
pub fn parse_filter(
    schema: &IndexSchema,
    query: &str,
    options: ProximityOptions,
) -> Result<FilterParseResults> {
    let limits = ParserLimits {
        max_depth: config::QUERY_STRING_DEPTH.get() as u32,
        max_nodes: config::QUERY_STRING_TERMS_COUNT.get() as u32,
    };
    let ast = FilterAst::parse(query, limits)
        .map_err(|e| UserError::InvalidQuerySyntax(e.to_string()))?;
    match ast {
        None => Ok(FilterParseResults::default()),
        Some(ast) => resolve(schema, &ast, options),
    }
}

pub fn resolve(
    schema: &IndexSchema,
    ast: &FilterAst,
    options: ProximityOptions,
) -> Result<FilterParseResults> {
    let mut resolver = Resolver {
        schema,
        options,
        identifiers: HashSet::new(),
        operations: QueryOperations::default(),
    };
    let root = resolver.node(ast, false)?;
    Ok(FilterParseResults {
        root: Some(root),
        identifiers: resolver.identifiers,
        operations: resolver.operations,
    })
}

struct Resolver<'a> {
    schema: &'a IndexSchema,
    options: ProximityOptions,
    identifiers: HashSet<Arc<str>>,
    operations: QueryOperations,
}

impl<'a> Resolver<'a> {
    /// `negated` tracks the negation parity above this node: a composed
    /// node under an odd number of `-` evaluates as its dual, and the
    /// dedup / unsolved policies must see the effective operation.
    fn node(&mut self, ast: &FilterAst, negated: bool) -> Result<Predicate> {
        match ast {
            FilterAst::And(children) => {
                self.operations |=
                    if negated { QueryOperations::AND | QueryOperations::OR } else { QueryOperations::AND };
                let children =
                    children.iter().map(|c| self.node(c, negated)).collect::<Result<Vec<_>>>()?;
                Ok(Predicate::And(children))
            }
            FilterAst::Or(children) => {
                self.operations |=
                    if negated { QueryOperations::AND | QueryOperations::OR } else { QueryOperations::OR };
                let children =
                    children.iter().map(|c| self.node(c, negated)).collect::<Result<Vec<_>>>()?;
                Ok(Predicate::Or(children))
            }
            FilterAst::Not(inner) => {
                Ok(Predicate::Negate(Box::new(self.node(inner, !negated)?)))
            }
            FilterAst::Numeric { field, range } => {
                let alias = field.value();
                let identifier = self.expect_kind(alias, IndexKind::Numeric)?;
                self.operations |= QueryOperations::NUMERIC;
                Ok(Predicate::Numeric(NumericPredicate {
                    alias: alias.to_string(),
                    identifier,
                    range: *range,
                }))
            }
            FilterAst::Tag { field, raw, patterns } => {
                let alias = field.value();
                let identifier = self.expect_kind(alias, IndexKind::Tag)?;
                self.operations |= QueryOperations::TAG;
                Ok(Predicate::Tag(TagPredicate {
                    alias: alias.to_string(),
                    identifier,
                    raw: raw.value().to_string(),
                    patterns: patterns.clone(),
                }))
            }
            FilterAst::TextGroup { atoms } => self.text_group(atoms),
        }
    }

    fn expect_kind(&mut self, alias: &str, expected: IndexKind) -> Result<Arc<str>> {
        let attribute = self
            .schema
            .attribute(alias)
            .ok_or_else(|| UserError::UnknownAttribute(alias.to_string()))?;
        if attribute.kind != expected {
            return Err(match expected {
                IndexKind::Numeric => UserError::NotANumericField(alias.to_string()),
                IndexKind::Tag => UserError::NotATagField(alias.to_string()),
                IndexKind::Text => UserError::NotATextField(alias.to_string()),
                IndexKind::Vector => UserError::NotAVectorIndex(alias.to_string()),
            }
            .into());
        }
        let identifier = attribute.identifier.clone();
        self.identifiers.insert(identifier.clone());
        Ok(identifier)
    }

    fn text_field_bit(&mut self, alias: &str) -> Result<(Arc<str>, u64)> {
        let identifier = self.expect_kind(alias, IndexKind::Text)?;
        let inner = self.schema.read();
        let field_bit = match inner.index(alias) {
            Some(TypedIndex::Text(attribute)) => attribute.field_bit(),
            _ => return Err(UserError::NotATextField(alias.to_string()).into()),
        };
        Ok((identifier, field_bit))
    }

    fn text_leaf(&mut self, field: Option<&filter_parser::Token>, token: &TextToken) -> Result<TextPredicate> {
        let alias = field.ok_or(UserError::NoDefaultTextField)?.value();
        let (identifier, field_bit) = self.text_field_bit(alias)?;
        let leaf = |word: &filter_parser::Token| TextLeaf {
            alias: alias.to_string(),
            identifier: identifier.clone(),
            field_bit,
            word: word.value().to_lowercase(),
        };
        self.operations |= QueryOperations::TEXT;
        Ok(match token {
            TextToken::Term(t) => {
                self.operations |= QueryOperations::TEXT_TERM;
                TextPredicate::Term(leaf(t))
            }
            TextToken::Prefix(t) => {
                self.operations |= QueryOperations::TEXT_PREFIX;
                TextPredicate::Prefix(leaf(t))
            }
            TextToken::Suffix(t) => {
                self.operations |= QueryOperations::TEXT_SUFFIX;
                TextPredicate::Suffix(leaf(t))
            }
            TextToken::Infix(t) => {
                self.operations |= QueryOperations::TEXT_SUFFIX;
                TextPredicate::Infix(leaf(t))
            }
            TextToken::Fuzzy(t, distance) => {
                self.operations |= QueryOperations::TEXT_FUZZY;
                TextPredicate::Fuzzy(leaf(t), u32::from(*distance))
            }
        })
    }

    fn text_group(&mut self, atoms: &[TextAtom]) -> Result<Predicate> {
        let mut children: Vec<TextPredicate> = Vec::new();
        for atom in atoms {
            match atom {
                TextAtom::Token { field, token } => {
                    children.push(self.text_leaf(field.as_ref(), token)?);
                }
                TextAtom::Phrase { field, terms } => {
                    let mut phrase = Vec::with_capacity(terms.len());
                    for term in terms {
                        phrase.push(self.text_leaf(field.as_ref(), term)?);
                    }
                    if phrase.len() == 1 {
                        children.push(phrase.pop().expect("one term"));
                    } else {
                        self.operations |= QueryOperations::TEXT_PROXIMITY;
                        children.push(TextPredicate::Proximity {
                            children: phrase,
                            slop: Some(0),
                            inorder: true,
                        });
                    }
                }
            }
        }
        if children.len() == 1 {
            return Ok(Predicate::Text(children.pop().expect("one child")));
        }
        self.operations |= QueryOperations::TEXT_PROXIMITY;
        Ok(Predicate::Text(TextPredicate::Proximity {
            children,
            slop: self.options.slop,
            inorder: self.options.inorder,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{DistanceMetric, VectorKind};
    use crate::schema::IndexSchema;

    fn schema() -> IndexSchema {
        IndexSchema::builder("idx")
            .numeric("num", "num")
            .unwrap()
            .tag("tag", "tag", ',', false)
            .unwrap()
            .text("body", "body")
            .unwrap()
            .text("title", "title")
            .unwrap()
            .vector("vec", "vec", VectorKind::Flat, 2, DistanceMetric::L2)
            .unwrap()
            .build()
            .unwrap()
    }

    fn parse(query: &str) -> Result<FilterParseResults> {
        parse_filter(&schema(), query, ProximityOptions::default())
    }

    #[test]
    fn match_all_has_no_root() {
        let results = parse("*").unwrap();
        assert!(results.is_match_all());
        assert!(results.identifiers.is_empty());
        let results = parse("(*)").unwrap();
        assert!(results.is_match_all());
    }

    #[test]
    fn typed_tree_with_identifiers() {
        let results = parse("@num:[1 10] @tag:{a|b}").unwrap();
        let root = results.root.unwrap();
        match &root {
            Predicate::And(children) => assert_eq!(children.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
        assert!(results.operations.has_and());
        assert!(results.operations.has_numeric());
        assert!(results.operations.has_tag());
        assert_eq!(results.identifiers.len(), 2);
    }

    #[test]
    fn field_type_mismatches() {
        assert!(parse("@tag:[1 2]").is_err());
        assert!(parse("@num:{a}").is_err());
        assert!(parse("@num:hello").is_err());
        assert!(parse("@missing:[1 2]").is_err());
        assert!(parse("@vec:hello").is_err());
    }

    #[test]
    fn bare_text_without_field_errors() {
        assert!(parse("hello").is_err());
    }

    #[test]
    fn phrases_get_zero_slop_in_order() {
        let results = parse("@body:\"hello world\"").unwrap();
        match results.root.unwrap() {
            Predicate::Text(TextPredicate::Proximity { children, slop, inorder }) => {
                assert_eq!(children.len(), 2);
                assert_eq!(slop, Some(0));
                assert!(inorder);
            }
            other => panic!("expected phrase proximity, got {other:?}"),
        }
    }

    #[test]
    fn juxtaposed_group_uses_command_options() {
        let options = ProximityOptions { slop: Some(2), inorder: true };
        let results = parse_filter(&schema(), "@body:hello world", options).unwrap();
        match results.root.unwrap() {
            Predicate::Text(TextPredicate::Proximity { slop, inorder, .. }) => {
                assert_eq!(slop, Some(2));
                assert!(inorder);
            }
            other => panic!("expected proximity, got {other:?}"),
        }
        // without the options, juxtaposition is a plain intersection
        let results = parse("@body:hello world").unwrap();
        match results.root.unwrap() {
            Predicate::Text(TextPredicate::Proximity { slop, inorder, .. }) => {
                assert_eq!(slop, None);
                assert!(!inorder);
            }
            other => panic!("expected proximity, got {other:?}"),
        }
    }

    #[test]
    fn field_scoping_inside_group() {
        let results = parse("@body:hello @title:world").unwrap();
        match results.root.unwrap() {
            Predicate::Text(TextPredicate::Proximity { children, .. }) => {
                let masks: Vec<u64> =
                    children.iter().map(TextPredicate::field_mask).collect();
                assert_eq!(masks.len(), 2);
                assert_ne!(masks[0], masks[1]);
            }
            other => panic!("expected proximity, got {other:?}"),
        }
    }

    #[test]
    fn negation_resolves() {
        let results = parse("-@num:[1 2]").unwrap();
        assert!(matches!(results.root.unwrap(), Predicate::Negate(_)));
    }
}
