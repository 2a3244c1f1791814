//! FT.SEARCH argument parsing: keyword arguments into the engine's
//! parameter block, then the query-string front end (filter plus the
//! optional `=>[KNN ...]` vector clause).

use std::collections::HashMap;
use std::sync::Arc;

use fletch::index::vector::decode_vector;
use fletch::index::IndexKind;
use fletch::{
    config, IndexSchema, LimitParameter, ProximityOptions, Result, ReturnAttribute,
    SearchParameters, SortByParameter, SortOrder, UserError,
};

use crate::commands::args::ArgsIterator;

pub const MAX_TIMEOUT_MS: u64 = 60_000;

/// Scope requested for the fanout (`LOCALONLY` pins the query to this
/// node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    #[default]
    AllShards,
    LocalOnly,
}

#[derive(Debug)]
pub struct SearchCommand {
    pub parameters: SearchParameters,
    pub with_sort_keys: bool,
    pub scope: SearchScope,
    /// SORTBY alias resolved to its schema identifier.
    pub sortby_identifier: Option<String>,
    /// PARAMS name -> (value, use count); every parameter must be consumed
    /// by the query string.
    params: HashMap<String, (Vec<u8>, u32)>,
    pub query_string: String,
}

impl SearchCommand {
    pub fn from_parameters(parameters: SearchParameters) -> Self {
        SearchCommand {
            parameters,
            with_sort_keys: false,
            scope: SearchScope::default(),
            sortby_identifier: None,
            params: HashMap::new(),
            query_string: String::new(),
        }
    }

    fn param(&mut self, name: &str) -> Result<&[u8]> {
        match self.params.get_mut(name) {
            Some((value, uses)) => {
                *uses += 1;
                Ok(value)
            }
            None => Err(UserError::ParameterNotFound(name.to_string()).into()),
        }
    }

    fn param_str(&mut self, name: &str) -> Result<String> {
        let bytes = self.param(name)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| UserError::InvalidQuerySyntax(format!("Parameter `{name}` is binary")).into())
    }

    /// A literal value, or `$name` substituted from PARAMS.
    fn resolve_value(&mut self, raw: &str) -> Result<String> {
        match raw.strip_prefix('$') {
            Some(name) => self.param_str(name),
            None => Ok(raw.to_string()),
        }
    }

    /// Parses everything after the index name.
    pub fn parse(schema: &IndexSchema, args: &[Vec<u8>]) -> Result<SearchCommand> {
        let mut itr = ArgsIterator::new(args);
        let query_bytes = itr.next_bytes().map_err(|_| {
            fletch::Error::from(UserError::InvalidQuerySyntax(
                "Missing query string".to_string(),
            ))
        })?;
        let query_string = String::from_utf8_lossy(query_bytes).into_owned();

        let mut command = SearchCommand::from_parameters(SearchParameters::new(
            schema.name(),
            fletch::cancel::ManualToken::token(),
        ));
        command.query_string = query_string;

        while !itr.done() {
            if itr.match_keyword("LIMIT") {
                command.parameters.limit = LimitParameter {
                    first_index: itr.next_u64("LIMIT offset")?,
                    number: itr.next_u64("LIMIT count")?,
                };
            } else if itr.match_keyword("NOCONTENT") {
                command.parameters.no_content = true;
            } else if itr.match_keyword("RETURN") {
                parse_return(schema, &mut command, &mut itr)?;
            } else if itr.match_keyword("SORTBY") {
                parse_sortby(&mut command, &mut itr)?;
            } else if itr.match_keyword("WITHSORTKEYS") {
                command.with_sort_keys = true;
            } else if itr.match_keyword("PARAMS") {
                parse_params(&mut command, &mut itr)?;
            } else if itr.match_keyword("DIALECT") {
                command.parameters.dialect = itr.next_u64("DIALECT")? as u32;
            } else if itr.match_keyword("TIMEOUT") {
                command.parameters.timeout_ms = itr.next_u64("TIMEOUT")?;
            } else if itr.match_keyword("LOCALONLY") {
                command.parameters.local_only = true;
                command.scope = SearchScope::LocalOnly;
            } else if itr.match_keyword("ALLSHARDS") {
                command.parameters.enable_partial_results = false;
            } else if itr.match_keyword("SOMESHARDS") {
                command.parameters.enable_partial_results = true;
            } else if itr.match_keyword("CONSISTENT") {
                command.parameters.enable_consistency = true;
            } else if itr.match_keyword("INCONSISTENT") {
                command.parameters.enable_consistency = false;
            } else if itr.match_keyword("INORDER") {
                command.parameters.inorder = true;
            } else if itr.match_keyword("VERBATIM") {
                command.parameters.verbatim = true;
            } else if itr.match_keyword("SLOP") {
                command.parameters.slop = Some(itr.next_u64("SLOP")? as u32);
            } else {
                return Err(UserError::InvalidQuerySyntax(format!(
                    "Unexpected parameter at position {}: {}",
                    itr.position() + 1,
                    itr.peek_str().unwrap_or("<binary>")
                ))
                .into());
            }
        }

        command.parse_query_string(schema)?;
        command.verify(schema)?;
        Ok(command)
    }

    /// Splits off the `=>[KNN ...]` clause and runs the filter front end.
    fn parse_query_string(&mut self, schema: &IndexSchema) -> Result<()> {
        let query = self.query_string.clone();
        let (filter_part, vector_part) = match query.split_once("=>") {
            Some((filter, vector)) => (filter.trim(), Some(vector.trim())),
            None => (query.trim(), None),
        };
        let options = ProximityOptions {
            slop: self.parameters.slop,
            inorder: self.parameters.inorder,
        };
        self.parameters.filter = fletch::parse_filter(schema, filter_part, options)?;
        if let Some(vector_part) = vector_part {
            self.parse_knn_clause(schema, vector_part)?;
        }
        Ok(())
    }

    /// `[KNN <k> @<attr> $<param> [EF_RUNTIME n] [AS name]]`
    fn parse_knn_clause(&mut self, schema: &IndexSchema, clause: &str) -> Result<()> {
        let inner = clause
            .strip_prefix('[')
            .and_then(|c| c.strip_suffix(']'))
            .ok_or_else(|| {
                UserError::InvalidQuerySyntax("Expected `[KNN ...]` after `=>`".to_string())
            })?;
        let tokens: Vec<&str> = inner.split_whitespace().collect();
        let mut cursor = tokens.iter();
        match cursor.next() {
            Some(token) if token.eq_ignore_ascii_case("KNN") => (),
            _ => {
                return Err(
                    UserError::InvalidQuerySyntax("Expected `KNN` keyword".to_string()).into()
                )
            }
        }
        let k_raw = cursor
            .next()
            .ok_or_else(|| UserError::InvalidQuerySyntax("Missing KNN count".to_string()))?;
        let k_value = self.resolve_value(k_raw)?;
        self.parameters.k = k_value.parse().map_err(|_| {
            fletch::Error::from(UserError::InvalidQuerySyntax(
                "KNN count must be an integer".to_string(),
            ))
        })?;

        let attr = cursor
            .next()
            .and_then(|t| t.strip_prefix('@'))
            .ok_or_else(|| {
                UserError::InvalidQuerySyntax("Expected `@attribute` in KNN clause".to_string())
            })?;
        match schema.attribute(attr) {
            Some(attribute) if attribute.kind == IndexKind::Vector => (),
            Some(_) | None => return Err(UserError::NotAVectorIndex(attr.to_string()).into()),
        }
        self.parameters.attribute_alias = Some(attr.to_string());

        let query_param = cursor
            .next()
            .and_then(|t| t.strip_prefix('$'))
            .ok_or_else(|| {
                UserError::InvalidQuerySyntax("Expected `$param` in KNN clause".to_string())
            })?;
        let blob = self.param(query_param)?.to_vec();
        self.parameters.query_vector = decode_vector(&blob).ok_or_else(|| {
            fletch::Error::from(UserError::InvalidQuerySyntax(format!(
                "Parameter `{query_param}` is not a FLOAT32 vector"
            )))
        })?;

        while let Some(token) = cursor.next() {
            if token.eq_ignore_ascii_case("EF_RUNTIME") {
                let raw = cursor.next().ok_or_else(|| {
                    UserError::InvalidQuerySyntax("Missing EF_RUNTIME value".to_string())
                })?;
                let value = self.resolve_value(raw)?;
                self.parameters.ef = Some(value.parse().map_err(|_| {
                    fletch::Error::from(UserError::InvalidQuerySyntax(
                        "EF_RUNTIME must be an integer".to_string(),
                    ))
                })?);
            } else if token.eq_ignore_ascii_case("AS") {
                let name = cursor.next().ok_or_else(|| {
                    UserError::InvalidQuerySyntax("Missing name after `AS`".to_string())
                })?;
                self.parameters.score_as = Some(name.to_string());
            } else {
                return Err(UserError::InvalidQuerySyntax(format!(
                    "Unexpected token `{token}` in KNN clause"
                ))
                .into());
            }
        }
        Ok(())
    }

    fn verify(&mut self, schema: &IndexSchema) -> Result<()> {
        if self.parameters.is_vector_query() {
            let max_knn = config::MAX_KNN.get();
            if self.parameters.k == 0 || self.parameters.k as u64 > max_knn {
                return Err(UserError::InvalidQuerySyntax(format!(
                    "KNN parameter must be a positive integer greater than 0 and cannot exceed {max_knn}"
                ))
                .into());
            }
            if let Some(ef) = self.parameters.ef {
                let max_ef = config::MAX_VECTOR_EF_RUNTIME.get();
                if ef == 0 || ef as u64 > max_ef {
                    return Err(UserError::InvalidQuerySyntax(format!(
                        "`EF_RUNTIME` must be a positive integer greater than 0 and cannot exceed {max_ef}"
                    ))
                    .into());
                }
            }
        }
        if self.parameters.timeout_ms > MAX_TIMEOUT_MS {
            return Err(UserError::InvalidQuerySyntax(format!(
                "TIMEOUT must be a positive integer greater than 0 and cannot exceed {MAX_TIMEOUT_MS}"
            ))
            .into());
        }
        if !(2..=4).contains(&self.parameters.dialect) {
            return Err(UserError::InvalidQuerySyntax(
                "DIALECT requires a non negative integer >=2 and <= 4".to_string(),
            )
            .into());
        }
        if let Some(sortby) = &self.parameters.sortby {
            let identifier = schema
                .identifier(&sortby.field)
                .ok_or_else(|| UserError::UnknownAttribute(sortby.field.clone()))?;
            self.sortby_identifier = Some(identifier.to_string());
        }
        // every declared parameter must have been consumed
        for (name, (_, uses)) in &self.params {
            if *uses == 0 {
                return Err(UserError::ParameterNotUsed(name.clone()).into());
            }
        }
        self.params.clear();
        Ok(())
    }
}

fn parse_return(
    schema: &IndexSchema,
    command: &mut SearchCommand,
    itr: &mut ArgsIterator,
) -> Result<()> {
    let count = itr.next_usize("RETURN count")?;
    if count == 0 {
        command.parameters.no_content = true;
        return Ok(());
    }
    let mut consumed = 0;
    while consumed < count {
        let field = itr.next_str()?;
        consumed += 1;
        let mut alias = field.to_string();
        if itr.match_keyword("AS") {
            alias = itr.next_str()?.to_string();
            consumed += 2;
            if consumed > count {
                return Err(UserError::InvalidQuerySyntax(
                    "Unexpected parameter `AS`".to_string(),
                )
                .into());
            }
        }
        // a known alias resolves to its identifier; anything else fetches
        // the raw field as-is
        let (identifier, attribute_alias): (Arc<str>, Option<String>) =
            match schema.identifier(field) {
                Some(identifier) => (identifier, Some(field.to_string())),
                None => (Arc::from(field), None),
            };
        command.parameters.return_attributes.push(ReturnAttribute {
            identifier,
            attribute_alias,
            alias,
        });
    }
    Ok(())
}

fn parse_sortby(command: &mut SearchCommand, itr: &mut ArgsIterator) -> Result<()> {
    let field = itr.next_str()?.to_string();
    let mut order = SortOrder::Ascending;
    if itr.match_keyword("ASC") {
        order = SortOrder::Ascending;
    } else if itr.match_keyword("DESC") {
        order = SortOrder::Descending;
    }
    command.parameters.sortby = Some(SortByParameter { field, order });
    Ok(())
}

fn parse_params(command: &mut SearchCommand, itr: &mut ArgsIterator) -> Result<()> {
    let count = itr.next_usize("PARAMS count")?;
    if count % 2 != 0 {
        return Err(
            UserError::InvalidQuerySyntax("Parameter count must be an even number".to_string())
                .into(),
        );
    }
    let mut remaining = count;
    while remaining > 0 {
        let name = itr.next_str()?.to_string();
        let value = itr.next_bytes()?.to_vec();
        if command.params.insert(name.clone(), (value, 0)).is_some() {
            return Err(UserError::ParameterAlreadyDefined(name).into());
        }
        remaining -= 2;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use fletch::index::{DistanceMetric, VectorKind};

    use super::*;
    use crate::commands::args::argv;

    fn schema() -> IndexSchema {
        IndexSchema::builder("idx")
            .numeric("num", "num")
            .unwrap()
            .text("body", "body")
            .unwrap()
            .vector("v", "$.vec", VectorKind::Flat, 2, DistanceMetric::L2)
            .unwrap()
            .build()
            .unwrap()
    }

    // a blob whose bytes are all ASCII so it survives the argv round-trip
    fn vector_blob() -> (String, Vec<f32>) {
        let bytes = b"@@@@AAAA".to_vec();
        let expected = decode_vector(&bytes).unwrap();
        (String::from_utf8(bytes).unwrap(), expected)
    }

    #[test]
    fn basic_search_arguments() {
        let schema = schema();
        let args = argv(&[
            "@num:[1 10]",
            "LIMIT",
            "5",
            "20",
            "NOCONTENT",
            "TIMEOUT",
            "1000",
            "DIALECT",
            "3",
        ]);
        let command = SearchCommand::parse(&schema, &args).unwrap();
        assert_eq!(command.parameters.limit.first_index, 5);
        assert_eq!(command.parameters.limit.number, 20);
        assert!(command.parameters.no_content);
        assert_eq!(command.parameters.timeout_ms, 1000);
        assert_eq!(command.parameters.dialect, 3);
        assert!(command.parameters.is_non_vector_query());
        assert!(command.parameters.filter.root.is_some());
    }

    #[test]
    fn knn_clause() {
        let schema = schema();
        let (blob, expected) = vector_blob();
        let args = argv(&[
            "*=>[KNN 10 @v $q AS score]",
            "PARAMS",
            "2",
            "q",
            &blob,
            "DIALECT",
            "2",
        ]);
        let command = SearchCommand::parse(&schema, &args).unwrap();
        assert!(command.parameters.is_vector_query());
        assert_eq!(command.parameters.k, 10);
        assert_eq!(command.parameters.attribute_alias.as_deref(), Some("v"));
        assert_eq!(command.parameters.score_as.as_deref(), Some("score"));
        assert_eq!(command.parameters.query_vector, expected);
        assert!(command.parameters.filter.is_match_all());
    }

    #[test]
    fn knn_with_filter_and_ef() {
        let schema = schema();
        let (blob, _) = vector_blob();
        let args = argv(&[
            "@num:[1 10]=>[KNN 5 @v $q EF_RUNTIME 64]",
            "PARAMS",
            "2",
            "q",
            &blob,
        ]);
        let command = SearchCommand::parse(&schema, &args).unwrap();
        assert_eq!(command.parameters.ef, Some(64));
        assert!(command.parameters.filter.root.is_some());
    }

    #[test]
    fn unused_parameter_is_an_error() {
        let schema = schema();
        let args = argv(&["@num:[1 10]", "PARAMS", "2", "q", "unused"]);
        let error = SearchCommand::parse(&schema, &args).unwrap_err();
        assert!(error.to_string().contains("not used"));
    }

    #[test]
    fn duplicate_parameter_is_an_error() {
        let schema = schema();
        let args = argv(&["@num:[1 10]", "PARAMS", "4", "q", "1", "q", "2"]);
        assert!(SearchCommand::parse(&schema, &args).is_err());
    }

    #[test]
    fn odd_params_count_is_an_error() {
        let schema = schema();
        let args = argv(&["@num:[1 10]", "PARAMS", "3", "a", "b", "c"]);
        assert!(SearchCommand::parse(&schema, &args).is_err());
    }

    #[test]
    fn dialect_and_timeout_ranges() {
        let schema = schema();
        assert!(SearchCommand::parse(&schema, &argv(&["*", "DIALECT", "1"])).is_err());
        assert!(SearchCommand::parse(&schema, &argv(&["*", "DIALECT", "5"])).is_err());
        assert!(SearchCommand::parse(&schema, &argv(&["*", "TIMEOUT", "60001"])).is_err());
        assert!(SearchCommand::parse(&schema, &argv(&["*", "TIMEOUT", "60000"])).is_ok());
    }

    #[test]
    fn return_zero_is_nocontent() {
        let schema = schema();
        let command = SearchCommand::parse(&schema, &argv(&["*", "RETURN", "0"])).unwrap();
        assert!(command.parameters.no_content);

        let command = SearchCommand::parse(
            &schema,
            &argv(&["*", "RETURN", "3", "num", "AS", "n"]),
        )
        .unwrap();
        let attribute = &command.parameters.return_attributes[0];
        assert_eq!(&*attribute.identifier, "num");
        assert_eq!(attribute.alias, "n");
        assert_eq!(attribute.attribute_alias.as_deref(), Some("num"));
    }

    #[test]
    fn sortby_resolves_identifier() {
        let schema = schema();
        let command =
            SearchCommand::parse(&schema, &argv(&["*", "SORTBY", "num", "DESC"])).unwrap();
        let sortby = command.parameters.sortby.as_ref().unwrap();
        assert_eq!(sortby.field, "num");
        assert_eq!(sortby.order, SortOrder::Descending);
        assert_eq!(command.sortby_identifier.as_deref(), Some("num"));

        assert!(SearchCommand::parse(&schema, &argv(&["*", "SORTBY", "missing"])).is_err());
    }

    #[test]
    fn scope_and_consistency_flags() {
        let schema = schema();
        let command = SearchCommand::parse(
            &schema,
            &argv(&["*", "LOCALONLY", "CONSISTENT", "ALLSHARDS"]),
        )
        .unwrap();
        assert_eq!(command.scope, SearchScope::LocalOnly);
        assert!(command.parameters.enable_consistency);
        assert!(!command.parameters.enable_partial_results);
    }

    #[test]
    fn slop_and_inorder_feed_the_filter() {
        let schema = schema();
        let command = SearchCommand::parse(
            &schema,
            &argv(&["@body:hello world", "SLOP", "2", "INORDER"]),
        )
        .unwrap();
        assert_eq!(command.parameters.slop, Some(2));
        assert!(command.parameters.inorder);
    }

    #[test]
    fn unknown_argument_errors() {
        let schema = schema();
        assert!(SearchCommand::parse(&schema, &argv(&["*", "BOGUS"])).is_err());
    }
}
