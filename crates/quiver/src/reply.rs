//! Converts engine results into the client-visible reply shape.

use fletch::expr::{compare, Ordering, Value};
use fletch::{Neighbor, SearchResult, SortOrder};

use crate::commands::search_parser::SearchCommand;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    Nil,
    Int(i64),
    Bulk(String),
    Simple(String),
    Array(Vec<ReplyValue>),
    Error(String),
}

impl ReplyValue {
    pub fn bulk(s: impl Into<String>) -> Self {
        ReplyValue::Bulk(s.into())
    }
}

fn sort_key_value(neighbor: &Neighbor, identifier: &str) -> Value {
    let Some(contents) = neighbor.attribute_contents.as_ref() else {
        return Value::nil("no content");
    };
    match contents.get(identifier) {
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if !v.is_nan() => Value::num(v),
            _ => Value::str(raw.as_str()),
        },
        None => Value::nil("missing sort field"),
    }
}

/// Orders neighbors by the SORTBY field. Runs at the coordinator (or the
/// single node in standalone mode) once content is available.
pub fn sort_neighbors(command: &SearchCommand, neighbors: &mut [Neighbor]) {
    let Some(sortby) = command.parameters.sortby.as_ref() else { return };
    let identifier = command.sortby_identifier.clone().unwrap_or_else(|| sortby.field.clone());
    neighbors.sort_by(|a, b| {
        let left = sort_key_value(a, &identifier);
        let right = sort_key_value(b, &identifier);
        let ordering = match compare(&left, &right) {
            Ordering::Less => std::cmp::Ordering::Less,
            Ordering::Greater => std::cmp::Ordering::Greater,
            Ordering::Equal | Ordering::Unordered => std::cmp::Ordering::Equal,
        };
        match sortby.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
}

fn neighbor_fields(command: &SearchCommand, neighbor: &Neighbor) -> Vec<ReplyValue> {
    let mut fields = Vec::new();
    if command.parameters.is_vector_query() {
        let score_name =
            command.parameters.score_as.clone().unwrap_or_else(|| "__score".to_string());
        fields.push(ReplyValue::bulk(score_name));
        fields.push(ReplyValue::bulk(fletch::expr::value::format_num(f64::from(
            neighbor.distance,
        ))));
    }
    let Some(contents) = neighbor.attribute_contents.as_ref() else {
        return fields;
    };
    if command.parameters.return_attributes.is_empty() {
        for (identifier, value) in contents {
            fields.push(ReplyValue::bulk(identifier.to_string()));
            fields.push(ReplyValue::bulk(value.clone()));
        }
        return fields;
    }
    // RETURN restricts and renames the emitted identifiers
    for attribute in &command.parameters.return_attributes {
        if let Some(value) = contents.get(&attribute.identifier) {
            fields.push(ReplyValue::bulk(attribute.alias.clone()));
            fields.push(ReplyValue::bulk(value.clone()));
        }
    }
    fields
}

/// `[total_count, key, (sortkey,)? [fields...], ...]` with LIMIT trimming
/// applied through the serialization range.
pub fn build_search_reply(command: &SearchCommand, result: &SearchResult) -> ReplyValue {
    let range = result.serialization_range(&command.parameters);
    let mut out = Vec::with_capacity(1 + range.count() * 2);
    out.push(ReplyValue::Int(result.total_count as i64));
    for neighbor in &result.neighbors[range.start_index..range.end_index] {
        out.push(ReplyValue::bulk(neighbor.key.as_str()));
        if command.with_sort_keys {
            let identifier = command
                .sortby_identifier
                .clone()
                .or_else(|| command.parameters.sortby.as_ref().map(|s| s.field.clone()));
            let sortkey = identifier
                .map(|id| sort_key_value(neighbor, &id).as_string())
                .unwrap_or_default();
            out.push(ReplyValue::bulk(format!("#{sortkey}")));
        }
        if command.parameters.no_content {
            continue;
        }
        out.push(ReplyValue::Array(neighbor_fields(command, neighbor)));
    }
    ReplyValue::Array(out)
}

/// `[group_count, [name, value, ...], ...]` over the final record set.
/// Unset (nil) fields are omitted from their row.
pub fn build_aggregate_reply(
    names: &[String],
    records: &fletch::aggregate::RecordSet,
) -> ReplyValue {
    let mut out = Vec::with_capacity(records.len() + 1);
    out.push(ReplyValue::Int(records.len() as i64));
    for record in records {
        let mut row = Vec::new();
        for (slot, name) in names.iter().enumerate() {
            match record.fields.get(slot) {
                Some(value) if !value.is_nil() => {
                    row.push(ReplyValue::bulk(name.clone()));
                    row.push(ReplyValue::bulk(value.as_string()));
                }
                _ => (),
            }
        }
        out.push(ReplyValue::Array(row));
    }
    ReplyValue::Array(out)
}

#[cfg(test)]
mod tests {
    use fletch::cancel::ManualToken;
    use fletch::{intern, Neighbor, SearchParameters, SearchResult};

    use super::*;
    use crate::commands::search_parser::SearchCommand;

    fn command() -> SearchCommand {
        SearchCommand::from_parameters(SearchParameters::new("idx", ManualToken::token()))
    }

    fn neighbor(key: &str, fields: &[(&str, &str)]) -> Neighbor {
        let mut n = Neighbor::new(intern(key), 0.0);
        let mut contents = fletch::RecordsMap::new();
        for (id, value) in fields {
            contents.insert(std::sync::Arc::from(*id), value.to_string());
        }
        n.attribute_contents = Some(contents);
        n
    }

    #[test]
    fn nocontent_reply_is_keys_only() {
        let mut command = command();
        command.parameters.no_content = true;
        let result = SearchResult::new(
            2,
            vec![neighbor("a", &[]), neighbor("b", &[])],
            &command.parameters,
        );
        let reply = build_search_reply(&command, &result);
        let ReplyValue::Array(items) = reply else { panic!("expected array") };
        assert_eq!(items[0], ReplyValue::Int(2));
        assert_eq!(items[1], ReplyValue::bulk("a"));
        assert_eq!(items[2], ReplyValue::bulk("b"));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn limit_is_applied_via_range() {
        let mut command = command();
        command.parameters.no_content = true;
        command.parameters.limit = fletch::LimitParameter { first_index: 1, number: 1 };
        command.parameters.is_cluster = true; // keep the offset for the range
        let result = SearchResult::new(
            3,
            vec![neighbor("a", &[]), neighbor("b", &[]), neighbor("c", &[])],
            &command.parameters,
        );
        let reply = build_search_reply(&command, &result);
        let ReplyValue::Array(items) = reply else { panic!("expected array") };
        assert_eq!(items, vec![ReplyValue::Int(3), ReplyValue::bulk("b")]);
    }

    #[test]
    fn sort_neighbors_by_field() {
        let mut command = command();
        command.parameters.sortby = Some(fletch::SortByParameter {
            field: "n".to_string(),
            order: fletch::SortOrder::Descending,
        });
        command.sortby_identifier = Some("n".to_string());
        let mut neighbors = vec![
            neighbor("a", &[("n", "1")]),
            neighbor("c", &[("n", "3")]),
            neighbor("b", &[("n", "2")]),
        ];
        sort_neighbors(&command, &mut neighbors);
        let keys: Vec<&str> = neighbors.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn return_renames_fields() {
        let mut command = command();
        command.parameters.return_attributes.push(fletch::ReturnAttribute {
            identifier: std::sync::Arc::from("$.price"),
            attribute_alias: Some("price".to_string()),
            alias: "cost".to_string(),
        });
        let result = SearchResult::new(
            1,
            vec![neighbor("a", &[("$.price", "10"), ("$.other", "x")])],
            &command.parameters,
        );
        let reply = build_search_reply(&command, &result);
        let ReplyValue::Array(items) = reply else { panic!("expected array") };
        let ReplyValue::Array(fields) = &items[2] else { panic!("expected fields") };
        assert_eq!(fields, &vec![ReplyValue::bulk("cost"), ReplyValue::bulk("10")]);
    }
}
