//! Query execution glue: local or fanned-out search, main-thread content
//! resolution with re-validation and size caps, aggregate pipelines, reply
//! construction.

use std::collections::HashSet;
use std::sync::Arc;

use fletch::aggregate::{self, Record, RecordSet};
use fletch::cancel::DeadlineToken;
use fletch::expr::Value;
use fletch::filter::eval::verify_filter;
use fletch::{config, metrics, IndexSchema, Neighbor, Result, SearchResult, UserError};
use tracing::warn;

use crate::cluster::fanout::perform_search_fanout;
use crate::cluster::map::FanoutTargetMode;
use crate::commands::aggregate_parser::{AggregateCommand, KEY_ATTRIBUTE};
use crate::commands::search_parser::{SearchCommand, SearchScope};
use crate::commands::ServerContext;
use crate::host::Host;
use crate::reply::{build_aggregate_reply, build_search_reply, sort_neighbors, ReplyValue};

/// Fetches content for neighbors that the index side could not serve,
/// re-validating mutated keys and enforcing the record caps. Neighbors left
/// without content are dropped.
pub fn resolve_contents(
    host: &dyn Host,
    schema: &IndexSchema,
    command: &SearchCommand,
    neighbors: &mut Vec<Neighbor>,
) {
    if command.parameters.no_content {
        return;
    }
    let mut identifiers: HashSet<Arc<str>> = command
        .parameters
        .return_attributes
        .iter()
        .map(|a| a.identifier.clone())
        .collect();
    if !identifiers.is_empty() {
        identifiers.extend(command.parameters.filter.identifiers.iter().cloned());
        if let Some(identifier) = &command.sortby_identifier {
            identifiers.insert(Arc::from(identifier.as_str()));
        }
    }
    let max_record_size = config::MAX_SEARCH_RESULT_RECORD_SIZE.get() as usize;
    let max_record_fields = config::MAX_SEARCH_RESULT_FIELDS_COUNT.get() as usize;
    let inner = schema.read();
    for neighbor in neighbors.iter_mut() {
        // neighbors from remote shards already carry their content
        if neighbor.attribute_contents.is_some() {
            continue;
        }
        let Some(content) = host.fetch_records(
            command.parameters.db_num,
            neighbor.key.as_str(),
            &identifiers,
        ) else {
            continue;
        };
        if !verify_filter(
            &inner,
            command.parameters.filter.root.as_ref(),
            &content,
            &neighbor.key,
            neighbor.sequence_number,
        ) {
            continue;
        }
        if content.len() > max_record_fields {
            metrics::stats().result_records_dropped.incr();
            warn!(key = %neighbor.key, "content field count exceeds the configured limit");
            continue;
        }
        let total_size: usize =
            content.iter().map(|(id, value)| id.len() + value.len()).sum();
        if total_size > max_record_size {
            metrics::stats().result_records_dropped.incr();
            warn!(key = %neighbor.key, "content size exceeds the configured limit");
            continue;
        }
        neighbor.attribute_contents = Some(content);
    }
    neighbors.retain(|n| n.attribute_contents.is_some());
}

fn finish_search(
    ctx: &ServerContext,
    schema: &IndexSchema,
    command: &mut SearchCommand,
    mut result: SearchResult,
) -> ReplyValue {
    resolve_contents(ctx.host.as_ref(), schema, command, &mut result.neighbors);
    if command.parameters.sortby.is_some() {
        sort_neighbors(command, &mut result.neighbors);
    }
    build_search_reply(command, &result)
}

/// Runs FT.SEARCH: locally in standalone mode (or LOCALONLY), otherwise
/// scattered across the shard targets and gathered here.
pub fn execute_search(
    ctx: &ServerContext,
    schema: &Arc<IndexSchema>,
    mut command: SearchCommand,
) -> Result<ReplyValue> {
    command.parameters.token = DeadlineToken::new(command.parameters.timeout_ms);
    command.parameters.index_fingerprint = schema.fingerprint();

    let cluster = match (&ctx.cluster, command.scope) {
        (Some(cluster), SearchScope::AllShards) if !command.parameters.local_only => cluster,
        _ => {
            let result = fletch::search::search(schema, &command.parameters)?;
            return Ok(finish_search(ctx, schema, &mut command, result));
        }
    };

    let map = cluster.map();
    command.parameters.is_cluster = true;
    command.parameters.slot_fingerprint = map.local_shard_fingerprint();
    let targets = map.targets(FanoutTargetMode::Primary);

    let (tx, rx) = std::sync::mpsc::channel();
    let completion = Box::new(move |result: Result<SearchResult>, parameters| {
        let _ = tx.send((result, parameters));
    });
    // the aggregated result applies the coordinator-side offset trimming
    let mut coordinator_parameters = command.parameters.clone();
    coordinator_parameters.is_cluster = false;
    perform_search_fanout(
        &targets,
        &map,
        &cluster.client,
        Some(schema),
        coordinator_parameters,
        ctx.reader_pool.as_ref(),
        completion,
    );
    let (result, parameters) = rx
        .recv()
        .map_err(|_| fletch::Error::from(fletch::InternalError::FanoutParametersLost))?;
    command.parameters = parameters;
    let result = result?;
    Ok(finish_search(ctx, schema, &mut command, result))
}

fn neighbor_value(neighbor: &Neighbor, identifier: &str) -> Value {
    let Some(contents) = neighbor.attribute_contents.as_ref() else {
        return Value::nil("no content");
    };
    match contents.get(identifier) {
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(v) if !v.is_nan() => Value::num(v),
            _ => Value::str(raw.as_str()),
        },
        None => Value::nil("missing field"),
    }
}

/// Builds the pipeline input records from the search output and runs the
/// stages.
pub fn execute_aggregate(
    ctx: &ServerContext,
    schema: &Arc<IndexSchema>,
    mut command: AggregateCommand,
) -> Result<ReplyValue> {
    command.search.parameters.token =
        DeadlineToken::new(command.search.parameters.timeout_ms);

    let result = match &ctx.cluster {
        Some(cluster) if !command.search.parameters.local_only => {
            let map = cluster.map();
            command.search.parameters.is_cluster = true;
            command.search.parameters.slot_fingerprint = map.local_shard_fingerprint();
            let targets = map.targets(FanoutTargetMode::Primary);
            let (tx, rx) = std::sync::mpsc::channel();
            let completion = Box::new(move |result: Result<SearchResult>, parameters| {
                let _ = tx.send((result, parameters));
            });
            let mut coordinator_parameters = command.search.parameters.clone();
            coordinator_parameters.is_cluster = false;
            perform_search_fanout(
                &targets,
                &map,
                &cluster.client,
                Some(schema),
                coordinator_parameters,
                ctx.reader_pool.as_ref(),
                completion,
            );
            let (result, parameters) = rx
                .recv()
                .map_err(|_| fletch::Error::from(fletch::InternalError::FanoutParametersLost))?;
            command.search.parameters = parameters;
            result?
        }
        _ => fletch::search::search(schema, &command.search.parameters)?,
    };

    let mut neighbors = result.neighbors;
    resolve_contents(ctx.host.as_ref(), schema, &command.search, &mut neighbors);

    let width = command.attributes.width();
    let mut records: RecordSet = RecordSet::new();
    for neighbor in &neighbors {
        let mut record = Record::with_width(width);
        for alias in &command.loads {
            let Some(slot) = command.attributes.slot_of(alias) else { continue };
            let Some(identifier) = schema.identifier(alias) else { continue };
            record.set_field(slot, neighbor_value(neighbor, &identifier));
        }
        if command.load_key {
            if let Some(slot) = command.attributes.slot_of(KEY_ATTRIBUTE) {
                record.set_field(slot, Value::str(neighbor.key.as_str()));
            }
        }
        records.push_back(record);
    }

    aggregate::execute(&command.stages, &mut records)?;
    Ok(build_aggregate_reply(command.attributes.names(), &records))
}

/// OOM gate for commands that allocate result sets.
pub fn check_memory(host: &dyn Host) -> Result<()> {
    if host.over_memory_limit() {
        return Err(UserError::OutOfMemory.into());
    }
    Ok(())
}
