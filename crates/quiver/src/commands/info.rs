//! FT.INFO: local index statistics, optionally merged across the cluster.
//! The same fanout backs the create/drop consistency checks, which only
//! compare fingerprints.

use std::sync::{Arc, Mutex};

use fletch::{IndexSchema, Result, UserError};

use crate::cluster::fanout::{run_with_retries, FanoutOperationBase};
use crate::cluster::map::FanoutTargetMode;
use crate::cluster::ClusterContext;
use crate::commands::args::ArgsIterator;
use crate::reply::ReplyValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoScope {
    #[default]
    Local,
    Primary,
    Cluster,
}

#[derive(Debug, Clone, Copy)]
pub struct InfoOptions {
    pub scope: InfoScope,
    pub partial_results: bool,
    pub consistent: bool,
}

pub fn parse_info_options(itr: &mut ArgsIterator) -> Result<InfoOptions> {
    let mut options = InfoOptions {
        scope: InfoScope::Local,
        partial_results: true,
        consistent: false,
    };
    while !itr.done() {
        if itr.match_keyword("LOCAL") {
            options.scope = InfoScope::Local;
        } else if itr.match_keyword("PRIMARY") {
            options.scope = InfoScope::Primary;
        } else if itr.match_keyword("CLUSTER") {
            options.scope = InfoScope::Cluster;
        } else if itr.match_keyword("ALLSHARDS") {
            options.partial_results = false;
        } else if itr.match_keyword("SOMESHARDS") {
            options.partial_results = true;
        } else if itr.match_keyword("CONSISTENT") {
            options.consistent = true;
        } else if itr.match_keyword("INCONSISTENT") {
            options.consistent = false;
        } else {
            return Err(UserError::InvalidQuerySyntax(format!(
                "Unexpected FT.INFO argument at position {}",
                itr.position() + 1
            ))
            .into());
        }
    }
    Ok(options)
}

fn info_pairs(schema: &IndexSchema, num_docs: u64) -> Vec<ReplyValue> {
    let mut out = Vec::new();
    out.push(ReplyValue::bulk("index_name"));
    out.push(ReplyValue::bulk(schema.name()));
    out.push(ReplyValue::bulk("num_docs"));
    out.push(ReplyValue::Int(num_docs as i64));
    out.push(ReplyValue::bulk("index_fingerprint"));
    out.push(ReplyValue::bulk(schema.fingerprint().to_string()));
    out.push(ReplyValue::bulk("version"));
    out.push(ReplyValue::Int(i64::from(schema.version())));
    out.push(ReplyValue::bulk("attributes"));
    let attributes = schema
        .attributes()
        .iter()
        .map(|a| {
            ReplyValue::Array(vec![
                ReplyValue::bulk("identifier"),
                ReplyValue::bulk(a.identifier.to_string()),
                ReplyValue::bulk("attribute"),
                ReplyValue::bulk(a.alias.clone()),
                ReplyValue::bulk("type"),
                ReplyValue::bulk(format!("{:?}", a.kind)),
            ])
        })
        .collect();
    out.push(ReplyValue::Array(attributes));
    out
}

struct InfoFanout {
    merged_docs: u64,
}

impl FanoutOperationBase for InfoFanout {
    fn reset_for_retry(&mut self) {
        self.merged_docs = 0;
    }
}

/// Merged per-shard statistics, or a consistency failure when the shards
/// disagree on the index fingerprint and `CONSISTENT` was requested.
pub fn cluster_info(
    cluster: &ClusterContext,
    schema: &IndexSchema,
    options: InfoOptions,
) -> Result<u64> {
    let map = cluster.map();
    let mode = match options.scope {
        InfoScope::Primary | InfoScope::Cluster => FanoutTargetMode::Primary,
        InfoScope::Local => return Ok(schema.read().num_keys() as u64),
    };
    let targets = map.targets(mode);
    let mut operation = InfoFanout { merged_docs: 0 };
    let mut consistency_failed = false;
    let mut transport_failed = false;
    run_with_retries(&mut operation, 2, |operation| {
        let results: Arc<Mutex<Vec<_>>> = Arc::new(Mutex::new(Vec::new()));
        for node in &targets {
            let results = Arc::clone(&results);
            cluster.client.index_info(
                &node.address.to_string(),
                schema.name(),
                Box::new(move |response| {
                    results.lock().expect("info results lock").push(response);
                }),
            );
        }
        let results = results.lock().expect("info results lock");
        let mut failed = 0;
        for response in results.iter() {
            match response {
                Ok(info) => {
                    operation.merged_docs += info.num_docs;
                    if options.consistent && info.fingerprint != schema.fingerprint() {
                        consistency_failed = true;
                    }
                }
                Err(_) => failed += 1,
            }
        }
        transport_failed = failed > 0;
        (failed, targets.len())
    });
    if consistency_failed {
        return Err(UserError::ConsistencyCheckFailed.into());
    }
    if transport_failed && !options.partial_results {
        return Err(UserError::ConsistencyCheckFailed.into());
    }
    Ok(operation.merged_docs)
}

pub fn build_info_reply(schema: &IndexSchema, num_docs: u64) -> ReplyValue {
    ReplyValue::Array(info_pairs(schema, num_docs))
}

/// After FT.CREATE / FT.DROPINDEX in cluster mode, verifies every shard
/// agrees on the schema's existence and fingerprint.
pub fn consistency_check(cluster: &ClusterContext, schema: &IndexSchema) -> Result<()> {
    let options =
        InfoOptions { scope: InfoScope::Cluster, partial_results: true, consistent: true };
    cluster_info(cluster, schema, options).map(|_| ())
}
