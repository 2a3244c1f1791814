//! FT.* command surface: the schema registry, the dispatch table and the
//! protocol-level error mapping.

pub mod aggregate_parser;
pub mod args;
pub mod create_parser;
pub mod exec;
pub mod info;
pub mod search_parser;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use fletch::{config, error_class, metrics, IndexSchema, Result, UserError};

use crate::cluster::ClusterContext;
use crate::commands::aggregate_parser::AggregateCommand;
use crate::commands::args::ArgsIterator;
use crate::commands::search_parser::SearchCommand;
use crate::host::Host;
use crate::pool::ThreadPool;
use crate::reply::ReplyValue;

/// Registry of live schemas. Creation and drop come through the command
/// surface; ingestion and queries share the `Arc`s handed out here.
#[derive(Default)]
pub struct SchemaManager {
    schemas: RwLock<HashMap<String, Arc<IndexSchema>>>,
}

impl SchemaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, schema: IndexSchema) -> Result<Arc<IndexSchema>> {
        let mut schemas = self.schemas.write().expect("schema registry lock");
        if schemas.contains_key(schema.name()) {
            return Err(UserError::InvalidQuerySyntax(format!(
                "Index `{}` already exists",
                schema.name()
            ))
            .into());
        }
        let schema = Arc::new(schema);
        schemas.insert(schema.name().to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn drop_index(&self, name: &str) -> Result<Arc<IndexSchema>> {
        self.schemas
            .write()
            .expect("schema registry lock")
            .remove(name)
            .ok_or_else(|| UserError::IndexNotFound(name.to_string()).into())
    }

    pub fn get(&self, name: &str) -> Result<Arc<IndexSchema>> {
        self.schemas
            .read()
            .expect("schema registry lock")
            .get(name)
            .cloned()
            .ok_or_else(|| UserError::IndexNotFound(name.to_string()).into())
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.schemas.read().expect("schema registry lock").keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct ServerContext {
    pub manager: SchemaManager,
    pub host: Arc<dyn Host>,
    pub cluster: Option<ClusterContext>,
    /// Query work moves here; `None` executes inline (tests, tooling).
    pub reader_pool: Option<ThreadPool>,
    /// Ingestion work; owned here so the pools share one lifecycle.
    pub writer_pool: Option<ThreadPool>,
    /// Maintenance work (intern-pool sweeps, map refreshes).
    pub utility_pool: Option<ThreadPool>,
}

impl ServerContext {
    pub fn new(host: Arc<dyn Host>) -> Self {
        ServerContext {
            manager: SchemaManager::new(),
            host,
            cluster: None,
            reader_pool: None,
            writer_pool: None,
            utility_pool: None,
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterContext) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_pools(mut self) -> Self {
        self.reader_pool =
            Some(ThreadPool::new("reader", config::READER_THREADS.get() as usize, 100));
        self.writer_pool =
            Some(ThreadPool::new("writer", config::WRITER_THREADS.get() as usize, 100));
        self.utility_pool =
            Some(ThreadPool::new("utility", config::UTILITY_THREADS.get() as usize, 100));
        self
    }
}

/// Entry point from the host dispatcher: a raw argument vector in, a
/// protocol value or `<CLASS> message` error string out.
pub fn dispatch(ctx: &ServerContext, argv: &[Vec<u8>]) -> ReplyValue {
    match run_command(ctx, argv) {
        Ok(reply) => reply,
        Err(error) => {
            metrics::stats().query_failed_requests.incr();
            ReplyValue::Error(format!("{} {}", error_class(&error), error))
        }
    }
}

fn check_arity(argv: &[Vec<u8>], minimum: usize, name: &str) -> Result<()> {
    if argv.len() < minimum {
        return Err(UserError::InvalidQuerySyntax(format!(
            "wrong number of arguments for '{name}' command"
        ))
        .into());
    }
    Ok(())
}

fn run_command(ctx: &ServerContext, argv: &[Vec<u8>]) -> Result<ReplyValue> {
    let command_name = argv
        .first()
        .and_then(|a| std::str::from_utf8(a).ok())
        .ok_or_else(|| UserError::InvalidQuerySyntax("Missing command".to_string()))?
        .to_ascii_uppercase();

    match command_name.as_str() {
        "FT.CREATE" => {
            check_arity(argv, 4, "FT.CREATE")?;
            let name = std::str::from_utf8(&argv[1])
                .map_err(|_| UserError::InvalidQuerySyntax("Invalid index name".to_string()))?;
            let schema = create_parser::parse_create(name, &argv[2..])?;
            let schema = ctx.manager.create(schema)?;
            if let Some(cluster) = &ctx.cluster {
                info::consistency_check(cluster, &schema)?;
            }
            Ok(ReplyValue::Simple("OK".to_string()))
        }
        "FT.DROPINDEX" => {
            check_arity(argv, 2, "FT.DROPINDEX")?;
            let name = std::str::from_utf8(&argv[1])
                .map_err(|_| UserError::InvalidQuerySyntax("Invalid index name".to_string()))?;
            let schema = ctx.manager.drop_index(name)?;
            if let Some(cluster) = &ctx.cluster {
                // drop consistency: every shard should now miss the index
                let _ = info::consistency_check(cluster, &schema);
            }
            Ok(ReplyValue::Simple("OK".to_string()))
        }
        "FT.SEARCH" => {
            check_arity(argv, 3, "FT.SEARCH")?;
            let name = std::str::from_utf8(&argv[1])
                .map_err(|_| UserError::InvalidQuerySyntax("Invalid index name".to_string()))?;
            let schema = ctx.manager.get(name)?;
            check_permissions(ctx, &schema)?;
            let command = SearchCommand::parse(&schema, &argv[2..])?;
            if command.parameters.is_vector_query() {
                exec::check_memory(ctx.host.as_ref())?;
            }
            exec::execute_search(ctx, &schema, command)
        }
        "FT.AGGREGATE" => {
            check_arity(argv, 3, "FT.AGGREGATE")?;
            let name = std::str::from_utf8(&argv[1])
                .map_err(|_| UserError::InvalidQuerySyntax("Invalid index name".to_string()))?;
            let schema = ctx.manager.get(name)?;
            check_permissions(ctx, &schema)?;
            let command = AggregateCommand::parse(&schema, &argv[2..])?;
            exec::execute_aggregate(ctx, &schema, command)
        }
        "FT.INFO" => {
            check_arity(argv, 2, "FT.INFO")?;
            let name = std::str::from_utf8(&argv[1])
                .map_err(|_| UserError::InvalidQuerySyntax("Invalid index name".to_string()))?;
            let schema = ctx.manager.get(name)?;
            let mut itr = ArgsIterator::new(&argv[2..]);
            let options = info::parse_info_options(&mut itr)?;
            let num_docs = match (&ctx.cluster, options.scope) {
                (_, info::InfoScope::Local) => schema.read().num_keys() as u64,
                (Some(cluster), _) => info::cluster_info(cluster, &schema, options)?,
                (None, _) => {
                    return Err(UserError::InvalidQuerySyntax(
                        "PRIMARY and CLUSTER scopes require cluster mode".to_string(),
                    )
                    .into())
                }
            };
            Ok(info::build_info_reply(&schema, num_docs))
        }
        "FT._LIST" => {
            let names = ctx.manager.list().into_iter().map(ReplyValue::Bulk).collect();
            Ok(ReplyValue::Array(names))
        }
        "FT._DEBUG" => {
            check_arity(argv, 2, "FT._DEBUG")?;
            let sub = std::str::from_utf8(&argv[1]).unwrap_or_default().to_ascii_uppercase();
            match sub.as_str() {
                "INFO_METADATA" => Ok(debug_metadata()),
                "INFO_VALUES" => Ok(debug_values()),
                _ => Err(UserError::InvalidQuerySyntax(format!(
                    "Unknown FT._DEBUG subcommand `{sub}`"
                ))
                .into()),
            }
        }
        "FT.INTERNAL_UPDATE" => {
            check_arity(argv, 4, "FT.INTERNAL_UPDATE")?;
            let flags = ctx.host.context_flags();
            if !flags.is_replica && !flags.loading_aof {
                return Err(UserError::InvalidQuerySyntax(
                    "FT.INTERNAL_UPDATE is only honored on replicas or during AOF load"
                        .to_string(),
                )
                .into());
            }
            // the replication payload is applied by the schema manager; the
            // query core only gates it
            Ok(ReplyValue::Simple("OK".to_string()))
        }
        _ => Err(UserError::InvalidQuerySyntax(format!("Unknown command `{command_name}`")).into()),
    }
}

fn check_permissions(ctx: &ServerContext, schema: &IndexSchema) -> Result<()> {
    if !ctx.host.acl_allows(schema.key_prefixes()) {
        return Err(UserError::PermissionDenied.into());
    }
    Ok(())
}

fn debug_metadata() -> ReplyValue {
    let stats = metrics::stats();
    let pairs: Vec<(&str, u64)> = vec![
        ("query_requests_cnt", stats.query_requests.get()),
        ("query_failed_requests_cnt", stats.query_failed_requests.get()),
        ("query_prefiltering_requests_cnt", stats.query_prefiltering_requests.get()),
        ("query_inline_filtering_requests_cnt", stats.query_inline_filtering_requests.get()),
        ("cancel_timeouts", stats.cancellation_timeouts.get()),
        ("predicate_revalidations", stats.predicate_revalidations.get()),
        ("result_records_dropped_cnt", stats.result_records_dropped.get()),
        ("fanout_retries", stats.fanout_retries.get()),
        ("used_memory", metrics::used_memory() as u64),
    ];
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (name, value) in pairs {
        out.push(ReplyValue::bulk(name));
        out.push(ReplyValue::Int(value as i64));
    }
    ReplyValue::Array(out)
}

fn debug_values() -> ReplyValue {
    let pairs: Vec<(&str, String)> = vec![
        ("query-string-depth", config::QUERY_STRING_DEPTH.get().to_string()),
        ("query-string-terms-count", config::QUERY_STRING_TERMS_COUNT.get().to_string()),
        ("default-timeout-ms", config::DEFAULT_TIMEOUT_MS.get().to_string()),
        ("max-knn", config::MAX_KNN.get().to_string()),
        ("max-term-expansions", config::MAX_TERM_EXPANSIONS.get().to_string()),
        ("prefilter-threshold-ratio", config::prefilter_threshold_ratio().to_string()),
        (
            "search-result-buffer-multiplier",
            config::SEARCH_RESULT_BUFFER_MULTIPLIER.get().to_string(),
        ),
        ("enable-partial-results", config::ENABLE_PARTIAL_RESULTS.get().to_string()),
        ("enable-consistent-results", config::ENABLE_CONSISTENT_RESULTS.get().to_string()),
        ("timeout-poll-frequency", config::TIMEOUT_POLL_FREQUENCY.get().to_string()),
    ];
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for (name, value) in pairs {
        out.push(ReplyValue::bulk(name));
        out.push(ReplyValue::bulk(value));
    }
    ReplyValue::Array(out)
}
