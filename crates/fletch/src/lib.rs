//! The query-execution engine of Quiver: predicate trees typed against an
//! index schema, entries-fetcher pipelines over the inverted indexes, text
//! proximity iterators, the vector query planner, the local search
//! orchestrator and the aggregate pipeline.
//!
//! The outer layer (`quiver`) owns command parsing, cluster fanout and
//! reply construction; the host key-value store and the graph vector
//! kernels are collaborators behind small traits.

pub mod aggregate;
pub mod cancel;
pub mod config;
pub mod error;
pub mod expr;
pub mod fetch;
pub mod filter;
pub mod index;
pub mod interning;
pub mod metrics;
pub mod planner;
pub mod schema;
pub mod search;
pub mod text;

pub use error::{error_class, Error, InternalError, Result, UserError};
pub use filter::resolve::{parse_filter, ProximityOptions};
pub use filter::{FilterParseResults, Predicate, QueryOperations};
pub use interning::{intern, InternedString};
pub use schema::{DataType, IndexSchema, IndexSchemaBuilder};
pub use search::{
    LimitParameter, Neighbor, RecordsMap, ReturnAttribute, SearchParameters, SearchResult,
    SerializationRange, SortByParameter, SortOrder,
};
