//! The outer layer of Quiver: FT.* command parsing and dispatch, the host
//! key-value store boundary, the priority worker pools, the cluster-map
//! snapshot and the scatter-gather fanout. The query engine itself lives in
//! the `fletch` crate.

pub mod cluster;
pub mod commands;
pub mod host;
pub mod pool;
pub mod reply;

pub use commands::{dispatch, SchemaManager, ServerContext};
pub use host::{Host, MemoryHost};
pub use reply::ReplyValue;
