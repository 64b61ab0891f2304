//! # jobgraph-core
//!
//! Platform-agnostic building blocks for the jobgraph toolkit.
//!
//! ## Modules
//!
//! - `pool` - fixed-size object pool with O(1) acquire/release and shrink
//! - `lru` - size-budgeted LRU cache with extract-on-get semantics
//! - `graph` - slab-backed directed graph with stable vertex/edge ids
//! - `error` - error types
//! - `log` - leveled stderr logging macros
//! - `env` - environment variable utilities

pub mod env;
pub mod error;
pub mod graph;
pub mod log;
pub mod lru;
pub mod pool;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use error::{JgError, JgResult, TrySendError};
pub use graph::{Edge, EdgeId, Graph, VertexId};
pub use log::LogLevel;
pub use lru::Lru;
pub use pool::{BlockId, Pool, SyncPool};
