//! # jobgraph
//!
//! Concurrent job-graph toolkit. This facade crate re-exports the public
//! API of the core building blocks, the Linux runtime and the executor.
//!
//! ```no_run
//! use jobgraph::{Executor, Job};
//!
//! let mut ex: Executor<i32> = Executor::new(4).unwrap();
//! let base = ex.add_job(Job::new("base", |_| Ok(2))).unwrap();
//! let doubled = ex
//!     .add_job(Job::new("doubled", |inputs| Ok(*inputs[0].data * 2)))
//!     .unwrap();
//! ex.add_dependency(doubled, base).unwrap();
//! assert_eq!(*ex.run(doubled).unwrap(), 4);
//! ```

pub use jobgraph_core::env::{env_get, env_get_bool};
pub use jobgraph_core::error::{JgError, JgResult, TrySendError};
pub use jobgraph_core::graph::{Edge, EdgeId, Graph, VertexId};
pub use jobgraph_core::log::LogLevel;
pub use jobgraph_core::lru::Lru;
pub use jobgraph_core::pool::{BlockId, Pool, SyncPool};

pub use jobgraph_runtime::handler::{HandleFn, Handler};
pub use jobgraph_runtime::looper::{Looper, LooperState, EVENT_READ};
pub use jobgraph_runtime::msg::{Msg, MsgBody, MsgPayload, MsgPriority};
pub use jobgraph_runtime::msgq::MsgQueue;
pub use jobgraph_runtime::threadex::{Listener, TexState, ThreadEx};

pub use jobgraph_executor::{Executor, Job, JobInput};
