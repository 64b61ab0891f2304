//! # jobgraph-executor
//!
//! Schedules a directed acyclic graph of dependent jobs across a bounded
//! set of worker threads. The executor is a single-threaded cooperative
//! driver draining its own priority message queue; workers never touch
//! scheduler state, they only post terminal messages.

pub mod executor;
pub mod job;

pub use executor::Executor;
pub use job::{Job, JobInput};
