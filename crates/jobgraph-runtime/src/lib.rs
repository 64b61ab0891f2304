//! # jobgraph-runtime
//!
//! Linux runtime pieces of the jobgraph toolkit:
//!
//! - `msg` - message type and priority levels
//! - `msgq` - bounded MPMC priority queue with eventfd readiness
//! - `looper` - per-thread epoll event loop
//! - `handler` - binds a message queue to a looper and dispatches
//! - `threadex` - cancelable worker thread with listener callbacks

#![allow(dead_code)]

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod msg;
        pub mod msgq;
        pub mod looper;
        pub mod handler;
        pub mod threadex;

        // Re-exports
        pub use msg::{Msg, MsgBody, MsgPayload, MsgPriority};
        pub use msgq::MsgQueue;
        pub use looper::{Looper, LooperState, EVENT_READ};
        pub use handler::{Handler, HandleFn};
        pub use threadex::{Listener, TexState, ThreadEx};
    } else {
        compile_error!("jobgraph-runtime requires Linux (epoll + eventfd)");
    }
}
