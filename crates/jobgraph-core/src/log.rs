//! Leveled stderr logging for jobgraph
//!
//! Lightweight, environment-configured logging used by the runtime and the
//! executor. No global subscriber, no allocation on disabled levels.
//!
//! # Environment Variables
//!
//! - `JG_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `JG_LOG_FLUSH=1` - Flush stderr after each line (useful when crashing)
//!
//! # Usage
//!
//! ```ignore
//! use jobgraph_core::{jg_debug, jg_warn};
//!
//! jg_debug!("dispatching job {}", name);
//! jg_warn!("queue full, retrying");
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::env::{env_get, env_get_bool};

/// Log levels (ascending verbosity)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize logging configuration from the environment (idempotent)
pub fn init_from_env() {
    if INITIALIZED.load(Ordering::Acquire) || INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let level: u8 = env_get("JG_LOG_LEVEL", LogLevel::Warn as u8);
    LOG_LEVEL.store(level, Ordering::SeqCst);
    FLUSH_ENABLED.store(env_get_bool("JG_LOG_FLUSH", false), Ordering::SeqCst);
}

/// Override the log level programmatically
pub fn set_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Check whether a level is currently enabled
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    init_from_env();
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

/// Emit one formatted line. Use the `jg_*` macros instead of calling this.
#[doc(hidden)]
pub fn emit(level: LogLevel, args: core::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let _ = writeln!(out, "{} {}", level.prefix(), args);
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! jg_log {
    ($lvl:expr, $($arg:tt)*) => {
        if $crate::log::enabled($lvl) {
            $crate::log::emit($lvl, format_args!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! jg_error {
    ($($arg:tt)*) => { $crate::jg_log!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! jg_warn {
    ($($arg:tt)*) => { $crate::jg_log!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! jg_info {
    ($($arg:tt)*) => { $crate::jg_log!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! jg_debug {
    ($($arg:tt)*) => { $crate::jg_log!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! jg_trace {
    ($($arg:tt)*) => { $crate::jg_log!($crate::log::LogLevel::Trace, $($arg)*) };
}
