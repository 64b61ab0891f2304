//! Error types shared across the jobgraph crates

use core::fmt;

/// Result type for jobgraph operations
pub type JgResult<T> = Result<T, JgError>;

/// Errors that can occur in jobgraph operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JgError {
    /// Misuse: NaN weight, duplicate edge, cycle, oversized cache insert, ...
    InvalidArgument,

    /// Resource exhausted: pool group cap reached, allocation failed
    OutOfMemory,

    /// Message queue is at capacity (retry later)
    QueueFull,

    /// Operation not allowed in the current state
    /// (starting a started thread, posting to a stopped looper, ...)
    InvalidState,

    /// Required item was not found
    NotFound,

    /// A job's run function returned a negative error code
    Job(i32),

    /// OS-level failure (errno from eventfd/epoll/thread plumbing)
    Os(i32),
}

impl fmt::Display for JgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JgError::InvalidArgument => write!(f, "invalid argument"),
            JgError::OutOfMemory => write!(f, "out of memory"),
            JgError::QueueFull => write!(f, "queue full"),
            JgError::InvalidState => write!(f, "invalid state"),
            JgError::NotFound => write!(f, "not found"),
            JgError::Job(code) => write!(f, "job failed: {}", code),
            JgError::Os(errno) => write!(f, "os error: {}", errno),
        }
    }
}

impl std::error::Error for JgError {}

/// Error returned when trying to enqueue on a full queue.
///
/// Carries the rejected message back so the caller may retry or drop it.
#[derive(Debug)]
pub struct TrySendError<T>(pub T);

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue full")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", JgError::InvalidArgument), "invalid argument");
        assert_eq!(format!("{}", JgError::Job(-3)), "job failed: -3");
        assert_eq!(format!("{}", JgError::Os(11)), "os error: 11");
    }

    #[test]
    fn test_try_send_error_returns_value() {
        let e = TrySendError(42);
        assert_eq!(e.0, 42);
    }
}
