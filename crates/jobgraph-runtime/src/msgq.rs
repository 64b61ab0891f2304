//! Priority message queue with eventfd readiness signalling
//!
//! MPMC, bounded, FIFO within each priority level. One mutex covers the
//! per-priority lists and the size counter; an eventfd in semaphore mode is
//! the synchronization hand-off between producers and blocking consumers.
//! Every enqueue writes one unit, every dequeue reads one, so a successful
//! read always finds a message.
//!
//! The eventfd is also the queue's readiness primitive for event loops:
//! register [`MsgQueue::readiness_fd`] with a looper and dequeue once per
//! readable event.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use jobgraph_core::error::{JgError, JgResult, TrySendError};
use jobgraph_core::jg_warn;

use crate::msg::{Msg, MsgPriority};

struct Inner {
    queues: [VecDeque<Msg>; MsgPriority::COUNT],
    len: u32,
}

/// Thread-safe bounded priority queue of [`Msg`]
pub struct MsgQueue {
    inner: Mutex<Inner>,
    /// Constant after creation
    capacity: u32,
    evfd: RawFd,
}

impl MsgQueue {
    /// Create an unbounded queue
    pub fn new() -> JgResult<MsgQueue> {
        Self::with_capacity(0)
    }

    /// Create a queue holding at most `capacity` messages
    ///
    /// `capacity <= 0` stands for "unbounded" (a `u32::MAX` proxy).
    pub fn with_capacity(capacity: i64) -> JgResult<MsgQueue> {
        let evfd = unsafe { libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC) };
        if evfd < 0 {
            return Err(JgError::Os(unsafe { *libc::__errno_location() }));
        }
        Ok(MsgQueue {
            inner: Mutex::new(Inner {
                queues: Default::default(),
                len: 0,
            }),
            capacity: if capacity <= 0 {
                u32::MAX
            } else {
                capacity as u32
            },
            evfd,
        })
    }

    /// The eventfd that becomes readable when a message is queued
    #[inline]
    pub fn readiness_fd(&self) -> RawFd {
        self.evfd
    }

    /// Number of queued messages
    pub fn len(&self) -> u32 {
        self.inner.lock().unwrap().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Enqueue a message
    ///
    /// Returns the message back inside [`TrySendError`] when the queue is
    /// at capacity; the caller may retry later or drop it.
    pub fn enqueue(&self, mut m: Msg) -> Result<(), TrySendError<Msg>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.len >= self.capacity {
                return Err(TrySendError(m));
            }
            m.stamp();
            let pri = m.priority().as_index();
            inner.queues[pri].push_back(m);
            inner.len += 1;
        }
        self.signal();
        Ok(())
    }

    /// Dequeue the oldest message of the highest non-empty priority
    ///
    /// Blocks on the eventfd until a message is available.
    pub fn dequeue(&self) -> Msg {
        let mut v: u64 = 0;
        loop {
            let r = unsafe {
                libc::read(
                    self.evfd,
                    &mut v as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if r == std::mem::size_of::<u64>() as isize {
                break;
            }
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EINTR {
                panic!("msgq eventfd read failed: errno {}", errno);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        for i in 0..MsgPriority::COUNT {
            if let Some(m) = inner.queues[i].pop_front() {
                inner.len -= 1;
                return m;
            }
        }
        // one unit per message: a successful read implies a queued message
        unreachable!("eventfd semaphore out of sync with queue");
    }

    /// One unit per enqueued message
    fn signal(&self) {
        let v: u64 = 1;
        loop {
            let r = unsafe {
                libc::write(
                    self.evfd,
                    &v as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if r == std::mem::size_of::<u64>() as isize {
                return;
            }
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EINTR {
                continue;
            }
            // EAGAIN means the counter is saturated; a wakeup is pending anyway
            if errno != libc::EAGAIN {
                jg_warn!("msgq eventfd write failed: errno {}", errno);
            }
            return;
        }
    }
}

impl Drop for MsgQueue {
    fn drop(&mut self) {
        if self.evfd >= 0 {
            unsafe {
                libc::close(self.evfd);
            }
            self.evfd = -1;
        }
    }
}
