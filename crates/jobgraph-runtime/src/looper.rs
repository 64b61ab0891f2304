//! Per-thread event loop multiplexing file descriptors
//!
//! A looper owns an epoll set and a control eventfd. Registered callbacks
//! run synchronously on the looper thread; `stop` may be called from any
//! thread and wakes the loop through the control fd.
//!
//! At most one looper exists per thread; a process-wide thread-local holds
//! the current thread's looper.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use jobgraph_core::error::{JgError, JgResult};
use jobgraph_core::{jg_debug, jg_warn};

/// Event mask bit for readability (the only mask the toolkit registers)
pub const EVENT_READ: u32 = libc::EPOLLIN as u32;

const MAX_EVENTS: usize = 64;

/// Looper lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LooperState {
    /// Created, loop not yet entered
    Ready = 0,

    /// The owning thread is inside `run`
    Loop = 1,

    /// `stop` was requested; the loop exits at the next wakeup
    Stopping = 2,

    /// The loop has exited (or was stopped before it started)
    Terminated = 3,
}

impl From<u8> for LooperState {
    fn from(v: u8) -> Self {
        match v {
            0 => LooperState::Ready,
            1 => LooperState::Loop,
            2 => LooperState::Stopping,
            _ => LooperState::Terminated,
        }
    }
}

/// Callback invoked on the looper thread with `(fd, ready event mask)`
pub type EventCb = dyn Fn(RawFd, u32) + Send + Sync;

thread_local! {
    static CURRENT_LOOPER: RefCell<Option<Arc<Looper>>> = const { RefCell::new(None) };
}

/// A per-thread epoll event loop
pub struct Looper {
    epoll: Epoll,
    ctlfd: RawFd,
    fds: Mutex<HashMap<RawFd, Arc<EventCb>>>,
    state: AtomicU8,
    /// The owning thread, fixed at creation
    thread: thread::ThreadId,
}

impl Looper {
    /// Create a looper bound to the calling thread
    ///
    /// Fails with `InvalidState` if the thread already has one.
    pub fn create_for_current_thread() -> JgResult<Arc<Looper>> {
        if Self::current().is_some() {
            return Err(JgError::InvalidState);
        }

        let ctlfd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if ctlfd < 0 {
            return Err(JgError::Os(unsafe { *libc::__errno_location() }));
        }
        let epoll = match Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC) {
            Ok(ep) => ep,
            Err(e) => {
                unsafe { libc::close(ctlfd) };
                return Err(JgError::Os(e as i32));
            }
        };

        let ml = Arc::new(Looper {
            epoll,
            ctlfd,
            fds: Mutex::new(HashMap::new()),
            state: AtomicU8::new(LooperState::Ready as u8),
            thread: thread::current().id(),
        });

        // control fd: nothing to do but consume the wake token
        ml.add_fd(ctlfd, EVENT_READ, |fd, _events| {
            let mut v: u64 = 0;
            unsafe {
                libc::read(fd, &mut v as *mut u64 as *mut libc::c_void, 8);
            }
        })?;

        CURRENT_LOOPER.with(|c| *c.borrow_mut() = Some(Arc::clone(&ml)));
        Ok(ml)
    }

    /// The calling thread's looper, if any
    pub fn current() -> Option<Arc<Looper>> {
        CURRENT_LOOPER.with(|c| c.borrow().clone())
    }

    /// Spawn a thread, create its looper and run it
    ///
    /// Returns once the new looper is published; the thread keeps looping
    /// until `stop` is called.
    pub fn start_thread() -> JgResult<Arc<Looper>> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("jg-looper".into())
            .spawn(move || {
                match Looper::create_for_current_thread() {
                    Ok(ml) => {
                        tx.send(Ok(Arc::clone(&ml))).ok();
                        if let Err(e) = ml.run() {
                            jg_warn!("looper thread exited with error: {}", e);
                        }
                    }
                    Err(e) => {
                        tx.send(Err(e)).ok();
                    }
                }
            })
            .map_err(|e| JgError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
        rx.recv().map_err(|_| JgError::InvalidState)?
    }

    #[inline]
    pub fn state(&self) -> LooperState {
        LooperState::from(self.state.load(Ordering::SeqCst))
    }

    /// True when called on the thread that owns this looper
    #[inline]
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Watch `fd` for `events`; `cb` runs on the looper thread per event
    pub fn add_fd(
        &self,
        fd: RawFd,
        events: u32,
        cb: impl Fn(RawFd, u32) + Send + Sync + 'static,
    ) -> JgResult<()> {
        {
            let mut fds = self.fds.lock().unwrap();
            fds.insert(fd, Arc::new(cb));
        }
        let ev = EpollEvent::new(
            EpollFlags::from_bits_truncate(events as i32),
            fd as u64,
        );
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self.epoll.add(bfd, ev) {
            self.fds.lock().unwrap().remove(&fd);
            return Err(JgError::Os(e as i32));
        }
        Ok(())
    }

    /// Stop watching `fd`
    pub fn del_fd(&self, fd: RawFd) {
        self.fds.lock().unwrap().remove(&fd);
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        // the fd may already be closed; nothing to do about failure
        let _ = self.epoll.delete(bfd);
    }

    /// Run the event loop on the owning thread until stopped
    ///
    /// A looper that was stopped before `run` goes straight to
    /// `Terminated`. On exit the thread-local binding is cleared.
    pub fn run(&self) -> JgResult<()> {
        if !self.is_current() {
            return Err(JgError::InvalidState);
        }
        let entered = self
            .state
            .compare_exchange(
                LooperState::Ready as u8,
                LooperState::Loop as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if entered {
            jg_debug!("looper: enter loop");
            let mut events = [EpollEvent::empty(); MAX_EVENTS];
            'outer: loop {
                let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                    Ok(n) => n,
                    Err(nix::errno::Errno::EINTR) => 0,
                    Err(e) => {
                        jg_warn!("looper: epoll wait failed: {}", e);
                        break 'outer;
                    }
                };
                for ev in events.iter().take(n) {
                    let fd = ev.data() as RawFd;
                    let cb = self.fds.lock().unwrap().get(&fd).cloned();
                    if let Some(cb) = cb {
                        cb(fd, ev.events().bits() as u32);
                    }
                }
                if self.state() == LooperState::Stopping {
                    jg_debug!("looper: stop requested, leaving loop");
                    break;
                }
            }
        }
        self.state
            .store(LooperState::Terminated as u8, Ordering::SeqCst);
        CURRENT_LOOPER.with(|c| c.borrow_mut().take());
        Ok(())
    }

    /// Request the loop to stop; callable from any thread
    pub fn stop(&self) -> JgResult<()> {
        let prev = LooperState::from(
            self.state
                .swap(LooperState::Stopping as u8, Ordering::SeqCst),
        );
        match prev {
            LooperState::Ready | LooperState::Loop => {
                let v: u64 = 1;
                let r = unsafe {
                    libc::write(
                        self.ctlfd,
                        &v as *const u64 as *const libc::c_void,
                        std::mem::size_of::<u64>(),
                    )
                };
                if r != std::mem::size_of::<u64>() as isize {
                    let errno = unsafe { *libc::__errno_location() };
                    self.state.store(prev as u8, Ordering::SeqCst);
                    return Err(JgError::Os(errno));
                }
            }
            LooperState::Terminated => {
                // stay terminated
                self.state
                    .store(LooperState::Terminated as u8, Ordering::SeqCst);
            }
            LooperState::Stopping => {}
        }
        Ok(())
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        if self.ctlfd >= 0 {
            unsafe {
                libc::close(self.ctlfd);
            }
            self.ctlfd = -1;
        }
    }
}
