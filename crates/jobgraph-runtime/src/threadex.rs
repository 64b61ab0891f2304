//! Cancelable worker thread with listener callbacks
//!
//! A `ThreadEx` runs one job function on a dedicated OS thread and reports
//! lifecycle events (started, progress, done, cancelling, cancelled)
//! through a [`Handler`], so listeners always run on the handler's looper
//! thread - never on the worker. Cancellation is cooperative: the job polls
//! [`ThreadEx::is_cancelled`] at safe points and surrenders.
//!
//! State machine:
//!
//! ```text
//! READY -> STARTED -> DONE      -> TERMINATED
//!             \
//!              -> CANCELLING -> CANCELLED -> TERMINATED_CANCELLED
//! READY -> CANCELLED -> TERMINATED_CANCELLED      (cancel before start)
//! ```
//!
//! The final TERMINATED transitions happen on the handler thread after the
//! terminal listener event is delivered, so a freshly finished worker may
//! be observed in DONE/CANCELLED for a moment.

use core::fmt;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use jobgraph_core::error::{JgError, JgResult};
use jobgraph_core::jg_debug;

use crate::handler::Handler;
use crate::msg::MsgPriority;

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TexState {
    Ready = 0,
    Started = 1,
    /// Cancel requested while running; the job has not surrendered yet
    Cancelling = 2,
    /// The job returned (result or error code recorded)
    Done = 3,
    /// The job surrendered to a cancel, or was cancelled before starting
    Cancelled = 4,
    /// Done and the terminal listener event was delivered
    Terminated = 5,
    /// Cancelled and the terminal listener event was delivered
    TerminatedCancelled = 6,
}

impl TexState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => TexState::Ready,
            1 => TexState::Started,
            2 => TexState::Cancelling,
            3 => TexState::Done,
            4 => TexState::Cancelled,
            5 => TexState::Terminated,
            _ => TexState::TerminatedCancelled,
        }
    }

    /// Terminal states (listener delivery included)
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, TexState::Terminated | TexState::TerminatedCancelled)
    }

    /// States on the cancellation path
    #[inline]
    pub const fn is_cancel(&self) -> bool {
        matches!(
            self,
            TexState::Cancelling | TexState::Cancelled | TexState::TerminatedCancelled
        )
    }
}

impl fmt::Display for TexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TexState::Ready => "READY",
            TexState::Started => "STARTED",
            TexState::Cancelling => "CANCELLING",
            TexState::Done => "DONE",
            TexState::Cancelled => "CANCELLED",
            TexState::Terminated => "TERMINATED",
            TexState::TerminatedCancelled => "TERMINATED_CANCELLED",
        };
        write!(f, "{}", s)
    }
}

type EventCb<A, R> = Box<dyn Fn(&ThreadEx<A, R>) + Send + Sync>;
type EventCbI32<A, R> = Box<dyn Fn(&ThreadEx<A, R>, i32) + Send + Sync>;
type EventCbBool<A, R> = Box<dyn Fn(&ThreadEx<A, R>, bool) + Send + Sync>;
type EventCbU64<A, R> = Box<dyn Fn(&ThreadEx<A, R>, u64) + Send + Sync>;

/// Lifecycle callbacks; every field is optional
///
/// All callbacks are dispatched on the handler's looper thread.
pub struct Listener<A, R> {
    pub on_started: Option<EventCb<A, R>>,
    /// `(worker, errcode)` - errcode 0 for success
    pub on_done: Option<EventCbI32<A, R>>,
    /// `(worker, started)` - whether the job had started when cancel hit
    pub on_cancelling: Option<EventCbBool<A, R>>,
    pub on_cancelled: Option<EventCbI32<A, R>>,
    pub on_progress_init: Option<EventCbU64<A, R>>,
    pub on_progress: Option<EventCbU64<A, R>>,
}

impl<A, R> Default for Listener<A, R> {
    fn default() -> Self {
        Listener {
            on_started: None,
            on_done: None,
            on_cancelling: None,
            on_cancelled: None,
            on_progress_init: None,
            on_progress: None,
        }
    }
}

type RunFn<A, R> = Box<dyn FnOnce(&ThreadEx<A, R>) -> Result<R, i32> + Send>;

struct TexInner<A, R> {
    name: String,
    handler: Arc<Handler>,
    /// Message priority for listener event delivery
    pri: MsgPriority,
    listener: Listener<A, R>,
    arg: A,
    run: Mutex<Option<RunFn<A, R>>>,
    state: AtomicU8,
    errcode: AtomicI32,
    result: Mutex<Option<R>>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Cancelable worker thread
///
/// Cheap to clone; clones share the same worker.
pub struct ThreadEx<A, R> {
    inner: Arc<TexInner<A, R>>,
}

impl<A, R> Clone for ThreadEx<A, R> {
    fn clone(&self) -> Self {
        ThreadEx {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, R> ThreadEx<A, R>
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    /// Create a worker in READY state
    ///
    /// `arg` is owned by the worker and dropped with it; `run` receives the
    /// worker handle for cancellation polling and progress publication and
    /// returns either a result or a negative error code.
    pub fn new(
        name: &str,
        handler: &Arc<Handler>,
        pri: MsgPriority,
        listener: Listener<A, R>,
        arg: A,
        run: impl FnOnce(&ThreadEx<A, R>) -> Result<R, i32> + Send + 'static,
    ) -> ThreadEx<A, R> {
        ThreadEx {
            inner: Arc::new(TexInner {
                name: name.to_owned(),
                handler: Arc::clone(handler),
                pri,
                listener,
                arg,
                run: Mutex::new(Some(Box::new(run))),
                state: AtomicU8::new(TexState::Ready as u8),
                errcode: AtomicI32::new(0),
                result: Mutex::new(None),
                join: Mutex::new(None),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn arg(&self) -> &A {
        &self.inner.arg
    }

    #[inline]
    pub fn handler(&self) -> &Arc<Handler> {
        &self.inner.handler
    }

    #[inline]
    pub fn state(&self) -> TexState {
        TexState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Error code of a failed run (0 otherwise)
    #[inline]
    pub fn err_code(&self) -> i32 {
        self.inner.errcode.load(Ordering::SeqCst)
    }

    /// True once cancellation was requested; poll this from `run`
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancel()
    }

    /// Spawn the worker thread
    ///
    /// Fails with `InvalidState` unless the worker is READY.
    pub fn start(&self) -> JgResult<()> {
        self.transition(TexState::Ready, TexState::Started)?;
        let run = self.take_run();
        let tex = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("jg-tex-{}", self.inner.name))
            .spawn(move || thread_main(tex, run));
        match spawned {
            Ok(jh) => {
                *self.inner.join.lock().unwrap() = Some(jh);
                Ok(())
            }
            Err(e) => {
                self.inner
                    .state
                    .store(TexState::Ready as u8, Ordering::SeqCst);
                Err(JgError::Os(e.raw_os_error().unwrap_or(libc::EAGAIN)))
            }
        }
    }

    /// Run the job synchronously on the calling thread
    ///
    /// Listener events still go through the handler.
    pub fn start_sync(&self) -> JgResult<()> {
        self.transition(TexState::Ready, TexState::Started)?;
        let run = self.take_run();
        thread_main(self.clone(), run);
        Ok(())
    }

    /// Request cooperative cancellation
    ///
    /// A READY worker is cancelled outright; a STARTED one moves to
    /// CANCELLING and keeps running until its job polls and surrenders.
    pub fn cancel(&self) -> JgResult<()> {
        if self
            .transition(TexState::Ready, TexState::Cancelled)
            .is_ok()
        {
            // never started
            self.post_cancelling_event(false);
            self.post_cancelled_event();
            return Ok(());
        }
        if self
            .transition(TexState::Started, TexState::Cancelling)
            .is_ok()
        {
            self.post_cancelling_event(true);
            return Ok(());
        }
        Err(JgError::InvalidState)
    }

    /// Wait for the worker thread to exit
    pub fn join(&self) -> JgResult<()> {
        let jh = self.inner.join.lock().unwrap().take();
        match jh {
            Some(jh) => jh.join().map_err(|_| JgError::InvalidState),
            None => Err(JgError::InvalidState),
        }
    }

    /// Take the result of a successful run
    ///
    /// `None` while running and after cancellation or failure.
    pub fn take_result(&self) -> Option<R> {
        self.inner.result.lock().unwrap().take()
    }

    /// Report the upper progress bound; call once from `run`
    pub fn publish_progress_init(&self, max: u64) {
        let tex = self.clone();
        let _ = self.inner.handler.post_exec_pri(
            move || {
                if let Some(cb) = &tex.inner.listener.on_progress_init {
                    cb(&tex, max);
                }
            },
            self.inner.pri,
        );
    }

    /// Report progress from inside `run`
    pub fn publish_progress(&self, prog: u64) {
        let tex = self.clone();
        let _ = self.inner.handler.post_exec_pri(
            move || {
                if let Some(cb) = &tex.inner.listener.on_progress {
                    cb(&tex, prog);
                }
            },
            self.inner.pri,
        );
    }

    fn transition(&self, from: TexState, to: TexState) -> JgResult<()> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| JgError::InvalidState)
    }

    fn take_run(&self) -> RunFn<A, R> {
        self.inner
            .run
            .lock()
            .unwrap()
            .take()
            .expect("run function present in READY state")
    }

    fn post_started_event(&self) {
        let tex = self.clone();
        let _ = self.inner.handler.post_exec_pri(
            move || {
                if let Some(cb) = &tex.inner.listener.on_started {
                    cb(&tex);
                }
            },
            self.inner.pri,
        );
    }

    fn post_cancelling_event(&self, started: bool) {
        let tex = self.clone();
        let _ = self.inner.handler.post_exec_pri(
            move || {
                if let Some(cb) = &tex.inner.listener.on_cancelling {
                    cb(&tex, started);
                }
            },
            self.inner.pri,
        );
    }

    /// Terminal event: listener first, then the final state advance
    fn post_cancelled_event(&self) {
        let tex = self.clone();
        let _ = self.inner.handler.post_exec_pri(
            move || {
                let code = tex.err_code();
                if let Some(cb) = &tex.inner.listener.on_cancelled {
                    cb(&tex, code);
                }
                tex.inner
                    .state
                    .store(TexState::TerminatedCancelled as u8, Ordering::SeqCst);
            },
            self.inner.pri,
        );
    }

    /// Terminal event: listener first, then the final state advance
    fn post_done_event(&self) {
        let tex = self.clone();
        let _ = self.inner.handler.post_exec_pri(
            move || {
                let code = tex.err_code();
                if let Some(cb) = &tex.inner.listener.on_done {
                    cb(&tex, code);
                }
                tex.inner
                    .state
                    .store(TexState::Terminated as u8, Ordering::SeqCst);
            },
            self.inner.pri,
        );
    }
}

/// Worker thread body (also the `start_sync` body)
fn thread_main<A, R>(tex: ThreadEx<A, R>, run: RunFn<A, R>)
where
    A: Send + Sync + 'static,
    R: Send + 'static,
{
    jg_debug!("threadex[{}]: started", tex.name());
    tex.post_started_event();

    let outcome = run(&tex);
    let code = match &outcome {
        Ok(_) => 0,
        Err(c) => *c,
    };
    tex.inner.errcode.store(code, Ordering::SeqCst);

    if tex
        .transition(TexState::Cancelling, TexState::Cancelled)
        .is_ok()
    {
        // surrendered to a cancel; any produced result is discarded
        jg_debug!("threadex[{}]: cancelled", tex.name());
        tex.post_cancelled_event();
        return;
    }

    if let Ok(r) = outcome {
        *tex.inner.result.lock().unwrap() = Some(r);
    }
    let _ = tex.transition(TexState::Started, TexState::Done);
    jg_debug!("threadex[{}]: done (code {})", tex.name(), code);
    tex.post_done_event();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::looper::Looper;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records listener events; shared through the worker's arg
    #[derive(Default)]
    struct Recorder {
        events: StdMutex<Vec<TexState>>,
        progress: AtomicI32,
    }

    impl Recorder {
        fn push(&self, s: TexState) {
            self.events.lock().unwrap().push(s);
        }
        fn events(&self) -> Vec<TexState> {
            self.events.lock().unwrap().clone()
        }
    }

    fn recording_listener() -> Listener<Arc<Recorder>, i32> {
        Listener {
            on_started: Some(Box::new(|t| t.arg().push(TexState::Started))),
            on_done: Some(Box::new(|t, _code| t.arg().push(TexState::Done))),
            on_cancelling: Some(Box::new(|t, _started| t.arg().push(TexState::Cancelling))),
            on_cancelled: Some(Box::new(|t, _code| t.arg().push(TexState::Cancelled))),
            on_progress_init: Some(Box::new(|t, _max| {
                t.arg().progress.fetch_add(1000, Ordering::SeqCst);
            })),
            on_progress: Some(Box::new(|t, _n| {
                t.arg().progress.fetch_add(1, Ordering::SeqCst);
            })),
        }
    }

    fn wait_terminated(t: &ThreadEx<Arc<Recorder>, i32>) {
        let mut retry = 1000;
        while !t.state().is_terminated() && retry > 0 {
            thread::sleep(Duration::from_millis(1));
            retry -= 1;
        }
        assert!(t.state().is_terminated(), "stuck in {}", t.state());
    }

    fn fixture() -> (Arc<Looper>, Arc<Handler>) {
        let ml = Looper::start_thread().unwrap();
        let h = Handler::new(&ml, None, None).unwrap();
        (ml, h)
    }

    #[test]
    fn test_successful_run() {
        let (ml, h) = fixture();
        let rec = Arc::new(Recorder::default());

        let yt = ThreadEx::new(
            "ok",
            &h,
            MsgPriority::Normal,
            recording_listener(),
            Arc::clone(&rec),
            |t| {
                t.publish_progress_init(100);
                Ok(7)
            },
        );
        yt.start().unwrap();
        yt.join().unwrap();
        wait_terminated(&yt);

        assert_eq!(yt.state(), TexState::Terminated);
        assert_eq!(yt.err_code(), 0);
        assert_eq!(yt.take_result(), Some(7));
        assert_eq!(rec.events(), vec![TexState::Started, TexState::Done]);
        assert_eq!(rec.progress.load(Ordering::SeqCst), 1000);
        ml.stop().unwrap();
    }

    #[test]
    fn test_start_sync_runs_inline() {
        let (ml, h) = fixture();
        let rec = Arc::new(Recorder::default());
        let yt = ThreadEx::new(
            "sync",
            &h,
            MsgPriority::Normal,
            recording_listener(),
            Arc::clone(&rec),
            |_t| Ok(11),
        );
        yt.start_sync().unwrap();
        // result is already stored when start_sync returns
        assert_eq!(yt.take_result(), Some(11));
        wait_terminated(&yt);
        assert_eq!(rec.events(), vec![TexState::Started, TexState::Done]);
        ml.stop().unwrap();
    }

    #[test]
    fn test_failed_run_reports_code() {
        let (ml, h) = fixture();
        let rec = Arc::new(Recorder::default());
        let yt = ThreadEx::new(
            "fail",
            &h,
            MsgPriority::Normal,
            recording_listener(),
            Arc::clone(&rec),
            |_t| Err(-3),
        );
        yt.start().unwrap();
        yt.join().unwrap();
        wait_terminated(&yt);

        assert_eq!(yt.state(), TexState::Terminated);
        assert_eq!(yt.err_code(), -3);
        assert_eq!(yt.take_result(), None);
        assert_eq!(rec.events(), vec![TexState::Started, TexState::Done]);
        ml.stop().unwrap();
    }

    #[test]
    fn test_cancel_running_job() {
        let (ml, h) = fixture();
        let rec = Arc::new(Recorder::default());
        let yt = ThreadEx::new(
            "cancel",
            &h,
            MsgPriority::Normal,
            recording_listener(),
            Arc::clone(&rec),
            |t| {
                for _ in 0..1000 {
                    if t.is_cancelled() {
                        return Err(-1);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(0)
            },
        );
        yt.start().unwrap();
        // let the loop spin at least once
        thread::sleep(Duration::from_millis(20));
        yt.cancel().unwrap();
        yt.join().unwrap();
        wait_terminated(&yt);

        assert_eq!(yt.state(), TexState::TerminatedCancelled);
        assert_eq!(yt.take_result(), None);
        assert_eq!(
            rec.events(),
            vec![TexState::Started, TexState::Cancelling, TexState::Cancelled]
        );
        ml.stop().unwrap();
    }

    #[test]
    fn test_cancel_before_start() {
        let (ml, h) = fixture();
        let rec = Arc::new(Recorder::default());
        let yt = ThreadEx::new(
            "early",
            &h,
            MsgPriority::Normal,
            recording_listener(),
            Arc::clone(&rec),
            |_t| Ok(0),
        );
        yt.cancel().unwrap();
        wait_terminated(&yt);
        assert_eq!(yt.state(), TexState::TerminatedCancelled);
        assert_eq!(
            rec.events(),
            vec![TexState::Cancelling, TexState::Cancelled]
        );
        // starting a cancelled worker is rejected
        assert!(matches!(yt.start(), Err(JgError::InvalidState)));
        ml.stop().unwrap();
    }

    #[test]
    fn test_start_twice_rejected() {
        let (ml, h) = fixture();
        let yt: ThreadEx<(), i32> = ThreadEx::new(
            "twice",
            &h,
            MsgPriority::Normal,
            Listener::default(),
            (),
            |_t| {
                thread::sleep(Duration::from_millis(30));
                Ok(0)
            },
        );
        yt.start().unwrap();
        assert!(matches!(yt.start(), Err(JgError::InvalidState)));
        yt.join().unwrap();
        ml.stop().unwrap();
    }

    #[test]
    fn test_progress_events() {
        let (ml, h) = fixture();
        let rec = Arc::new(Recorder::default());
        let yt = ThreadEx::new(
            "prog",
            &h,
            MsgPriority::Normal,
            recording_listener(),
            Arc::clone(&rec),
            |t| {
                t.publish_progress_init(3);
                for i in 0..3 {
                    t.publish_progress(i + 1);
                }
                Ok(0)
            },
        );
        yt.start().unwrap();
        yt.join().unwrap();
        wait_terminated(&yt);
        assert_eq!(rec.progress.load(Ordering::SeqCst), 1003);
        ml.stop().unwrap();
    }

    #[test]
    fn test_many_workers() {
        let (ml, h) = fixture();
        let mut workers = Vec::new();
        for i in 0..25 {
            let rec = Arc::new(Recorder::default());
            let yt = ThreadEx::new(
                &format!("w{}", i),
                &h,
                MsgPriority::Normal,
                recording_listener(),
                rec,
                move |t| {
                    for _ in 0..200 {
                        if t.is_cancelled() {
                            return Err(-1);
                        }
                        thread::sleep(Duration::from_millis(2));
                    }
                    Ok(i)
                },
            );
            yt.start().unwrap();
            workers.push(yt);
        }
        for (i, yt) in workers.iter().enumerate() {
            if i % 3 != 0 {
                let _ = yt.cancel();
            }
        }
        for yt in &workers {
            yt.join().unwrap();
        }
        for (i, yt) in workers.iter().enumerate() {
            wait_terminated(yt);
            if i % 3 != 0 {
                assert_eq!(yt.state(), TexState::TerminatedCancelled);
                assert_eq!(yt.take_result(), None);
            } else {
                assert_eq!(yt.state(), TexState::Terminated);
                assert_eq!(yt.take_result(), Some(i as i32));
            }
        }
        ml.stop().unwrap();
    }
}
