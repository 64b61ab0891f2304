//! Message handler: binds a message queue to a looper
//!
//! The handler owns an unbounded [`MsgQueue`] and registers its readiness
//! fd with a looper. Each readable event dequeues exactly one message and
//! dispatches it on the looper thread: exec messages run their closure,
//! data messages go to the user-provided handle function (or are logged
//! and dropped).

use std::any::Any;
use std::sync::{Arc, Weak};

use jobgraph_core::error::{JgError, JgResult};
use jobgraph_core::jg_warn;

use crate::looper::{Looper, EVENT_READ};
use crate::msg::{Msg, MsgBody, MsgPayload, MsgPriority};
use crate::msgq::MsgQueue;

/// User callback for data messages, invoked on the looper thread
pub type HandleFn = Box<dyn Fn(&Handler, i32, Option<MsgPayload>) + Send + Sync>;

/// Looper-bound dispatcher for one message queue
pub struct Handler {
    mq: Arc<MsgQueue>,
    looper: Arc<Looper>,
    tag: Option<Box<dyn Any + Send + Sync>>,
    handle: Option<HandleFn>,
}

impl Handler {
    /// Create a handler bound to `looper`
    ///
    /// `tag` is an opaque value owned by the handler (dropped with it);
    /// `handle` receives data messages, `None` installs the default that
    /// logs and drops them.
    pub fn new(
        looper: &Arc<Looper>,
        tag: Option<Box<dyn Any + Send + Sync>>,
        handle: Option<HandleFn>,
    ) -> JgResult<Arc<Handler>> {
        let mq = Arc::new(MsgQueue::new()?);
        let h = Arc::new(Handler {
            mq: Arc::clone(&mq),
            looper: Arc::clone(looper),
            tag,
            handle,
        });
        // Weak: the looper's callback table must not keep the handler alive
        let weak: Weak<Handler> = Arc::downgrade(&h);
        looper.add_fd(mq.readiness_fd(), EVENT_READ, move |_fd, _events| {
            if let Some(h) = weak.upgrade() {
                h.dispatch_one();
            }
        })?;
        Ok(h)
    }

    /// One message per readiness event
    fn dispatch_one(&self) {
        let msg = self.mq.dequeue();
        match msg.into_body() {
            MsgBody::Exec(run) => run(),
            MsgBody::Data { code, payload } => match &self.handle {
                Some(handle) => handle(self, code, payload),
                None => {
                    jg_warn!("data message without handle (code {}), dropped", code);
                }
            },
        }
    }

    #[inline]
    pub fn looper(&self) -> &Arc<Looper> {
        &self.looper
    }

    /// The opaque tag passed at creation
    pub fn tag(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.tag.as_deref()
    }

    /// Queue a data message at normal priority
    pub fn post_data(&self, code: i32, payload: Option<MsgPayload>) -> JgResult<()> {
        self.post_data_pri(code, payload, MsgPriority::Normal)
    }

    pub fn post_data_pri(
        &self,
        code: i32,
        payload: Option<MsgPayload>,
        pri: MsgPriority,
    ) -> JgResult<()> {
        self.mq
            .enqueue(Msg::data(pri, code, payload))
            .map_err(|_| JgError::QueueFull)
    }

    /// Queue a closure to run on the looper thread at normal priority
    pub fn post_exec(&self, run: impl FnOnce() + Send + 'static) -> JgResult<()> {
        self.post_exec_pri(run, MsgPriority::Normal)
    }

    pub fn post_exec_pri(
        &self,
        run: impl FnOnce() + Send + 'static,
        pri: MsgPriority,
    ) -> JgResult<()> {
        self.mq
            .enqueue(Msg::exec(pri, run))
            .map_err(|_| JgError::QueueFull)
    }

    /// Run `f` inline when already on the looper thread, else post it
    ///
    /// The inline fast path keeps reentrant scheduling correct: code that
    /// is already inside a dispatched message may not block on its own
    /// queue.
    pub fn exec_on(&self, run: impl FnOnce() + Send + 'static) -> JgResult<()> {
        if self.looper.is_current() {
            run();
            Ok(())
        } else {
            self.post_exec(run)
        }
    }

    /// Number of undispatched messages
    pub fn pending(&self) -> u32 {
        self.mq.len()
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.looper.del_fd(self.mq.readiness_fd());
    }
}
