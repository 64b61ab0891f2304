//! The job-graph executor
//!
//! `Executor::run(target)` evaluates the minimal sub-DAG of the target's
//! ancestors ("participants"). Scheduling is message-driven: the run loop
//! drains the executor's own priority queue on the calling thread, and is
//! the only mutator of wait-counts, outputs and the ready queue. Workers
//! run one job each and post a terminal message; listener traffic of the
//! worker threads flows through a dedicated looper thread.
//!
//! Output lifecycle: a finished job's output is shared with every
//! dependent as an `Arc`. The executor's own reference is dropped when the
//! last dependent's terminal message has been processed, so by then the
//! dependents' input clones are gone and the output is freed exactly once.

use std::collections::VecDeque;
use std::sync::Arc;

use jobgraph_core::error::{JgError, JgResult};
use jobgraph_core::graph::{Graph, VertexId};
use jobgraph_core::{jg_debug, jg_trace};

use jobgraph_runtime::handler::Handler;
use jobgraph_runtime::looper::Looper;
use jobgraph_runtime::msg::{Msg, MsgBody, MsgPayload, MsgPriority};
use jobgraph_runtime::msgq::MsgQueue;
use jobgraph_runtime::threadex::{Listener, ThreadEx};

use crate::job::{Job, JobInput};

// Scheduler message codes
const CODE_START: i32 = 0;
const CODE_ERROR: i32 = 1;
const CODE_JOB_END: i32 = 2;
const CODE_JOB_ERROR: i32 = 3;

/// Wait-count sentinel: vertex takes no part in the current run
const NOT_PARTICIPANT: i32 = -1;

/// Per-vertex scheduling state, recomputed for every run
struct JobState<T> {
    job: Job<T>,

    /// Incoming edges still waiting for an output; [`NOT_PARTICIPANT`]
    /// outside the current sub-DAG
    wjcnt: i32,

    output: Option<Arc<T>>,

    /// Dependents that have accepted the output but not yet consumed it
    consumers: i32,

    /// Transient traversal mark
    flag: bool,

    worker: Option<ThreadEx<(), ()>>,
}

impl<T> JobState<T> {
    fn new(job: Job<T>) -> Self {
        JobState {
            job,
            wjcnt: NOT_PARTICIPANT,
            output: None,
            consumers: 0,
            flag: false,
            worker: None,
        }
    }
}

/// Depth-first walk over the target's ancestors, one visit per vertex
fn walk_participants<T>(
    g: &mut Graph<JobState<T>>,
    target: VertexId,
    mut f: impl FnMut(&mut Graph<JobState<T>>, VertexId),
) {
    let all: Vec<VertexId> = g.vertices().collect();
    for v in all {
        g.data_mut(v).flag = false;
    }
    let mut stack = vec![target];
    while let Some(v) = stack.pop() {
        if g.data(v).flag {
            continue;
        }
        f(g, v);
        g.data_mut(v).flag = true;
        let ups: Vec<VertexId> = g.incoming(v).iter().map(|&e| g.edge(e).from).collect();
        stack.extend(ups);
    }
}

/// Schedules a DAG of dependent jobs over at most `maxjobs` workers
pub struct Executor<T> {
    graph: Graph<JobState<T>>,
    looper: Arc<Looper>,
    handler: Arc<Handler>,
    maxjobs: u32,
    ready: VecDeque<VertexId>,
    running: u32,
    err: Option<JgError>,
}

impl<T: Send + Sync + 'static> Executor<T> {
    /// Create an executor running at most `maxjobs` jobs in parallel
    ///
    /// `maxjobs == 0` means unbounded.
    pub fn new(maxjobs: u32) -> JgResult<Executor<T>> {
        let looper = Looper::start_thread()?;
        let handler = Handler::new(&looper, None, None)?;
        Ok(Executor {
            graph: Graph::new(),
            looper,
            handler,
            maxjobs: if maxjobs == 0 { u32::MAX } else { maxjobs },
            ready: VecDeque::new(),
            running: 0,
            err: None,
        })
    }

    /// Add a job; returns the vertex standing for it
    pub fn add_job(&mut self, job: Job<T>) -> JgResult<VertexId> {
        let name = job.name().to_owned();
        self.graph.add_vertex(&name, JobState::new(job))
    }

    /// Replace the job owned by `v`
    pub fn set_job(&mut self, v: VertexId, job: Job<T>) -> JgResult<()> {
        if !self.graph.has_vertex(v) {
            return Err(JgError::InvalidArgument);
        }
        self.graph.data_mut(v).job = job;
        Ok(())
    }

    /// Declare that `job` needs the output of `depends_on`
    pub fn add_dependency(&mut self, job: VertexId, depends_on: VertexId) -> JgResult<()> {
        self.graph.add_edge(depends_on, job, 0.0).map(|_| ())
    }

    pub fn remove_dependency(&mut self, job: VertexId, depends_on: VertexId) -> JgResult<()> {
        self.graph.remove_edge(depends_on, job)
    }

    /// Look a job up by name (linear scan)
    pub fn find_job(&self, name: &str) -> Option<VertexId> {
        self.graph.find_vertex(name)
    }

    /// Run `target` and everything it depends on; blocks until finished
    ///
    /// Fails up front with `InvalidArgument` when a cycle is reachable
    /// from `target` (no worker is spawned). A failing job latches the
    /// run's error: in-flight jobs drain, no new ones start, every stored
    /// output is reclaimed and the first failure code is returned.
    pub fn run(&mut self, target: VertexId) -> JgResult<Arc<T>> {
        if !self.graph.has_vertex(target) {
            return Err(JgError::InvalidArgument);
        }
        if self.has_cycle(target) {
            jg_debug!(
                "executor: cycle reachable from '{}', run rejected",
                self.graph.name(target)
            );
            return Err(JgError::InvalidArgument);
        }

        // fresh queue per run: stragglers of a past run cannot pollute it
        let mq = Arc::new(MsgQueue::new()?);
        self.prepare(target);
        self.running = 0;
        self.err = None;

        mq.enqueue(Msg::data(MsgPriority::VeryHigh, CODE_START, None))
            .unwrap_or_else(|_| unreachable!("scheduler queue is unbounded"));

        loop {
            let msg = mq.dequeue();
            let r = match msg.into_body() {
                MsgBody::Data { code, payload } => self.on_message(&mq, target, code, payload),
                MsgBody::Exec(_) => Err(JgError::InvalidArgument),
            };
            if let Err(e) = r {
                // unrecoverable scheduling failure; latch through the queue
                let _ = mq.enqueue(Msg::data(
                    MsgPriority::VeryHigh,
                    CODE_ERROR,
                    Some(Box::new(e)),
                ));
            }
            if self.running == 0 && mq.is_empty() {
                break;
            }
        }
        self.ready.clear();

        if self.err.is_none() {
            let out = self
                .graph
                .data_mut(target)
                .output
                .take()
                .expect("target output present on success");
            return Ok(out);
        }

        // error path: reclaim whatever outputs the drain left behind
        walk_participants(&mut self.graph, target, |g, v| {
            let st = g.data_mut(v);
            st.output = None;
            st.worker = None;
        });
        Err(self.err.take().expect("latched error"))
    }

    fn on_message(
        &mut self,
        mq: &Arc<MsgQueue>,
        target: VertexId,
        code: i32,
        payload: Option<MsgPayload>,
    ) -> JgResult<()> {
        match code {
            CODE_START => self.on_start(mq, target),
            CODE_ERROR => {
                let e = payload
                    .and_then(|p| p.downcast::<JgError>().ok())
                    .map(|b| *b)
                    .unwrap_or(JgError::InvalidState);
                self.err.get_or_insert(e);
                Ok(())
            }
            CODE_JOB_END => {
                let boxed = payload
                    .and_then(|p| p.downcast::<(VertexId, T)>().ok())
                    .ok_or(JgError::InvalidArgument)?;
                let (v, out) = *boxed;
                self.on_job_end(mq, v, out)
            }
            CODE_JOB_ERROR => {
                let boxed = payload
                    .and_then(|p| p.downcast::<(VertexId, i32)>().ok())
                    .ok_or(JgError::InvalidArgument)?;
                let (v, errcode) = *boxed;
                self.on_job_error(v, errcode)
            }
            _ => Err(JgError::InvalidArgument),
        }
    }

    /// Enqueue every zero-wait participant and dispatch
    fn on_start(&mut self, mq: &Arc<MsgQueue>, target: VertexId) -> JgResult<()> {
        let mut ready = std::mem::take(&mut self.ready);
        walk_participants(&mut self.graph, target, |g, v| {
            if g.data(v).wjcnt == 0 {
                ready.push_back(v);
            }
        });
        self.ready = ready;
        self.run_ready_jobs(mq)?;
        Ok(())
    }

    fn on_job_end(&mut self, mq: &Arc<MsgQueue>, v: VertexId, out: T) -> JgResult<()> {
        self.running -= 1;
        jg_debug!("executor: job '{}' finished", self.graph.name(v));
        {
            let st = self.graph.data_mut(v);
            st.worker = None;
            st.output = Some(Arc::new(out));
        }

        // hand the output to every participant dependent
        let downstream: Vec<VertexId> = self
            .graph
            .outgoing(v)
            .iter()
            .map(|&e| self.graph.edge(e).to)
            .collect();
        let mut handed = 0;
        for w in downstream {
            if self.graph.data(w).wjcnt < 0 {
                continue;
            }
            debug_assert!(self.graph.data(w).wjcnt > 0);
            handed += 1;
            let wst = self.graph.data_mut(w);
            wst.wjcnt -= 1;
            if wst.wjcnt == 0 {
                self.ready.push_back(w);
            }
        }
        self.graph.data_mut(v).consumers += handed;

        self.release_inputs(v);
        self.run_ready_jobs(mq)?;
        Ok(())
    }

    fn on_job_error(&mut self, v: VertexId, errcode: i32) -> JgResult<()> {
        self.running -= 1;
        jg_debug!(
            "executor: job '{}' failed with {}",
            self.graph.name(v),
            errcode
        );
        self.graph.data_mut(v).worker = None;
        self.err.get_or_insert(JgError::Job(errcode));
        self.release_inputs(v);
        Ok(())
    }

    /// Consume one reference on each upstream output; the last consumer
    /// drops the executor's stored `Arc`
    fn release_inputs(&mut self, v: VertexId) {
        let ups: Vec<VertexId> = self
            .graph
            .incoming(v)
            .iter()
            .map(|&e| self.graph.edge(e).from)
            .collect();
        for u in ups {
            jg_trace!("executor: consuming output of '{}'", self.graph.name(u));
            let ust = self.graph.data_mut(u);
            if ust.consumers <= 0 {
                continue;
            }
            ust.consumers -= 1;
            if ust.consumers == 0 {
                ust.output = None;
            }
        }
    }

    /// Dispatch ready jobs while worker slots are free
    ///
    /// Never dispatches once an error is latched.
    fn run_ready_jobs(&mut self, mq: &Arc<MsgQueue>) -> JgResult<usize> {
        if self.err.is_some() {
            return Ok(0);
        }
        let mut count = 0;
        while self.running < self.maxjobs && !self.ready.is_empty() {
            let v = self.ready.pop_front().expect("non-empty ready queue");
            debug_assert_eq!(self.graph.data(v).wjcnt, 0);

            let inputs = self.collect_inputs(v);
            let name = self.graph.name(v).to_owned();
            let run = Arc::clone(&self.graph.data(v).job.run);
            let mq = Arc::clone(mq);
            jg_debug!("executor: dispatching '{}'", name);

            let worker = ThreadEx::new(
                &name,
                &self.handler,
                MsgPriority::Normal,
                Listener::default(),
                (),
                move |_t| {
                    let r = run(&inputs);
                    // release input references before the terminal message
                    drop(inputs);
                    match r {
                        Ok(out) => {
                            mq.enqueue(Msg::data(
                                MsgPriority::Normal,
                                CODE_JOB_END,
                                Some(Box::new((v, out))),
                            ))
                            .unwrap_or_else(|_| unreachable!("scheduler queue is unbounded"));
                            Ok(())
                        }
                        Err(code) => {
                            mq.enqueue(Msg::data(
                                MsgPriority::VeryHigh,
                                CODE_JOB_ERROR,
                                Some(Box::new((v, code))),
                            ))
                            .unwrap_or_else(|_| unreachable!("scheduler queue is unbounded"));
                            Err(code)
                        }
                    }
                },
            );
            worker.start()?;
            self.graph.data_mut(v).worker = Some(worker);
            self.running += 1;
            count += 1;
        }
        Ok(count)
    }

    /// `(name, output)` pairs for every incoming edge of `v`
    fn collect_inputs(&self, v: VertexId) -> Vec<JobInput<T>> {
        self.graph
            .incoming(v)
            .iter()
            .map(|&e| {
                let u = self.graph.edge(e).from;
                JobInput {
                    name: Arc::from(self.graph.name(u)),
                    data: Arc::clone(
                        self.graph
                            .data(u)
                            .output
                            .as_ref()
                            .expect("upstream output ready at dispatch"),
                    ),
                }
            })
            .collect()
    }

    /// Iterative DFS over incoming edges with a path stack
    ///
    /// A vertex met again while on the current path closes a cycle.
    fn has_cycle(&mut self, target: VertexId) -> bool {
        let g = &mut self.graph;
        let all: Vec<VertexId> = g.vertices().collect();
        for v in all {
            g.data_mut(v).flag = false;
        }

        let mut vs: Vec<VertexId> = vec![target]; // path history
        let mut es = g.incoming(target).to_vec(); // edges to visit
        while let Some(e) = es.pop() {
            let (from, to) = {
                let edge = g.edge(e);
                (edge.from, edge.to)
            };
            // rewind the history to the edge's target vertex
            while let Some(&top) = vs.last() {
                if top == to {
                    break;
                }
                vs.pop();
            }
            if g.data(from).flag {
                if vs.contains(&from) {
                    return true;
                }
                continue;
            }
            g.data_mut(from).flag = true;
            vs.push(from);
            es.extend_from_slice(g.incoming(from));
        }
        false
    }

    /// Reset run state: participants get their wait-counts, the rest the
    /// not-a-participant sentinel
    fn prepare(&mut self, target: VertexId) {
        let all: Vec<VertexId> = self.graph.vertices().collect();
        for v in all {
            self.graph.data_mut(v).wjcnt = NOT_PARTICIPANT;
        }
        self.ready.clear();
        walk_participants(&mut self.graph, target, |g, v| {
            let n = g.incoming(v).len() as i32;
            let st = g.data_mut(v);
            st.wjcnt = n;
            st.output = None;
            st.consumers = 0;
            st.worker = None;
        });
    }
}

impl<T> Drop for Executor<T> {
    fn drop(&mut self) {
        let _ = self.looper.stop();
    }
}
