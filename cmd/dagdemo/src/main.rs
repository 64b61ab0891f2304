//! Job-graph demo
//!
//! Builds a twelve-job dependency network, runs it with four parallel
//! workers, then shows a cancelable worker publishing progress.

use std::thread;
use std::time::Duration;

use jobgraph::{Executor, Handler, Job, Listener, Looper, MsgPriority, ThreadEx};

fn make_job(name: &str) -> Job<String> {
    let label = name.to_owned();
    Job::new(name, move |inputs| {
        let deps: Vec<&str> = inputs.iter().map(|i| &*i.name).collect();
        println!("[job {}] running (inputs: {:?})", label, deps);
        thread::sleep(Duration::from_millis(50));
        Ok(format!("{}:done", label))
    })
}

fn run_dag() {
    println!("--- DAG execution ---\n");

    // Job network:
    //
    //              +-> D -----------+
    //              |                |
    //              +-> F ---+----+  |   +-> B
    //              |        |    |  |   |   |
    //              |        v    v  v   |   v
    // K -> J -> I -+-> G -> E -> [ A ] -+-> C
    //              |   ^            ^
    //              |   |            |
    //              +-> H            L
    let mut ex: Executor<String> = Executor::new(4).expect("executor");
    let names = ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J", "K", "L"];
    let mut vs = std::collections::HashMap::new();
    for n in names {
        vs.insert(n, ex.add_job(make_job(n)).expect("add job"));
    }
    for (job, dep) in [
        ("A", "D"), ("A", "E"), ("A", "F"), ("A", "L"),
        ("B", "A"),
        ("C", "B"), ("C", "A"),
        ("D", "I"),
        ("E", "F"), ("E", "G"),
        ("F", "I"),
        ("G", "I"), ("G", "H"),
        ("H", "I"),
        ("I", "J"),
        ("J", "K"),
    ] {
        ex.add_dependency(vs[job], vs[dep]).expect("add dependency");
    }

    let out = ex.run(vs["C"]).expect("run");
    println!("\ntarget output: {}\n", out);
}

fn run_worker_with_progress() {
    println!("--- Cancelable worker with progress ---\n");

    let ml = Looper::start_thread().expect("looper thread");
    let h = Handler::new(&ml, None, None).expect("handler");

    let listener: Listener<(), u64> = Listener {
        on_started: Some(Box::new(|t| println!("[{}] started", t.name()))),
        on_progress_init: Some(Box::new(|t, max| {
            println!("[{}] progress target: {}", t.name(), max)
        })),
        on_progress: Some(Box::new(|t, n| println!("[{}] progress: {}", t.name(), n))),
        on_done: Some(Box::new(|t, code| {
            println!("[{}] done (code {})", t.name(), code)
        })),
        ..Listener::default()
    };

    let worker = ThreadEx::new("crunch", &h, MsgPriority::Normal, listener, (), |t| {
        t.publish_progress_init(5);
        let mut acc = 0u64;
        for i in 1..=5 {
            if t.is_cancelled() {
                return Err(-1);
            }
            acc += i * i;
            t.publish_progress(i);
            thread::sleep(Duration::from_millis(40));
        }
        Ok(acc)
    });
    worker.start().expect("start worker");
    worker.join().expect("join worker");

    // terminal listener events are delivered on the looper thread
    while !worker.state().is_terminated() {
        thread::sleep(Duration::from_millis(5));
    }
    println!("result: {:?}\n", worker.take_result());

    ml.stop().expect("stop looper");
}

fn main() {
    println!("=== jobgraph demo ===\n");
    run_dag();
    run_worker_with_progress();
    println!("=== done ===");
}
