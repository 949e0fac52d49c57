//! Job execution: an MPSC queue drained by a dispatcher that runs each job
//! on its own named thread.
//!
//! Jobs are blocking-style but never issue an unbounded blocking syscall:
//! all socket waits go through bounded polls that re-check the shared
//! shutdown flag (exposed to jobs as [`TaskCtx`]), so an executor shuts
//! down promptly even with connections parked in keep-alive waits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};
use tracing::{debug, warn};

/// Stack size for job threads. Jobs keep their frames shallow (I/O loops
/// and header buffers), so a small stack is enough.
const JOB_STACK_SIZE: usize = 256 * 1024;

/// A unit of work created by the dispatcher.
pub(crate) type Job = Box<dyn FnOnce(&TaskCtx) + Send + 'static>;

/// Execution context handed to every job.
///
/// Carries the executor's shutdown flag; long waits inside jobs poll in
/// bounded slices and bail out once `cancelled()` reports true.
#[derive(Debug, Clone)]
pub(crate) struct TaskCtx {
    shutdown: Arc<AtomicBool>,
}

impl TaskCtx {
    pub(crate) fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        TaskCtx {
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Thread-backed job executor with a single-consumer dispatch loop.
///
/// `enqueue` hands a job to the dispatcher thread, which spawns it on a
/// fresh named thread. Dropping the executor enqueues the terminating
/// `None`, joins the dispatcher, and flips the shutdown flag that live
/// jobs observe through their [`TaskCtx`].
#[derive(Debug)]
pub(crate) struct Executor {
    tx: Sender<Option<Job>>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    job_name: &'static str,
}

impl Executor {
    pub(crate) fn new(name: &'static str, job_name: &'static str) -> Executor {
        let (tx, rx) = channel::<Option<Job>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let task_shutdown = shutdown.clone();

        let dispatcher = Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(Some(job)) = rx.recv() {
                    let ctx = TaskCtx {
                        shutdown: task_shutdown.clone(),
                    };
                    let spawned = Builder::new()
                        .name(job_name.to_string())
                        .stack_size(JOB_STACK_SIZE)
                        .spawn(move || job(&ctx));
                    if let Err(err) = spawned {
                        warn!(?err, "failed to spawn job thread");
                    }
                }
                debug!("dispatcher finished");
            })
            .expect("failed to spawn dispatcher thread");

        Executor {
            tx,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
            job_name,
        }
    }

    /// Queues a job for execution. Jobs enqueued after shutdown are dropped.
    pub(crate) fn enqueue<F>(&self, job: F)
    where
        F: FnOnce(&TaskCtx) + Send + 'static,
    {
        if self.tx.send(Some(Box::new(job))).is_err() {
            debug!(job = self.job_name, "executor is down, job dropped");
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.tx.send(None);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
