//! Fixed worker-thread pools.
//!
//! A [`PoolDispatcher`] owns a set of named OS worker threads fed from a
//! single injection queue. Work submitted from one thread executes in
//! submission order (single queue, FIFO pop). There is deliberately no
//! work stealing; the pool is a plain executor.
//!
//! [`Dispatchers`] exposes the process-wide pools, initialized on first
//! reference and never torn down: a compute pool sized to the CPU count
//! and a wider pool for blocking work. A shut-down pool cancels the job
//! of anything submitted to it and re-routes the work to the blocking
//! pool so cleanup code still runs.

use crossbeam_channel::{self as cb};
use once_cell::sync::Lazy;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use super::{Dispatcher, Runnable, Unconfined};
use crate::error::Cancelled;

// ---------------------------------------------------------------------------
// PoolDispatcher
// ---------------------------------------------------------------------------

struct PoolState {
    sender: Option<cb::Sender<Runnable>>,
    workers: Vec<thread::JoinHandle<()>>,
}

/// A fixed pool of worker threads over one FIFO injection queue.
pub struct PoolDispatcher {
    name: String,
    worker_count: usize,
    state: Mutex<PoolState>,
    shutdown: AtomicBool,
    completed: Arc<AtomicUsize>,
    /// The process-wide fallback pool runs rejected work inline instead of
    /// re-routing to itself.
    is_fallback: bool,
}

impl PoolDispatcher {
    /// Create a pool with `workers` threads named `{name}-{index}`.
    /// Passing `0` defaults to the number of available CPUs.
    pub fn new(name: impl Into<String>, workers: usize) -> Arc<Self> {
        Self::build(name.into(), workers, false)
    }

    /// A single-threaded pool; everything dispatched to it runs on the one
    /// thread, in submission order.
    pub fn single(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), 1, false)
    }

    fn build(name: String, workers: usize, is_fallback: bool) -> Arc<Self> {
        let workers = if workers == 0 {
            num_cpus::get().max(1)
        } else {
            workers
        };
        let (tx, rx) = cb::unbounded::<Runnable>();
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let rx = rx.clone();
            let completed = Arc::clone(&completed);
            let thread_name = format!("{name}-{index}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    // Drains remaining queued work even after the sender is
                    // dropped, then exits on disconnect.
                    while let Ok(runnable) = rx.recv() {
                        if catch_unwind(AssertUnwindSafe(|| runnable.run())).is_err() {
                            tracing::error!(worker = %thread_name, "runnable panicked");
                        }
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Arc::new(Self {
            name,
            worker_count: workers,
            state: Mutex::new(PoolState {
                sender: Some(tx),
                workers: handles,
            }),
            shutdown: AtomicBool::new(false),
            completed,
            is_fallback,
        })
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of runnables executed so far.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Shut the pool down: already queued work is drained, new work is
    /// rejected (its job cancelled, the runnable re-routed to the blocking
    /// pool). Joins the workers; do not call from a worker thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let workers = {
            let mut state = self.state.lock().unwrap();
            state.sender = None;
            std::mem::take(&mut state.workers)
        };
        for handle in workers {
            let _ = handle.join();
        }
        tracing::debug!(pool = %self.name, "dispatcher shut down");
    }

    fn reject(&self, runnable: Runnable) {
        if let Some(job) = runnable.job() {
            job.cancel_with(Cancelled::new("dispatcher was shut down"));
        }
        if self.is_fallback {
            // Nowhere further to route; run inline so cleanup proceeds.
            runnable.run();
        } else {
            Dispatchers::io().dispatch(runnable);
        }
    }
}

impl Dispatcher for PoolDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, runnable: Runnable) {
        if self.shutdown.load(Ordering::Acquire) {
            self.reject(runnable);
            return;
        }
        let sender = self.state.lock().unwrap().sender.clone();
        match sender {
            Some(tx) => {
                if let Err(err) = tx.send(runnable) {
                    self.reject(err.0);
                }
            }
            None => self.reject(runnable),
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide dispatchers
// ---------------------------------------------------------------------------

static DEFAULT_POOL: Lazy<Arc<PoolDispatcher>> =
    Lazy::new(|| PoolDispatcher::build("strand-default".into(), num_cpus::get().max(2), false));

static IO_POOL: Lazy<Arc<PoolDispatcher>> = Lazy::new(|| {
    let width = (num_cpus::get() * 4).max(8);
    PoolDispatcher::build("strand-io".into(), width, true)
});

static UNCONFINED: Lazy<Arc<Unconfined>> = Lazy::new(|| Arc::new(Unconfined::new()));

/// Accessors for the process-wide dispatchers. Initialized on first
/// reference; never torn down.
pub struct Dispatchers;

impl Dispatchers {
    /// The CPU-sized compute pool.
    pub fn default_pool() -> Arc<dyn Dispatcher> {
        DEFAULT_POOL.clone()
    }

    /// The wider pool for blocking work; also the fallback target for
    /// rejected dispatches.
    pub fn io() -> Arc<dyn Dispatcher> {
        IO_POOL.clone()
    }

    /// The inline dispatcher: resumptions run on whichever thread resumes
    /// them.
    pub fn unconfined() -> Arc<dyn Dispatcher> {
        UNCONFINED.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
