//! Dispatchers — where a resumed task runs.
//!
//! A [`Dispatcher`] decides on which thread (or inline on the resuming
//! thread) a [`Runnable`] executes. The runtime ships:
//!
//! * [`PoolDispatcher`] — a fixed pool of named worker threads fed from a
//!   single injection queue. [`Dispatchers::default_pool`] and
//!   [`Dispatchers::io`] are process-wide pools initialized on first use.
//! * [`limited_parallelism`] — a view over another dispatcher that admits
//!   at most `n` concurrently running tasks.
//! * [`Unconfined`] — runs work inline on whichever thread resumes it,
//!   through a thread-local event loop that bounds stack depth.
//! * [`StepDispatcher`] — a deterministic, manually-stepped dispatcher for
//!   tests.
//!
//! Runnables submitted from one thread to one dispatcher execute in
//! submission order.

mod limited;
mod pool;
mod step;
mod unconfined;

pub use limited::limited_parallelism;
pub use pool::{Dispatchers, PoolDispatcher};
pub use step::StepDispatcher;
pub use unconfined::Unconfined;

use crate::job::JobHandle;

// ---------------------------------------------------------------------------
// Runnable
// ---------------------------------------------------------------------------

/// A unit of work handed to a dispatcher.
///
/// Carries the job the work belongs to (if any) so a closed dispatcher can
/// cancel it before falling back to another executor.
pub struct Runnable {
    job: Option<JobHandle>,
    work: Box<dyn FnOnce() + Send + 'static>,
}

impl Runnable {
    /// Wrap a plain closure.
    pub fn new<F: FnOnce() + Send + 'static>(work: F) -> Self {
        Self {
            job: None,
            work: Box::new(work),
        }
    }

    /// Wrap a closure that runs on behalf of `job`.
    pub fn for_job<F: FnOnce() + Send + 'static>(job: JobHandle, work: F) -> Self {
        Self {
            job: Some(job),
            work: Box::new(work),
        }
    }

    /// The job this work belongs to, if known.
    pub fn job(&self) -> Option<&JobHandle> {
        self.job.as_ref()
    }

    /// Execute the work, consuming the runnable.
    pub fn run(self) {
        (self.work)();
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable")
            .field("job", &self.job.as_ref().map(|j| j.id()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// A scheduler for task resumptions.
pub trait Dispatcher: Send + Sync {
    /// Human-readable name, used in thread names and diagnostics.
    fn name(&self) -> &str;

    /// Whether work must go through [`dispatch`](Dispatcher::dispatch) at
    /// all. Inline dispatchers return `false` and run resumptions on the
    /// resuming thread.
    fn is_dispatch_needed(&self) -> bool {
        true
    }

    /// Submit work. Must eventually run `runnable` unless the executor is
    /// closed, in which case the runnable's job is cancelled and the work
    /// is re-routed so cleanup can proceed.
    fn dispatch(&self, runnable: Runnable);
}
