//! Deterministic manually-stepped dispatcher.
//!
//! [`StepDispatcher`] queues everything and runs nothing until the test
//! driver asks for it. Behaviour is reproducible because there is no
//! thread interleaving: [`run_one`](StepDispatcher::run_one) executes the
//! oldest queued runnable on the calling thread,
//! [`run_until_idle`](StepDispatcher::run_until_idle) drains the queue —
//! including work enqueued by the work it runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{Dispatcher, Runnable};

/// A dispatcher for deterministic stepping in tests.
pub struct StepDispatcher {
    queue: Mutex<VecDeque<Runnable>>,
    executed: AtomicUsize,
}

impl StepDispatcher {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            executed: AtomicUsize::new(0),
        }
    }

    /// Number of runnables waiting to be stepped.
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Total number of runnables executed.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Acquire)
    }

    /// Run the oldest queued runnable on the calling thread. Returns
    /// `false` when the queue was empty.
    pub fn run_one(&self) -> bool {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(runnable) => {
                runnable.run();
                self.executed.fetch_add(1, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Run queued work until the queue stays empty. Returns the number of
    /// runnables executed by this call.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl Default for StepDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for StepDispatcher {
    fn name(&self) -> &str {
        "step"
    }

    fn dispatch(&self, runnable: Runnable) {
        self.queue.lock().unwrap().push_back(runnable);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
