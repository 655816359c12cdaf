//! Inline execution on the resuming thread.
//!
//! [`Unconfined`] reports `is_dispatch_needed() == false` and runs its
//! work on whichever thread submits it. A thread-local event loop keeps
//! nested dispatches iterative instead of recursive, so resume chains of
//! arbitrary depth use constant stack.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::{Dispatcher, Runnable};

/// The inline dispatcher. All instances share per-thread event loops.
pub struct Unconfined {
    _private: (),
}

impl Unconfined {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for Unconfined {
    fn default() -> Self {
        Self::new()
    }
}

struct EventLoop {
    running: bool,
    queue: VecDeque<Runnable>,
}

thread_local! {
    static EVENT_LOOP: RefCell<EventLoop> = RefCell::new(EventLoop {
        running: false,
        queue: VecDeque::new(),
    });
}

/// Clears the `running` flag even when a runnable panics through us.
struct LoopGuard;

impl Drop for LoopGuard {
    fn drop(&mut self) {
        EVENT_LOOP.with(|l| l.borrow_mut().running = false);
    }
}

impl Dispatcher for Unconfined {
    fn name(&self) -> &str {
        "unconfined"
    }

    fn is_dispatch_needed(&self) -> bool {
        false
    }

    fn dispatch(&self, runnable: Runnable) {
        let first = EVENT_LOOP.with(|l| {
            let mut state = l.borrow_mut();
            if state.running {
                // Re-entrant dispatch: enqueue for the outer loop.
                state.queue.push_back(runnable);
                None
            } else {
                state.running = true;
                Some(runnable)
            }
        });

        let Some(first) = first else { return };
        let _guard = LoopGuard;
        let mut current = first;
        loop {
            if catch_unwind(AssertUnwindSafe(|| current.run())).is_err() {
                tracing::error!("runnable panicked on unconfined dispatcher");
            }
            let next = EVENT_LOOP.with(|l| l.borrow_mut().queue.pop_front());
            match next {
                Some(next) => current = next,
                None => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_inline_on_calling_thread() {
        let unconfined = Unconfined::new();
        let thread_id = std::thread::current().id();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        unconfined.dispatch(Runnable::new(move || {
            assert_eq!(std::thread::current().id(), thread_id);
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_dispatch_is_iterative_not_recursive() {
        // A chain of re-entrant dispatches must complete without growing
        // the stack: each inner dispatch lands on the outer loop's queue.
        let count = Arc::new(AtomicUsize::new(0));

        fn chain(count: Arc<AtomicUsize>, depth: usize) {
            if depth == 0 {
                return;
            }
            count.fetch_add(1, Ordering::SeqCst);
            let next = Arc::clone(&count);
            Unconfined::new().dispatch(Runnable::new(move || {
                chain(next, depth - 1);
            }));
        }

        let c = Arc::clone(&count);
        Unconfined::new().dispatch(Runnable::new(move || chain(c, 10_000)));
        assert_eq!(count.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn order_of_reentrant_dispatches_is_fifo() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let outer_log = Arc::clone(&log);
        Unconfined::new().dispatch(Runnable::new(move || {
            outer_log.lock().unwrap().push(0);
            for i in 1..=3 {
                let inner = Arc::clone(&outer_log);
                Unconfined::new().dispatch(Runnable::new(move || {
                    inner.lock().unwrap().push(i);
                }));
            }
            outer_log.lock().unwrap().push(100);
        }));
        assert_eq!(log.lock().unwrap().clone(), vec![0, 100, 1, 2, 3]);
    }
}
