//! Parallelism-limited view over another dispatcher.
//!
//! [`limited_parallelism`] returns a dispatcher that admits at most `n`
//! of its runnables to the underlying dispatcher at once; the excess
//! queues FIFO and is drained as running work completes. Several limited
//! views over the same pool are independent — each gets its own budget.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use super::{Dispatcher, Dispatchers, Runnable};

struct LimitedState {
    queue: VecDeque<Runnable>,
    running: usize,
}

struct LimitedDispatcher {
    name: String,
    limit: usize,
    inner: Arc<dyn Dispatcher>,
    state: Arc<Mutex<LimitedState>>,
}

/// Limit `inner` to at most `limit` concurrently running runnables.
///
/// Panics when `limit == 0`. An inline dispatcher (no queue of its own)
/// is silently upgraded to a view over the default pool — limiting
/// "run wherever you are" is meaningless.
pub fn limited_parallelism(
    inner: Arc<dyn Dispatcher>,
    limit: usize,
    name: Option<String>,
) -> Arc<dyn Dispatcher> {
    assert!(limit > 0, "parallelism limit must be positive");
    let inner = if inner.is_dispatch_needed() {
        inner
    } else {
        Dispatchers::default_pool()
    };
    let name = name.unwrap_or_else(|| format!("{}.limited({limit})", inner.name()));
    Arc::new(LimitedDispatcher {
        name,
        limit,
        inner,
        state: Arc::new(Mutex::new(LimitedState {
            queue: VecDeque::new(),
            running: 0,
        })),
    })
}

impl Dispatcher for LimitedDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, runnable: Runnable) {
        let admitted = {
            let mut state = self.state.lock().unwrap();
            if state.running < self.limit {
                state.running += 1;
                true
            } else {
                state.queue.push_back(runnable);
                return;
            }
        };
        debug_assert!(admitted);
        self.submit(runnable);
    }
}

impl LimitedDispatcher {
    /// Submit one admitted runnable; the worker closure keeps draining the
    /// overflow queue in FIFO order before giving its slot back.
    fn submit(&self, runnable: Runnable) {
        let state = Arc::clone(&self.state);
        let worker = move || {
            let mut current = runnable;
            loop {
                if catch_unwind(AssertUnwindSafe(|| current.run())).is_err() {
                    tracing::error!("runnable panicked under limited dispatcher");
                }
                let next = {
                    let mut st = state.lock().unwrap();
                    match st.queue.pop_front() {
                        Some(next) => Some(next),
                        None => {
                            st.running -= 1;
                            None
                        }
                    }
                };
                match next {
                    Some(next) => current = next,
                    None => break,
                }
            }
        };
        self.inner.dispatch(Runnable::new(worker));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{PoolDispatcher, StepDispatcher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    #[should_panic(expected = "parallelism limit must be positive")]
    fn zero_limit_is_rejected() {
        let _ = limited_parallelism(Arc::new(StepDispatcher::new()), 0, None);
    }

    #[test]
    fn limit_one_serializes_execution() {
        let pool = PoolDispatcher::new("test-limited", 4);
        let limited = limited_parallelism(pool.clone(), 1, None);

        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            let done = Arc::clone(&done);
            limited.dispatch(Runnable::new(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 16 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[test]
    fn unconfined_upgrades_to_default_pool() {
        let limited = limited_parallelism(Dispatchers::unconfined(), 2, None);
        assert!(limited.is_dispatch_needed());
        assert!(limited.name().contains("strand-default"));
    }

    #[test]
    fn queued_work_drains_in_order() {
        let step = Arc::new(StepDispatcher::new());
        let limited = limited_parallelism(step.clone(), 1, Some("narrow".into()));

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            limited.dispatch(Runnable::new(move || {
                log.lock().unwrap().push(i);
            }));
        }

        // One admitted worker carries the whole queue.
        assert_eq!(step.pending(), 1);
        step.run_until_idle();
        assert_eq!(log.lock().unwrap().clone(), (0..8).collect::<Vec<_>>());
    }
}
