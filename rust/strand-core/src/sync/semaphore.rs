//! Counting semaphore with suspending acquisition.
//!
//! Fair FIFO: waiters are resumed in arrival order. A released permit is
//! handed directly to the oldest live waiter instead of going back to the
//! counter, so a stream of acquirers cannot starve a parked one. A waiter
//! cancelled while parked gives its queue slot back; a waiter that was
//! handed a permit and then observed cancellation (prompt cancellation)
//! returns the permit.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use crate::error::{Outcome, StrandError};
use crate::suspend::{suspension, Resumer};

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

struct SemState {
    permits: usize,
    next_waiter_id: u64,
    waiters: VecDeque<(u64, Resumer<()>)>,
}

struct SemCore {
    max_permits: usize,
    state: StdMutex<SemState>,
}

/// A counting semaphore. Cheap to clone; clones share the permits.
#[derive(Clone)]
pub struct Semaphore {
    core: Arc<SemCore>,
}

impl Semaphore {
    /// Create a semaphore with `permits` permits. Panics when `permits`
    /// is zero.
    pub fn new(permits: usize) -> Self {
        assert!(permits > 0, "semaphore needs at least one permit");
        Self {
            core: Arc::new(SemCore {
                max_permits: permits,
                state: StdMutex::new(SemState {
                    permits,
                    next_waiter_id: 1,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Permits currently available (waiters pending count as zero).
    pub fn available_permits(&self) -> usize {
        self.core.state.lock().unwrap().permits
    }

    /// Take a permit without suspending. `false` when none is free.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.core.state.lock().unwrap();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take a permit, suspending FIFO-fair while none is free. Errs when
    /// the acquiring job is cancelled; a permit handed over during the
    /// cancellation race is returned.
    pub async fn acquire(&self) -> Outcome<()> {
        let future = {
            let mut state = self.core.state.lock().unwrap();
            if state.permits > 0 {
                state.permits -= 1;
                return Ok(());
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (suspension, resumer) = suspension::<()>();
            state.waiters.push_back((id, resumer));
            drop(state);

            let core = Arc::clone(&self.core);
            suspension.into_future(Some(Box::new(move |parked| {
                if parked.is_some() {
                    // Prompt cancellation: the permit arrived while the
                    // waiter was being cancelled. Pass it on.
                    release_into(&core);
                } else {
                    core.state
                        .lock()
                        .unwrap()
                        .waiters
                        .retain(|(waiter, _)| *waiter != id);
                }
            })))
        };
        match future.await {
            Ok(()) => Ok(()),
            Err(cancelled) => Err(StrandError::Cancelled(cancelled)),
        }
    }

    /// Acquire and return an RAII guard releasing on drop.
    pub async fn acquire_guard(&self) -> Outcome<SemaphoreGuard> {
        self.acquire().await?;
        Ok(SemaphoreGuard {
            semaphore: self.clone(),
        })
    }

    /// Return a permit. The oldest live waiter receives it directly.
    /// Panics when called more times than permits were acquired.
    pub fn release(&self) {
        release_into(&self.core);
    }
}

fn release_into(core: &Arc<SemCore>) {
    loop {
        let next = {
            let mut state = core.state.lock().unwrap();
            match state.waiters.pop_front() {
                Some((_, resumer)) => Some(resumer),
                None => {
                    assert!(
                        state.permits < core.max_permits,
                        "semaphore released more times than acquired"
                    );
                    state.permits += 1;
                    None
                }
            }
        };
        match next {
            Some(resumer) => {
                if resumer.resume(()).is_ok() {
                    return;
                }
                // That waiter was cancelled under us; hand the permit to
                // the next one.
            }
            None => return,
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock().unwrap();
        f.debug_struct("Semaphore")
            .field("permits", &state.permits)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// RAII permit; releases on drop.
pub struct SemaphoreGuard {
    semaphore: Semaphore,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
