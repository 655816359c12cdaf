//! Hot multicast flow with replay.
//!
//! A [`MutableSharedFlow`] broadcasts emitted values to every active
//! collector. The ring buffer holds `replay + extra_buffer_capacity`
//! values; a new collector starts with the replay window, and the slowest
//! collector bounds what may be reclaimed. When the buffer is full,
//! emitters suspend (or drop, per policy) until the slowest collector
//! advances.
//!
//! Collecting a shared flow never completes normally — it ends only with
//! the collector's cancellation or failure. The per-flow lock around the
//! slot array is held briefly; waiters are resumed after it is released.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use strand_core::channel::OverflowPolicy;
use strand_core::error::{Outcome, StrandError};
use strand_core::suspend::{suspension, Resumer, SuspendFuture};

use crate::flow::{BoxFlow, Flow, FlowCollector};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct CollectorSlot {
    /// Index of the next value this collector will take.
    index: u64,
    /// Parked collector waiting for a newer value.
    resumer: Option<Resumer<()>>,
}

struct SharedState<T> {
    buffer: VecDeque<T>,
    /// Absolute index of `buffer[0]`.
    head: u64,
    /// Values below this are not replayed to new collectors
    /// (`reset_replay_cache` barrier).
    replay_from: u64,
    slots: Vec<Option<CollectorSlot>>,
    emitters: VecDeque<(T, Resumer<()>)>,
}

impl<T> SharedState<T> {
    fn tail(&self) -> u64 {
        self.head + self.buffer.len() as u64
    }

    fn active_collectors(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn min_collector_index(&self) -> u64 {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.index)
            .min()
            .unwrap_or_else(|| self.tail())
    }

    fn take_collector_resumers(&mut self) -> Vec<Resumer<()>> {
        self.slots
            .iter_mut()
            .flatten()
            .filter_map(|slot| slot.resumer.take())
            .collect()
    }
}

struct SharedCore<T> {
    replay: usize,
    extra: usize,
    policy: OverflowPolicy,
    state: Mutex<SharedState<T>>,
}

impl<T: Clone + Send + 'static> SharedCore<T> {
    fn window(&self) -> usize {
        (self.replay + self.extra).max(1)
    }

    /// Where a fresh collector starts: the replay window, bounded by the
    /// reset barrier and by what is still buffered.
    fn replay_low(&self, state: &SharedState<T>) -> u64 {
        let tail = state.tail();
        tail.saturating_sub(self.replay as u64)
            .max(state.replay_from)
            .max(state.head)
    }

    /// Drop buffered values nobody can still read.
    fn trim(&self, state: &mut SharedState<T>) {
        let keep_from = self.replay_low(state).min(state.min_collector_index());
        while state.head < keep_from && !state.buffer.is_empty() {
            state.buffer.pop_front();
            state.head += 1;
        }
    }

    /// Append `value` if the window allows it; returns the wakeups to run
    /// after the lock is released.
    fn insert(&self, state: &mut SharedState<T>, value: T) -> Insert<T> {
        if state.active_collectors() == 0 {
            // Nobody collecting: succeed immediately, keep only replay.
            state.buffer.push_back(value);
            while state.buffer.len() > self.replay {
                state.buffer.pop_front();
                state.head += 1;
            }
            return Insert::Stored(Vec::new());
        }

        let used = (state.tail() - state.min_collector_index()) as usize;
        if used < self.window() {
            state.buffer.push_back(value);
            return Insert::Stored(state.take_collector_resumers());
        }
        match self.policy {
            OverflowPolicy::Suspend => Insert::Full(value),
            OverflowPolicy::DropLatest => Insert::Dropped,
            OverflowPolicy::DropOldest => {
                state.buffer.pop_front();
                state.head += 1;
                for slot in state.slots.iter_mut().flatten() {
                    if slot.index < state.head {
                        slot.index = state.head;
                    }
                }
                state.buffer.push_back(value);
                Insert::Stored(state.take_collector_resumers())
            }
        }
    }

    /// A collector advanced or left: reclaim buffer space and let queued
    /// emitters in.
    fn pump(&self, state: &mut SharedState<T>) -> Vec<Resumer<()>> {
        self.trim(state);
        let mut wakeups = Vec::new();
        loop {
            if state.emitters.is_empty() {
                break;
            }
            let has_collectors = state.active_collectors() > 0;
            let used = (state.tail() - state.min_collector_index()) as usize;
            if has_collectors && used >= self.window() {
                break;
            }
            let (value, resumer) = state.emitters.pop_front().unwrap();
            state.buffer.push_back(value);
            if !has_collectors {
                while state.buffer.len() > self.replay {
                    state.buffer.pop_front();
                    state.head += 1;
                }
            }
            wakeups.push(resumer);
            wakeups.extend(state.take_collector_resumers());
        }
        wakeups
    }
}

enum Insert<T> {
    Stored(Vec<Resumer<()>>),
    Dropped,
    Full(T),
}

// ---------------------------------------------------------------------------
// MutableSharedFlow
// ---------------------------------------------------------------------------

/// A hot flow multicasting to all active collectors, with replay.
pub struct MutableSharedFlow<T> {
    core: Arc<SharedCore<T>>,
}

impl<T> Clone for MutableSharedFlow<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + 'static> MutableSharedFlow<T> {
    /// `replay` values are delivered to every new collector;
    /// `extra_buffer_capacity` adds slack before emitters suspend (or the
    /// overflow policy applies).
    pub fn new(replay: usize, extra_buffer_capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            core: Arc::new(SharedCore {
                replay,
                extra: extra_buffer_capacity,
                policy,
                state: Mutex::new(SharedState {
                    buffer: VecDeque::new(),
                    head: 0,
                    replay_from: 0,
                    slots: Vec::new(),
                    emitters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Emit to all collectors. Suspends only when the buffer is full and
    /// the policy is [`OverflowPolicy::Suspend`].
    pub async fn emit(&self, value: T) -> Outcome<()> {
        let future = {
            let mut state = self.core.state.lock().unwrap();
            match self.core.insert(&mut state, value) {
                Insert::Stored(wakeups) => {
                    drop(state);
                    resume_all(wakeups);
                    return Ok(());
                }
                Insert::Dropped => return Ok(()),
                Insert::Full(value) => {
                    let (parked, resumer) = suspension::<()>();
                    state.emitters.push_back((value, resumer));
                    parked.into_future(None)
                }
            }
        };
        match future.await {
            Ok(()) => Ok(()),
            Err(cancelled) => Err(StrandError::Cancelled(cancelled)),
        }
    }

    /// Non-suspending emit; `false` when the value was neither stored nor
    /// dropped by policy.
    pub fn try_emit(&self, value: T) -> bool {
        let (stored, wakeups) = {
            let mut state = self.core.state.lock().unwrap();
            match self.core.insert(&mut state, value) {
                Insert::Stored(wakeups) => (true, wakeups),
                Insert::Dropped => (true, Vec::new()),
                Insert::Full(_) => (false, Vec::new()),
            }
        };
        resume_all(wakeups);
        stored
    }

    /// Snapshot of the values a new collector would receive first.
    pub fn replay_cache(&self) -> Vec<T> {
        let state = self.core.state.lock().unwrap();
        let from = self.core.replay_low(&state);
        state
            .buffer
            .iter()
            .skip((from - state.head) as usize)
            .cloned()
            .collect()
    }

    /// Clear the replayable values. Values still owed to in-flight
    /// collectors stay buffered until delivered.
    pub fn reset_replay_cache(&self) {
        let mut state = self.core.state.lock().unwrap();
        state.replay_from = state.tail();
        self.core.trim(&mut state);
    }

    /// Number of active collectors.
    pub fn subscription_count(&self) -> usize {
        self.core.state.lock().unwrap().active_collectors()
    }

    /// This flow as a collectable [`BoxFlow`].
    pub fn as_flow(&self) -> BoxFlow<T>
    where
        T: Sync,
    {
        Arc::new(self.clone())
    }
}

impl<T> fmt::Debug for MutableSharedFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock().unwrap();
        f.debug_struct("MutableSharedFlow")
            .field("buffered", &state.buffer.len())
            .field("collectors", &state.active_collectors())
            .field("queued_emitters", &state.emitters.len())
            .finish()
    }
}

fn resume_all(wakeups: Vec<Resumer<()>>) {
    for resumer in wakeups {
        let _ = resumer.resume(());
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Frees the slot (and unblocks emitters) however collection ends.
struct SlotGuard<T: Clone + Send + 'static> {
    core: Arc<SharedCore<T>>,
    slot: usize,
}

impl<T: Clone + Send + 'static> Drop for SlotGuard<T> {
    fn drop(&mut self) {
        let wakeups = {
            let mut state = self.core.state.lock().unwrap();
            state.slots[self.slot] = None;
            self.core.pump(&mut state)
        };
        resume_all(wakeups);
    }
}

enum CollectStep<T> {
    Value(T, Vec<Resumer<()>>),
    Park(SuspendFuture<()>),
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> Flow<T> for MutableSharedFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let slot = {
            let mut state = self.core.state.lock().unwrap();
            let start = self.core.replay_low(&state);
            let slot = CollectorSlot {
                index: start,
                resumer: None,
            };
            match state.slots.iter_mut().position(|s| s.is_none()) {
                Some(free) => {
                    state.slots[free] = Some(slot);
                    free
                }
                None => {
                    state.slots.push(Some(slot));
                    state.slots.len() - 1
                }
            }
        };
        let _guard = SlotGuard {
            core: Arc::clone(&self.core),
            slot,
        };

        loop {
            let step = {
                let mut state = self.core.state.lock().unwrap();
                let tail = state.tail();
                let head = state.head;
                let slot_ref = state.slots[slot].as_mut().expect("slot alive");
                if slot_ref.index < tail {
                    if slot_ref.index < head {
                        // Conflated past: jump to the oldest retained
                        // value.
                        slot_ref.index = head;
                    }
                    let offset = (slot_ref.index - head) as usize;
                    let value = state.buffer[offset].clone();
                    let slot_ref = state.slots[slot].as_mut().expect("slot alive");
                    slot_ref.index += 1;
                    let wakeups = self.core.pump(&mut state);
                    CollectStep::Value(value, wakeups)
                } else {
                    let (parked, resumer) = suspension::<()>();
                    slot_ref.resumer = Some(resumer);
                    CollectStep::Park(parked.into_future(None))
                }
            };
            match step {
                CollectStep::Value(value, wakeups) => {
                    resume_all(wakeups);
                    collector.emit(value).await?;
                }
                CollectStep::Park(future) => {
                    future
                        .await
                        .map_err(StrandError::Cancelled)?;
                }
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

    #[test]
    fn try_emit_without_collectors_keeps_replay_only() {
        let flow = MutableSharedFlow::new(2, 0, OverflowPolicy::Suspend);
        assert!(flow.try_emit(1));
        assert!(flow.try_emit(2));
        assert!(flow.try_emit(3));
        assert_eq!(flow.replay_cache(), vec![2, 3]);
    }

    #[test]
    fn reset_replay_cache_clears_replay_window() {
        let flow = MutableSharedFlow::new(2, 0, OverflowPolicy::Suspend);
        flow.try_emit(1);
        flow.try_emit(2);
        assert_eq!(flow.replay_cache(), vec![1, 2]);
        flow.reset_replay_cache();
        assert!(flow.replay_cache().is_empty());
        flow.try_emit(3);
        assert_eq!(flow.replay_cache(), vec![3]);
    }

    #[test]
    fn subscription_count_starts_at_zero() {
        let flow: MutableSharedFlow<u32> = MutableSharedFlow::new(1, 1, OverflowPolicy::Suspend);
        assert_eq!(flow.subscription_count(), 0);
    }
}
