//! Conflated state holder, observable as a flow.
//!
//! [`MutableStateFlow`] always has a value. Setting an equal value is
//! suppressed (no emission); collectors always see the current value
//! first and then every *distinct* newer value they are fast enough to
//! observe — intermediate values conflate away.

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};

use strand_core::error::{Outcome, StrandError};
use strand_core::suspend::{suspension, Resumer, SuspendFuture};

use crate::flow::{BoxFlow, Flow, FlowCollector};

struct StateInner<T> {
    value: T,
    version: u64,
    watchers: Vec<Resumer<()>>,
}

/// An observable value with equality-suppressed updates.
pub struct MutableStateFlow<T> {
    inner: Arc<Mutex<StateInner<T>>>,
}

impl<T> Clone for MutableStateFlow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> MutableStateFlow<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner {
                value: initial,
                version: 0,
                watchers: Vec::new(),
            })),
        }
    }

    /// The current value.
    pub fn value(&self) -> T {
        self.inner.lock().unwrap().value.clone()
    }

    /// Replace the value. Setting a value equal to the current one has no
    /// observable effect; returns whether an update happened.
    pub fn set(&self, value: T) -> bool {
        let watchers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.value == value {
                return false;
            }
            inner.value = value;
            inner.version += 1;
            std::mem::take(&mut inner.watchers)
        };
        wake_all(watchers);
        true
    }

    /// Atomically replace the value iff the current value equals
    /// `expect`. Returns `true` exactly when the pre-state matched.
    pub fn compare_and_set(&self, expect: &T, update: T) -> bool {
        let watchers = {
            let mut inner = self.inner.lock().unwrap();
            if inner.value != *expect {
                return false;
            }
            if inner.value == update {
                // Matched, but nothing changes — suppressed like `set`.
                return true;
            }
            inner.value = update;
            inner.version += 1;
            std::mem::take(&mut inner.watchers)
        };
        wake_all(watchers);
        true
    }

    /// Transform the value with `f`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let _ = self.update_and_get(f);
    }

    /// Transform and return the previous value.
    pub fn get_and_update(&self, f: impl FnOnce(&T) -> T) -> T {
        let (previous, watchers) = {
            let mut inner = self.inner.lock().unwrap();
            let previous = inner.value.clone();
            let next = f(&inner.value);
            let watchers = if next == inner.value {
                Vec::new()
            } else {
                inner.value = next;
                inner.version += 1;
                std::mem::take(&mut inner.watchers)
            };
            (previous, watchers)
        };
        wake_all(watchers);
        previous
    }

    /// Transform and return the new value.
    pub fn update_and_get(&self, f: impl FnOnce(&T) -> T) -> T {
        let (next, watchers) = {
            let mut inner = self.inner.lock().unwrap();
            let next = f(&inner.value);
            let watchers = if next == inner.value {
                Vec::new()
            } else {
                inner.value = next.clone();
                inner.version += 1;
                std::mem::take(&mut inner.watchers)
            };
            (next, watchers)
        };
        wake_all(watchers);
        next
    }

    /// This state as a collectable [`BoxFlow`].
    pub fn as_flow(&self) -> BoxFlow<T>
    where
        T: Sync,
    {
        Arc::new(self.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for MutableStateFlow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("MutableStateFlow")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .finish()
    }
}

fn wake_all(watchers: Vec<Resumer<()>>) {
    for resumer in watchers {
        let _ = resumer.resume(());
    }
}

enum StateStep<T> {
    Emit(T),
    Park(SuspendFuture<()>),
}

#[async_trait]
impl<T: Clone + PartialEq + Send + Sync + 'static> Flow<T> for MutableStateFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let mut seen: Option<u64> = None;
        loop {
            let step = {
                let mut inner = self.inner.lock().unwrap();
                if seen != Some(inner.version) {
                    seen = Some(inner.version);
                    StateStep::Emit(inner.value.clone())
                } else {
                    let (parked, resumer) = suspension::<()>();
                    inner.watchers.push(resumer);
                    StateStep::Park(parked.into_future(None))
                }
            };
            match step {
                StateStep::Emit(value) => collector.emit(value).await?,
                StateStep::Park(future) => {
                    future.await.map_err(StrandError::Cancelled)?;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
