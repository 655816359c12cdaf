//! Flow operators and terminal collectors.
//!
//! Intermediate operators wrap the upstream with a decorating collector —
//! no task, no channel. The channel-based operators (`buffer`, `flow_on`,
//! `conflate`) delegate to [`crate::channel_flow`] and fuse with their
//! neighbours. Terminal operators drive a collection to a value.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use strand_core::channel::OverflowPolicy;
use strand_core::dispatch::Dispatcher;
use strand_core::error::Outcome;
use strand_core::scope::check_cancellation;

use crate::channel_flow::{fused, CapacityRequest};
use crate::delay::{DebounceFlow, SampleFlow};
use crate::flow::{abort_error, swallow_abort, BoxFlow, Flow, FlowCollector};

// ---------------------------------------------------------------------------
// FlowOps
// ---------------------------------------------------------------------------

/// Operator surface for [`BoxFlow`].
#[async_trait]
pub trait FlowOps<T: Send + 'static> {
    // -- intermediate -------------------------------------------------------

    fn map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> BoxFlow<U>;

    fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> BoxFlow<T>;

    /// Run a side effect on every value without consuming it.
    fn on_each(&self, action: impl Fn(&T) + Send + Sync + 'static) -> BoxFlow<T>;

    /// Pass through the first `count` values, then stop the upstream.
    fn take(&self, count: usize) -> BoxFlow<T>;

    /// Drop the first `count` values.
    fn skip(&self, count: usize) -> BoxFlow<T>;

    /// Re-insert a cancellation check before every emission (for flows
    /// built outside [`crate::flow`] that do not check on their own).
    fn cancellable(&self) -> BoxFlow<T>;

    // -- channel-based ------------------------------------------------------

    /// Decouple producer and consumer through a buffer of `capacity`
    /// (fuses with adjacent channel operators).
    fn buffer(&self, capacity: usize) -> BoxFlow<T>;

    /// [`buffer`](FlowOps::buffer) with explicit capacity request and
    /// overflow policy.
    fn buffer_with(&self, capacity: CapacityRequest, policy: OverflowPolicy) -> BoxFlow<T>;

    /// Keep only the most recent value when the consumer lags.
    fn conflate(&self) -> BoxFlow<T>;

    /// Collect the upstream on `dispatcher` (fuses with adjacent channel
    /// operators; the innermost override wins).
    fn flow_on(&self, dispatcher: Arc<dyn Dispatcher>) -> BoxFlow<T>;

    // -- time-based ---------------------------------------------------------

    /// Emit a value only after `window` of quiet; a newer value restarts
    /// the window. The latest value is always delivered eventually.
    fn debounce(&self, window: Duration) -> BoxFlow<T>;

    /// Emit at most one value per `period`, the most recent one; quiet
    /// periods emit nothing.
    fn sample(&self, period: Duration) -> BoxFlow<T>;

    // -- terminal -----------------------------------------------------------

    /// Collect every value into a vector.
    async fn to_vec(&self) -> Outcome<Vec<T>>;

    /// The first value, or `None` for an empty flow. Stops the upstream
    /// after one value.
    async fn first(&self) -> Outcome<Option<T>>;

    /// Number of values the flow produces.
    async fn count(&self) -> Outcome<usize>;

    /// Run `f` for every value.
    async fn for_each<F>(&self, f: F) -> Outcome<()>
    where
        F: FnMut(T) + Send + 'static;
}

#[async_trait]
impl<T: Send + 'static> FlowOps<T> for BoxFlow<T> {
    fn map<U: Send + 'static>(
        &self,
        f: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> BoxFlow<U> {
        Arc::new(MapFlow {
            upstream: self.clone(),
            f: Arc::new(f),
        })
    }

    fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> BoxFlow<T> {
        Arc::new(FilterFlow {
            upstream: self.clone(),
            predicate: Arc::new(predicate),
        })
    }

    fn on_each(&self, action: impl Fn(&T) + Send + Sync + 'static) -> BoxFlow<T> {
        Arc::new(OnEachFlow {
            upstream: self.clone(),
            action: Arc::new(action),
        })
    }

    fn take(&self, count: usize) -> BoxFlow<T> {
        Arc::new(TakeFlow {
            upstream: self.clone(),
            count,
        })
    }

    fn skip(&self, count: usize) -> BoxFlow<T> {
        Arc::new(SkipFlow {
            upstream: self.clone(),
            count,
        })
    }

    fn cancellable(&self) -> BoxFlow<T> {
        Arc::new(CancellableFlow {
            upstream: self.clone(),
        })
    }

    fn buffer(&self, capacity: usize) -> BoxFlow<T> {
        self.buffer_with(CapacityRequest::Fixed(capacity), OverflowPolicy::Suspend)
    }

    fn buffer_with(&self, capacity: CapacityRequest, policy: OverflowPolicy) -> BoxFlow<T> {
        fused(self.clone(), None, capacity, policy)
    }

    fn conflate(&self) -> BoxFlow<T> {
        self.buffer_with(CapacityRequest::Fixed(1), OverflowPolicy::DropOldest)
    }

    fn flow_on(&self, dispatcher: Arc<dyn Dispatcher>) -> BoxFlow<T> {
        fused(
            self.clone(),
            Some(dispatcher),
            CapacityRequest::Default,
            OverflowPolicy::Suspend,
        )
    }

    fn debounce(&self, window: Duration) -> BoxFlow<T> {
        Arc::new(DebounceFlow {
            upstream: self.clone(),
            window,
        })
    }

    fn sample(&self, period: Duration) -> BoxFlow<T> {
        Arc::new(SampleFlow {
            upstream: self.clone(),
            period,
        })
    }

    async fn to_vec(&self) -> Outcome<Vec<T>> {
        let mut collector = VecCollector { out: Vec::new() };
        self.collect(&mut collector).await?;
        Ok(collector.out)
    }

    async fn first(&self) -> Outcome<Option<T>> {
        let mut collector = FirstCollector { slot: None };
        swallow_abort(self.collect(&mut collector).await)?;
        Ok(collector.slot)
    }

    async fn count(&self) -> Outcome<usize> {
        let mut collector = CountCollector { seen: 0 };
        self.collect(&mut collector).await?;
        Ok(collector.seen)
    }

    async fn for_each<F>(&self, f: F) -> Outcome<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut collector = FnCollector { f };
        self.collect(&mut collector).await
    }
}

// ---------------------------------------------------------------------------
// Intermediate operator flows
// ---------------------------------------------------------------------------

struct MapFlow<T, U> {
    upstream: BoxFlow<T>,
    f: Arc<dyn Fn(T) -> U + Send + Sync>,
}

struct MapCollector<'a, T, U> {
    inner: &'a mut dyn FlowCollector<U>,
    f: &'a Arc<dyn Fn(T) -> U + Send + Sync>,
}

#[async_trait]
impl<'a, T: Send + 'static, U: Send + 'static> FlowCollector<T> for MapCollector<'a, T, U> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        self.inner.emit((self.f)(value)).await
    }
}

#[async_trait]
impl<T: Send + 'static, U: Send + 'static> Flow<U> for MapFlow<T, U> {
    async fn collect(&self, collector: &mut dyn FlowCollector<U>) -> Outcome<()> {
        let mut mapped = MapCollector {
            inner: collector,
            f: &self.f,
        };
        self.upstream.collect(&mut mapped).await
    }
}

struct FilterFlow<T> {
    upstream: BoxFlow<T>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

struct FilterCollector<'a, T> {
    inner: &'a mut dyn FlowCollector<T>,
    predicate: &'a Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

#[async_trait]
impl<'a, T: Send + 'static> FlowCollector<T> for FilterCollector<'a, T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        if (self.predicate)(&value) {
            self.inner.emit(value).await
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for FilterFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let mut filtered = FilterCollector {
            inner: collector,
            predicate: &self.predicate,
        };
        self.upstream.collect(&mut filtered).await
    }
}

struct OnEachFlow<T> {
    upstream: BoxFlow<T>,
    action: Arc<dyn Fn(&T) + Send + Sync>,
}

struct OnEachCollector<'a, T> {
    inner: &'a mut dyn FlowCollector<T>,
    action: &'a Arc<dyn Fn(&T) + Send + Sync>,
}

#[async_trait]
impl<'a, T: Send + 'static> FlowCollector<T> for OnEachCollector<'a, T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        (self.action)(&value);
        self.inner.emit(value).await
    }
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for OnEachFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let mut tapped = OnEachCollector {
            inner: collector,
            action: &self.action,
        };
        self.upstream.collect(&mut tapped).await
    }
}

struct TakeFlow<T> {
    upstream: BoxFlow<T>,
    count: usize,
}

struct TakeCollector<'a, T> {
    inner: &'a mut dyn FlowCollector<T>,
    remaining: usize,
}

#[async_trait]
impl<'a, T: Send + 'static> FlowCollector<T> for TakeCollector<'a, T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        self.remaining -= 1;
        self.inner.emit(value).await?;
        if self.remaining == 0 {
            // Stop the upstream; the TakeFlow converts this back into
            // clean completion.
            return Err(abort_error());
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for TakeFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        if self.count == 0 {
            return Ok(());
        }
        let mut taking = TakeCollector {
            inner: collector,
            remaining: self.count,
        };
        swallow_abort(self.upstream.collect(&mut taking).await)
    }
}

struct SkipFlow<T> {
    upstream: BoxFlow<T>,
    count: usize,
}

struct SkipCollector<'a, T> {
    inner: &'a mut dyn FlowCollector<T>,
    remaining: usize,
}

#[async_trait]
impl<'a, T: Send + 'static> FlowCollector<T> for SkipCollector<'a, T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Ok(());
        }
        self.inner.emit(value).await
    }
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for SkipFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let mut skipping = SkipCollector {
            inner: collector,
            remaining: self.count,
        };
        self.upstream.collect(&mut skipping).await
    }
}

struct CancellableFlow<T> {
    upstream: BoxFlow<T>,
}

struct CancellableCollector<'a, T> {
    inner: &'a mut dyn FlowCollector<T>,
}

#[async_trait]
impl<'a, T: Send + 'static> FlowCollector<T> for CancellableCollector<'a, T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        check_cancellation()?;
        self.inner.emit(value).await
    }
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for CancellableFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let mut checked = CancellableCollector { inner: collector };
        self.upstream.collect(&mut checked).await
    }
}

// ---------------------------------------------------------------------------
// Terminal collectors
// ---------------------------------------------------------------------------

struct VecCollector<T> {
    out: Vec<T>,
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for VecCollector<T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        self.out.push(value);
        Ok(())
    }
}

struct FirstCollector<T> {
    slot: Option<T>,
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for FirstCollector<T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        self.slot = Some(value);
        Err(abort_error())
    }
}

struct CountCollector {
    seen: usize,
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for CountCollector {
    async fn emit(&mut self, _value: T) -> Outcome<()> {
        self.seen += 1;
        Ok(())
    }
}

struct FnCollector<F> {
    f: F,
}

#[async_trait]
impl<T: Send + 'static, F: FnMut(T) + Send + 'static> FlowCollector<T> for FnCollector<F> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        (self.f)(value);
        Ok(())
    }
}

/// Count of channels a flow chain would allocate if collected now: one
/// for a fused channel flow, zero otherwise. Exists for asserting the
/// fusing guarantee.
pub fn channel_count_hint<T: Send + 'static>(flow: &BoxFlow<T>) -> usize {
    usize::from(flow.as_channel_flow().is_some())
}
