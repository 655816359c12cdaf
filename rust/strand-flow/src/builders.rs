//! Flow builders.
//!
//! [`flow`] runs a producer body and the collector in the *same* task: the
//! body parks on a one-slot emission cell, the driver forwards the value
//! to the collector, then resumes the body. No channel, no second task —
//! this is what keeps plain flows sequential.
//!
//! Every emission checks two invariants:
//!
//! * context preservation — the emitting task must be the task that
//!   started collecting (moving the sink into a launched child and
//!   emitting from there is an error);
//! * cancellation — the ambient job is checked before each emission, so a
//!   cancelled collector stops a busy producer at the next emit.

use async_trait::async_trait;
use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use strand_core::context::current_job;
use strand_core::error::{Outcome, StrandError};
use strand_core::job::JobId;
use strand_core::scope::check_cancellation;

use crate::flow::{BoxFlow, Flow, FlowCollector};

// ---------------------------------------------------------------------------
// Emission cell
// ---------------------------------------------------------------------------

struct EmitState<T> {
    parked: Option<T>,
    resumed: bool,
}

pub(crate) struct EmitCell<T> {
    state: Mutex<EmitState<T>>,
}

impl<T> EmitCell<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(EmitState {
                parked: None,
                resumed: false,
            }),
        }
    }

    fn take_parked(&self) -> Option<T> {
        self.state.lock().unwrap().parked.take()
    }

    fn mark_resumed(&self) {
        self.state.lock().unwrap().resumed = true;
    }
}

// ---------------------------------------------------------------------------
// FlowSink
// ---------------------------------------------------------------------------

/// The producer's handle for emitting values from a [`flow`] body.
pub struct FlowSink<T> {
    cell: Arc<EmitCell<T>>,
    origin: Option<JobId>,
}

impl<T: Send + 'static> FlowSink<T> {
    /// Emit one value downstream. Suspends until the collector has
    /// processed it.
    pub async fn emit(&mut self, value: T) -> Outcome<()> {
        let here = current_job().map(|job| job.id());
        if here != self.origin {
            return Err(StrandError::msg(
                "flow invariant violated: emission outside the collecting task",
            ));
        }
        check_cancellation()?;
        EmitFuture {
            cell: Arc::clone(&self.cell),
            value: Some(value),
        }
        .await
    }
}

struct EmitFuture<T> {
    cell: Arc<EmitCell<T>>,
    value: Option<T>,
}

impl<T> Unpin for EmitFuture<T> {}

impl<T> Future for EmitFuture<T> {
    type Output = Outcome<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.cell.state.lock().unwrap();
        if state.resumed {
            state.resumed = false;
            return Poll::Ready(Ok(()));
        }
        if let Some(value) = this.value.take() {
            // Park the value; the collect driver picks it up in the same
            // task and resumes us after the collector ran.
            state.parked = Some(value);
        }
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// flow builder
// ---------------------------------------------------------------------------

/// Build a cold flow from an async producer body. The body runs once per
/// collection and receives a fresh [`FlowSink`].
pub fn flow<T, F, Fut>(body: F) -> BoxFlow<T>
where
    T: Send + 'static,
    F: Fn(FlowSink<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome<()>> + Send + 'static,
{
    Arc::new(BodyFlow { body })
}

struct BodyFlow<F> {
    body: F,
}

enum Step<T> {
    Emit(T),
    Done(Outcome<()>),
}

#[async_trait]
impl<T, F, Fut> Flow<T> for BodyFlow<F>
where
    T: Send + 'static,
    F: Fn(FlowSink<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome<()>> + Send + 'static,
{
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let cell = Arc::new(EmitCell::new());
        let sink = FlowSink {
            cell: Arc::clone(&cell),
            origin: current_job().map(|job| job.id()),
        };
        let mut body = Box::pin((self.body)(sink));

        loop {
            let step = poll_fn(|cx| match body.as_mut().poll(cx) {
                Poll::Ready(result) => Poll::Ready(Step::Done(result)),
                Poll::Pending => match cell.take_parked() {
                    Some(value) => Poll::Ready(Step::Emit(value)),
                    None => Poll::Pending,
                },
            })
            .await;
            match step {
                Step::Emit(value) => {
                    collector.emit(value).await?;
                    cell.mark_resumed();
                }
                Step::Done(result) => return result,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-content flows
// ---------------------------------------------------------------------------

/// A flow replaying a fixed list of values on every collection.
pub fn flow_of<T>(items: impl Into<Vec<T>>) -> BoxFlow<T>
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(IterFlow {
        items: items.into(),
    })
}

struct IterFlow<T> {
    items: Vec<T>,
}

#[async_trait]
impl<T> Flow<T> for IterFlow<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        for item in &self.items {
            check_cancellation()?;
            collector.emit(item.clone()).await?;
        }
        Ok(())
    }
}

/// An empty flow.
pub fn empty_flow<T: Send + Sync + 'static>() -> BoxFlow<T> {
    Arc::new(EmptyFlow)
}

struct EmptyFlow;

#[async_trait]
impl<T: Send + Sync + 'static> Flow<T> for EmptyFlow {
    async fn collect(&self, _collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        Ok(())
    }
}
