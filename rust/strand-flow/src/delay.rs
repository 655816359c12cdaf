//! Time-shaping operators: debounce and sample.
//!
//! Both run the upstream as a producer into a rendezvous channel inside a
//! scoped child task, then drive a small state machine with a
//! select-with-timeout: at most one value per window leaves the operator.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use strand_core::channel::Channel;
use strand_core::error::{Fault, Outcome, StrandError};
use strand_core::scope::coroutine_scope;
use strand_core::select::Select;

use crate::channel_flow::ChannelSink;
use crate::flow::{BoxFlow, Flow, FlowCollector};

enum Event<T> {
    Next(Result<T, Option<Fault>>),
    Window,
}

// ---------------------------------------------------------------------------
// debounce
// ---------------------------------------------------------------------------

/// Emits a value once `window` has passed without a newer one; the final
/// value is always delivered when the upstream ends.
pub(crate) struct DebounceFlow<T> {
    pub(crate) upstream: BoxFlow<T>,
    pub(crate) window: Duration,
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for DebounceFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let channel: Channel<T> = Channel::rendezvous();
        let upstream = self.upstream.clone();
        let window = self.window;
        let producer_channel = channel.clone();
        coroutine_scope(|scope| async move {
            scope.launch(async move {
                let mut sink = ChannelSink {
                    channel: producer_channel.clone(),
                };
                let result = upstream.collect(&mut sink).await;
                producer_channel.close();
                result
            });

            let mut pending: Option<T> = None;
            loop {
                if pending.is_none() {
                    match channel.recv().await {
                        Ok(value) => pending = Some(value),
                        Err(error) => {
                            return match error {
                                strand_core::channel::RecvError::Closed(None) => Ok(()),
                                other => Err(other.into()),
                            }
                        }
                    }
                }
                // A quiet window emits the pending value; a newer value
                // restarts the window.
                let event = Select::new()
                    .on_recv_catching(&channel, |next| Ok(Event::Next(next)))
                    .timeout(window, || Event::Window)
                    .run()
                    .await?;
                match event {
                    Event::Window => {
                        let value = pending.take().expect("window only runs with a value");
                        collector.emit(value).await?;
                    }
                    Event::Next(Ok(value)) => pending = Some(value),
                    Event::Next(Err(None)) => {
                        // Upstream done: the latest value is always
                        // delivered.
                        let value = pending.take().expect("checked above");
                        collector.emit(value).await?;
                        return Ok(());
                    }
                    Event::Next(Err(Some(fault))) => return Err(StrandError::Failed(fault)),
                }
            }
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// sample
// ---------------------------------------------------------------------------

/// Emits the most recent upstream value on a fixed `period` tick; quiet
/// ticks emit nothing, and a value pending when the upstream ends is
/// dropped (it missed its window).
pub(crate) struct SampleFlow<T> {
    pub(crate) upstream: BoxFlow<T>,
    pub(crate) period: Duration,
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for SampleFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let channel: Channel<T> = Channel::rendezvous();
        let upstream = self.upstream.clone();
        let period = self.period;
        let producer_channel = channel.clone();
        coroutine_scope(|scope| async move {
            scope.launch(async move {
                let mut sink = ChannelSink {
                    channel: producer_channel.clone(),
                };
                let result = upstream.collect(&mut sink).await;
                producer_channel.close();
                result
            });

            let mut latest: Option<T> = None;
            let mut deadline = Instant::now() + period;
            loop {
                let wait = deadline.saturating_duration_since(Instant::now());
                let event = Select::new()
                    .on_recv_catching(&channel, |next| Ok(Event::Next(next)))
                    .timeout(wait, || Event::Window)
                    .run()
                    .await?;
                match event {
                    Event::Next(Ok(value)) => latest = Some(value),
                    Event::Next(Err(None)) => return Ok(()),
                    Event::Next(Err(Some(fault))) => return Err(StrandError::Failed(fault)),
                    Event::Window => {
                        deadline += period;
                        if let Some(value) = latest.take() {
                            collector.emit(value).await?;
                        }
                    }
                }
            }
        })
        .await
    }
}
