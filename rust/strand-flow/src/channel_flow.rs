//! Channel-based flow operators and their fusing.
//!
//! `flow_on`, `buffer`, `channel_flow` and `produce_in` are all views of
//! one type: a [`ChannelFlow`] carrying `(source, dispatcher override,
//! capacity request, overflow policy)`. Stacking two of them does not
//! stack two channels — the outer operator merges its parameters into the
//! inner one through [`Flow::as_channel_flow`]:
//!
//! * dispatcher: the inner override wins; the outer one only fills a gap;
//! * capacity: explicit sizes sum; a plain "give me a buffer" request is
//!   overridden by any explicit size;
//! * overflow: a non-suspending policy replaces all preceding suspending
//!   buffers (they would never be used).
//!
//! Collection allocates exactly one channel: a producer child collects
//! the source into it on the fused dispatcher, the collecting task drains
//! it.

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use strand_core::channel::{Capacity, Channel, OverflowPolicy, RecvError, SendError};
use strand_core::dispatch::Dispatcher;
use strand_core::error::{fault, Outcome, StrandError};
use strand_core::scope::{coroutine_scope, LaunchOptions, Scope};

use crate::flow::{BoxFlow, Flow, FlowCollector};

/// How much buffering a channel operator asks for; resolved to a concrete
/// [`Capacity`] only when the fused channel is finally allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityRequest {
    /// "A buffer of any size" — overridden by any explicit request.
    Default,
    /// Exactly this many elements (`0` = rendezvous).
    Fixed(usize),
    /// Never suspend the producer.
    Unlimited,
}

const DEFAULT_BUFFER: usize = 64;

type ProducerFn<T> =
    Arc<dyn Fn(Channel<T>) -> Pin<Box<dyn Future<Output = Outcome<()>> + Send>> + Send + Sync>;

enum FlowSource<T> {
    Upstream(BoxFlow<T>),
    Producer(ProducerFn<T>),
}

impl<T> Clone for FlowSource<T> {
    fn clone(&self) -> Self {
        match self {
            FlowSource::Upstream(flow) => FlowSource::Upstream(flow.clone()),
            FlowSource::Producer(body) => FlowSource::Producer(body.clone()),
        }
    }
}

/// A flow whose values travel through one configured channel.
pub struct ChannelFlow<T> {
    source: FlowSource<T>,
    pub(crate) dispatcher: Option<Arc<dyn Dispatcher>>,
    pub(crate) capacity: CapacityRequest,
    pub(crate) policy: OverflowPolicy,
}

/// Wrap (or fuse into) a channel flow with the given parameters.
pub(crate) fn fused<T: Send + 'static>(
    upstream: BoxFlow<T>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    capacity: CapacityRequest,
    policy: OverflowPolicy,
) -> BoxFlow<T> {
    if let Some(inner) = upstream.as_channel_flow() {
        // Fuse instead of stacking a second channel.
        let merged_dispatcher = inner.dispatcher.clone().or(dispatcher);
        let (merged_capacity, merged_policy) = if policy != OverflowPolicy::Suspend {
            // A non-suspending buffer downstream makes any preceding
            // suspending buffer unreachable.
            (capacity, policy)
        } else {
            let merged = match (inner.capacity, capacity) {
                (CapacityRequest::Default, outer) => outer,
                (inner, CapacityRequest::Default) => inner,
                (CapacityRequest::Unlimited, _) | (_, CapacityRequest::Unlimited) => {
                    CapacityRequest::Unlimited
                }
                (CapacityRequest::Fixed(a), CapacityRequest::Fixed(b)) => {
                    CapacityRequest::Fixed(a + b)
                }
            };
            (merged, inner.policy)
        };
        return Arc::new(ChannelFlow {
            source: inner.source.clone(),
            dispatcher: merged_dispatcher,
            capacity: merged_capacity,
            policy: merged_policy,
        });
    }
    Arc::new(ChannelFlow {
        source: FlowSource::Upstream(upstream),
        dispatcher,
        capacity,
        policy,
    })
}

/// Build a hot-producer flow: `body` runs in its own child task per
/// collection and sends into the channel handed to it; closing the
/// channel (or returning) ends the flow.
pub fn channel_flow<T, F, Fut>(body: F) -> BoxFlow<T>
where
    T: Send + 'static,
    F: Fn(Channel<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome<()>> + Send + 'static,
{
    Arc::new(ChannelFlow {
        source: FlowSource::Producer(Arc::new(move |channel| Box::pin(body(channel)))),
        dispatcher: None,
        capacity: CapacityRequest::Default,
        policy: OverflowPolicy::Suspend,
    })
}

impl<T: Send + 'static> ChannelFlow<T> {
    fn channel_capacity(&self) -> Capacity {
        match self.capacity {
            CapacityRequest::Default => Capacity::Bounded(DEFAULT_BUFFER),
            CapacityRequest::Fixed(0) => Capacity::Rendezvous,
            CapacityRequest::Fixed(n) => Capacity::Bounded(n),
            CapacityRequest::Unlimited => Capacity::Unlimited,
        }
    }

    fn launch_options(&self) -> LaunchOptions {
        match &self.dispatcher {
            Some(dispatcher) => LaunchOptions::on(dispatcher.clone()),
            None => LaunchOptions::default(),
        }
    }

    /// Start the producer in `scope` and return the channel to drain.
    /// This is the escape hatch from flows back into channel code.
    pub fn produce_in(&self, scope: &Scope) -> Channel<T> {
        let channel = Channel::with_config(self.channel_capacity(), self.policy, None);
        let producer = make_producer(self.source.clone(), channel.clone());
        scope.launch_with(self.launch_options(), producer);
        channel
    }
}

fn make_producer<T: Send + 'static>(
    source: FlowSource<T>,
    channel: Channel<T>,
) -> impl Future<Output = Outcome<()>> + Send + 'static {
    async move {
        let result = match source {
            FlowSource::Upstream(flow) => {
                let mut sink = ChannelSink {
                    channel: channel.clone(),
                };
                flow.collect(&mut sink).await
            }
            FlowSource::Producer(body) => body(channel.clone()).await,
        };
        match &result {
            Ok(()) => {
                channel.close();
            }
            Err(error) => {
                tracing::debug!(error = %error, "flow producer failed; closing channel");
                channel.close_with(Some(fault(error.to_string())));
            }
        }
        result
    }
}

#[async_trait]
impl<T: Send + 'static> Flow<T> for ChannelFlow<T> {
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()> {
        let channel = Channel::with_config(self.channel_capacity(), self.policy, None);
        let producer = make_producer(self.source.clone(), channel.clone());
        let options = self.launch_options();
        coroutine_scope(|scope| async move {
            scope.launch_with(options, producer);
            loop {
                match channel.recv().await {
                    Ok(value) => collector.emit(value).await?,
                    Err(RecvError::Closed(None)) => return Ok(()),
                    Err(RecvError::Closed(Some(cause))) => {
                        return Err(StrandError::Failed(cause))
                    }
                    Err(RecvError::Cancelled(cancelled)) => {
                        return Err(StrandError::Cancelled(cancelled))
                    }
                }
            }
        })
        .await
    }

    fn as_channel_flow(&self) -> Option<&ChannelFlow<T>> {
        Some(self)
    }
}

/// Collector forwarding emissions into a channel (the producer half of a
/// channel flow).
pub(crate) struct ChannelSink<T> {
    pub(crate) channel: Channel<T>,
}

#[async_trait]
impl<T: Send + 'static> FlowCollector<T> for ChannelSink<T> {
    async fn emit(&mut self, value: T) -> Outcome<()> {
        self.channel.send(value).await.map_err(|error| match error {
            SendError::Cancelled(cancelled) => StrandError::Cancelled(cancelled),
            closed => StrandError::from(closed),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::flow_of;
    use crate::ops::FlowOps;
    use strand_core::dispatch::PoolDispatcher;

    #[test]
    fn adjacent_buffers_fuse_into_one_channel_with_summed_capacity() {
        let fused = flow_of([1, 2, 3]).buffer(2).buffer(3);
        let cf = fused.as_channel_flow().expect("fused channel flow");
        assert_eq!(cf.capacity, CapacityRequest::Fixed(5));
        assert_eq!(cf.policy, OverflowPolicy::Suspend);
        // The source is the plain upstream, not another channel flow.
        match &cf.source {
            FlowSource::Upstream(upstream) => assert!(upstream.as_channel_flow().is_none()),
            FlowSource::Producer(_) => panic!("unexpected producer source"),
        }
    }

    #[test]
    fn inner_dispatcher_wins_when_stacking_flow_on() {
        let pool_a = PoolDispatcher::new("fuse-a", 1);
        let pool_b = PoolDispatcher::new("fuse-b", 1);
        let fused = flow_of([1]).flow_on(pool_a).flow_on(pool_b);
        let cf = fused.as_channel_flow().unwrap();
        assert_eq!(cf.dispatcher.as_ref().unwrap().name(), "fuse-a");
    }

    #[test]
    fn explicit_capacity_overrides_the_default_request() {
        let pool = PoolDispatcher::new("fuse-c", 1);
        let fused = flow_of([1]).flow_on(pool).buffer(4);
        let cf = fused.as_channel_flow().unwrap();
        assert_eq!(cf.capacity, CapacityRequest::Fixed(4));
        // And the other way round: buffer first, flow_on after.
        let pool = PoolDispatcher::new("fuse-d", 1);
        let fused = flow_of([1]).buffer(4).flow_on(pool);
        let cf = fused.as_channel_flow().unwrap();
        assert_eq!(cf.capacity, CapacityRequest::Fixed(4));
    }

    #[test]
    fn non_suspending_policy_replaces_preceding_buffers() {
        let fused = flow_of([1]).buffer(8).conflate();
        let cf = fused.as_channel_flow().unwrap();
        assert_eq!(cf.capacity, CapacityRequest::Fixed(1));
        assert_eq!(cf.policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn channel_flow_builder_is_already_fused() {
        let fused = channel_flow(|ch: Channel<u32>| async move {
            ch.send(1).await.map_err(StrandError::from)?;
            Ok(())
        })
        .buffer(16);
        let cf = fused.as_channel_flow().unwrap();
        assert_eq!(cf.capacity, CapacityRequest::Fixed(16));
        assert!(matches!(cf.source, FlowSource::Producer(_)));
    }
}
