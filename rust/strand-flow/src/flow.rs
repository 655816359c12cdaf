//! The cold-flow contract.
//!
//! A [`Flow`] is a description of a producer: nothing runs until
//! [`collect`](Flow::collect) is called, and every collection re-executes
//! the producer from scratch. A [`FlowCollector`] receives the emissions.
//!
//! Collection is sequential: within one `collect` call every emission
//! happens in the task that started collecting (channel-based operators
//! introduce a second task but move values through exactly one channel —
//! see the fusing in [`crate::channel_flow`]).

use async_trait::async_trait;
use std::sync::Arc;

use strand_core::error::{Outcome, StrandError};

use crate::channel_flow::ChannelFlow;

/// A shared, type-erased flow.
pub type BoxFlow<T> = Arc<dyn Flow<T>>;

/// A cold asynchronous stream of values.
#[async_trait]
pub trait Flow<T: Send + 'static>: Send + Sync + 'static {
    /// Run the producer, feeding every value to `collector`. Returns when
    /// the producer finishes, the collector aborts, or either side fails.
    async fn collect(&self, collector: &mut dyn FlowCollector<T>) -> Outcome<()>;

    /// Fusing hook: channel-based flows expose their configuration so an
    /// adjacent channel operator merges into them instead of stacking a
    /// second channel.
    fn as_channel_flow(&self) -> Option<&ChannelFlow<T>> {
        None
    }
}

/// The receiving side of a collection.
#[async_trait]
pub trait FlowCollector<T: Send + 'static>: Send {
    async fn emit(&mut self, value: T) -> Outcome<()>;
}

// ---------------------------------------------------------------------------
// Abort protocol
// ---------------------------------------------------------------------------

/// Sentinel threaded through `emit` results by truncating operators
/// (`take`, `first`): the upstream unwinds, the operator converts the
/// sentinel back into normal completion.
#[derive(Debug)]
pub(crate) struct AbortCollection;

impl std::fmt::Display for AbortCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow collection aborted")
    }
}

impl std::error::Error for AbortCollection {}

pub(crate) fn abort_error() -> StrandError {
    StrandError::Failed(Arc::new(AbortCollection))
}

pub(crate) fn is_abort(error: &StrandError) -> bool {
    matches!(error, StrandError::Failed(fault) if fault.downcast_ref::<AbortCollection>().is_some())
}

/// Map an abort back to clean completion; pass everything else through.
pub(crate) fn swallow_abort(result: Outcome<()>) -> Outcome<()> {
    match result {
        Err(error) if is_abort(&error) => Ok(()),
        other => other,
    }
}
