//! Strand flow — cold asynchronous streams for the strand runtime.
//!
//! A [`Flow`] describes a producer that runs once per collection. Plain
//! operators compose without tasks or channels; the channel-based
//! operators (`buffer`, `flow_on`, [`channel_flow`]) fuse into a single
//! configured channel. [`MutableSharedFlow`] and [`MutableStateFlow`] are
//! the hot, multicast counterparts.

pub mod builders;
pub mod channel_flow;
pub mod flow;
pub mod ops;
pub mod shared;
pub mod state;

mod delay;

pub use builders::{empty_flow, flow, flow_of, FlowSink};
pub use channel_flow::{channel_flow, CapacityRequest, ChannelFlow};
pub use flow::{BoxFlow, Flow, FlowCollector};
pub use ops::{channel_count_hint, FlowOps};
pub use shared::MutableSharedFlow;
pub use state::MutableStateFlow;
