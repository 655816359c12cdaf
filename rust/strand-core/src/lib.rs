//! Strand core — a structured-concurrency runtime.
//!
//! Tasks are lightweight, cancellable units of work organized into a
//! parent/child job tree ([`job`]), dispatched onto configurable
//! executors ([`dispatch`]), and coordinated through suspending
//! primitives: channels ([`channel`]), multi-way select ([`select`]),
//! timers ([`time`]), and fair locks ([`sync`]).
//!
//! The scope builders in [`scope`] enforce the structural invariant: a
//! scope never completes before everything launched into it has
//! completed, and a child's failure cancels its siblings (unless the
//! scope supervises them).

pub mod channel;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod job;
pub mod run;
pub mod scope;
pub mod select;
pub mod suspend;
pub mod sync;
pub mod time;

mod task;

pub use channel::{Capacity, Channel, OverflowPolicy, RecvError, SendError, TryRecvError, TrySendError};
pub use context::TaskContext;
pub use dispatch::{limited_parallelism, Dispatcher, Dispatchers, PoolDispatcher, StepDispatcher};
pub use error::{fault, Cancelled, Cause, Failure, Fault, Outcome, StrandError};
pub use job::{Deferred, JobHandle, JobPhase};
pub use run::run_blocking;
pub use scope::{
    check_cancellation, coroutine_scope, non_cancellable, supervisor_scope, with_context,
    yield_now, LaunchOptions, Scope,
};
pub use select::Select;
pub use time::{delay, invoke_on_timeout, with_timeout, with_timeout_opt};
