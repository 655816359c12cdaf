//! Buffered channels.
//!
//! The implementation follows the segmented-array channel design: a
//! conceptually infinite array of cells, two monotone counters (`senders`,
//! with the close flag in the top bit, and `receivers`) that assign each
//! operation a unique cell, and a `buffer_end` counter separating sends
//! that may complete without suspension from sends that must find a
//! receiver. Each cell is touched by exactly one send and one receive, so
//! the per-cell lock is contention-free by construction; the counters are
//! the linearization points.
//!
//! Cell lifecycle:
//!
//! ```text
//! Empty -> { Buffered, WaiterSend, WaiterRecv } -> { Done, Interrupted, Broken, Closed }
//! ```
//!
//! `Interrupted` marks a cancelled waiter (the counterpart skips the cell
//! and retries with a fresh index), `Broken` poisons a cell whose sender
//! was observed mid-flight (both sides retry).
//!
//! Capacity variants: rendezvous (0), bounded, unlimited, conflated
//! (bounded(1) + drop-oldest). Bounded channels may replace suspension
//! with a drop policy. An optional `on_undelivered` callback observes
//! every value that can no longer reach a receiver.

use once_cell::sync::OnceCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Cancelled, Fault, StrandError};
use crate::hooks::deliver_unhandled;
use crate::suspend::{gated_suspension, suspension, Resumer, SelectGate, SuspendFuture};

const SEGMENT_SIZE: u64 = 32;
const CLOSE_BIT: u64 = 1 << 63;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Channel capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// No buffer; every send pairs with a receive.
    Rendezvous,
    /// A fixed buffer. `Bounded(0)` behaves as `Rendezvous`.
    Bounded(usize),
    /// Sends never suspend; memory is the only limit.
    Unlimited,
    /// Keeps only the most recent value (`Bounded(1)` + drop-oldest).
    Conflated,
}

/// What a bounded channel does when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Suspend the sender until space frees up.
    #[default]
    Suspend,
    /// Evict the oldest buffered value.
    DropOldest,
    /// Discard the value being sent.
    DropLatest,
}

/// Callback observing values that can no longer reach a receiver.
pub type UndeliveredFn<T> = Arc<dyn Fn(T) + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by [`Channel::send`].
#[derive(Debug)]
pub enum SendError<T> {
    /// The channel is closed for send; the value comes back to the caller.
    Closed { value: T, cause: Option<Fault> },
    /// The sending job was cancelled while suspended.
    Cancelled(Arc<Cancelled>),
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed { .. } => write!(f, "send failed: channel is closed"),
            SendError::Cancelled(c) => write!(f, "send failed: {c}"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for SendError<T> {}

/// Error returned by [`Channel::try_send`].
#[derive(Debug)]
pub enum TrySendError<T> {
    /// The buffer is full (or no receiver waits, for rendezvous).
    Full(T),
    /// The channel is closed for send.
    Closed { value: T, cause: Option<Fault> },
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "try_send failed: channel is full"),
            TrySendError::Closed { .. } => write!(f, "try_send failed: channel is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TrySendError<T> {}

/// Error returned by [`Channel::recv`].
#[derive(Debug, Clone)]
pub enum RecvError {
    /// Closed and drained. The fault is the close cause, if one was given.
    Closed(Option<Fault>),
    /// The receiving job was cancelled while suspended.
    Cancelled(Arc<Cancelled>),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Closed(_) => write!(f, "recv failed: channel is closed and empty"),
            RecvError::Cancelled(c) => write!(f, "recv failed: {c}"),
        }
    }
}

impl std::error::Error for RecvError {}

/// Error returned by [`Channel::try_recv`].
#[derive(Debug, Clone)]
pub enum TryRecvError {
    /// No value is ready right now; the channel is still open.
    Empty,
    /// Closed and drained.
    Closed(Option<Fault>),
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => write!(f, "channel is empty"),
            TryRecvError::Closed(_) => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for TryRecvError {}

impl From<RecvError> for StrandError {
    fn from(value: RecvError) -> Self {
        match value {
            RecvError::Cancelled(c) => StrandError::Cancelled(c),
            RecvError::Closed(Some(fault)) => StrandError::Failed(fault),
            RecvError::Closed(None) => StrandError::msg("channel is closed"),
        }
    }
}

impl<T> From<SendError<T>> for StrandError {
    fn from(value: SendError<T>) -> Self {
        match value {
            SendError::Cancelled(c) => StrandError::Cancelled(c),
            SendError::Closed {
                cause: Some(fault), ..
            } => StrandError::Failed(fault),
            SendError::Closed { .. } => StrandError::msg("channel is closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cells and segments
// ---------------------------------------------------------------------------

/// What a suspended sender is resumed with.
pub(crate) enum SendOutcome<T> {
    /// The value was delivered or buffered.
    Sent,
    /// The rendezvous fell through (counterpart lost its select); claim a
    /// fresh cell and try again with the returned value.
    Retry(T),
    /// The channel closed while the sender was parked.
    Closed { value: T, cause: Option<Fault> },
}

/// What a suspended receiver is resumed with.
pub(crate) enum RecvOutcome<T> {
    Value(T),
    /// The rendezvous fell through; claim a fresh cell and park again.
    Retry,
    Closed(Option<Fault>),
}

enum CellState<T> {
    Empty,
    Buffered(T),
    WaiterSend {
        value: T,
        resumer: Resumer<SendOutcome<T>>,
    },
    WaiterRecv {
        resumer: Resumer<RecvOutcome<T>>,
    },
    Done,
    Interrupted,
    Broken,
    Closed,
}

impl<T> CellState<T> {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            CellState::Done | CellState::Interrupted | CellState::Broken | CellState::Closed
        )
    }
}

struct Segment<T> {
    id: u64,
    cells: Vec<Mutex<CellState<T>>>,
    next: OnceCell<Arc<Segment<T>>>,
}

impl<T> Segment<T> {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            cells: (0..SEGMENT_SIZE).map(|_| Mutex::new(CellState::Empty)).collect(),
            next: OnceCell::new(),
        })
    }

    fn next_or_create(&self) -> Arc<Segment<T>> {
        self.next.get_or_init(|| Segment::new(self.id + 1)).clone()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A multi-producer multi-consumer channel handle. Clones share the same
/// channel; there is no separate sender/receiver split.
pub struct Channel<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let closed = self.core.senders.load(Ordering::SeqCst) & CLOSE_BIT != 0;
        f.debug_struct("Channel")
            .field("capacity", &self.core.capacity)
            .field("policy", &self.core.policy)
            .field("closed", &closed)
            .finish()
    }
}

struct ChannelCore<T> {
    capacity: Capacity,
    policy: OverflowPolicy,
    on_undelivered: Option<UndeliveredFn<T>>,
    /// Claim counter for sends; the top bit is the close flag.
    senders: AtomicU64,
    /// Claim counter for receives.
    receivers: AtomicU64,
    /// Cells below this index may buffer without suspension.
    buffer_end: AtomicU64,
    head: Mutex<Arc<Segment<T>>>,
    close_cause: Mutex<Option<Fault>>,
    closed_for_receive: AtomicBool,
}

enum SendClaim<T> {
    Done,
    Closed(T, Option<Fault>),
    Suspend(SuspendFuture<SendOutcome<T>>),
    /// Try-only mode: would have to suspend.
    Full(T),
}

enum RecvClaim<T> {
    Value(T),
    Closed(Option<Fault>),
    Suspend(SuspendFuture<RecvOutcome<T>>),
    /// Try-only mode: nothing ready.
    Empty,
}

/// Result of registering a select clause on a channel.
pub(crate) enum RecvRegistration<T> {
    /// Completed during registration (gate already claimed).
    Ready(Result<T, Option<Fault>>),
    Suspended(SuspendFuture<RecvOutcome<T>>),
    /// Another clause claimed the select first.
    Lost,
}

pub(crate) enum SendRegistration<T> {
    /// Completed during registration (gate already claimed).
    Ready(Result<(), (T, Option<Fault>)>),
    Suspended(SuspendFuture<SendOutcome<T>>),
    /// Another clause claimed the select first; the value comes back.
    Lost(T),
}

impl<T: Send + 'static> Channel<T> {
    /// Capacity-zero channel: every send rendezvouses with a receive.
    pub fn rendezvous() -> Self {
        Self::with_config(Capacity::Rendezvous, OverflowPolicy::Suspend, None)
    }

    /// Bounded buffer (`0` behaves as rendezvous).
    pub fn bounded(capacity: usize) -> Self {
        Self::with_config(Capacity::Bounded(capacity), OverflowPolicy::Suspend, None)
    }

    /// Unbounded buffer; sends never suspend.
    pub fn unlimited() -> Self {
        Self::with_config(Capacity::Unlimited, OverflowPolicy::Suspend, None)
    }

    /// Keeps only the most recent value.
    pub fn conflated() -> Self {
        Self::with_config(Capacity::Conflated, OverflowPolicy::Suspend, None)
    }

    /// Full-control constructor.
    pub fn with_config(
        capacity: Capacity,
        policy: OverflowPolicy,
        on_undelivered: Option<UndeliveredFn<T>>,
    ) -> Self {
        // Normalize the shorthand capacities.
        let (capacity, policy) = match capacity {
            Capacity::Conflated => (Capacity::Bounded(1), OverflowPolicy::DropOldest),
            Capacity::Bounded(0) => (Capacity::Rendezvous, policy),
            other => (other, policy),
        };
        let buffer_end = match capacity {
            Capacity::Rendezvous => 0,
            Capacity::Bounded(n) => n as u64,
            Capacity::Unlimited => u64::MAX >> 1,
            Capacity::Conflated => unreachable!("normalized above"),
        };
        Self {
            core: Arc::new(ChannelCore {
                capacity,
                policy,
                on_undelivered,
                senders: AtomicU64::new(0),
                receivers: AtomicU64::new(0),
                buffer_end: AtomicU64::new(buffer_end),
                head: Mutex::new(Segment::new(0)),
                close_cause: Mutex::new(None),
                closed_for_receive: AtomicBool::new(false),
            }),
        }
    }

    // -- send --------------------------------------------------------------

    /// Send a value. Suspends iff the channel is full and the overflow
    /// policy is [`OverflowPolicy::Suspend`].
    pub async fn send(&self, value: T) -> Result<(), SendError<T>> {
        match self.core.policy {
            OverflowPolicy::Suspend => self.send_suspending(value).await,
            OverflowPolicy::DropOldest | OverflowPolicy::DropLatest => {
                self.send_dropping(value)
            }
        }
    }

    async fn send_suspending(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            match self.core.send_claim(value, None, false) {
                SendClaim::Done => return Ok(()),
                SendClaim::Closed(v, cause) => {
                    return Err(SendError::Closed { value: v, cause })
                }
                SendClaim::Full(_) => unreachable!("suspend mode never reports full"),
                SendClaim::Suspend(future) => match future.await {
                    Ok(SendOutcome::Sent) => return Ok(()),
                    Ok(SendOutcome::Retry(v)) => {
                        value = v;
                        continue;
                    }
                    Ok(SendOutcome::Closed { value, cause }) => {
                        return Err(SendError::Closed { value, cause })
                    }
                    Err(cancelled) => return Err(SendError::Cancelled(cancelled)),
                },
            }
        }
    }

    /// Non-suspending overflow handling for drop policies.
    fn send_dropping(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            match self.try_send(value) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed { value, cause }) => {
                    return Err(SendError::Closed { value, cause })
                }
                Err(TrySendError::Full(v)) => match self.core.policy {
                    OverflowPolicy::DropLatest => {
                        self.core.undeliver(v);
                        return Ok(());
                    }
                    OverflowPolicy::DropOldest => {
                        // Evict the head of the buffer, then retry.
                        if let RecvClaim::Value(old) = self.core.recv_claim(None, true) {
                            self.core.undeliver(old);
                        }
                        value = v;
                    }
                    OverflowPolicy::Suspend => unreachable!(),
                },
            }
        }
    }

    /// Non-suspending send. On a rendezvous channel this succeeds iff a
    /// receiver is already waiting.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        match self.core.send_claim(value, None, true) {
            SendClaim::Done => Ok(()),
            SendClaim::Closed(value, cause) => Err(TrySendError::Closed { value, cause }),
            SendClaim::Full(value) => Err(TrySendError::Full(value)),
            SendClaim::Suspend(_) => unreachable!("try mode never suspends"),
        }
    }

    // -- receive -----------------------------------------------------------

    /// Receive a value; suspends on an empty, open channel. Errs with
    /// [`RecvError::Closed`] once the channel is closed and drained.
    pub async fn recv(&self) -> Result<T, RecvError> {
        loop {
            match self.core.recv_claim(None, false) {
                RecvClaim::Value(value) => return Ok(value),
                RecvClaim::Closed(cause) => return Err(RecvError::Closed(cause)),
                RecvClaim::Empty => unreachable!("blocking mode never reports empty"),
                RecvClaim::Suspend(future) => match future.await {
                    Ok(RecvOutcome::Value(value)) => return Ok(value),
                    Ok(RecvOutcome::Retry) => continue,
                    Ok(RecvOutcome::Closed(cause)) => return Err(RecvError::Closed(cause)),
                    Err(cancelled) => return Err(RecvError::Cancelled(cancelled)),
                },
            }
        }
    }

    /// Non-suspending receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        match self.core.recv_claim(None, true) {
            RecvClaim::Value(value) => Ok(value),
            RecvClaim::Closed(cause) => Err(TryRecvError::Closed(cause)),
            RecvClaim::Empty => Err(TryRecvError::Empty),
            RecvClaim::Suspend(_) => unreachable!("try mode never suspends"),
        }
    }

    // -- close -------------------------------------------------------------

    /// Close the channel for send. Idempotent: `true` only on the call
    /// that performed the close. Buffered values stay receivable.
    pub fn close(&self) -> bool {
        self.close_with(None)
    }

    /// Close with a cause that subsequent operations observe.
    pub fn close_with(&self, cause: Option<Fault>) -> bool {
        if let Some(cause) = cause {
            let mut slot = self.core.close_cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        let prev = self.core.senders.fetch_or(CLOSE_BIT, Ordering::SeqCst);
        if prev & CLOSE_BIT != 0 {
            return false;
        }
        self.core.sweep_after_close();
        true
    }

    /// Close for receive as well: buffered values are discarded through
    /// the undelivered callback and pending receivers resume closed.
    pub fn cancel(&self) {
        self.cancel_with(None);
    }

    /// [`cancel`](Channel::cancel) with an explicit cause.
    pub fn cancel_with(&self, cause: Option<Fault>) {
        self.close_with(cause);
        self.core.closed_for_receive.store(true, Ordering::Release);
        loop {
            match self.core.recv_claim(None, true) {
                RecvClaim::Value(value) => self.core.undeliver(value),
                _ => break,
            }
        }
    }

    /// `true` once the channel is closed for send.
    pub fn is_closed_for_send(&self) -> bool {
        self.core.is_closed_for_send()
    }

    /// The close cause, if any was supplied.
    pub fn close_cause(&self) -> Option<Fault> {
        self.core.close_cause.lock().unwrap().clone()
    }

    // -- select integration -------------------------------------------------

    pub(crate) fn register_recv(
        &self,
        gate: Arc<SelectGate>,
        index: usize,
    ) -> RecvRegistration<T> {
        match self.core.recv_claim(Some((gate, index)), false) {
            RecvClaim::Value(value) => RecvRegistration::Ready(Ok(value)),
            RecvClaim::Closed(cause) => RecvRegistration::Ready(Err(cause)),
            RecvClaim::Suspend(future) => RecvRegistration::Suspended(future),
            RecvClaim::Empty => RecvRegistration::Lost,
        }
    }

    pub(crate) fn register_send(
        &self,
        value: T,
        gate: Arc<SelectGate>,
        index: usize,
    ) -> SendRegistration<T> {
        match self.core.send_claim(value, Some((gate, index)), false) {
            SendClaim::Done => SendRegistration::Ready(Ok(())),
            SendClaim::Closed(value, cause) => SendRegistration::Ready(Err((value, cause))),
            SendClaim::Suspend(future) => SendRegistration::Suspended(future),
            SendClaim::Full(value) => SendRegistration::Lost(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Core algorithm
// ---------------------------------------------------------------------------

impl<T: Send + 'static> ChannelCore<T> {
    fn is_closed_for_send(&self) -> bool {
        self.senders.load(Ordering::SeqCst) & CLOSE_BIT != 0
    }

    fn senders_count(&self) -> u64 {
        self.senders.load(Ordering::SeqCst) & !CLOSE_BIT
    }

    fn cause(&self) -> Option<Fault> {
        self.close_cause.lock().unwrap().clone()
    }

    fn undeliver(self: &Arc<Self>, value: T) {
        if let Some(callback) = &self.on_undelivered {
            if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
                deliver_unhandled(None, &crate::error::fault("undelivered-element callback failed"));
            }
        }
    }

    fn find_segment(&self, id: u64) -> Arc<Segment<T>> {
        let mut segment = self.head.lock().unwrap().clone();
        while segment.id < id {
            segment = segment.next_or_create();
        }
        segment
    }

    /// Drop fully processed head segments. Cheap scan under the per-cell
    /// locks; in-flight operations keep their own `Arc` to the segment.
    fn try_advance_head(&self) {
        let mut head = self.head.lock().unwrap();
        loop {
            let all_terminal = head
                .cells
                .iter()
                .all(|cell| cell.lock().unwrap().is_terminal());
            if !all_terminal {
                return;
            }
            let next = head.next.get().cloned();
            match next {
                Some(next) => *head = next,
                None => return,
            }
        }
    }

    /// Claim a send cell and act on its state. `try_only` never suspends.
    fn send_claim(
        self: &Arc<Self>,
        value: T,
        gate: Option<(Arc<SelectGate>, usize)>,
        try_only: bool,
    ) -> SendClaim<T> {
        let mut value = value;
        loop {
            // Fast non-claiming check for the try path so a full channel
            // does not burn indexes.
            if try_only {
                let s = self.senders.load(Ordering::SeqCst);
                if s & CLOSE_BIT != 0 {
                    return SendClaim::Closed(value, self.cause());
                }
                let count = s & !CLOSE_BIT;
                let in_buffer = count < self.buffer_end.load(Ordering::SeqCst)
                    || count < self.receivers.load(Ordering::SeqCst);
                if !in_buffer {
                    return SendClaim::Full(value);
                }
            }

            let raw = self.senders.fetch_add(1, Ordering::SeqCst);
            if raw & CLOSE_BIT != 0 {
                return SendClaim::Closed(value, self.cause());
            }
            let index = raw;
            let segment = self.find_segment(index / SEGMENT_SIZE);
            let slot = &segment.cells[(index % SEGMENT_SIZE) as usize];
            let mut cell = slot.lock().unwrap();
            match &*cell {
                CellState::Empty => {
                    let in_buffer = index < self.buffer_end.load(Ordering::SeqCst)
                        || index < self.receivers.load(Ordering::SeqCst);
                    if in_buffer {
                        // Select clauses must win the gate before the
                        // effect becomes observable.
                        if let Some((gate, clause)) = &gate {
                            if !gate.try_claim(*clause) {
                                return SendClaim::Full(value);
                            }
                        }
                        *cell = CellState::Buffered(value);
                        return SendClaim::Done;
                    }
                    if try_only {
                        *cell = CellState::Interrupted;
                        return SendClaim::Full(value);
                    }
                    let (suspension, resumer) = match &gate {
                        Some((gate, clause)) => gated_suspension(gate.clone(), *clause),
                        None => suspension(),
                    };
                    *cell = CellState::WaiterSend { value, resumer };
                    drop(cell);
                    let cleanup_segment = segment.clone();
                    let cleanup_core = self.clone();
                    let cell_index = (index % SEGMENT_SIZE) as usize;
                    let future = suspension.into_future(Some(Box::new(move |parked| {
                        cleanup_core.cleanup_send_waiter(
                            &cleanup_segment,
                            cell_index,
                            parked,
                        );
                    })));
                    return SendClaim::Suspend(future);
                }
                CellState::WaiterRecv { .. } => {
                    let state = std::mem::replace(&mut *cell, CellState::Done);
                    let CellState::WaiterRecv { resumer } = state else {
                        unreachable!()
                    };
                    if let Some((gate, clause)) = &gate {
                        if !gate.try_claim(*clause) {
                            // Put the receiver back; this clause lost.
                            *cell = CellState::WaiterRecv { resumer };
                            return SendClaim::Full(value);
                        }
                    }
                    // Resume outside the cell lock: the woken task may run
                    // inline and touch this channel again.
                    drop(cell);
                    match resumer.resume(RecvOutcome::Value(value)) {
                        Ok(()) => return SendClaim::Done,
                        Err(RecvOutcome::Value(v)) => {
                            // Receiver was cancelled or lost its select.
                            *slot.lock().unwrap() = CellState::Interrupted;
                            value = v;
                            continue;
                        }
                        Err(_) => unreachable!(),
                    }
                }
                CellState::Interrupted | CellState::Broken => continue,
                CellState::Closed => return SendClaim::Closed(value, self.cause()),
                CellState::Buffered(_) | CellState::WaiterSend { .. } | CellState::Done => {
                    unreachable!("one send per cell")
                }
            }
        }
    }

    /// Claim a receive cell and act on its state. `try_only` never
    /// suspends.
    fn recv_claim(
        self: &Arc<Self>,
        gate: Option<(Arc<SelectGate>, usize)>,
        try_only: bool,
    ) -> RecvClaim<T> {
        loop {
            let raw = self.senders.load(Ordering::SeqCst);
            let closed = raw & CLOSE_BIT != 0;
            let sends = raw & !CLOSE_BIT;
            let receives = self.receivers.load(Ordering::SeqCst);
            if self.closed_for_receive.load(Ordering::Acquire) && !try_only {
                return RecvClaim::Closed(self.cause());
            }
            if receives >= sends {
                if closed || self.closed_for_receive.load(Ordering::Acquire) {
                    return RecvClaim::Closed(self.cause());
                }
                if try_only {
                    return RecvClaim::Empty;
                }
            }
            if try_only && receives >= sends {
                return RecvClaim::Empty;
            }

            let index = self.receivers.fetch_add(1, Ordering::SeqCst);
            let segment = self.find_segment(index / SEGMENT_SIZE);
            let slot = &segment.cells[(index % SEGMENT_SIZE) as usize];
            let mut cell = slot.lock().unwrap();
            let claim = match &*cell {
                CellState::Buffered(_) => {
                    if let Some((gate, clause)) = &gate {
                        if !gate.try_claim(*clause) {
                            // Consumed index with a parked value: hand the
                            // value to the undelivered callback rather than
                            // strand it (registration-time race).
                            let state = std::mem::replace(&mut *cell, CellState::Done);
                            let CellState::Buffered(v) = state else { unreachable!() };
                            drop(cell);
                            self.undeliver(v);
                            self.expand_buffer();
                            return RecvClaim::Empty;
                        }
                    }
                    let state = std::mem::replace(&mut *cell, CellState::Done);
                    let CellState::Buffered(v) = state else { unreachable!() };
                    Some(RecvClaim::Value(v))
                }
                CellState::WaiterSend { .. } => {
                    if let Some((gate, clause)) = &gate {
                        if !gate.try_claim(*clause) {
                            // Ask the parked sender to take a fresh cell so
                            // it does not wait on our abandoned index.
                            let state = std::mem::replace(&mut *cell, CellState::Interrupted);
                            let CellState::WaiterSend { value, resumer } = state else {
                                unreachable!()
                            };
                            drop(cell);
                            if let Err(SendOutcome::Retry(v)) =
                                resumer.resume(SendOutcome::Retry(value))
                            {
                                // Sender already cancelled; value disposal
                                // falls to us.
                                self.undeliver(v);
                            }
                            return RecvClaim::Empty;
                        }
                    }
                    let state = std::mem::replace(&mut *cell, CellState::Done);
                    let CellState::WaiterSend { value, resumer } = state else {
                        unreachable!()
                    };
                    drop(cell);
                    match resumer.resume(SendOutcome::Sent) {
                        Ok(()) => {
                            self.expand_buffer();
                            return RecvClaim::Value(value);
                        }
                        Err(_) => {
                            // Sender cancelled while we rendezvoused: the
                            // value never reaches anyone else.
                            self.undeliver(value);
                            let mut cell = slot.lock().unwrap();
                            *cell = CellState::Interrupted;
                            continue;
                        }
                    }
                }
                CellState::Empty => {
                    let sends_now = self.senders_count();
                    if index < sends_now {
                        // The paired sender claimed this cell but has not
                        // arrived; poison it so both sides retry.
                        *cell = CellState::Broken;
                        if try_only {
                            return RecvClaim::Empty;
                        }
                        continue;
                    }
                    if self.is_closed_for_send() {
                        *cell = CellState::Closed;
                        return RecvClaim::Closed(self.cause());
                    }
                    if try_only {
                        *cell = CellState::Interrupted;
                        return RecvClaim::Empty;
                    }
                    let (suspension, resumer) = match &gate {
                        Some((gate, clause)) => gated_suspension(gate.clone(), *clause),
                        None => suspension(),
                    };
                    *cell = CellState::WaiterRecv { resumer };
                    drop(cell);
                    let cleanup_segment = segment.clone();
                    let cleanup_core = self.clone();
                    let cell_index = (index % SEGMENT_SIZE) as usize;
                    let future = suspension.into_future(Some(Box::new(move |parked| {
                        cleanup_core.cleanup_recv_waiter(
                            &cleanup_segment,
                            cell_index,
                            parked,
                        );
                    })));
                    return RecvClaim::Suspend(future);
                }
                CellState::Interrupted => None,
                CellState::Closed => Some(RecvClaim::Closed(self.cause())),
                CellState::Broken | CellState::Done | CellState::WaiterRecv { .. } => {
                    unreachable!("one receive per cell")
                }
            };
            drop(cell);
            match claim {
                Some(RecvClaim::Value(v)) => {
                    self.expand_buffer();
                    if (index + 1) % SEGMENT_SIZE == 0 {
                        self.try_advance_head();
                    }
                    return RecvClaim::Value(v);
                }
                Some(other) => return other,
                None => continue,
            }
        }
    }

    /// A receive completed: move the buffer boundary and resume a sender
    /// whose cell just entered the buffered zone.
    fn expand_buffer(self: &Arc<Self>) {
        if !matches!(self.capacity, Capacity::Bounded(_)) {
            return;
        }
        let boundary = self.buffer_end.fetch_add(1, Ordering::SeqCst);
        let segment = self.find_segment(boundary / SEGMENT_SIZE);
        if segment.id != boundary / SEGMENT_SIZE {
            // The boundary cell's segment was already reclaimed: every
            // cell in it is terminal, so there is no sender to resume.
            return;
        }
        let slot = &segment.cells[(boundary % SEGMENT_SIZE) as usize];
        let mut cell = slot.lock().unwrap();
        let state = std::mem::replace(&mut *cell, CellState::Empty);
        match state {
            CellState::WaiterSend { value, resumer } => {
                // Publish the value first, resume outside the lock. A
                // sender cancelled in the race gets unwound below.
                *cell = CellState::Buffered(value);
                drop(cell);
                if resumer.resume(SendOutcome::Sent).is_err() {
                    let mut cell = slot.lock().unwrap();
                    if matches!(&*cell, CellState::Buffered(_)) {
                        let state = std::mem::replace(&mut *cell, CellState::Interrupted);
                        drop(cell);
                        let CellState::Buffered(value) = state else {
                            unreachable!()
                        };
                        self.undeliver(value);
                    }
                }
            }
            other => *cell = other,
        }
    }

    /// Cancelled suspended sender: release its cell and dispose the value.
    fn cleanup_send_waiter(
        self: &Arc<Self>,
        segment: &Arc<Segment<T>>,
        index: usize,
        parked: Option<SendOutcome<T>>,
    ) {
        if let Some(outcome) = parked {
            // A resume landed before the cancellation was observed.
            match outcome {
                SendOutcome::Sent => {}
                SendOutcome::Retry(value) | SendOutcome::Closed { value, .. } => {
                    self.undeliver(value)
                }
            }
            return;
        }
        let mut cell = segment.cells[index].lock().unwrap();
        if matches!(&*cell, CellState::WaiterSend { .. }) {
            let state = std::mem::replace(&mut *cell, CellState::Interrupted);
            drop(cell);
            let CellState::WaiterSend { value, .. } = state else {
                unreachable!()
            };
            self.undeliver(value);
        }
    }

    /// Cancelled suspended receiver: release its cell; a value that was
    /// already claimed for it is undeliverable.
    fn cleanup_recv_waiter(
        self: &Arc<Self>,
        segment: &Arc<Segment<T>>,
        index: usize,
        parked: Option<RecvOutcome<T>>,
    ) {
        match parked {
            Some(RecvOutcome::Value(value)) => self.undeliver(value),
            Some(_) => {}
            None => {
                let mut cell = segment.cells[index].lock().unwrap();
                if matches!(&*cell, CellState::WaiterRecv { .. }) {
                    *cell = CellState::Interrupted;
                }
            }
        }
    }

    /// Resume every parked waiter after the close flag is set.
    fn sweep_after_close(self: &Arc<Self>) {
        let cause = self.cause();
        let sends = self.senders_count();
        let receives = self.receivers.load(Ordering::SeqCst);
        let low = sends.min(receives);
        let high = sends.max(receives);
        for index in low..high {
            let segment = self.find_segment(index / SEGMENT_SIZE);
            let mut cell = segment.cells[(index % SEGMENT_SIZE) as usize]
                .lock()
                .unwrap();
            match &*cell {
                CellState::WaiterSend { .. } => {
                    let state = std::mem::replace(&mut *cell, CellState::Closed);
                    drop(cell);
                    let CellState::WaiterSend { value, resumer } = state else {
                        unreachable!()
                    };
                    if let Err(outcome) = resumer.resume(SendOutcome::Closed {
                        value,
                        cause: cause.clone(),
                    }) {
                        if let SendOutcome::Closed { value, .. } = outcome {
                            self.undeliver(value);
                        }
                    }
                }
                CellState::WaiterRecv { .. } => {
                    let state = std::mem::replace(&mut *cell, CellState::Closed);
                    drop(cell);
                    let CellState::WaiterRecv { resumer } = state else {
                        unreachable!()
                    };
                    let _ = resumer.resume(RecvOutcome::Closed(cause.clone()));
                }
                _ => {}
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
    use crate::run::run_blocking;
    use crate::scope::{coroutine_scope, yield_now};
    use crate::time::delay;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    // -- basic buffered ----------------------------------------------------

    #[test]
    fn unlimited_send_recv_fifo() {
        let ch = Channel::unlimited();
        run_blocking(async move {
            for i in 0..100 {
                ch.send(i).await.unwrap();
            }
            for i in 0..100 {
                assert_eq!(ch.recv().await.unwrap(), i);
            }
        });
    }

    #[test]
    fn bounded_try_send_reports_full() {
        let ch = Channel::bounded(2);
        assert!(ch.try_send(1).is_ok());
        assert!(ch.try_send(2).is_ok());
        match ch.try_send(3) {
            Err(TrySendError::Full(3)) => {}
            other => panic!("expected full, got {other:?}"),
        }
        assert_eq!(ch.try_recv().unwrap(), 1);
        assert!(ch.try_send(3).is_ok());
    }

    #[test]
    fn try_recv_empty_then_value_then_closed() {
        let ch = Channel::bounded(4);
        assert!(matches!(ch.try_recv(), Err(TryRecvError::Empty)));
        ch.try_send(5).unwrap();
        assert_eq!(ch.try_recv().unwrap(), 5);
        ch.close();
        assert!(matches!(ch.try_recv(), Err(TryRecvError::Closed(_))));
    }

    // -- rendezvous --------------------------------------------------------

    #[test]
    fn rendezvous_try_send_needs_waiting_receiver() {
        let ch: Channel<u32> = Channel::rendezvous();
        assert!(matches!(ch.try_send(1), Err(TrySendError::Full(1))));

        let ch2 = ch.clone();
        run_blocking(coroutine_scope(move |scope| async move {
            let receiver = ch2.clone();
            let deferred = scope.spawn(async move {
                receiver.recv().await.map_err(StrandError::from)
            });
            // Give the receiver time to park.
            delay(Duration::from_millis(20)).await?;
            assert!(ch2.try_send(9).is_ok());
            assert_eq!(deferred.await_result().await?, 9);
            Ok(())
        }))
        .unwrap();
    }

    #[test]
    fn rendezvous_send_then_close_drains_cleanly() {
        // Producer sends 1, 2 and closes; the consumer sees both values
        // and a clean end of iteration.
        let ch = Channel::rendezvous();
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let producer = ch.clone();
            scope.launch(async move {
                producer.send(1).await.map_err(StrandError::from)?;
                producer.send(2).await.map_err(StrandError::from)?;
                producer.close();
                Ok(())
            });

            let mut seen = Vec::new();
            while let Ok(v) = ch.recv().await {
                seen.push(v);
            }
            assert!(matches!(ch.recv().await, Err(RecvError::Closed(None))));
            Ok(seen)
        }));
        assert_eq!(result.unwrap(), vec![1, 2]);
    }

    #[test]
    fn bounded_send_suspends_until_space() {
        let ch = Channel::bounded(1);
        let received = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&received);
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let producer = ch.clone();
            scope.launch(async move {
                for i in 0..10 {
                    producer.send(i).await.map_err(StrandError::from)?;
                }
                producer.close();
                Ok(())
            });

            let mut expected = 0;
            while let Ok(v) = ch.recv().await {
                assert_eq!(v, expected);
                expected += 1;
                r.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }));
        assert!(result.is_ok());
        assert_eq!(received.load(Ordering::SeqCst), 10);
    }

    // -- close -------------------------------------------------------------

    #[test]
    fn close_is_idempotent() {
        let ch: Channel<u32> = Channel::bounded(1);
        assert!(ch.close());
        assert!(!ch.close());
    }

    #[test]
    fn send_after_close_returns_value() {
        let ch = Channel::bounded(4);
        ch.try_send(1).unwrap();
        ch.close();
        match run_blocking(ch.send(2)) {
            Err(SendError::Closed { value: 2, .. }) => {}
            other => panic!("expected closed, got {other:?}"),
        }
        // Buffered values survive the close.
        assert_eq!(ch.try_recv().unwrap(), 1);
        assert!(matches!(ch.try_recv(), Err(TryRecvError::Closed(_))));
    }

    #[test]
    fn close_with_cause_reaches_receiver() {
        let ch: Channel<u32> = Channel::bounded(1);
        ch.close_with(Some(crate::error::fault("upstream failed")));
        match ch.try_recv() {
            Err(TryRecvError::Closed(Some(cause))) => {
                assert!(cause.to_string().contains("upstream failed"));
            }
            other => panic!("expected cause, got {other:?}"),
        }
    }

    #[test]
    fn close_resumes_suspended_receiver() {
        let ch: Channel<u32> = Channel::rendezvous();
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let closer = ch.clone();
            scope.launch(async move {
                delay(Duration::from_millis(20)).await?;
                closer.close();
                Ok(())
            });
            match ch.recv().await {
                Err(RecvError::Closed(None)) => Ok(()),
                other => Err(StrandError::msg(format!("unexpected: {other:?}"))),
            }
        }));
        assert!(result.is_ok());
    }

    #[test]
    fn close_resumes_suspended_sender_with_value() {
        let ch = Channel::bounded(1);
        ch.try_send(1).unwrap();
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let closer = ch.clone();
            scope.launch(async move {
                delay(Duration::from_millis(20)).await?;
                closer.close();
                Ok(())
            });
            match ch.send(2).await {
                Err(SendError::Closed { value: 2, .. }) => Ok(()),
                other => Err(StrandError::msg(format!("unexpected: {other:?}"))),
            }
        }));
        assert!(result.is_ok());
    }

    // -- cancel and undelivered ---------------------------------------------

    #[test]
    fn cancel_discards_buffer_through_undelivered() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ch = Channel::with_config(
            Capacity::Bounded(4),
            OverflowPolicy::Suspend,
            Some(Arc::new(move |v: u32| sink.lock().unwrap().push(v))),
        );
        ch.try_send(1).unwrap();
        ch.try_send(2).unwrap();
        ch.cancel();

        assert_eq!(seen.lock().unwrap().clone(), vec![1, 2]);
        assert!(matches!(ch.try_recv(), Err(TryRecvError::Closed(_))));
    }

    // -- conflation and drop policies ---------------------------------------

    #[test]
    fn conflated_keeps_most_recent() {
        let ch = Channel::conflated();
        run_blocking(async move {
            ch.send(1).await.unwrap();
            ch.send(2).await.unwrap();
            ch.send(3).await.unwrap();
            assert_eq!(ch.recv().await.unwrap(), 3);
        });
    }

    #[test]
    fn drop_oldest_evicts_buffer_head() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let ch = Channel::with_config(
            Capacity::Bounded(2),
            OverflowPolicy::DropOldest,
            Some(Arc::new(move |v: u32| sink.lock().unwrap().push(v))),
        );
        run_blocking(async move {
            ch.send(1).await.unwrap();
            ch.send(2).await.unwrap();
            ch.send(3).await.unwrap();
            assert_eq!(ch.recv().await.unwrap(), 2);
            assert_eq!(ch.recv().await.unwrap(), 3);
        });
        assert_eq!(dropped.lock().unwrap().clone(), vec![1]);
    }

    #[test]
    fn drop_latest_discards_incoming() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&dropped);
        let ch = Channel::with_config(
            Capacity::Bounded(2),
            OverflowPolicy::DropLatest,
            Some(Arc::new(move |v: u32| sink.lock().unwrap().push(v))),
        );
        run_blocking(async move {
            ch.send(1).await.unwrap();
            ch.send(2).await.unwrap();
            ch.send(3).await.unwrap();
            assert_eq!(ch.recv().await.unwrap(), 1);
            assert_eq!(ch.recv().await.unwrap(), 2);
        });
        assert_eq!(dropped.lock().unwrap().clone(), vec![3]);
    }

    // -- concurrency ---------------------------------------------------------

    #[test]
    fn mpmc_delivers_every_message_once() {
        let ch = Channel::bounded(8);
        let total = Arc::new(AtomicUsize::new(0));
        let result = run_blocking(coroutine_scope(move |scope| async move {
            for p in 0..4u64 {
                let tx = ch.clone();
                scope.launch(async move {
                    for i in 0..50u64 {
                        tx.send(p * 1000 + i).await.map_err(StrandError::from)?;
                    }
                    Ok(())
                });
            }

            let mut consumers = Vec::new();
            for _ in 0..2 {
                let rx = ch.clone();
                let counter = Arc::clone(&total);
                consumers.push(scope.spawn(async move {
                    let mut seen = 0usize;
                    while let Ok(_) = rx.recv().await {
                        seen += 1;
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(seen)
                }));
            }

            // Close once all producers are done: wait until 200 messages
            // have been claimed, with a timeout guard via polling.
            loop {
                yield_now().await?;
                if total.load(Ordering::SeqCst) >= 200 {
                    break;
                }
                delay(Duration::from_millis(1)).await?;
            }
            ch.close();
            let mut sum = 0;
            for c in consumers {
                sum += c.await_result().await?;
            }
            Ok(sum)
        }));
        assert_eq!(result.unwrap(), 200);
    }

    #[test]
    fn cancelled_receiver_releases_its_cell() {
        let ch: Channel<u32> = Channel::rendezvous();
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let rx = ch.clone();
            let stuck = scope.spawn(async move {
                rx.recv().await.map_err(StrandError::from)
            });
            delay(Duration::from_millis(10)).await?;
            stuck.job().cancel();
            let _ = stuck.await_result().await;

            // The channel still works for a fresh pair.
            let rx2 = ch.clone();
            let next = scope.spawn(async move {
                rx2.recv().await.map_err(StrandError::from)
            });
            delay(Duration::from_millis(10)).await?;
            ch.send(11).await.map_err(StrandError::from)?;
            assert_eq!(next.await_result().await?, 11);
            Ok(())
        }));
        assert!(result.is_ok());
    }
}
