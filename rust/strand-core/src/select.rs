//! Multi-way choice over channel operations.
//!
//! [`Select`] is a builder: register clauses, then [`run`](Select::run).
//! Registration proceeds clause-by-clause in builder order; a clause that
//! can complete synchronously during registration wins immediately and
//! later clauses are never registered. Otherwise every clause parks a
//! waiter gated by one shared decision cell, and the first side to claim
//! the gate wins. Losing clauses leave no observable effect: a losing
//! send keeps its value, a losing receive consumes nothing.
//!
//! When several clauses are ready at registration time, builder order
//! decides.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::channel::{
    Channel, RecvOutcome, RecvRegistration, SendOutcome, SendRegistration, TryRecvError,
    TrySendError,
};
use crate::error::{Fault, Outcome, StrandError};
use crate::suspend::{SelectGate, SuspendFuture};
use crate::time::delay;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// A multi-way choice. `R` is the common result type of all clause
/// handlers.
pub struct Select<R> {
    arms: Vec<Box<dyn Clause<R>>>,
    timeout: Option<(Duration, Box<dyn FnOnce() -> R + Send>)>,
    default_case: Option<Box<dyn FnOnce() -> R + Send>>,
}

impl<R: Send + 'static> Default for Select<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Send + 'static> Select<R> {
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            timeout: None,
            default_case: None,
        }
    }

    /// Receive from `channel`; the handler gets the value. A closed
    /// channel completes the select with the close error.
    pub fn on_recv<T: Send + 'static>(
        self,
        channel: &Channel<T>,
        handler: impl FnOnce(T) -> R + Send + 'static,
    ) -> Self {
        self.on_recv_catching(channel, |result| match result {
            Ok(value) => Ok(handler(value)),
            Err(Some(fault)) => Err(StrandError::Failed(fault)),
            Err(None) => Err(StrandError::msg("channel is closed")),
        })
    }

    /// Receive from `channel`, observing closure as a value instead of an
    /// error: the handler gets `Err(close cause)` when the channel is
    /// closed and drained.
    pub fn on_recv_catching<T: Send + 'static>(
        mut self,
        channel: &Channel<T>,
        handler: impl FnOnce(Result<T, Option<Fault>>) -> Outcome<R> + Send + 'static,
    ) -> Self {
        self.arms.push(Box::new(RecvClause {
            channel: channel.clone(),
            handler: Some(Box::new(handler)),
        }));
        self
    }

    /// Send `value` into `channel` when space (or a receiver) is
    /// available.
    pub fn on_send<T: Send + 'static>(
        mut self,
        channel: &Channel<T>,
        value: T,
        handler: impl FnOnce() -> R + Send + 'static,
    ) -> Self {
        self.arms.push(Box::new(SendClause {
            channel: channel.clone(),
            value: Some(value),
            handler: Some(Box::new(handler)),
        }));
        self
    }

    /// Complete with `handler`'s value if no clause fires within
    /// `duration`.
    pub fn timeout(mut self, duration: Duration, handler: impl FnOnce() -> R + Send + 'static) -> Self {
        self.timeout = Some((duration, Box::new(handler)));
        self
    }

    /// Non-suspending select: if no clause is ready at registration time,
    /// run this instead of waiting.
    pub fn default_case(mut self, handler: impl FnOnce() -> R + Send + 'static) -> Self {
        self.default_case = Some(Box::new(handler));
        self
    }

    /// Run the select: exactly one clause's handler executes.
    pub async fn run(mut self) -> Outcome<R> {
        // Non-suspending mode: probe clauses in order, fall back to the
        // default handler.
        if let Some(default_case) = self.default_case {
            for arm in &mut self.arms {
                if let Some(result) = arm.try_now() {
                    return result;
                }
            }
            return Ok(default_case());
        }

        let gate = SelectGate::new();
        let mut drivers: Vec<Box<dyn ArmDriver<R>>> = Vec::new();
        let arm_count = self.arms.len();
        for (index, arm) in self.arms.into_iter().enumerate() {
            match arm.register(gate.clone(), index) {
                Registered::Ready(result) => return result,
                Registered::Pending(driver) => drivers.push(driver),
                // A previously registered clause was resumed while we were
                // still registering; the winner is among the drivers.
                Registered::Lost => break,
            }
        }
        if let Some((duration, handler)) = self.timeout {
            drivers.push(Box::new(TimeoutArm {
                sleep: delay(duration),
                gate: gate.clone(),
                index: arm_count,
                handler: Some(handler),
            }));
        }
        debug_assert!(!drivers.is_empty(), "select needs at least one clause");

        poll_fn(move |cx| {
            for driver in drivers.iter_mut() {
                if let Poll::Ready(result) = driver.poll_arm(cx) {
                    return Poll::Ready(result);
                }
            }
            Poll::Pending
        })
        .await
        // Losing drivers are dropped here; their waiters release their
        // cells without consuming anything.
    }
}

// ---------------------------------------------------------------------------
// Clause plumbing
// ---------------------------------------------------------------------------

enum Registered<R> {
    Ready(Outcome<R>),
    Pending(Box<dyn ArmDriver<R>>),
    Lost,
}

trait Clause<R>: Send {
    /// Probe without registering a waiter (default-case mode).
    fn try_now(&mut self) -> Option<Outcome<R>>;

    /// Register a gated waiter (or complete synchronously).
    fn register(self: Box<Self>, gate: Arc<SelectGate>, index: usize) -> Registered<R>;
}

trait ArmDriver<R>: Send {
    fn poll_arm(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<R>>;
}

type RecvHandler<T, R> =
    Box<dyn FnOnce(Result<T, Option<Fault>>) -> Outcome<R> + Send + 'static>;

// -- receive clauses ---------------------------------------------------------

struct RecvClause<T, R> {
    channel: Channel<T>,
    handler: Option<RecvHandler<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Clause<R> for RecvClause<T, R> {
    fn try_now(&mut self) -> Option<Outcome<R>> {
        match self.channel.try_recv() {
            Ok(value) => Some((self.handler.take().expect("armed once"))(Ok(value))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed(cause)) => {
                Some((self.handler.take().expect("armed once"))(Err(cause)))
            }
        }
    }

    fn register(mut self: Box<Self>, gate: Arc<SelectGate>, index: usize) -> Registered<R> {
        let handler = self.handler.take().expect("armed once");
        match self.channel.register_recv(gate.clone(), index) {
            RecvRegistration::Ready(result) => Registered::Ready(handler(result)),
            RecvRegistration::Suspended(future) => Registered::Pending(Box::new(RecvDriver {
                channel: self.channel,
                gate,
                index,
                future: Some(future),
                handler: Some(handler),
            })),
            RecvRegistration::Lost => Registered::Lost,
        }
    }
}

struct RecvDriver<T, R> {
    channel: Channel<T>,
    gate: Arc<SelectGate>,
    index: usize,
    future: Option<SuspendFuture<RecvOutcome<T>>>,
    handler: Option<RecvHandler<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> ArmDriver<R> for RecvDriver<T, R> {
    fn poll_arm(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<R>> {
        loop {
            let Some(future) = self.future.as_mut() else {
                return Poll::Pending;
            };
            match Pin::new(future).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(RecvOutcome::Value(value))) => {
                    let handler = self.handler.take().expect("armed once");
                    return Poll::Ready(handler(Ok(value)));
                }
                Poll::Ready(Ok(RecvOutcome::Closed(cause))) => {
                    let handler = self.handler.take().expect("armed once");
                    return Poll::Ready(handler(Err(cause)));
                }
                Poll::Ready(Ok(RecvOutcome::Retry)) => {
                    // The rendezvous fell through; re-register.
                    match self.channel.register_recv(self.gate.clone(), self.index) {
                        RecvRegistration::Ready(result) => {
                            let handler = self.handler.take().expect("armed once");
                            return Poll::Ready(handler(result));
                        }
                        RecvRegistration::Suspended(future) => {
                            self.future = Some(future);
                            continue;
                        }
                        RecvRegistration::Lost => {
                            self.future = None;
                            return Poll::Pending;
                        }
                    }
                }
                Poll::Ready(Err(cancelled)) => {
                    return Poll::Ready(Err(StrandError::Cancelled(cancelled)));
                }
            }
        }
    }
}

// -- send clauses ------------------------------------------------------------

struct SendClause<T, R> {
    channel: Channel<T>,
    value: Option<T>,
    handler: Option<Box<dyn FnOnce() -> R + Send + 'static>>,
}

impl<T: Send + 'static, R: Send + 'static> Clause<R> for SendClause<T, R> {
    fn try_now(&mut self) -> Option<Outcome<R>> {
        let value = self.value.take().expect("armed once");
        match self.channel.try_send(value) {
            Ok(()) => Some(Ok((self.handler.take().expect("armed once"))())),
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                None
            }
            Err(TrySendError::Closed { cause: Some(fault), .. }) => {
                Some(Err(StrandError::Failed(fault)))
            }
            Err(TrySendError::Closed { .. }) => Some(Err(StrandError::msg("channel is closed"))),
        }
    }

    fn register(mut self: Box<Self>, gate: Arc<SelectGate>, index: usize) -> Registered<R> {
        let value = self.value.take().expect("armed once");
        let handler = self.handler.take().expect("armed once");
        match self.channel.register_send(value, gate.clone(), index) {
            SendRegistration::Ready(Ok(())) => Registered::Ready(Ok(handler())),
            SendRegistration::Ready(Err((_value, Some(fault)))) => {
                Registered::Ready(Err(StrandError::Failed(fault)))
            }
            SendRegistration::Ready(Err((_value, None))) => {
                Registered::Ready(Err(StrandError::msg("channel is closed")))
            }
            SendRegistration::Suspended(future) => Registered::Pending(Box::new(SendDriver {
                channel: self.channel,
                gate,
                index,
                future: Some(future),
                handler: Some(handler),
            })),
            SendRegistration::Lost(_value) => Registered::Lost,
        }
    }
}

struct SendDriver<T, R> {
    channel: Channel<T>,
    gate: Arc<SelectGate>,
    index: usize,
    future: Option<SuspendFuture<SendOutcome<T>>>,
    handler: Option<Box<dyn FnOnce() -> R + Send + 'static>>,
}

impl<T: Send + 'static, R: Send + 'static> ArmDriver<R> for SendDriver<T, R> {
    fn poll_arm(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<R>> {
        loop {
            let Some(future) = self.future.as_mut() else {
                return Poll::Pending;
            };
            match Pin::new(future).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(SendOutcome::Sent)) => {
                    let handler = self.handler.take().expect("armed once");
                    return Poll::Ready(Ok(handler()));
                }
                Poll::Ready(Ok(SendOutcome::Retry(value))) => {
                    match self.channel.register_send(value, self.gate.clone(), self.index) {
                        SendRegistration::Ready(Ok(())) => {
                            let handler = self.handler.take().expect("armed once");
                            return Poll::Ready(Ok(handler()));
                        }
                        SendRegistration::Ready(Err((_v, Some(fault)))) => {
                            return Poll::Ready(Err(StrandError::Failed(fault)));
                        }
                        SendRegistration::Ready(Err((_v, None))) => {
                            return Poll::Ready(Err(StrandError::msg("channel is closed")));
                        }
                        SendRegistration::Suspended(future) => {
                            self.future = Some(future);
                            continue;
                        }
                        SendRegistration::Lost(_value) => {
                            self.future = None;
                            return Poll::Pending;
                        }
                    }
                }
                Poll::Ready(Ok(SendOutcome::Closed { cause: Some(fault), .. })) => {
                    return Poll::Ready(Err(StrandError::Failed(fault)));
                }
                Poll::Ready(Ok(SendOutcome::Closed { .. })) => {
                    return Poll::Ready(Err(StrandError::msg("channel is closed")));
                }
                Poll::Ready(Err(cancelled)) => {
                    return Poll::Ready(Err(StrandError::Cancelled(cancelled)));
                }
            }
        }
    }
}

// -- timeout clause ----------------------------------------------------------

struct TimeoutArm<R> {
    sleep: crate::time::DelayFuture,
    gate: Arc<SelectGate>,
    index: usize,
    handler: Option<Box<dyn FnOnce() -> R + Send>>,
}

impl<R: Send + 'static> ArmDriver<R> for TimeoutArm<R> {
    fn poll_arm(&mut self, cx: &mut Context<'_>) -> Poll<Outcome<R>> {
        match Pin::new(&mut self.sleep).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                if self.gate.try_claim(self.index) {
                    let handler = self.handler.take().expect("armed once");
                    Poll::Ready(Ok(handler()))
                } else {
                    Poll::Pending
                }
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(error)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
