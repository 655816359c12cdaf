//! Suspension primitives.
//!
//! A [`Suspension`] / [`Resumer`] pair is the one-shot resume protocol
//! behind every waiter the runtime parks: channel senders and receivers,
//! semaphore acquirers, timer sleepers. The waiting side turns its half
//! into a [`SuspendFuture`]; the resuming side calls
//! [`Resumer::resume`] exactly once.
//!
//! The decision cell moves `Undecided -> Resumed(value) | Cancelled`:
//!
//! * A successful resume parks the value and wakes the waiter.
//! * Cancellation of the waiter's job (or dropping the future) claims the
//!   cell so a late resume gets its value back and can recycle it.
//! * Prompt cancellation: when a value was parked but the waiter's job is
//!   already cancelled at poll time, the waiter observes the cancellation
//!   and the value is handed to the `on_cancel` disposer instead.
//!
//! A [`SelectGate`] threads a multi-way choice through the same protocol:
//! a gated resumer must claim the gate before it may deliver, so at most
//! one clause of a `select` ever consumes an effect.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::context::current_job;
use crate::error::Cancelled;
use crate::job::{CompletionRegistration, JobHandle};

// ---------------------------------------------------------------------------
// SharedWaker
// ---------------------------------------------------------------------------

/// A slot holding the most recent waker of a parked future. Handlers keep
/// an `Arc` to it and wake whatever was registered last.
pub(crate) struct SharedWaker(Mutex<Option<Waker>>);

impl SharedWaker {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(None))
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.0.lock().unwrap();
        match slot.as_mut() {
            Some(existing) => existing.clone_from(waker),
            None => *slot = Some(waker.clone()),
        }
    }

    pub(crate) fn wake(&self) {
        // Take the waker out before invoking it: waking can run a task
        // inline, and that task may re-register into this same slot.
        let waker = self.0.lock().unwrap().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

// ---------------------------------------------------------------------------
// SelectGate
// ---------------------------------------------------------------------------

const GATE_UNDECIDED: usize = usize::MAX;

/// Decision cell shared by the clauses of one `select`. The first side to
/// claim it wins; every other clause's resume attempt fails and leaves the
/// effect unconsumed.
pub(crate) struct SelectGate {
    decision: AtomicUsize,
}

impl SelectGate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            decision: AtomicUsize::new(GATE_UNDECIDED),
        })
    }

    /// Claim the gate for clause `index`. Returns `true` if this clause
    /// won (first claim, or re-entry by the same clause).
    pub(crate) fn try_claim(&self, index: usize) -> bool {
        match self.decision.compare_exchange(
            GATE_UNDECIDED,
            index,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == index,
        }
    }

    /// The winning clause, if decided.
    pub(crate) fn winner(&self) -> Option<usize> {
        let value = self.decision.load(Ordering::Acquire);
        (value != GATE_UNDECIDED).then_some(value)
    }
}

// ---------------------------------------------------------------------------
// Suspension / Resumer
// ---------------------------------------------------------------------------

enum Decision<T> {
    Undecided,
    Resumed(T),
    Cancelled,
    Finished,
}

struct SuspendShared<T> {
    decision: Mutex<Decision<T>>,
    waker: Arc<SharedWaker>,
    gate: Option<(Arc<SelectGate>, usize)>,
}

/// The waiting half of a one-shot resume protocol.
pub struct Suspension<T> {
    shared: Arc<SuspendShared<T>>,
}

/// The resuming half. Exactly one resume is delivered; a resume that
/// loses (waiter cancelled, select gate claimed elsewhere) hands the
/// value back.
pub struct Resumer<T> {
    shared: Arc<SuspendShared<T>>,
}

/// Create an ungated suspension pair.
pub fn suspension<T>() -> (Suspension<T>, Resumer<T>) {
    suspension_inner(None)
}

/// Create a suspension pair whose resume must first claim `gate` for
/// clause `index`.
pub(crate) fn gated_suspension<T>(
    gate: Arc<SelectGate>,
    index: usize,
) -> (Suspension<T>, Resumer<T>) {
    suspension_inner(Some((gate, index)))
}

fn suspension_inner<T>(gate: Option<(Arc<SelectGate>, usize)>) -> (Suspension<T>, Resumer<T>) {
    let shared = Arc::new(SuspendShared {
        decision: Mutex::new(Decision::Undecided),
        waker: Arc::new(SharedWaker::new()),
        gate,
    });
    (
        Suspension {
            shared: shared.clone(),
        },
        Resumer { shared },
    )
}

impl<T> Resumer<T> {
    /// Deliver `value` to the waiter. `Err(value)` when the waiter was
    /// cancelled first or a competing select clause already won.
    pub fn resume(self, value: T) -> Result<(), T> {
        if let Some((gate, index)) = &self.shared.gate {
            if !gate.try_claim(*index) {
                return Err(value);
            }
        }
        {
            let mut decision = self.shared.decision.lock().unwrap();
            match &*decision {
                Decision::Undecided => *decision = Decision::Resumed(value),
                Decision::Cancelled => return Err(value),
                Decision::Resumed(_) | Decision::Finished => return Err(value),
            }
        }
        self.shared.waker.wake();
        Ok(())
    }
}

impl<T> Suspension<T> {
    /// Turn the waiting half into a future.
    ///
    /// `on_cancel` runs exactly once if the wait ends in cancellation
    /// (job cancelled or future dropped); it receives the resumed value
    /// when one had already been parked, so the caller can recycle it.
    pub fn into_future(
        self,
        on_cancel: Option<Box<dyn FnOnce(Option<T>) + Send>>,
    ) -> SuspendFuture<T> {
        SuspendFuture {
            shared: self.shared,
            on_cancel,
            cancel_reg: None,
            job: None,
            started: false,
            done: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SuspendFuture
// ---------------------------------------------------------------------------

/// Future returned by [`Suspension::into_future`].
pub struct SuspendFuture<T> {
    shared: Arc<SuspendShared<T>>,
    on_cancel: Option<Box<dyn FnOnce(Option<T>) + Send>>,
    cancel_reg: Option<CompletionRegistration>,
    job: Option<JobHandle>,
    started: bool,
    done: bool,
}

impl<T> SuspendFuture<T> {
    fn take_resumed(&self) -> Option<T> {
        let mut decision = self.shared.decision.lock().unwrap();
        if matches!(&*decision, Decision::Resumed(_)) {
            match std::mem::replace(&mut *decision, Decision::Finished) {
                Decision::Resumed(value) => Some(value),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Claim the cell for cancellation; the parked value (if any) comes
    /// back for disposal.
    fn mark_cancelled(&self) -> Option<T> {
        let mut decision = self.shared.decision.lock().unwrap();
        match std::mem::replace(&mut *decision, Decision::Cancelled) {
            Decision::Resumed(value) => Some(value),
            _ => None,
        }
    }

    fn finish_cancelled(&mut self) -> Option<T> {
        self.done = true;
        if let Some(reg) = self.cancel_reg.take() {
            reg.dispose();
        }
        let parked = self.mark_cancelled();
        let mut recovered = None;
        if let Some(disposer) = self.on_cancel.take() {
            match parked {
                Some(value) => disposer(Some(value)),
                None => disposer(None),
            }
        } else {
            recovered = parked;
        }
        recovered
    }
}

impl<T> Future for SuspendFuture<T> {
    type Output = Result<T, Arc<Cancelled>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        if !this.started {
            this.started = true;
            this.job = current_job();
            if let Some(job) = &this.job {
                this.cancel_reg = Some(job.wake_on_cancel(this.shared.waker.clone()));
            }
        }

        // Prompt cancellation: a cancelled job wins over a parked value.
        if let Some(job) = &this.job {
            if let Some(cancelled) = job.cancellation_if_cancelled() {
                this.finish_cancelled();
                return Poll::Ready(Err(cancelled));
            }
        }

        if let Some(value) = this.take_resumed() {
            this.done = true;
            if let Some(reg) = this.cancel_reg.take() {
                reg.dispose();
            }
            return Poll::Ready(Ok(value));
        }

        this.shared.waker.register(cx.waker());

        // Re-check after registering so a resume that raced the register
        // is not lost.
        if let Some(value) = this.take_resumed() {
            this.done = true;
            if let Some(reg) = this.cancel_reg.take() {
                reg.dispose();
            }
            return Poll::Ready(Ok(value));
        }
        Poll::Pending
    }
}

impl<T> Drop for SuspendFuture<T> {
    fn drop(&mut self) {
        if !self.done {
            self.finish_cancelled();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountWake(AtomicUsize);
    impl Wake for CountWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Waker, Arc<CountWake>) {
        let inner = Arc::new(CountWake(AtomicUsize::new(0)));
        (Waker::from(inner.clone()), inner)
    }

    #[test]
    fn resume_before_poll_delivers_value() {
        let (suspension, resumer) = suspension::<u32>();
        assert!(resumer.resume(7).is_ok());

        let mut fut = suspension.into_future(None);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        match Pin::new(&mut fut).poll(&mut cx) {
            Poll::Ready(Ok(7)) => {}
            other => panic!("expected Ready(Ok(7)), got {other:?}"),
        }
    }

    #[test]
    fn resume_after_poll_wakes_and_delivers() {
        let (suspension, resumer) = suspension::<&'static str>();
        let mut fut = suspension.into_future(None);
        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut fut).poll(&mut cx).is_pending());
        assert!(resumer.resume("hello").is_ok());
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        match Pin::new(&mut fut).poll(&mut cx) {
            Poll::Ready(Ok("hello")) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropped_future_returns_value_to_resumer() {
        let (suspension, resumer) = suspension::<u32>();
        let recovered = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&recovered);
        let fut = suspension.into_future(Some(Box::new(move |value| {
            assert!(value.is_none());
            r.fetch_add(1, Ordering::SeqCst);
        })));
        drop(fut);

        // The waiter is gone; the resume fails and hands the value back.
        assert_eq!(resumer.resume(3), Err(3));
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parked_value_reaches_disposer_on_drop() {
        let (suspension, resumer) = suspension::<u32>();
        assert!(resumer.resume(9).is_ok());

        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let fut = suspension.into_future(Some(Box::new(move |value| {
            assert_eq!(value, Some(9));
            s.fetch_add(1, Ordering::SeqCst);
        })));
        drop(fut);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gate_admits_exactly_one_clause() {
        let gate = SelectGate::new();
        let (_s1, r1) = gated_suspension::<u32>(gate.clone(), 0);
        let (_s2, r2) = gated_suspension::<u32>(gate.clone(), 1);

        assert!(r1.resume(1).is_ok());
        assert_eq!(gate.winner(), Some(0));
        // The losing clause keeps its value.
        assert_eq!(r2.resume(2), Err(2));
    }
}
