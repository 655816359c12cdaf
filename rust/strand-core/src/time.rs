//! Timers: `delay`, `with_timeout`, and the shared timer service.
//!
//! One dedicated `strand-timer` thread owns a binary heap of pending
//! entries ordered by deadline (FIFO among equal deadlines) and sleeps on
//! a condvar until the earliest one is due. Entries either wake a parked
//! future or run a closure (used by timeouts and select deadlines).
//!
//! `delay(Duration::ZERO)` still dispatches: it yields and resumes, never
//! returns inline. `with_timeout` runs its body under a child job that the
//! timer cancels at expiry; a result produced while the timeout was in
//! flight is discarded.

use once_cell::sync::Lazy;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use crate::context::{current_job, TaskContext};
use crate::error::{Cancelled, Outcome, StrandError};
use crate::job::{CompletionRegistration, JobConfig, JobHandle};
use crate::scope::ScopedFuture;
use crate::suspend::SharedWaker;

// ---------------------------------------------------------------------------
// Timer service
// ---------------------------------------------------------------------------

/// Wait target of a parked `delay`.
pub(crate) struct TimerSlot {
    fired: AtomicBool,
    cancelled: AtomicBool,
    pub(crate) waker: Arc<SharedWaker>,
}

impl TimerSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            waker: Arc::new(SharedWaker::new()),
        })
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn fire(&self) {
        if !self.cancelled.load(Ordering::Acquire) {
            self.fired.store(true, Ordering::Release);
            self.waker.wake();
        }
    }
}

enum TimerAction {
    Wake(Arc<TimerSlot>),
    Run {
        cancelled: Arc<AtomicBool>,
        f: Box<dyn FnOnce() + Send + 'static>,
    },
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    action: TimerAction,
}

impl TimerEntry {
    fn fire(self) {
        match self.action {
            TimerAction::Wake(slot) => slot.fire(),
            TimerAction::Run { cancelled, f } => {
                if !cancelled.load(Ordering::Acquire) {
                    f();
                }
            }
        }
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and
        // the lowest sequence number among equals) surfaces first.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

struct TimerService {
    queue: Mutex<TimerQueue>,
    cond: Condvar,
}

impl TimerService {
    fn schedule(&self, at: Instant, action: TimerAction) {
        let mut queue = self.queue.lock().unwrap();
        let seq = queue.seq;
        queue.seq += 1;
        queue.heap.push(TimerEntry { at, seq, action });
        self.cond.notify_one();
    }

    fn run(&self) {
        let mut queue = self.queue.lock().unwrap();
        loop {
            let now = Instant::now();
            let mut due = Vec::new();
            while queue.heap.peek().is_some_and(|e| e.at <= now) {
                due.push(queue.heap.pop().unwrap());
            }
            if !due.is_empty() {
                drop(queue);
                for entry in due {
                    entry.fire();
                }
                queue = self.queue.lock().unwrap();
                continue;
            }
            match queue.heap.peek().map(|e| e.at) {
                Some(at) => {
                    let wait = at.saturating_duration_since(now);
                    let (guard, _timeout) = self.cond.wait_timeout(queue, wait).unwrap();
                    queue = guard;
                }
                None => {
                    queue = self.cond.wait(queue).unwrap();
                }
            }
        }
    }
}

static TIMER: Lazy<Arc<TimerService>> = Lazy::new(|| {
    let service = Arc::new(TimerService {
        queue: Mutex::new(TimerQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }),
        cond: Condvar::new(),
    });
    let worker = Arc::clone(&service);
    thread::Builder::new()
        .name("strand-timer".into())
        .spawn(move || worker.run())
        .expect("failed to spawn timer thread");
    service
});

pub(crate) fn schedule_wake(at: Instant, slot: Arc<TimerSlot>) {
    TIMER.schedule(at, TimerAction::Wake(slot));
}

/// Registration of a deadline closure; cancelling prevents the closure
/// from running if it has not fired yet.
pub struct TimeoutRegistration {
    cancelled: Arc<AtomicBool>,
}

impl TimeoutRegistration {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Run `f` on the timer thread after `delay`. Used for timeouts; keep the
/// closure small.
pub fn invoke_on_timeout(delay: Duration, f: impl FnOnce() + Send + 'static) -> TimeoutRegistration {
    let cancelled = Arc::new(AtomicBool::new(false));
    TIMER.schedule(
        Instant::now() + delay,
        TimerAction::Run {
            cancelled: Arc::clone(&cancelled),
            f: Box::new(f),
        },
    );
    TimeoutRegistration { cancelled }
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

/// Suspend for `duration`. A suspension point: errs when the ambient job
/// is cancelled while sleeping. `delay(0)` yields (dispatch + resume) and
/// never completes on its first poll.
pub fn delay(duration: Duration) -> DelayFuture {
    DelayFuture {
        duration,
        slot: None,
        cancel_reg: None,
        job: None,
        yielded: false,
        started: false,
    }
}

/// Future returned by [`delay`].
pub struct DelayFuture {
    duration: Duration,
    slot: Option<Arc<TimerSlot>>,
    cancel_reg: Option<CompletionRegistration>,
    job: Option<JobHandle>,
    yielded: bool,
    started: bool,
}

impl Future for DelayFuture {
    type Output = Outcome<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.started {
            this.started = true;
            this.job = current_job();
        }

        if let Some(job) = &this.job {
            if let Some(cancelled) = job.cancellation_if_cancelled() {
                this.cleanup();
                return Poll::Ready(Err(StrandError::Cancelled(cancelled)));
            }
        }

        if this.duration.is_zero() {
            // Yield semantics: go through the dispatcher once.
            return if this.yielded {
                Poll::Ready(Ok(()))
            } else {
                this.yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            };
        }

        let slot = match &this.slot {
            Some(slot) => slot.clone(),
            None => {
                let slot = TimerSlot::new();
                if let Some(job) = &this.job {
                    this.cancel_reg = Some(job.wake_on_cancel(slot.waker.clone()));
                }
                schedule_wake(Instant::now() + this.duration, slot.clone());
                this.slot = Some(slot.clone());
                slot
            }
        };

        if slot.is_fired() {
            this.cleanup();
            return Poll::Ready(Ok(()));
        }
        slot.waker.register(cx.waker());
        if slot.is_fired() {
            this.cleanup();
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }
}

impl DelayFuture {
    fn cleanup(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.cancel();
        }
        if let Some(reg) = self.cancel_reg.take() {
            reg.dispose();
        }
    }
}

impl Drop for DelayFuture {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// with_timeout
// ---------------------------------------------------------------------------

/// Run `body` under a deadline. At expiry the body's job is cancelled with
/// a timeout-flagged cancellation; a value produced while the timeout was
/// already in flight is discarded (prompt cancellation).
pub async fn with_timeout<T, F>(duration: Duration, body: F) -> Outcome<T>
where
    T: Send,
    F: Future<Output = Outcome<T>> + Send,
{
    match run_with_deadline(duration, body).await {
        Ok(result) => result,
        Err(timeout) => Err(timeout),
    }
}

/// Like [`with_timeout`], but this call's own expiry maps to `Ok(None)`.
/// A timeout raised by a nested deadline still propagates as an error.
pub async fn with_timeout_opt<T, F>(duration: Duration, body: F) -> Outcome<Option<T>>
where
    T: Send,
    F: Future<Output = Outcome<T>> + Send,
{
    match run_with_deadline(duration, body).await {
        Ok(Ok(value)) => Ok(Some(value)),
        Ok(Err(error)) => Err(error),
        Err(_own_timeout) => Ok(None),
    }
}

/// Shared deadline driver. `Err` carries only *this* call's timeout
/// (identified by cancellation-value identity); everything else comes back
/// through the inner `Outcome`.
async fn run_with_deadline<T, F>(duration: Duration, body: F) -> Result<Outcome<T>, StrandError>
where
    T: Send,
    F: Future<Output = Outcome<T>> + Send,
{
    let parent_ctx = TaskContext::current_or_background();
    let config = JobConfig {
        start_active: true,
        supervisor: false,
        has_body: true,
        propagate_failure: false,
        handles_failure: false,
    };
    let job = JobHandle::create(
        None,
        config,
        parent_ctx.job(),
        parent_ctx.failure_handler().cloned(),
    );

    let marker = Arc::new(Cancelled::timeout(format!(
        "timed out after {duration:?}"
    )));
    let registration = if duration.is_zero() {
        job.cancel_with_shared(marker.clone());
        None
    } else {
        let deadline_job = job.clone();
        let deadline_marker = marker.clone();
        Some(invoke_on_timeout(duration, move || {
            deadline_job.cancel_with_shared(deadline_marker);
        }))
    };

    let ctx = parent_ctx.with_job(job.clone());
    let result = ScopedFuture::new(ctx, body).await;
    if let Some(registration) = &registration {
        registration.cancel();
    }
    match &result {
        Ok(_) => job.complete_with(Ok(())),
        Err(error) => job.complete_with(Err(error.clone())),
    }
    let _ = ScopedFuture::new(parent_ctx.without_job(), job.join()).await;

    match job.final_cause() {
        Some(crate::error::Cause::Cancelled(c)) if Arc::ptr_eq(&c, &marker) => {
            Err(StrandError::Cancelled(c))
        }
        Some(cause) => Ok(Err(cause.to_error())),
        None => Ok(result),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::run_blocking;
    use crate::scope::coroutine_scope;

    #[test]
    fn delay_waits_for_roughly_the_duration() {
        let start = Instant::now();
        run_blocking(async {
            delay(Duration::from_millis(25)).await.unwrap();
        });
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn zero_delay_yields_but_never_inline() {
        run_blocking(async {
            let mut fut = delay(Duration::ZERO);
            let pending_first = std::future::poll_fn(|cx| {
                Poll::Ready(Pin::new(&mut fut).poll(cx).is_pending())
            })
            .await;
            assert!(pending_first, "delay(0) must not complete inline");
            fut.await.unwrap();
        });
    }

    #[test]
    fn timer_fires_in_deadline_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = Arc::clone(&log);
        let l2 = Arc::clone(&log);
        invoke_on_timeout(Duration::from_millis(40), move || {
            l1.lock().unwrap().push("late");
        });
        invoke_on_timeout(Duration::from_millis(10), move || {
            l2.lock().unwrap().push("early");
        });

        thread::sleep(Duration::from_millis(120));
        assert_eq!(log.lock().unwrap().clone(), vec!["early", "late"]);
    }

    #[test]
    fn cancelled_timeout_registration_never_runs() {
        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let reg = invoke_on_timeout(Duration::from_millis(20), move || {
            f.store(true, Ordering::SeqCst);
        });
        reg.cancel();
        thread::sleep(Duration::from_millis(80));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancelling_the_job_interrupts_delay() {
        let start = Instant::now();
        let result: Outcome<()> = run_blocking(coroutine_scope(|scope| async move {
            let job = scope.launch(async move {
                delay(Duration::from_secs(30)).await?;
                Ok(())
            });
            delay(Duration::from_millis(10)).await?;
            job.cancel();
            job.join().await?;
            Ok(())
        }));
        assert!(result.is_ok());
        assert!(start.elapsed() < Duration::from_secs(5), "delay was not interrupted");
    }

    #[test]
    fn with_timeout_returns_fast_results() {
        let result = run_blocking(with_timeout(Duration::from_secs(5), async {
            delay(Duration::from_millis(5)).await?;
            Ok(7)
        }));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn with_timeout_cancels_slow_bodies() {
        let start = Instant::now();
        let result: Outcome<u32> = run_blocking(with_timeout(Duration::from_millis(30), async {
            delay(Duration::from_secs(30)).await?;
            Ok(1)
        }));
        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn zero_timeout_cancels_before_first_suspension_completes() {
        let reached_after = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&reached_after);
        let result: Outcome<()> = run_blocking(with_timeout(Duration::ZERO, async move {
            delay(Duration::from_millis(1)).await?;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));
        assert!(result.unwrap_err().is_timeout());
        assert!(!reached_after.load(Ordering::SeqCst));
    }

    #[test]
    fn with_timeout_opt_maps_own_expiry_to_none() {
        let result = run_blocking(with_timeout_opt(Duration::from_millis(20), async {
            delay(Duration::from_secs(30)).await?;
            Ok(5)
        }));
        assert_eq!(result.unwrap(), None);

        let result = run_blocking(with_timeout_opt(Duration::from_secs(5), async {
            Ok(5)
        }));
        assert_eq!(result.unwrap(), Some(5));
    }

    #[test]
    fn nested_timeout_propagates_through_outer_opt() {
        // The inner deadline's expiry is not *this* call's timeout.
        let result: Outcome<Option<u32>> =
            run_blocking(with_timeout_opt(Duration::from_secs(30), async {
                with_timeout(Duration::from_millis(10), async {
                    delay(Duration::from_secs(30)).await?;
                    Ok(1)
                })
                .await
            }));
        let err = result.unwrap_err();
        assert!(err.is_timeout());
    }
}
