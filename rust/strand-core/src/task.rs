//! Dispatched task execution.
//!
//! A [`Task`] pairs a boxed future with the [`TaskContext`] it runs under.
//! The compiler lowers `async` blocks into resumable state machines; the
//! task supplies the missing half of the protocol: a waker that
//! re-submits the task to its dispatcher, and the thread-local context
//! publication around every poll.
//!
//! The `queued` flag coalesces wakes: a task already sitting in a
//! dispatcher queue is not submitted twice, and a wake arriving while the
//! task is being polled re-queues it for another round.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Wake, Waker};

use crate::context::TaskContext;
use crate::dispatch::Runnable;
use crate::error::{panic_fault, StrandError};

pub(crate) struct Task {
    ctx: TaskContext,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>>,
    queued: AtomicBool,
}

impl Task {
    /// Create a task without submitting it (lazy bodies are scheduled by
    /// their job's start hook).
    pub(crate) fn new(
        ctx: TaskContext,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            future: Mutex::new(Some(Box::pin(future))),
            queued: AtomicBool::new(false),
        })
    }

    /// Create a task and submit it to its dispatcher.
    pub(crate) fn spawn(
        ctx: TaskContext,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Arc<Self> {
        let task = Self::new(ctx, future);
        task.schedule();
        task
    }

    /// Submit the task unless it is already queued.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::SeqCst) {
            let task = self.clone();
            let run = move || task.run();
            let runnable = match self.ctx.job() {
                Some(job) => Runnable::for_job(job.clone(), run),
                None => Runnable::new(run),
            };
            self.ctx.dispatcher().dispatch(runnable);
        }
    }

    /// Poll the task once on the current thread.
    fn run(self: &Arc<Self>) {
        self.queued.store(false, Ordering::SeqCst);
        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            return;
        };
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        let polled = catch_unwind(AssertUnwindSafe(|| {
            self.ctx.enter(|| future.as_mut().poll(&mut cx))
        }));
        match polled {
            Ok(poll) => {
                if poll.is_ready() {
                    *slot = None;
                }
            }
            Err(payload) => {
                // A panicking body fails its job instead of killing the
                // worker thread.
                *slot = None;
                drop(slot);
                if let Some(job) = self.ctx.job() {
                    job.complete_with(Err(StrandError::Failed(panic_fault(payload))));
                }
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}
