//! Task context — the ambient environment of a running task.
//!
//! A [`TaskContext`] is an immutable value carrying the current job, the
//! dispatcher resumptions go to, an optional task name, and an optional
//! failure handler. Builders derive child contexts from it with the
//! `with_*` methods; the right-hand element replaces the left-hand one.
//!
//! The context of the task currently being polled is published in a
//! thread-local by the executor; suspending primitives read it through
//! [`TaskContext::current`] / [`current_job`] to find the job whose
//! cancellation they must observe.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use crate::dispatch::{Dispatcher, Dispatchers};
use crate::error::Fault;
use crate::job::JobHandle;

/// Callback receiving failures that nobody awaits (see
/// [`crate::scope::Scope::launch`]).
pub type FailureHandler = Arc<dyn Fn(&Fault) + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// The ambient environment of a task. Cheap to clone; never mutated in
/// place.
#[derive(Clone)]
pub struct TaskContext {
    job: Option<JobHandle>,
    dispatcher: Arc<dyn Dispatcher>,
    name: Option<Arc<str>>,
    on_failure: Option<FailureHandler>,
}

impl TaskContext {
    /// A fresh context on the given dispatcher, with no job attached.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            job: None,
            dispatcher,
            name: None,
            on_failure: None,
        }
    }

    /// The context used when no ambient context exists: the process-wide
    /// default pool, no job.
    pub fn background() -> Self {
        Self::new(Dispatchers::default_pool())
    }

    /// Snapshot of the context of the task currently being polled on this
    /// thread, if any.
    pub fn current() -> Option<TaskContext> {
        CURRENT.with(|cell| cell.borrow().clone())
    }

    /// Like [`current`](TaskContext::current), falling back to
    /// [`background`](TaskContext::background).
    pub fn current_or_background() -> TaskContext {
        Self::current().unwrap_or_else(Self::background)
    }

    // -- accessors ---------------------------------------------------------

    pub fn job(&self) -> Option<&JobHandle> {
        self.job.as_ref()
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn failure_handler(&self) -> Option<&FailureHandler> {
        self.on_failure.as_ref()
    }

    // -- derivation --------------------------------------------------------

    pub fn with_job(&self, job: JobHandle) -> Self {
        let mut next = self.clone();
        next.job = Some(job);
        next
    }

    /// Drop the job element. Primitives running under such a context
    /// observe no cancellation (the non-cancellable cleanup path).
    pub fn without_job(&self) -> Self {
        let mut next = self.clone();
        next.job = None;
        next
    }

    pub fn with_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let mut next = self.clone();
        next.dispatcher = dispatcher;
        next
    }

    pub fn with_name(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.name = Some(Arc::from(name.into().into_boxed_str()));
        next
    }

    pub fn with_failure_handler(&self, handler: FailureHandler) -> Self {
        let mut next = self.clone();
        next.on_failure = Some(handler);
        next
    }

    // -- thread-local publication -----------------------------------------

    /// Run `f` with this context installed as the current one, restoring
    /// the previous context afterwards (also on unwind).
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT.with(|cell| cell.borrow_mut().replace(self.clone()));
        let _restore = RestoreGuard(previous);
        f()
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("job", &self.job.as_ref().map(|j| j.id()))
            .field("dispatcher", &self.dispatcher.name())
            .field("name", &self.name)
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskContext>> = const { RefCell::new(None) };
}

struct RestoreGuard(Option<TaskContext>);

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let previous = self.0.take();
        CURRENT.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// The job of the task currently being polled on this thread.
pub fn current_job() -> Option<JobHandle> {
    CURRENT.with(|cell| cell.borrow().as_ref().and_then(|ctx| ctx.job.clone()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
