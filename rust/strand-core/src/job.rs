//! Job lifecycle — the state machine behind every task.
//!
//! A [`JobHandle`] is a node in the parent/child job tree. Its lifecycle is
//!
//! ```text
//! New -> Active -> Finishing { is_cancelling, is_completing } -> Final
//! ```
//!
//! # Invariants
//!
//! 1. Transitions are monotone; `Final` is absorbing.
//! 2. A job observed as completed has no children.
//! 3. Cancelling a job cancels every attached child; a failed child cancels
//!    a non-supervisor parent.
//! 4. Completion handlers fire at most once.
//! 5. The first captured failure is the root cause; later failures from the
//!    same tree attach to it as suppressed faults (identity-deduplicated).
//!
//! The structural state (handlers, children, causes) lives behind one
//! mutex; the coarse phase is mirrored into an atomic word so the hot
//! queries (`is_active`, `is_cancelled`, `is_completed`) never take the
//! lock. Callbacks are always invoked with the lock released.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::context::{current_job, FailureHandler};
use crate::error::{
    fault, panic_fault, push_suppressed, Cancelled, Cause, Failure, Fault, Outcome, StrandError,
};
use crate::hooks::deliver_unhandled;
use crate::suspend::SharedWaker;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Monotonically increasing counter used to mint unique [`JobId`]s.
static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, opaque identifier for a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    /// Allocate the next unique job ID.
    pub fn next() -> Self {
        Self(NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the raw numeric value (useful for logging / tracing).
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Phases and configuration
// ---------------------------------------------------------------------------

/// The coarse lifecycle phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Created lazily, not yet started.
    New,
    /// Running (or runnable).
    Active,
    /// Cancellation in progress; children draining.
    Cancelling,
    /// Asked to complete; children draining.
    Completing,
    /// Terminal.
    Final,
}

/// Per-job behavioral switches, fixed at creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JobConfig {
    /// Start in `Active` (eager) or `New` (lazy).
    pub start_active: bool,
    /// Child failures do not cancel this job.
    pub supervisor: bool,
    /// A task body will call `complete_with`; finalization waits for it.
    pub has_body: bool,
    /// Report own failure to the parent (scope-like jobs rethrow to the
    /// caller instead).
    pub propagate_failure: bool,
    /// Deliver an unobserved failure to the failure handler / hooks.
    pub handles_failure: bool,
}

impl JobConfig {
    /// A plain, externally managed job (no body).
    pub(crate) fn bare() -> Self {
        Self {
            start_active: true,
            supervisor: false,
            has_body: false,
            propagate_failure: true,
            handles_failure: false,
        }
    }
}

// Atomic phase encoding: low two bits are the phase code, the flag bits are
// OR'd on top and persist into the final state.
const CODE_NEW: u8 = 0;
const CODE_ACTIVE: u8 = 1;
const CODE_FINISHING: u8 = 2;
const CODE_FINAL: u8 = 3;
const BIT_CANCELLING: u8 = 4;
const BIT_CAUSE: u8 = 8;

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Root cause captured while a job is finishing.
#[derive(Clone)]
enum RootCause {
    Cancelled(Arc<Cancelled>),
    Failed(Fault),
}

impl RootCause {
    fn as_cause(&self) -> Cause {
        match self {
            RootCause::Cancelled(c) => Cause::Cancelled(c.clone()),
            RootCause::Failed(f) => Cause::Failed(Arc::new(Failure::new(f.clone()))),
        }
    }

    fn root_fault(&self) -> Option<&Fault> {
        match self {
            RootCause::Failed(f) => Some(f),
            RootCause::Cancelled(_) => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Active,
    Finishing,
    Final,
}

struct HandlerNode {
    id: u64,
    on_cancelling: bool,
    f: Box<dyn FnOnce(Option<&Cause>) + Send + 'static>,
}

struct JobInner {
    phase: Phase,
    is_cancelling: bool,
    is_completing: bool,
    /// Lazy-start hook dropped without running when a `New` job is
    /// cancelled before `start`.
    start_hook: Option<Box<dyn FnOnce() + Send + 'static>>,
    body_discarded: bool,
    root_cause: Option<RootCause>,
    suppressed: Vec<Fault>,
    handlers: Vec<HandlerNode>,
    next_handler_id: u64,
    children: Vec<JobHandle>,
    parent: Option<Weak<JobCore>>,
    /// Meaningful once `phase == Final`; `None` means completed normally.
    final_cause: Option<Cause>,
    join_wakers: Vec<Option<Waker>>,
}

pub(crate) struct JobCore {
    id: JobId,
    name: Option<Arc<str>>,
    config: JobConfig,
    phase_bits: AtomicU8,
    inner: Mutex<JobInner>,
    on_failure: Mutex<Option<FailureHandler>>,
    cached_cancellation: Mutex<Option<Arc<Cancelled>>>,
}

/// Work collected under the lock, executed after it is released.
struct Notifications {
    handlers: Vec<HandlerNode>,
    cancel_children: Vec<JobHandle>,
    cause: Option<Cause>,
}

struct FinalizeActions {
    cause: Option<Cause>,
    handlers: Vec<HandlerNode>,
    wakers: Vec<Waker>,
    parent: Option<Arc<JobCore>>,
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// A cheaply cloneable handle to a job.
#[derive(Clone)]
pub struct JobHandle {
    core: Arc<JobCore>,
}

impl JobHandle {
    pub(crate) fn create(
        name: Option<Arc<str>>,
        config: JobConfig,
        parent: Option<&JobHandle>,
        on_failure: Option<FailureHandler>,
    ) -> Self {
        let phase = if config.start_active {
            Phase::Active
        } else {
            Phase::New
        };
        let core = Arc::new(JobCore {
            id: JobId::next(),
            name,
            config,
            phase_bits: AtomicU8::new(if config.start_active {
                CODE_ACTIVE
            } else {
                CODE_NEW
            }),
            inner: Mutex::new(JobInner {
                phase,
                is_cancelling: false,
                is_completing: false,
                start_hook: None,
                body_discarded: false,
                root_cause: None,
                suppressed: Vec::new(),
                handlers: Vec::new(),
                next_handler_id: 1,
                children: Vec::new(),
                parent: None,
                final_cause: None,
                join_wakers: Vec::new(),
            }),
            on_failure: Mutex::new(on_failure),
            cached_cancellation: Mutex::new(None),
        });
        let handle = JobHandle { core };
        if let Some(parent) = parent {
            parent.attach_child(&handle);
        }
        handle
    }

    /// A fresh externally managed job (no task body), optionally attached
    /// to a parent.
    pub fn new_job(parent: Option<&JobHandle>) -> Self {
        Self::create(None, JobConfig::bare(), parent, None)
    }

    /// A supervisor job: failures of its children do not cancel it or
    /// their siblings.
    pub fn new_supervisor(parent: Option<&JobHandle>) -> Self {
        let config = JobConfig {
            supervisor: true,
            ..JobConfig::bare()
        };
        Self::create(None, config, parent, None)
    }

    pub fn id(&self) -> JobId {
        self.core.id
    }

    pub fn name(&self) -> Option<&str> {
        self.core.name.as_deref()
    }

    // -- lock-free state queries ------------------------------------------

    /// `true` while the job is running or completing normally (not while
    /// cancelling, not once final).
    pub fn is_active(&self) -> bool {
        let bits = self.core.phase_bits.load(Ordering::Acquire);
        let code = bits & 0x3;
        code == CODE_ACTIVE || (code == CODE_FINISHING && bits & BIT_CANCELLING == 0)
    }

    /// `true` once the job reached its terminal state.
    pub fn is_completed(&self) -> bool {
        self.core.phase_bits.load(Ordering::Acquire) & 0x3 == CODE_FINAL
    }

    /// `true` once cancellation started or the job finished with a cause
    /// (cancelled or failed).
    pub fn is_cancelled(&self) -> bool {
        let bits = self.core.phase_bits.load(Ordering::Acquire);
        bits & (BIT_CANCELLING | BIT_CAUSE) != 0
    }

    /// The coarse lifecycle phase.
    pub fn phase(&self) -> JobPhase {
        let bits = self.core.phase_bits.load(Ordering::Acquire);
        match bits & 0x3 {
            CODE_NEW => JobPhase::New,
            CODE_ACTIVE => JobPhase::Active,
            CODE_FINISHING => {
                if bits & BIT_CANCELLING != 0 {
                    JobPhase::Cancelling
                } else {
                    JobPhase::Completing
                }
            }
            _ => JobPhase::Final,
        }
    }

    // -- lifecycle operations ---------------------------------------------

    /// Move a `New` job to `Active`. Returns `true` on the transition,
    /// `false` if the job was already started (idempotent).
    pub fn start(&self) -> bool {
        let hook = {
            let mut inner = self.core.inner.lock().unwrap();
            if inner.phase != Phase::New || inner.is_cancelling {
                return false;
            }
            inner.phase = Phase::Active;
            self.core.store_phase(&inner);
            inner.start_hook.take()
        };
        tracing::trace!(job = %self.core.id, "job started");
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Cancel with a default cause. Never blocks; returns after recording
    /// intent, not after children finish.
    pub fn cancel(&self) {
        self.cancel_with(Cancelled::new("job was cancelled"));
    }

    /// Cancel with an explicit cause.
    pub fn cancel_with(&self, cancelled: Cancelled) {
        self.cancel_with_shared(Arc::new(cancelled));
    }

    /// Cancel with a shared cause value, preserving its identity so
    /// callers can recognize their own cancellation later.
    pub(crate) fn cancel_with_shared(&self, cancelled: Arc<Cancelled>) {
        self.core.make_cancelling(RootCause::Cancelled(cancelled));
    }

    /// Ask an externally managed job to complete once its children drain.
    /// Returns `true` if this call initiated completion.
    pub fn complete(&self) -> bool {
        self.core.complete(Ok(()))
    }

    /// Complete a job whose task body finished with `outcome`.
    pub(crate) fn complete_with(&self, outcome: Outcome<()>) {
        self.core.complete(outcome);
    }

    /// Suspend until the job reaches its terminal state. The target's own
    /// cancellation is not an error; the *caller's* cancellation is.
    pub fn join(&self) -> JoinFuture {
        JoinFuture {
            target: self.clone(),
            slot: None,
            caller: None,
            caller_reg: None,
            waker_slot: Arc::new(SharedWaker::new()),
            started: false,
        }
    }

    // -- completion handlers ----------------------------------------------

    /// Register a completion handler invoked exactly once with the final
    /// cause (`None` = completed normally). If the job is already final,
    /// the handler runs synchronously.
    pub fn invoke_on_completion(
        &self,
        handler: impl FnOnce(Option<&Cause>) + Send + 'static,
    ) -> CompletionRegistration {
        self.on_completion_config(false, true, handler)
    }

    /// Full-control handler registration.
    ///
    /// With `on_cancelling = true` the handler fires at the start of
    /// cancellation instead of at completion. If the job is already past
    /// the requested phase, the handler runs synchronously iff
    /// `invoke_immediately`.
    pub fn on_completion_config(
        &self,
        on_cancelling: bool,
        invoke_immediately: bool,
        handler: impl FnOnce(Option<&Cause>) + Send + 'static,
    ) -> CompletionRegistration {
        let run_now: Option<Option<Cause>> = {
            let mut inner = self.core.inner.lock().unwrap();
            if inner.phase == Phase::Final {
                Some(inner.final_cause.clone())
            } else if on_cancelling && inner.is_cancelling {
                Some(inner.root_cause.as_ref().map(|r| r.as_cause()))
            } else {
                let id = inner.next_handler_id;
                inner.next_handler_id += 1;
                inner.handlers.push(HandlerNode {
                    id,
                    on_cancelling,
                    f: Box::new(handler),
                });
                return CompletionRegistration {
                    job: Some(Arc::downgrade(&self.core)),
                    id,
                };
            }
        };
        if invoke_immediately {
            if let Some(cause) = run_now {
                handler(cause.as_ref());
            }
        }
        CompletionRegistration { job: None, id: 0 }
    }

    // -- tree -------------------------------------------------------------

    /// Snapshot of the currently attached children.
    pub fn children(&self) -> Vec<JobHandle> {
        self.core.inner.lock().unwrap().children.clone()
    }

    /// Attach `child` to this job. The child is cancelled together with
    /// this job; its failures cancel this job unless it is a supervisor.
    pub fn attach_child(&self, child: &JobHandle) -> ChildHandle {
        let cancel_now: Option<Cause> = {
            let mut inner = self.core.inner.lock().unwrap();
            if inner.phase == Phase::Final {
                Some(
                    inner
                        .final_cause
                        .clone()
                        .unwrap_or_else(|| Cause::Cancelled(Arc::new(Cancelled::new("parent already completed")))),
                )
            } else {
                inner.children.push(child.clone());
                child.core.inner.lock().unwrap().parent = Some(Arc::downgrade(&self.core));
                if inner.is_cancelling {
                    Some(
                        inner
                            .root_cause
                            .as_ref()
                            .map(|r| r.as_cause())
                            .unwrap_or_else(|| Cause::Cancelled(Arc::new(Cancelled::new("parent was cancelled")))),
                    )
                } else {
                    None
                }
            }
        };
        if let Some(cause) = cancel_now {
            child.cancel_from_parent(&cause);
        }
        ChildHandle {
            parent: Arc::downgrade(&self.core),
            child: child.id(),
        }
    }

    fn cancel_from_parent(&self, cause: &Cause) {
        self.core
            .make_cancelling(RootCause::Cancelled(Arc::new(Cancelled::with_cause(
                "parent was cancelled",
                cause.clone(),
            ))));
    }

    // -- causes -----------------------------------------------------------

    /// The terminal cause, once final. `None` while running or when the
    /// job completed normally.
    pub fn final_cause(&self) -> Option<Cause> {
        self.core.inner.lock().unwrap().final_cause.clone()
    }

    /// Canonical cancellation value for awaiting code. Cached after first
    /// use once a cause is known.
    pub fn cancellation_cause(&self) -> Arc<Cancelled> {
        if let Some(cached) = self.core.cached_cancellation.lock().unwrap().clone() {
            return cached;
        }
        let derived: Option<Arc<Cancelled>> = {
            let inner = self.core.inner.lock().unwrap();
            let root = inner
                .final_cause
                .clone()
                .or_else(|| inner.root_cause.as_ref().map(|r| r.as_cause()));
            root.map(|cause| match &cause {
                Cause::Cancelled(c) => c.clone(),
                Cause::Failed(_) => {
                    Arc::new(Cancelled::with_cause("job is failing", cause.clone()))
                }
            })
        };
        match derived {
            Some(c) => {
                *self.core.cached_cancellation.lock().unwrap() = Some(c.clone());
                c
            }
            None => Arc::new(Cancelled::new("job was cancelled")),
        }
    }

    /// `Some(cancellation)` when a suspension point under this job must
    /// resume with a cancellation instead of proceeding.
    pub fn cancellation_if_cancelled(&self) -> Option<Arc<Cancelled>> {
        if self.is_cancelled() {
            Some(self.cancellation_cause())
        } else {
            None
        }
    }

    // -- wiring for builders ----------------------------------------------

    /// Install the hook that dispatches a lazy job's task on `start`.
    pub(crate) fn set_start_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut inner = self.core.inner.lock().unwrap();
        debug_assert!(inner.phase == Phase::New);
        inner.start_hook = Some(Box::new(hook));
    }

    /// Register a waker woken when the job starts cancelling (or fires
    /// immediately if it already is). Used by suspension points.
    pub(crate) fn wake_on_cancel(&self, waker: Arc<SharedWaker>) -> CompletionRegistration {
        self.on_completion_config(true, true, move |_| waker.wake())
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.core.id)
            .field("phase", &self.phase())
            .field("name", &self.core.name)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// JobCore — state machine internals
// ---------------------------------------------------------------------------

impl JobCore {
    fn store_phase(&self, inner: &JobInner) {
        let code = match inner.phase {
            Phase::New => CODE_NEW,
            Phase::Active => CODE_ACTIVE,
            Phase::Finishing => CODE_FINISHING,
            Phase::Final => CODE_FINAL,
        };
        let mut bits = code;
        if inner.is_cancelling {
            bits |= BIT_CANCELLING;
        }
        if inner.phase == Phase::Final && inner.final_cause.is_some() {
            bits |= BIT_CAUSE;
        }
        self.phase_bits.store(bits, Ordering::Release);
    }

    /// Enter the cancelling state (idempotent). Notifies on-cancelling
    /// handlers and cancels children outside the lock.
    fn make_cancelling(self: &Arc<Self>, proposed: RootCause) {
        let notify: Option<Notifications> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase == Phase::Final {
                None
            } else if inner.is_cancelling {
                // Already cancelling: keep extra failures as suppressed.
                if let Some(new_fault) = proposed.root_fault() {
                    let root = inner
                        .root_cause
                        .as_ref()
                        .and_then(|r| r.root_fault())
                        .cloned();
                    push_suppressed(&mut inner.suppressed, new_fault, root.as_ref());
                }
                None
            } else {
                inner.is_cancelling = true;
                if matches!(inner.phase, Phase::New | Phase::Active) {
                    inner.phase = Phase::Finishing;
                }
                if inner.root_cause.is_none() {
                    inner.root_cause = Some(proposed);
                } else if let Some(new_fault) = proposed.root_fault() {
                    let root = inner
                        .root_cause
                        .as_ref()
                        .and_then(|r| r.root_fault())
                        .cloned();
                    push_suppressed(&mut inner.suppressed, new_fault, root.as_ref());
                }
                if inner.start_hook.take().is_some() {
                    inner.body_discarded = true;
                }
                self.store_phase(&inner);
                let taken = std::mem::take(&mut inner.handlers);
                let (fire, keep): (Vec<_>, Vec<_>) =
                    taken.into_iter().partition(|h| h.on_cancelling);
                inner.handlers = keep;
                Some(Notifications {
                    handlers: fire,
                    cancel_children: inner.children.clone(),
                    cause: inner.root_cause.as_ref().map(|r| r.as_cause()),
                })
            }
        };

        if let Some(notify) = notify {
            tracing::trace!(job = %self.id, "job cancelling");
            let cause = notify.cause;
            let failure_handler = self.on_failure.lock().unwrap().clone();
            run_handlers(notify.handlers, cause.as_ref(), failure_handler.as_ref());
            if let Some(cause) = &cause {
                for child in notify.cancel_children {
                    child.cancel_from_parent(cause);
                }
            }
        }
        self.try_finalize();
    }

    /// Record the completion of the job's body (or an explicit
    /// `complete()` call). Returns `true` if this call initiated
    /// completion.
    fn complete(self: &Arc<Self>, outcome: Outcome<()>) -> bool {
        let (initiated, newly_cancelling): (bool, Option<RootCause>) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase == Phase::Final {
                return false;
            }
            let initiated = !inner.is_completing;
            inner.is_completing = true;
            if matches!(inner.phase, Phase::New | Phase::Active) {
                inner.phase = Phase::Finishing;
            }
            let mut trigger: Option<RootCause> = None;
            match outcome {
                Ok(()) => {}
                Err(StrandError::Cancelled(c)) => {
                    if inner.root_cause.is_none() && !inner.is_cancelling {
                        trigger = Some(RootCause::Cancelled(c));
                    }
                }
                Err(StrandError::Failed(f)) => {
                    if inner.root_cause.is_none() && !inner.is_cancelling {
                        trigger = Some(RootCause::Failed(f));
                    } else {
                        let root = inner
                            .root_cause
                            .as_ref()
                            .and_then(|r| r.root_fault())
                            .cloned();
                        push_suppressed(&mut inner.suppressed, &f, root.as_ref());
                    }
                }
            }
            self.store_phase(&inner);
            (initiated, trigger)
        };

        if let Some(root) = newly_cancelling {
            // A failing body cancels the job (and thereby its children).
            self.make_cancelling(root);
        } else {
            self.try_finalize();
        }
        initiated
    }

    /// Transition to `Final` when the body is done and all children have
    /// drained; fire remaining handlers, wake joiners, notify the parent.
    fn try_finalize(self: &Arc<Self>) {
        let actions: Option<FinalizeActions> = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase == Phase::Final {
                None
            } else if !inner.children.is_empty() {
                None
            } else {
                let body_done =
                    inner.is_completing || !self.config.has_body || inner.body_discarded;
                let has_reason = inner.is_completing || inner.is_cancelling;
                if !body_done || !has_reason {
                    None
                } else {
                    let suppressed = std::mem::take(&mut inner.suppressed);
                    let cause = match inner.root_cause.take() {
                        None => None,
                        Some(RootCause::Failed(f)) => Some(Cause::Failed(Arc::new(
                            Failure::with_suppressed(f, suppressed),
                        ))),
                        Some(RootCause::Cancelled(c)) => {
                            if suppressed.is_empty() {
                                Some(Cause::Cancelled(c))
                            } else {
                                // A real failure arrived while cancelling:
                                // it wins over the cancellation.
                                let mut rest = suppressed;
                                let root = rest.remove(0);
                                Some(Cause::Failed(Arc::new(Failure::with_suppressed(
                                    root, rest,
                                ))))
                            }
                        }
                    };
                    inner.phase = Phase::Final;
                    inner.final_cause = cause.clone();
                    self.store_phase(&inner);
                    let handlers = std::mem::take(&mut inner.handlers);
                    let wakers: Vec<Waker> =
                        inner.join_wakers.drain(..).flatten().collect();
                    let parent = inner.parent.take().and_then(|w| w.upgrade());
                    Some(FinalizeActions {
                        cause,
                        handlers,
                        wakers,
                        parent,
                    })
                }
            }
        };

        let Some(actions) = actions else { return };
        tracing::trace!(
            job = %self.id,
            cancelled = actions.cause.is_some(),
            "job completed"
        );
        let failure_handler = self.on_failure.lock().unwrap().clone();
        run_handlers(actions.handlers, actions.cause.as_ref(), failure_handler.as_ref());
        for waker in actions.wakers {
            waker.wake();
        }
        let absorbed = self.config.propagate_failure
            && actions
                .parent
                .as_ref()
                .is_some_and(|parent| !parent.config.supervisor);
        if let Some(parent) = actions.parent {
            parent.child_completed(
                self.id,
                actions.cause.as_ref(),
                self.config.propagate_failure,
            );
        }
        // A failure the parent absorbs surfaces at the scope boundary;
        // only orphaned failures go to the handler / hooks.
        if self.config.handles_failure && !absorbed {
            if let Some(Cause::Failed(failure)) = &actions.cause {
                let as_fault: Fault = failure.clone();
                deliver_unhandled(failure_handler.as_ref(), &as_fault);
            }
        }
    }

    /// A child reached its terminal state.
    fn child_completed(self: &Arc<Self>, child: JobId, cause: Option<&Cause>, propagate: bool) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.children.retain(|c| c.id() != child);
        }
        if propagate && !self.config.supervisor {
            if let Some(Cause::Failed(failure)) = cause {
                self.make_cancelling(RootCause::Failed(failure.root().clone()));
            }
        }
        self.try_finalize();
    }
}

/// Invoke handlers outside the state lock; panics are collected into one
/// wrapping failure and delivered to the failure handler / hooks.
fn run_handlers(
    handlers: Vec<HandlerNode>,
    cause: Option<&Cause>,
    context_handler: Option<&FailureHandler>,
) {
    let mut panics: Vec<Fault> = Vec::new();
    for node in handlers {
        let f = node.f;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(cause))) {
            panics.push(panic_fault(payload));
        }
    }
    if !panics.is_empty() {
        let wrapped: Fault = Arc::new(Failure::with_suppressed(
            fault("completion handler failed"),
            panics,
        ));
        deliver_unhandled(context_handler, &wrapped);
    }
}

// ---------------------------------------------------------------------------
// Registrations and handles
// ---------------------------------------------------------------------------

/// A disposable completion-handler registration.
pub struct CompletionRegistration {
    job: Option<Weak<JobCore>>,
    id: u64,
}

impl CompletionRegistration {
    /// A registration that does nothing on dispose (handler already ran or
    /// was never stored).
    pub fn disposed() -> Self {
        Self { job: None, id: 0 }
    }

    /// Remove the handler if it has not fired yet. Idempotent.
    pub fn dispose(&self) {
        if let Some(core) = self.job.as_ref().and_then(|w| w.upgrade()) {
            let mut inner = core.inner.lock().unwrap();
            inner.handlers.retain(|h| h.id != self.id);
        }
    }
}

/// The parent side of an `attach_child` registration. Disposing detaches
/// the child without cancelling it.
pub struct ChildHandle {
    parent: Weak<JobCore>,
    child: JobId,
}

impl ChildHandle {
    /// Detach the child from its parent. The parent no longer waits for
    /// it, and failures no longer propagate.
    pub fn dispose(&self) {
        if let Some(parent) = self.parent.upgrade() {
            {
                let mut inner = parent.inner.lock().unwrap();
                inner.children.retain(|c| c.id() != self.child);
            }
            parent.try_finalize();
        }
    }
}

// ---------------------------------------------------------------------------
// JoinFuture
// ---------------------------------------------------------------------------

/// Future returned by [`JobHandle::join`]. Completes with `Ok(())` when the
/// target reaches its terminal state (even a cancelled one); errs only when
/// the *calling* job is cancelled while waiting.
pub struct JoinFuture {
    target: JobHandle,
    slot: Option<usize>,
    caller: Option<JobHandle>,
    caller_reg: Option<CompletionRegistration>,
    waker_slot: Arc<SharedWaker>,
    started: bool,
}

impl Future for JoinFuture {
    type Output = Outcome<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.started {
            this.started = true;
            // Joining a lazy job starts it.
            this.target.start();
            this.caller = current_job();
            if let Some(caller) = &this.caller {
                if caller.id() != this.target.id() {
                    let slot = this.waker_slot.clone();
                    this.caller_reg =
                        Some(caller.wake_on_cancel(slot));
                }
            }
        }

        if let Some(caller) = &this.caller {
            if let Some(cancelled) = caller.cancellation_if_cancelled() {
                this.cleanup();
                return Poll::Ready(Err(StrandError::Cancelled(cancelled)));
            }
        }

        this.waker_slot.register(cx.waker());

        let mut inner = this.target.core.inner.lock().unwrap();
        if inner.phase == Phase::Final {
            drop(inner);
            this.cleanup();
            return Poll::Ready(Ok(()));
        }
        match this.slot {
            Some(index) if index < inner.join_wakers.len() => {
                inner.join_wakers[index] = Some(cx.waker().clone());
            }
            _ => {
                inner.join_wakers.push(Some(cx.waker().clone()));
                this.slot = Some(inner.join_wakers.len() - 1);
            }
        }
        Poll::Pending
    }
}

impl JoinFuture {
    fn cleanup(&mut self) {
        if let Some(reg) = self.caller_reg.take() {
            reg.dispose();
        }
        if let Some(index) = self.slot.take() {
            let mut inner = self.target.core.inner.lock().unwrap();
            if index < inner.join_wakers.len() {
                inner.join_wakers[index] = None;
            }
        }
    }
}

impl Drop for JoinFuture {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ---------------------------------------------------------------------------
// Deferred
// ---------------------------------------------------------------------------

/// A job that additionally carries a result value.
pub struct Deferred<T> {
    handle: JobHandle,
    cell: Arc<Mutex<Option<T>>>,
}

impl<T: Send + 'static> Deferred<T> {
    pub(crate) fn new(handle: JobHandle, cell: Arc<Mutex<Option<T>>>) -> Self {
        Self { handle, cell }
    }

    /// The underlying job.
    pub fn job(&self) -> &JobHandle {
        &self.handle
    }

    /// Suspend until the value is available and deliver it, or the cause
    /// of the deferred's cancellation/failure.
    ///
    /// Prompt cancellation: a caller whose own job was cancelled while the
    /// value was in transit observes the cancellation, never the value.
    pub async fn await_result(self) -> Outcome<T> {
        self.handle.join().await?;
        if let Some(caller) = current_job() {
            if let Some(cancelled) = caller.cancellation_if_cancelled() {
                return Err(StrandError::Cancelled(cancelled));
            }
        }
        match self.handle.final_cause() {
            Some(cause) => Err(cause.to_error()),
            None => match self.cell.lock().unwrap().take() {
                Some(value) => Ok(value),
                None => Err(StrandError::msg("deferred value already consumed")),
            },
        }
    }

    /// Non-suspending read: the completed value, if the deferred finished
    /// normally and the value has not been consumed.
    pub fn try_take(&self) -> Option<T> {
        if self.handle.is_completed() && self.handle.final_cause().is_none() {
            self.cell.lock().unwrap().take()
        } else {
            None
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("job", &self.handle.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::task::Wake;

    struct NoopWake;
    impl Wake for NoopWake {
        fn wake(self: Arc<Self>) {}
    }

    fn noop_waker() -> Waker {
        Waker::from(Arc::new(NoopWake))
    }

    fn lazy_job() -> JobHandle {
        JobHandle::create(
            None,
            JobConfig {
                start_active: false,
                ..JobConfig::bare()
            },
            None,
            None,
        )
    }

    // -- basic lifecycle ---------------------------------------------------

    #[test]
    fn bare_job_starts_active() {
        let job = JobHandle::new_job(None);
        assert!(job.is_active());
        assert!(!job.is_completed());
        assert_eq!(job.phase(), JobPhase::Active);
    }

    #[test]
    fn lazy_job_starts_on_demand() {
        let job = lazy_job();
        assert_eq!(job.phase(), JobPhase::New);
        assert!(!job.is_active());

        assert!(job.start());
        assert!(job.is_active());
        // Idempotent.
        assert!(!job.start());
    }

    #[test]
    fn start_hook_runs_once() {
        let job = lazy_job();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        job.set_start_hook(move || {
            r.fetch_add(1, AtomicOrdering::SeqCst);
        });

        job.start();
        job.start();
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn cancelled_lazy_job_never_runs_hook() {
        let job = lazy_job();
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        job.set_start_hook(move || {
            r.fetch_add(1, AtomicOrdering::SeqCst);
        });

        job.cancel();
        assert!(!job.start());
        assert_eq!(runs.load(AtomicOrdering::SeqCst), 0);
        assert!(job.is_completed());
        assert!(job.is_cancelled());
    }

    #[test]
    fn complete_transitions_to_final_without_cause() {
        let job = JobHandle::new_job(None);
        assert!(job.complete());
        assert!(job.is_completed());
        assert!(job.final_cause().is_none());
        // Second complete is a no-op.
        assert!(!job.complete());
    }

    #[test]
    fn cancel_is_idempotent() {
        let job = JobHandle::new_job(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        job.invoke_on_completion(move |_| {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });

        job.cancel();
        job.cancel();
        assert!(job.is_completed());
        assert!(job.is_cancelled());
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
    }

    // -- handlers ----------------------------------------------------------

    #[test]
    fn completion_handler_after_final_runs_immediately() {
        let job = JobHandle::new_job(None);
        job.complete();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        job.invoke_on_completion(move |cause| {
            assert!(cause.is_none());
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);

        // invoke_immediately = false suppresses the synchronous call.
        let f2 = Arc::new(AtomicUsize::new(0));
        let f2c = Arc::clone(&f2);
        job.on_completion_config(false, false, move |_| {
            f2c.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(f2.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn on_cancelling_handler_fires_at_cancel_edge() {
        let job = JobHandle::new_job(None);
        // Keep the job from finalizing so the edge is observable.
        let child = JobHandle::new_job(Some(&job));

        let saw_cause = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&saw_cause);
        job.on_completion_config(true, true, move |cause| {
            assert!(cause.is_some());
            s.fetch_add(1, AtomicOrdering::SeqCst);
        });

        job.cancel();
        assert_eq!(saw_cause.load(AtomicOrdering::SeqCst), 1);
        assert!(child.is_cancelled());
    }

    #[test]
    fn disposed_handler_never_fires() {
        let job = JobHandle::new_job(None);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let reg = job.invoke_on_completion(move |_| {
            f.fetch_add(1, AtomicOrdering::SeqCst);
        });
        reg.dispose();
        job.complete();
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    // -- parent / child ----------------------------------------------------

    #[test]
    fn parent_cancel_cancels_children() {
        let parent = JobHandle::new_job(None);
        let child_a = JobHandle::new_job(Some(&parent));
        let child_b = JobHandle::new_job(Some(&parent));

        parent.cancel();
        assert!(child_a.is_cancelled());
        assert!(child_b.is_cancelled());
        assert!(parent.is_completed());
        assert!(parent.children().is_empty());
    }

    #[test]
    fn parent_waits_for_children_before_final() {
        let parent = JobHandle::new_job(None);
        let child = JobHandle::new_job(Some(&parent));

        parent.complete();
        assert!(!parent.is_completed());
        assert_eq!(parent.phase(), JobPhase::Completing);

        child.complete();
        assert!(child.is_completed());
        assert!(parent.is_completed());
        assert!(parent.children().is_empty());
    }

    #[test]
    fn child_failure_cancels_parent_and_siblings() {
        let parent = JobHandle::new_job(None);
        let failing = JobHandle::create(
            None,
            JobConfig {
                has_body: true,
                ..JobConfig::bare()
            },
            Some(&parent),
            None,
        );
        let sibling = JobHandle::new_job(Some(&parent));

        failing.complete_with(Err(StrandError::msg("boom")));
        assert!(failing.is_completed());
        assert!(sibling.is_cancelled());

        // Parent finalizes once the sibling drains.
        assert!(parent.is_completed());
        let cause = parent.final_cause().expect("parent failed");
        assert!(!cause.is_cancellation());
        assert_eq!(cause.root_fault().unwrap().to_string(), "boom");
    }

    #[test]
    fn supervisor_ignores_child_failure() {
        let parent = JobHandle::new_supervisor(None);
        let failing = JobHandle::create(
            None,
            JobConfig {
                has_body: true,
                ..JobConfig::bare()
            },
            Some(&parent),
            None,
        );
        let sibling = JobHandle::new_job(Some(&parent));

        failing.complete_with(Err(StrandError::msg("boom")));
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(parent.is_active());

        sibling.complete();
        parent.complete();
        assert!(parent.is_completed());
        assert!(parent.final_cause().is_none());
    }

    #[test]
    fn child_cancellation_does_not_fail_parent() {
        let parent = JobHandle::new_job(None);
        let child = JobHandle::new_job(Some(&parent));

        child.cancel();
        assert!(!parent.is_cancelled());

        parent.complete();
        assert!(parent.is_completed());
        assert!(parent.final_cause().is_none());
    }

    #[test]
    fn sibling_failures_aggregate_as_suppressed() {
        let parent = JobHandle::new_job(None);
        let body = JobConfig {
            has_body: true,
            ..JobConfig::bare()
        };
        let first = JobHandle::create(None, body, Some(&parent), None);
        let second = JobHandle::create(None, body, Some(&parent), None);

        first.complete_with(Err(StrandError::msg("first")));
        second.complete_with(Err(StrandError::msg("second")));

        assert!(parent.is_completed());
        let cause = parent.final_cause().expect("failed");
        match cause {
            Cause::Failed(failure) => {
                assert_eq!(failure.root().to_string(), "first");
                assert_eq!(failure.suppressed().len(), 1);
                assert_eq!(failure.suppressed()[0].to_string(), "second");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn attach_child_to_completed_parent_cancels_child() {
        let parent = JobHandle::new_job(None);
        parent.complete();

        let child = JobHandle::new_job(None);
        parent.attach_child(&child);
        assert!(child.is_cancelled());
    }

    #[test]
    fn detached_child_no_longer_blocks_parent() {
        let parent = JobHandle::new_job(None);
        let child = JobHandle::new_job(None);
        let handle = parent.attach_child(&child);

        parent.complete();
        assert!(!parent.is_completed());

        handle.dispose();
        assert!(parent.is_completed());
        // The detached child is unaffected.
        assert!(child.is_active());
    }

    // -- join --------------------------------------------------------------

    #[test]
    fn join_ready_once_final() {
        let job = JobHandle::new_job(None);
        let mut join = job.join();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut join).poll(&mut cx).is_pending());
        job.complete();
        match Pin::new(&mut join).poll(&mut cx) {
            Poll::Ready(Ok(())) => {}
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn join_on_cancelled_target_is_not_an_error() {
        let job = JobHandle::new_job(None);
        job.cancel();
        let mut join = job.join();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match Pin::new(&mut join).poll(&mut cx) {
            Poll::Ready(Ok(())) => {}
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_cause_is_cached() {
        let job = JobHandle::new_job(None);
        job.cancel_with(Cancelled::new("stop now"));
        let a = job.cancellation_cause();
        let b = job.cancellation_cause();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.message(), "stop now");
    }

    #[test]
    fn failed_job_reports_cancelled_query() {
        let job = JobHandle::create(
            None,
            JobConfig {
                has_body: true,
                ..JobConfig::bare()
            },
            None,
            None,
        );
        job.complete_with(Err(StrandError::msg("boom")));
        assert!(job.is_completed());
        assert!(job.is_cancelled());
        let cancellation = job.cancellation_cause();
        assert!(cancellation.cause().is_some());
    }
}
