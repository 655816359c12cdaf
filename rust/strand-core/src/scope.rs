//! Structured concurrency scopes and task builders.
//!
//! A [`Scope`] is a concurrency boundary: every task launched into it
//! completes or is cancelled before the scope itself completes.
//!
//! # Invariants
//!
//! 1. [`coroutine_scope`] returns only after every launched child reached
//!    its terminal state.
//! 2. If any child fails, the remaining siblings are cancelled and the
//!    first failure is returned (later failures attach as suppressed).
//! 3. [`supervisor_scope`] confines each child's failure to that child.
//! 4. Scopes nest: an inner scope is a child job of the outer one, so
//!    cancellation flows down the whole tree.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::context::{current_job, TaskContext};
use crate::dispatch::Dispatcher;
use crate::error::{Outcome, StrandError};
use crate::job::{Deferred, JobConfig, JobHandle};
use crate::task::Task;

// ---------------------------------------------------------------------------
// LaunchOptions
// ---------------------------------------------------------------------------

/// Options for [`Scope::launch_with`] / [`Scope::spawn_with`].
#[derive(Default)]
pub struct LaunchOptions {
    /// Run on this dispatcher instead of the scope's.
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    /// Create the job in the `New` state; the body is dispatched by
    /// `start()` or the first `join()`.
    pub lazy: bool,
    /// Task name for diagnostics.
    pub name: Option<String>,
}

impl LaunchOptions {
    pub fn lazy() -> Self {
        Self {
            lazy: true,
            ..Self::default()
        }
    }

    pub fn on(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            dispatcher: Some(dispatcher),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// A handle to a structured-concurrency scope. Cloneable; all clones
/// launch into the same job.
#[derive(Clone)]
pub struct Scope {
    ctx: TaskContext,
    job: JobHandle,
}

impl Scope {
    pub(crate) fn new(ctx: TaskContext, job: JobHandle) -> Self {
        Self { ctx, job }
    }

    /// The context children inherit.
    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// The scope's own job.
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// `true` while the scope accepts new work.
    pub fn is_active(&self) -> bool {
        self.job.is_active()
    }

    /// Cancel the scope and everything launched into it.
    pub fn cancel(&self) {
        self.job.cancel();
    }

    /// Launch a fire-and-forget child task. Failures cancel the scope
    /// (unless it is a supervisor scope) and are reported to the context's
    /// failure handler.
    pub fn launch<F>(&self, body: F) -> JobHandle
    where
        F: Future<Output = Outcome<()>> + Send + 'static,
    {
        self.launch_with(LaunchOptions::default(), body)
    }

    /// Launch on an explicit dispatcher.
    pub fn launch_on<F>(&self, dispatcher: Arc<dyn Dispatcher>, body: F) -> JobHandle
    where
        F: Future<Output = Outcome<()>> + Send + 'static,
    {
        self.launch_with(LaunchOptions::on(dispatcher), body)
    }

    /// Launch with full options.
    pub fn launch_with<F>(&self, options: LaunchOptions, body: F) -> JobHandle
    where
        F: Future<Output = Outcome<()>> + Send + 'static,
    {
        let config = JobConfig {
            start_active: !options.lazy,
            supervisor: false,
            has_body: true,
            propagate_failure: true,
            handles_failure: true,
        };
        let (job, ctx) = self.child_parts(config, &options);
        let wrapped = wrap_body(job.clone(), body);
        if options.lazy {
            let task = Task::new(ctx, wrapped);
            job.set_start_hook(move || task.schedule());
        } else {
            Task::spawn(ctx, wrapped);
        }
        job
    }

    /// Launch a child task that produces a value; the result (value or
    /// failure) is observed through the returned [`Deferred`]. A failure
    /// still cancels a non-supervisor scope.
    pub fn spawn<T, F>(&self, body: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        self.spawn_with(LaunchOptions::default(), body)
    }

    /// Spawn with full options.
    pub fn spawn_with<T, F>(&self, options: LaunchOptions, body: F) -> Deferred<T>
    where
        T: Send + 'static,
        F: Future<Output = Outcome<T>> + Send + 'static,
    {
        let config = JobConfig {
            start_active: !options.lazy,
            supervisor: false,
            has_body: true,
            propagate_failure: true,
            handles_failure: false,
        };
        let (job, ctx) = self.child_parts(config, &options);
        let cell = Arc::new(Mutex::new(None));
        let value_cell = Arc::clone(&cell);
        let body_job = job.clone();
        let wrapped = async move {
            if body_job.is_cancelled() {
                let cancelled = body_job.cancellation_cause();
                body_job.complete_with(Err(StrandError::Cancelled(cancelled)));
                return;
            }
            match body.await {
                Ok(value) => {
                    *value_cell.lock().unwrap() = Some(value);
                    body_job.complete_with(Ok(()));
                }
                Err(error) => body_job.complete_with(Err(error)),
            }
        };
        if options.lazy {
            let task = Task::new(ctx, wrapped);
            job.set_start_hook(move || task.schedule());
        } else {
            Task::spawn(ctx, wrapped);
        }
        Deferred::new(job, cell)
    }

    fn child_parts(&self, config: JobConfig, options: &LaunchOptions) -> (JobHandle, TaskContext) {
        let name: Option<Arc<str>> = options
            .name
            .as_deref()
            .map(|n| Arc::from(n.to_string().into_boxed_str()));
        let job = JobHandle::create(
            name,
            config,
            Some(&self.job),
            self.ctx.failure_handler().cloned(),
        );
        let mut ctx = self.ctx.with_job(job.clone());
        if let Some(dispatcher) = &options.dispatcher {
            ctx = ctx.with_dispatcher(dispatcher.clone());
        }
        if let Some(name) = &options.name {
            ctx = ctx.with_name(name.clone());
        }
        (job, ctx)
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("job", &self.job).finish()
    }
}

fn wrap_body<F>(job: JobHandle, body: F) -> impl Future<Output = ()> + Send + 'static
where
    F: Future<Output = Outcome<()>> + Send + 'static,
{
    async move {
        if job.is_cancelled() {
            let cancelled = job.cancellation_cause();
            job.complete_with(Err(StrandError::Cancelled(cancelled)));
            return;
        }
        let outcome = body.await;
        job.complete_with(outcome);
    }
}

// ---------------------------------------------------------------------------
// ScopedFuture — context-swapping wrapper
// ---------------------------------------------------------------------------

/// Runs an inner future with a different ambient context installed around
/// every poll.
pub(crate) struct ScopedFuture<'a, T> {
    ctx: TaskContext,
    inner: Pin<Box<dyn Future<Output = T> + Send + 'a>>,
}

impl<'a, T> ScopedFuture<'a, T> {
    pub(crate) fn new<F>(ctx: TaskContext, inner: F) -> Self
    where
        F: Future<Output = T> + Send + 'a,
    {
        Self {
            ctx,
            inner: Box::pin(inner),
        }
    }
}

impl<T> Future for ScopedFuture<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let inner = &mut this.inner;
        this.ctx.enter(|| inner.as_mut().poll(cx))
    }
}

// ---------------------------------------------------------------------------
// Scope builders
// ---------------------------------------------------------------------------

/// Run `f` in a fresh scope whose job is a child of the current one.
/// Suspends until the scope's job is terminal; the result is the block's
/// value, the first child failure (with suppressed siblings attached), or
/// the cancellation that reached the scope.
pub async fn coroutine_scope<T, F, Fut>(f: F) -> Outcome<T>
where
    T: Send,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Outcome<T>> + Send,
{
    scope_impl(false, f).await
}

/// Like [`coroutine_scope`], but a child's failure does not cancel its
/// siblings or fail the scope.
pub async fn supervisor_scope<T, F, Fut>(f: F) -> Outcome<T>
where
    T: Send,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Outcome<T>> + Send,
{
    scope_impl(true, f).await
}

async fn scope_impl<T, F, Fut>(supervisor: bool, f: F) -> Outcome<T>
where
    T: Send,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Outcome<T>> + Send,
{
    let parent_ctx = TaskContext::current_or_background();
    let config = JobConfig {
        start_active: true,
        supervisor,
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
    let ctx = parent_ctx.with_job(job.clone());
    let scope = Scope::new(ctx.clone(), job.clone());

    // The block runs inline in the calling task, with the scope's job as
    // the ambient one so cancellation is observable inside.
    let block_result = ScopedFuture::new(ctx, f(scope)).await;
    match &block_result {
        Ok(_) => job.complete_with(Ok(())),
        Err(error) => job.complete_with(Err(error.clone())),
    }

    // Wait for the children to drain regardless of the caller's own
    // cancellation: a scope never completes before its children.
    let join = ScopedFuture::new(parent_ctx.without_job(), job.join());
    let _ = join.await;

    match job.final_cause() {
        None => block_result,
        Some(cause) => Err(cause.to_error()),
    }
}

// ---------------------------------------------------------------------------
// Context-changing builders
// ---------------------------------------------------------------------------

/// Run `body` on `dispatcher` as a child job and deliver its result back
/// here.
///
/// Prompt cancellation guarantee: if the calling job is cancelled while
/// the result is in transit, the result is discarded and the cancellation
/// is observed instead.
pub async fn with_context<T, F>(dispatcher: Arc<dyn Dispatcher>, body: F) -> Outcome<T>
where
    T: Send + 'static,
    F: Future<Output = Outcome<T>> + Send + 'static,
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
    let ctx = parent_ctx
        .with_job(job.clone())
        .with_dispatcher(dispatcher);

    let cell = Arc::new(Mutex::new(None));
    let value_cell = Arc::clone(&cell);
    let body_job = job.clone();
    Task::spawn(ctx, async move {
        if body_job.is_cancelled() {
            let cancelled = body_job.cancellation_cause();
            body_job.complete_with(Err(StrandError::Cancelled(cancelled)));
            return;
        }
        match body.await {
            Ok(value) => {
                *value_cell.lock().unwrap() = Some(value);
                body_job.complete_with(Ok(()));
            }
            Err(error) => body_job.complete_with(Err(error)),
        }
    });

    Deferred::new(job, cell).await_result().await
}

/// Run `body` inline, shielded from the caller's cancellation. Used for
/// cleanup that must finish even while the surrounding job is going down.
pub async fn non_cancellable<T, F>(body: F) -> T
where
    F: Future<Output = T> + Send,
{
    let ctx = TaskContext::current_or_background().without_job();
    ScopedFuture::new(ctx, body).await
}

/// Run `body` inline under a task name (diagnostics only).
pub async fn with_task_name<T, F>(name: impl Into<String>, body: F) -> T
where
    F: Future<Output = T> + Send,
{
    let ctx = TaskContext::current_or_background().with_name(name);
    ScopedFuture::new(ctx, body).await
}

// ---------------------------------------------------------------------------
// Cooperation points
// ---------------------------------------------------------------------------

/// Errs when the ambient job has been cancelled. The cooperative check
/// for compute loops without natural suspension points.
pub fn check_cancellation() -> Outcome<()> {
    if let Some(job) = current_job() {
        if let Some(cancelled) = job.cancellation_if_cancelled() {
            return Err(StrandError::Cancelled(cancelled));
        }
    }
    Ok(())
}

/// Yield the thread: the task is re-dispatched and resumes after other
/// queued work. Never returns inline on first poll.
pub fn yield_now() -> YieldFuture {
    YieldFuture { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldFuture {
    yielded: bool,
}

impl Future for YieldFuture {
    type Output = Outcome<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(cancelled) = check_cancellation() {
            return Poll::Ready(Err(cancelled));
        }
        if self.yielded {
            Poll::Ready(Ok(()))
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Cause;
    use crate::run::run_blocking;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn scope_returns_block_value() {
        let value = run_blocking(coroutine_scope(|_scope| async move { Ok(40 + 2) }));
        assert_eq!(value.unwrap(), 42);
    }

    #[test]
    fn scope_waits_for_launched_children() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let result = run_blocking(coroutine_scope(move |scope| async move {
            for _ in 0..8 {
                let c = Arc::clone(&c);
                scope.launch(async move {
                    yield_now().await?;
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
            Ok(())
        }));
        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn child_failure_cancels_siblings_and_fails_scope() {
        let sibling_cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&sibling_cancelled);
        let result: Outcome<()> = run_blocking(coroutine_scope(move |scope| async move {
            let flag = Arc::clone(&flag);
            scope.launch(async move {
                // Parks forever; only cancellation can end it.
                let (suspension, _resumer) = crate::suspend::suspension::<()>();
                let r = suspension.into_future(None).await;
                if r.is_err() {
                    flag.store(true, Ordering::SeqCst);
                }
                r.map_err(StrandError::Cancelled)
            });
            scope.launch(async move { Err(StrandError::msg("boom")) });
            Ok(())
        }));

        let err = result.unwrap_err();
        assert!(!err.is_cancellation());
        assert!(err.to_string().contains("boom"));
        assert!(sibling_cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn supervisor_scope_confines_child_failure() {
        let result = run_blocking(supervisor_scope(|scope| async move {
            scope.launch(async move { Err(StrandError::msg("contained")) });
            yield_now().await?;
            Ok("survived")
        }));
        assert_eq!(result.unwrap(), "survived");
    }

    #[test]
    fn spawn_delivers_value() {
        let result = run_blocking(coroutine_scope(|scope| async move {
            let deferred = scope.spawn(async move { Ok(6 * 7) });
            deferred.await_result().await
        }));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn spawn_failure_reaches_awaiter_and_scope() {
        let result: Outcome<u32> = run_blocking(coroutine_scope(|scope| async move {
            let deferred = scope.spawn::<u32, _>(async move { Err(StrandError::msg("bad")) });
            deferred.await_result().await
        }));
        assert!(result.is_err());
    }

    #[test]
    fn lazy_launch_runs_only_after_start_or_join() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let flag2 = Arc::clone(&flag);
            let job = scope.launch_with(LaunchOptions::lazy(), async move {
                flag2.store(true, Ordering::SeqCst);
                Ok(())
            });
            yield_now().await?;
            assert!(!flag.load(Ordering::SeqCst));
            assert!(!job.is_active());

            job.join().await?;
            assert!(flag.load(Ordering::SeqCst));
            Ok(())
        }));
        assert!(result.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn launch_join_empty_body_fires_handlers_once() {
        let fires = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fires);
        let result = run_blocking(coroutine_scope(move |scope| async move {
            let job = scope.launch(async move { Ok(()) });
            let f2 = Arc::clone(&f);
            job.invoke_on_completion(move |cause| {
                assert!(cause.is_none());
                f2.fetch_add(1, Ordering::SeqCst);
            });
            job.join().await?;
            Ok(())
        }));
        assert!(result.is_ok());
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_scope_reports_cancellation_to_children() {
        let saw_cause = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&saw_cause);
        let result: Outcome<()> = run_blocking(coroutine_scope(move |scope| async move {
            let job = scope.launch(async move {
                let (suspension, _keep) = crate::suspend::suspension::<()>();
                suspension
                    .into_future(None)
                    .await
                    .map_err(StrandError::Cancelled)
            });
            let flag2 = Arc::clone(&flag);
            job.invoke_on_completion(move |cause| {
                if matches!(cause, Some(Cause::Cancelled(_))) {
                    flag2.store(true, Ordering::SeqCst);
                }
            });
            scope.cancel();
            Ok(())
        }));
        assert!(result.unwrap_err().is_cancellation());
        assert!(saw_cause.load(Ordering::SeqCst));
    }

    #[test]
    fn with_context_moves_work_to_target_dispatcher() {
        let pool = crate::dispatch::PoolDispatcher::new("ctx-pool", 1);
        let result = run_blocking(coroutine_scope(|_scope| async move {
            let value = with_context(pool, async move {
                let name = std::thread::current().name().unwrap_or("").to_string();
                Ok(name)
            })
            .await?;
            Ok(value)
        }));
        assert!(result.unwrap().starts_with("ctx-pool"));
    }

    #[test]
    fn non_cancellable_completes_under_cancelled_job() {
        let result: Outcome<u32> = run_blocking(coroutine_scope(|scope| async move {
            scope.cancel();
            // The ambient job is cancelled, but the shielded block still
            // runs its suspension points.
            let v = non_cancellable(async move {
                yield_now().await.expect("shielded from cancellation");
                7
            })
            .await;
            // Outside the shield the cancellation is observable again.
            assert!(check_cancellation().is_err());
            Ok(v)
        }));
        // The scope itself was cancelled.
        assert!(result.unwrap_err().is_cancellation());
    }

    #[test]
    fn yield_now_never_completes_inline() {
        let result = run_blocking(async {
            let mut fut = yield_now();
            let pending_first = std::future::poll_fn(|cx| {
                std::task::Poll::Ready(Pin::new(&mut fut).poll(cx).is_pending())
            })
            .await;
            assert!(pending_first, "first poll must not complete inline");
            fut.await
        });
        assert!(result.is_ok());
    }
}
