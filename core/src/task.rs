//! Tasks: futures driven on an execution context.
//!
//! A task is polled inside a job on its context. When woken it queues a fresh
//! job on the same context, so every resumption goes through the context's
//! ordering. Each task owns a child of its scope's lifetime; the flag is
//! checked before every poll, and cancellation wakes a suspended task so it
//! observes the flag at its current suspension point.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Wake, Waker};

use futures_util::future::BoxFuture;

use dispatch_types::{ChildFailure, Role, ScopeId, TaskError, TaskId};

use crate::context::ContextRef;
use crate::lifetime::{CallbackKey, Lifetime};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts tasks that have been spawned but have not finished.
///
/// Trackers form a tree mirroring child scopes: a task counted by a child
/// tracker is also counted by every ancestor.
#[derive(Debug, Default)]
pub struct TaskTracker {
    active: AtomicUsize,
    parent: Option<Arc<TaskTracker>>,
}

impl TaskTracker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            parent: Some(Arc::clone(self)),
        })
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn enter(&self) {
        let mut current = Some(self);
        while let Some(tracker) = current {
            tracker.active.fetch_add(1, Ordering::AcqRel);
            current = tracker.parent.as_deref();
        }
    }

    fn exit(&self) {
        let mut current = Some(self);
        while let Some(tracker) = current {
            tracker.active.fetch_sub(1, Ordering::AcqRel);
            current = tracker.parent.as_deref();
        }
    }
}

/// What the body of a task reported when it finished.
pub(crate) enum Outcome {
    Done,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Idle,
    Scheduled,
    Running,
    Notified,
    Done,
}

trait Completion: Send + Sync {
    fn finish_with_error(&self, err: TaskError);
}

struct JoinSlot<T> {
    result: Option<Result<T, TaskError>>,
    waker: Option<Waker>,
    finished: bool,
}

struct JoinState<T> {
    slot: Mutex<JoinSlot<T>>,
}

impl<T> JoinState<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(JoinSlot {
                result: None,
                waker: None,
                finished: false,
            }),
        }
    }

    fn complete(&self, result: Result<T, TaskError>) {
        let waker = {
            let mut slot = lock(&self.slot);
            if slot.finished {
                return;
            }
            slot.finished = true;
            slot.result = Some(result);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T: Send> Completion for JoinState<T> {
    fn finish_with_error(&self, err: TaskError) {
        self.complete(Err(err));
    }
}

/// Where a task runs and whom it answers to.
#[derive(Clone)]
pub(crate) struct Placement {
    pub(crate) scope: ScopeId,
    pub(crate) role: Role,
    pub(crate) context: ContextRef,
    pub(crate) parent: Lifetime,
    pub(crate) tracker: Arc<TaskTracker>,
}

struct Task {
    id: TaskId,
    placement: Placement,
    lifetime: Lifetime,
    future: Mutex<Option<BoxFuture<'static, Outcome>>>,
    schedule: Mutex<Schedule>,
    completion: Arc<dyn Completion>,
    cancel_key: Mutex<Option<CallbackKey>>,
}

impl Task {
    fn schedule(self: &Arc<Self>) {
        let mut state = lock(&self.schedule);
        match *state {
            Schedule::Idle => {
                *state = Schedule::Scheduled;
                drop(state);
                self.dispatch();
            }
            Schedule::Running => *state = Schedule::Notified,
            Schedule::Scheduled | Schedule::Notified | Schedule::Done => {}
        }
    }

    fn dispatch(self: &Arc<Self>) {
        let runnable = Runnable(Some(Arc::clone(self)));
        self.placement
            .context
            .dispatch(Box::new(move || runnable.run()));
    }

    fn run(self: &Arc<Self>) {
        {
            let mut state = lock(&self.schedule);
            if *state != Schedule::Scheduled {
                return;
            }
            *state = Schedule::Running;
        }

        if self.lifetime.is_cancelled() {
            self.finish(Err(TaskError::Cancelled));
            return;
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let polled = {
            let mut future = lock(&self.future);
            let Some(body) = future.as_mut() else {
                return;
            };
            catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)))
        };

        match polled {
            Ok(Poll::Ready(Outcome::Done)) => self.finish(Ok(())),
            Ok(Poll::Ready(Outcome::Failed(message))) => self.fail(message),
            Ok(Poll::Pending) => {
                let mut state = lock(&self.schedule);
                if *state == Schedule::Notified {
                    *state = Schedule::Scheduled;
                    drop(state);
                    self.dispatch();
                } else {
                    *state = Schedule::Idle;
                }
            }
            Err(payload) => self.fail(panic_message(payload.as_ref())),
        }
    }

    fn fail(self: &Arc<Self>, message: String) {
        let failure = ChildFailure {
            task: self.id,
            scope: self.placement.scope,
            role: self.placement.role,
            message,
        };
        let escalated = self.placement.parent.record_failure(failure.clone());
        if escalated {
            tracing::warn!(
                task = %self.id,
                scope = %self.placement.scope,
                role = %self.placement.role,
                "Task failed, cancelling scope: {}",
                failure.message
            );
        } else {
            tracing::warn!(
                task = %self.id,
                scope = %self.placement.scope,
                role = %self.placement.role,
                "Task failed: {}",
                failure.message
            );
        }
        self.finish(Err(TaskError::Failed(failure)));
    }

    /// Terminal transition. `Ok(())` means the body already stored its value.
    fn finish(self: &Arc<Self>, result: Result<(), TaskError>) {
        {
            let mut state = lock(&self.schedule);
            if *state == Schedule::Done {
                return;
            }
            *state = Schedule::Done;
        }
        *lock(&self.future) = None;
        if let Some(key) = lock(&self.cancel_key).take() {
            self.lifetime.remove_callback(key);
        }
        if let Err(err) = result {
            if err.is_cancelled() {
                tracing::debug!(task = %self.id, scope = %self.placement.scope, "Task cancelled");
            }
            self.completion.finish_with_error(err);
        }
        self.placement.tracker.exit();
    }

    /// The job carrying this task was dropped without running.
    fn abandon(self: &Arc<Self>) {
        tracing::debug!(task = %self.id, "Task dropped by its execution context");
        self.finish(Err(TaskError::Cancelled));
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

/// A queued poll of a task. Dropping it unrun finishes the task as cancelled.
struct Runnable(Option<Arc<Task>>);

impl Runnable {
    fn run(mut self) {
        if let Some(task) = self.0.take() {
            task.run();
        }
    }
}

impl Drop for Runnable {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abandon();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Spawn `future` under `placement`. Its output becomes the handle's value.
pub(crate) fn spawn<F, T>(placement: Placement, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    spawn_body(placement, move |out| {
        Box::pin(async move {
            out.complete(Ok(future.await));
            Outcome::Done
        })
    })
}

/// Spawn a fallible `future`. An `Err` is a child failure.
pub(crate) fn spawn_try<F, T>(placement: Placement, future: F) -> JoinHandle<T>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    spawn_body(placement, move |out| {
        Box::pin(async move {
            match future.await {
                Ok(value) => {
                    out.complete(Ok(value));
                    Outcome::Done
                }
                Err(e) => Outcome::Failed(format!("{e:#}")),
            }
        })
    })
}

fn spawn_body<T, B>(placement: Placement, body: B) -> JoinHandle<T>
where
    T: Send + 'static,
    B: FnOnce(Arc<JoinState<T>>) -> BoxFuture<'static, Outcome>,
{
    let id = TaskId::new(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
    let state = Arc::new(JoinState::new());
    let lifetime = placement.parent.child();

    if lifetime.is_cancelled() {
        tracing::debug!(
            task = %id,
            scope = %placement.scope,
            "Scope cancelled, work not submitted"
        );
        state.complete(Err(TaskError::Cancelled));
        return JoinHandle {
            id,
            state,
            lifetime,
        };
    }

    placement.tracker.enter();
    let task = Arc::new(Task {
        id,
        lifetime: lifetime.clone(),
        future: Mutex::new(Some(body(Arc::clone(&state)))),
        schedule: Mutex::new(Schedule::Scheduled),
        completion: Arc::clone(&state) as Arc<dyn Completion>,
        cancel_key: Mutex::new(None),
        placement,
    });

    let weak = Arc::downgrade(&task);
    let key = lifetime.on_cancel(move || {
        if let Some(task) = weak.upgrade() {
            task.schedule();
        }
    });
    *lock(&task.cancel_key) = key;

    tracing::trace!(
        task = %id,
        scope = %task.placement.scope,
        role = %task.placement.role,
        context = task.placement.context.label(),
        "Task spawned"
    );
    task.dispatch();

    JoinHandle {
        id,
        state,
        lifetime,
    }
}

/// Handle to a spawned task. Awaiting it yields the task's value, or why there is none.
///
/// Dropping the handle detaches the task; it keeps running.
pub struct JoinHandle<T> {
    id: TaskId,
    state: Arc<JoinState<T>>,
    lifetime: Lifetime,
}

impl<T> JoinHandle<T> {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel this task only. Siblings and the scope are unaffected.
    pub fn cancel(&self) {
        self.lifetime.cancel();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        lock(&self.state.slot).finished
    }

    /// The task's own lifetime, a child of its scope's.
    #[must_use]
    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = lock(&self.state.slot);
        if let Some(result) = slot.result.take() {
            return Poll::Ready(result);
        }
        if slot.finished {
            // Value already taken by an earlier poll.
            return Poll::Ready(Err(TaskError::Cancelled));
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

/// Yield once to the task's execution context.
#[must_use]
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
