//! Execution contexts: opaque handles that accept units of work.
//!
//! A context only knows how to run a `Job` now or after a delay. Futures are
//! layered on top by [`crate::task`], which re-dispatches a task onto its
//! context every time it is woken.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use dispatch_types::ContextId;

/// A unit of work handed to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared handle to an execution context.
pub type ContextRef = Arc<dyn ExecutionContext>;

/// Ids at or above this value are reserved for immediate wrappers, whose id is
/// derived from their target so that wrapping the same target twice is
/// indistinguishable.
const IMMEDIATE_TAG: u64 = 1 << 63;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh context id.
#[must_use]
pub fn next_context_id() -> ContextId {
    ContextId::new(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
}

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// A delayed job that has not fired yet.
///
/// Dropping the handle cancels the timer and drops its job unrun.
/// [`TimerHandle::detach`] keeps the timer armed instead.
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
    cancel: Option<CancelFn>,
}

impl TimerHandle {
    /// A handle whose drop runs `cancel`. Running it after the job fired must
    /// be harmless.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel, for jobs that were queued directly.
    pub fn inert() -> Self {
        Self { cancel: None }
    }

    /// Let the timer fire regardless of this handle.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

pub trait ExecutionContext: Send + Sync + fmt::Debug {
    fn id(&self) -> ContextId;

    /// Human-readable name used in logs.
    fn label(&self) -> &str;

    /// Queue `job` for execution.
    fn dispatch(&self, job: Job);

    /// Queue `job` for execution once `delay` has elapsed on this context's clock.
    ///
    /// Dropping the returned handle before the deadline removes the timer.
    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle;

    /// Whether the calling thread is currently on this context's execution path.
    fn is_current(&self) -> bool;

    /// Whether this context already serves as its own immediate variant:
    /// dispatching to it from its own execution path needs no separate wrapper.
    fn is_self_immediate(&self) -> bool {
        false
    }

    /// For immediate wrappers, the context they run on behalf of.
    fn immediate_target(&self) -> Option<ContextId> {
        None
    }
}

/// Runs every job synchronously on the calling thread.
///
/// Delayed jobs run on a short-lived sleeper thread, so resumption after a
/// delay happens wherever the timer fires.
#[derive(Debug)]
pub struct InlineContext {
    id: ContextId,
    label: String,
}

impl InlineContext {
    #[must_use]
    pub fn new() -> Self {
        Self::named("unconstrained")
    }

    #[must_use]
    pub fn named(label: impl Into<String>) -> Self {
        Self {
            id: next_context_id(),
            label: label.into(),
        }
    }

    #[must_use]
    pub fn shared() -> ContextRef {
        Arc::new(Self::new())
    }
}

impl Default for InlineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for InlineContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, job: Job) {
        job();
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        if delay.is_zero() {
            job();
            return TimerHandle::inert();
        }
        let (cancel, cancelled) = mpsc::channel::<()>();
        let deadline = Instant::now() + delay;
        let spawned = thread::Builder::new()
            .name(format!("{}-timer", self.label))
            .spawn(move || match cancelled.recv_timeout(delay) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => job(),
                // Detached: the handle is gone but the timer stays armed.
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    job();
                }
            });
        match spawned {
            Ok(_) => TimerHandle::new(move || {
                let _ = cancel.send(());
            }),
            Err(e) => {
                tracing::error!(context = %self.id, "Failed to spawn timer thread: {e}");
                TimerHandle::inert()
            }
        }
    }

    fn is_current(&self) -> bool {
        true
    }

    fn is_self_immediate(&self) -> bool {
        true
    }
}

/// Runs a job synchronously when already on the target's execution path,
/// and queues it on the target otherwise.
#[derive(Debug)]
pub struct ImmediateContext {
    id: ContextId,
    label: String,
    target: ContextRef,
}

impl ImmediateContext {
    #[must_use]
    pub fn new(target: ContextRef) -> Self {
        Self {
            id: Self::id_for(target.id()),
            label: format!("{}.immediate", target.label()),
            target,
        }
    }

    #[must_use]
    pub fn wrap(target: &ContextRef) -> ContextRef {
        Arc::new(Self::new(Arc::clone(target)))
    }

    /// The id an immediate wrapper around `target` carries.
    #[must_use]
    pub fn id_for(target: ContextId) -> ContextId {
        ContextId::new(target.value() | IMMEDIATE_TAG)
    }

    #[must_use]
    pub fn target(&self) -> &ContextRef {
        &self.target
    }
}

impl ExecutionContext for ImmediateContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn dispatch(&self, job: Job) {
        if self.target.is_current() {
            job();
        } else {
            self.target.dispatch(job);
        }
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        self.target.dispatch_after(delay, job)
    }

    fn is_current(&self) -> bool {
        self.target.is_current()
    }

    fn is_self_immediate(&self) -> bool {
        true
    }

    fn immediate_target(&self) -> Option<ContextId> {
        Some(self.target.id())
    }
}
