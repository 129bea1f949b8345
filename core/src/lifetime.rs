//! Lifetime handles: a tree of cancellation flags.
//!
//! Cancelling a lifetime flips its flag, runs its registered callbacks, and
//! cascades to every descendant. Cancellation never travels upward. A failing
//! child only cancels its parent when the parent was created with
//! [`Supervision::Shared`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use dispatch_types::{ChildFailure, Supervision};

use crate::context::ContextRef;

type Callback = Box<dyn FnOnce() + Send + 'static>;

static NEXT_LIFETIME_ID: AtomicU64 = AtomicU64::new(1);

/// Key returned by [`Lifetime::on_cancel`], used to deregister the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackKey(u64);

#[derive(Default)]
struct State {
    children: Vec<Weak<Inner>>,
    callbacks: Vec<(u64, Callback)>,
    next_callback: u64,
    failure: Option<ChildFailure>,
}

struct Inner {
    id: u64,
    supervision: Supervision,
    cancelled: AtomicBool,
    parent: Option<Weak<Inner>>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let (callbacks, children) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.children),
            )
        };
        tracing::trace!(
            lifetime = self.id,
            callbacks = callbacks.len(),
            children = children.len(),
            "Lifetime cancelled"
        );
        for (_, callback) in callbacks {
            callback();
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A cancellation-lifetime handle. Cheap to clone; clones share one flag.
#[derive(Clone)]
pub struct Lifetime {
    inner: Arc<Inner>,
}

impl Lifetime {
    /// A root lifetime with the given failure semantics.
    #[must_use]
    pub fn new(supervision: Supervision) -> Self {
        Self::build(supervision, None)
    }

    /// A root lifetime whose children fail independently.
    #[must_use]
    pub fn isolated() -> Self {
        Self::new(Supervision::Isolated)
    }

    /// A root lifetime cancelled by the first failing child.
    #[must_use]
    pub fn shared() -> Self {
        Self::new(Supervision::Shared)
    }

    fn build(supervision: Supervision, parent: Option<Weak<Inner>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_LIFETIME_ID.fetch_add(1, Ordering::Relaxed),
                supervision,
                cancelled: AtomicBool::new(false),
                parent,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// A descendant with the same supervision.
    #[must_use]
    pub fn child(&self) -> Self {
        self.child_with(self.inner.supervision)
    }

    /// A descendant with its own failure semantics.
    ///
    /// A child of an already-cancelled lifetime starts cancelled.
    #[must_use]
    pub fn child_with(&self, supervision: Supervision) -> Self {
        let child = Self::build(supervision, Some(Arc::downgrade(&self.inner)));
        let parent_cancelled = {
            let mut state = self.inner.lock();
            if self.inner.cancelled.load(Ordering::Acquire) {
                true
            } else {
                state.children.retain(|c| c.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.inner));
                false
            }
        };
        if parent_cancelled {
            child.cancel();
        }
        child
    }

    /// A descendant that cancels itself once `delay` elapses on `clock`.
    ///
    /// The timer is removed from `clock` as soon as the descendant is
    /// cancelled some other way or dropped.
    #[must_use]
    pub fn with_timeout(&self, delay: Duration, clock: &ContextRef) -> Self {
        let child = self.child();
        let weak = Arc::downgrade(&child.inner);
        let timer = clock.dispatch_after(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(lifetime = inner.id, "Lifetime timed out");
                    inner.cancel();
                }
            }),
        );
        // Held by the callback list: running or dropping it releases the timer.
        child.on_cancel(move || drop(timer));
        child
    }

    /// Cancel this lifetime and every descendant. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_cancelled()
    }

    #[must_use]
    pub fn supervision(&self) -> Supervision {
        self.inner.supervision
    }

    /// Run `callback` once this lifetime is cancelled.
    ///
    /// Returns `None` when the lifetime is already cancelled; in that case the
    /// callback has already run on the calling thread.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> Option<CallbackKey> {
        let mut state = self.inner.lock();
        if self.inner.cancelled.load(Ordering::Acquire) {
            drop(state);
            callback();
            return None;
        }
        let key = state.next_callback;
        state.next_callback += 1;
        state.callbacks.push((key, Box::new(callback)));
        Some(CallbackKey(key))
    }

    /// Deregister a callback that has not run yet.
    pub fn remove_callback(&self, key: CallbackKey) {
        let mut state = self.inner.lock();
        state.callbacks.retain(|(k, _)| *k != key.0);
    }

    /// Record a failed child. Returns `true` when the failure escalated and
    /// cancelled this lifetime.
    pub fn record_failure(&self, failure: ChildFailure) -> bool {
        {
            let mut state = self.inner.lock();
            if state.failure.is_none() {
                state.failure = Some(failure);
            }
        }
        if self.inner.supervision.propagates_failure() {
            self.cancel();
            true
        } else {
            false
        }
    }

    /// The first child failure recorded against this lifetime.
    #[must_use]
    pub fn failure(&self) -> Option<ChildFailure> {
        self.inner.lock().failure.clone()
    }

    /// Whether `ancestor` is this lifetime or one of its ancestors.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Lifetime) -> bool {
        let mut current = Some(Arc::clone(&self.inner));
        while let Some(inner) = current {
            if Arc::ptr_eq(&inner, &ancestor.inner) {
                return true;
            }
            current = inner.parent.as_ref().and_then(Weak::upgrade);
        }
        false
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Lifetime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A future that resolves once this lifetime is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            lifetime: self.clone(),
            slot: Arc::new(Mutex::new(None)),
            key: None,
        }
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("id", &self.inner.id)
            .field("supervision", &self.inner.supervision)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`Lifetime::cancelled`].
pub struct Cancelled {
    lifetime: Lifetime,
    slot: Arc<Mutex<Option<Waker>>>,
    key: Option<CallbackKey>,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.lifetime.is_cancelled() {
            return Poll::Ready(());
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(cx.waker().clone());
        if self.key.is_none() {
            let slot = Arc::clone(&self.slot);
            let key = self.lifetime.on_cancel(move || {
                let waker = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            });
            match key {
                Some(key) => self.key = Some(key),
                None => return Poll::Ready(()),
            }
        }
        Poll::Pending
    }
}

impl Drop for Cancelled {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.lifetime.remove_callback(key);
        }
    }
}
