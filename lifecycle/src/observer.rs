//! The contract between a host's lifecycle events and dispatch scopes.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use dispatch_types::OwnerId;

/// Receives lifecycle signals. A well-behaved host sends exactly one ready and
/// eventually one terminal signal per owner.
pub trait LifecycleObserver: Send + Sync {
    fn on_ready(&self, owner: OwnerId);
    fn on_terminal(&self, owner: OwnerId);
}

/// Anything that can deliver lifecycle signals to observers.
pub trait LifecycleEventSource {
    fn subscribe(&self, observer: Arc<dyn LifecycleObserver>);
}

/// A lifecycle signal as a value, for channel-based delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Ready(OwnerId),
    Terminal(OwnerId),
}

impl LifecycleEvent {
    #[must_use]
    pub const fn owner(self) -> OwnerId {
        match self {
            Self::Ready(owner) | Self::Terminal(owner) => owner,
        }
    }

    /// Deliver this event to `observer`.
    pub fn dispatch_to(self, observer: &dyn LifecycleObserver) {
        match self {
            Self::Ready(owner) => observer.on_ready(owner),
            Self::Terminal(owner) => observer.on_terminal(owner),
        }
    }
}

/// In-process event source: every emitted signal reaches every subscriber,
/// in subscription order.
#[derive(Default)]
pub struct LifecycleBus {
    observers: Mutex<Vec<Arc<dyn LifecycleObserver>>>,
}

impl LifecycleBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: LifecycleEvent) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::trace!(?event, observers = observers.len(), "Lifecycle event");
        for observer in &observers {
            event.dispatch_to(observer.as_ref());
        }
    }

    pub fn ready(&self, owner: OwnerId) {
        self.emit(LifecycleEvent::Ready(owner));
    }

    pub fn terminal(&self, owner: OwnerId) {
        self.emit(LifecycleEvent::Terminal(owner));
    }

    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl LifecycleEventSource for LifecycleBus {
    fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }
}

impl fmt::Debug for LifecycleBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleBus")
            .field("subscribers", &self.subscribers())
            .finish()
    }
}
