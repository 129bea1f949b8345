//! A scope whose lifetime follows one external lifecycle owner.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dispatch_core::{ConfigurationError, FactoryRegistry, Scope, ScopeConfig};
use dispatch_types::OwnerId;

use crate::observer::LifecycleObserver;

/// Observable phase of a [`LifecycleBoundScope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No ready signal seen yet.
    Unbound,
    /// A live scope exists.
    Active,
    /// The last scope was cancelled. A later ready signal creates a new one.
    Cancelled,
}

enum Phase {
    Unbound,
    Active(Scope),
    Cancelled,
}

/// Creates a scope on the owner's ready signal and cancels it on the terminal
/// signal. Repeated ready signals while active return the same scope.
pub struct LifecycleBoundScope {
    owner: OwnerId,
    registry: Arc<FactoryRegistry>,
    config: ScopeConfig,
    phase: Mutex<Phase>,
    created: AtomicUsize,
}

impl LifecycleBoundScope {
    #[must_use]
    pub fn new(owner: OwnerId, registry: Arc<FactoryRegistry>) -> Self {
        Self::with_config(owner, registry, ScopeConfig::new())
    }

    /// Every scope is created from a clone of `config`.
    #[must_use]
    pub fn with_config(owner: OwnerId, registry: Arc<FactoryRegistry>, config: ScopeConfig) -> Self {
        Self {
            owner,
            registry,
            config,
            phase: Mutex::new(Phase::Unbound),
            created: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    fn live(&self) -> Option<Scope> {
        match &*self.lock() {
            Phase::Active(scope) if scope.is_active() => Some(scope.clone()),
            Phase::Active(scope) => {
                tracing::debug!(owner = %self.owner, scope = %scope.id(), "Scope was cancelled directly");
                None
            }
            Phase::Unbound | Phase::Cancelled => None,
        }
    }

    /// Handle a ready signal: return the live scope, or create one with the
    /// registry's current factory.
    ///
    /// The factory runs without the phase lock held, so it may call back into
    /// this scope. If a concurrent ready signal installs a scope first, that
    /// scope wins and the one built here is cancelled.
    pub fn ready(&self) -> Result<Scope, ConfigurationError> {
        if let Some(scope) = self.live() {
            tracing::debug!(owner = %self.owner, scope = %scope.id(), "Ready signal ignored, scope already active");
            return Ok(scope);
        }

        let scope = self.registry.create(self.config.clone())?;
        let mut phase = self.lock();
        if let Phase::Active(existing) = &*phase
            && existing.is_active()
        {
            let existing = existing.clone();
            drop(phase);
            tracing::debug!(owner = %self.owner, scope = %scope.id(), "Concurrent ready signal won, discarding scope");
            scope.cancel();
            return Ok(existing);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(owner = %self.owner, scope = %scope.id(), "Lifecycle scope created");
        *phase = Phase::Active(scope.clone());
        Ok(scope)
    }

    /// Handle a terminal signal: cancel the live scope, if any. Idempotent.
    pub fn terminate(&self) {
        let previous = std::mem::replace(&mut *self.lock(), Phase::Cancelled);
        if let Phase::Active(scope) = previous {
            tracing::debug!(owner = %self.owner, scope = %scope.id(), "Lifecycle scope cancelled");
            scope.cancel();
        }
    }

    /// Explicit cancellation; same effect as a terminal signal.
    pub fn cancel(&self) {
        self.terminate();
    }

    /// The live scope, if the owner is ready and the scope was not cancelled.
    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        match &*self.lock() {
            Phase::Active(scope) if scope.is_active() => Some(scope.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        match &*self.lock() {
            Phase::Unbound => LifecycleState::Unbound,
            Phase::Active(scope) if scope.is_active() => LifecycleState::Active,
            Phase::Active(_) | Phase::Cancelled => LifecycleState::Cancelled,
        }
    }

    /// Number of distinct scopes created so far.
    #[must_use]
    pub fn scopes_created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl LifecycleObserver for LifecycleBoundScope {
    fn on_ready(&self, owner: OwnerId) {
        if owner != self.owner {
            return;
        }
        if let Err(e) = self.ready() {
            tracing::warn!(owner = %owner, "Failed to create lifecycle scope: {e}");
        }
    }

    fn on_terminal(&self, owner: OwnerId) {
        if owner == self.owner {
            self.terminate();
        }
    }
}

impl Drop for LifecycleBoundScope {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for LifecycleBoundScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleBoundScope")
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("created", &self.scopes_created())
            .finish_non_exhaustive()
    }
}
