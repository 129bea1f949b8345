//! Per-owner lifecycle scopes.
//!
//! An owner's entry exists from its first ready signal until its terminal
//! signal; removal from the map is the terminal transition.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use dispatch_core::{ConfigurationError, FactoryRegistry, Scope, ScopeConfig};
use dispatch_types::OwnerId;

use crate::bound::LifecycleBoundScope;
use crate::observer::{LifecycleEvent, LifecycleObserver};

/// Channel capacity suggested for hosts feeding [`drive`].
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct LifecycleScopes {
    registry: Arc<FactoryRegistry>,
    config: ScopeConfig,
    scopes: Mutex<HashMap<OwnerId, Arc<LifecycleBoundScope>>>,
}

impl LifecycleScopes {
    #[must_use]
    pub fn new(registry: Arc<FactoryRegistry>) -> Self {
        Self::with_config(registry, ScopeConfig::new())
    }

    #[must_use]
    pub fn with_config(registry: Arc<FactoryRegistry>, config: ScopeConfig) -> Self {
        Self {
            registry,
            config,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OwnerId, Arc<LifecycleBoundScope>>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The owner is ready: return its scope, creating it on first signal.
    pub fn ready(&self, owner: OwnerId) -> Result<Scope, ConfigurationError> {
        let bound = {
            let mut scopes = self.lock();
            Arc::clone(scopes.entry(owner).or_insert_with(|| {
                Arc::new(LifecycleBoundScope::with_config(
                    owner,
                    Arc::clone(&self.registry),
                    self.config.clone(),
                ))
            }))
        };
        bound.ready()
    }

    /// The owner is gone: cancel and forget its scope. Returns whether the
    /// owner had one.
    pub fn terminal(&self, owner: OwnerId) -> bool {
        let removed = self.lock().remove(&owner);
        match removed {
            Some(bound) => {
                bound.terminate();
                true
            }
            None => {
                tracing::debug!(owner = %owner, "Terminal signal for unknown owner");
                false
            }
        }
    }

    pub fn handle(&self, event: LifecycleEvent) -> Result<(), ConfigurationError> {
        match event {
            LifecycleEvent::Ready(owner) => self.ready(owner).map(|_| ()),
            LifecycleEvent::Terminal(owner) => {
                self.terminal(owner);
                Ok(())
            }
        }
    }

    /// The owner's live scope, if any.
    #[must_use]
    pub fn scope(&self, owner: OwnerId) -> Option<Scope> {
        let bound = self.lock().get(&owner).cloned();
        bound.and_then(|bound| bound.scope())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[must_use]
    pub fn owners(&self) -> Vec<OwnerId> {
        let mut owners: Vec<OwnerId> = self.lock().keys().copied().collect();
        owners.sort();
        owners
    }

    /// Cancel every scope, as if each owner had sent its terminal signal.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Cancelling all lifecycle scopes");
        }
        for (_, bound) in drained {
            bound.terminate();
        }
    }
}

impl LifecycleObserver for LifecycleScopes {
    fn on_ready(&self, owner: OwnerId) {
        if let Err(e) = self.ready(owner) {
            tracing::warn!(owner = %owner, "Failed to create lifecycle scope: {e}");
        }
    }

    fn on_terminal(&self, owner: OwnerId) {
        self.terminal(owner);
    }
}

impl fmt::Debug for LifecycleScopes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleScopes")
            .field("owners", &self.owners())
            .finish_non_exhaustive()
    }
}

/// Feed events from a channel into `scopes` until every sender is gone, then
/// cancel whatever is still live. Returns the number of events handled.
pub async fn drive(scopes: Arc<LifecycleScopes>, mut events: mpsc::Receiver<LifecycleEvent>) -> usize {
    let mut handled = 0;
    while let Some(event) = events.recv().await {
        if let Err(e) = scopes.handle(event) {
            tracing::warn!(owner = %event.owner(), "Lifecycle event failed: {e}");
        }
        handled += 1;
    }
    tracing::info!(handled, remaining = scopes.len(), "Lifecycle event source closed");
    scopes.cancel_all();
    handled
}
