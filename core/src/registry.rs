//! The overridable slot holding the active scope factory.
//!
//! A registry is an ordinary value: construction paths take an
//! `Arc<FactoryRegistry>` wherever they can. [`FactoryRegistry::global`] is the
//! one ambient instance, meant for the outermost composition root only.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dispatch_config::DispatchConfig;
use dispatch_types::ConfigurationError;

use crate::factory::{ProductionScopeFactory, ScopeFactory};
use crate::scope::{Scope, ScopeConfig};

pub type FactoryRef = Arc<dyn ScopeFactory>;

static GLOBAL: OnceLock<FactoryRegistry> = OnceLock::new();

pub struct FactoryRegistry {
    default: FactoryRef,
    current: RwLock<FactoryRef>,
    generation: AtomicU64,
}

impl FactoryRegistry {
    /// A registry whose default (and initial) factory is `default`.
    #[must_use]
    pub fn new(default: FactoryRef) -> Self {
        Self {
            current: RwLock::new(Arc::clone(&default)),
            default,
            generation: AtomicU64::new(0),
        }
    }

    /// Process-wide registry. Its default factory starts the production
    /// runtime from the user config the first time a scope is created.
    pub fn global() -> &'static FactoryRegistry {
        GLOBAL.get_or_init(|| {
            let config = DispatchConfig::load_or_default();
            FactoryRegistry::new(Arc::new(ProductionScopeFactory::new(&config)))
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, FactoryRef> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FactoryRef> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The factory in effect right now.
    pub(crate) fn get(&self) -> FactoryRef {
        Arc::clone(&*self.read())
    }

    /// Build a scope with the active factory.
    pub fn create(&self, config: ScopeConfig) -> Result<Scope, ConfigurationError> {
        let factory = self.get();
        factory.create(config)
    }

    /// Install `factory` for every later `create`. Existing scopes are unaffected.
    pub fn set(&self, factory: FactoryRef) {
        let _ = self.replace(factory);
    }

    /// Install `factory`, returning the one it replaced.
    pub fn replace(&self, factory: FactoryRef) -> FactoryRef {
        let name = factory.name().to_string();
        let previous = {
            let mut current = self.write();
            self.generation.fetch_add(1, Ordering::AcqRel);
            std::mem::replace(&mut *current, factory)
        };
        tracing::info!(factory = %name, replaced = previous.name(), "Scope factory overridden");
        previous
    }

    /// Install `factory` only if `expected` is still the active factory.
    ///
    /// On a lost race, returns the factory that is active instead.
    pub fn compare_and_set(&self, expected: &FactoryRef, factory: FactoryRef) -> Result<(), FactoryRef> {
        let mut current = self.write();
        if !Arc::ptr_eq(&*current, expected) {
            return Err(Arc::clone(&*current));
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::info!(factory = factory.name(), "Scope factory swapped");
        *current = factory;
        Ok(())
    }

    /// Reinstall the default factory.
    pub fn reset(&self) {
        {
            let mut current = self.write();
            if Arc::ptr_eq(&*current, &self.default) {
                return;
            }
            self.generation.fetch_add(1, Ordering::AcqRel);
            *current = Arc::clone(&self.default);
        }
        tracing::info!(factory = self.default.name(), "Scope factory reset to default");
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        Arc::ptr_eq(&*self.read(), &self.default)
    }

    /// Bumped by every change of the active factory.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Install `factory` until the returned guard is dropped, then put back
    /// whichever factory was active before. Guards nest.
    pub fn override_with(&self, factory: FactoryRef) -> FactoryOverride<'_> {
        let previous = self.replace(factory);
        FactoryOverride {
            registry: self,
            previous: Some(previous),
        }
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("default", &self.default.name())
            .field("current", &self.read().name())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Restores the factory its override replaced when dropped.
#[must_use = "the override ends as soon as the guard is dropped"]
pub struct FactoryOverride<'a> {
    registry: &'a FactoryRegistry,
    previous: Option<FactoryRef>,
}

impl FactoryOverride<'_> {
    #[must_use]
    pub fn registry(&self) -> &FactoryRegistry {
        self.registry
    }
}

impl Drop for FactoryOverride<'_> {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        if Arc::ptr_eq(&previous, &self.registry.default) {
            self.registry.reset();
        } else {
            self.registry.set(previous);
        }
    }
}
