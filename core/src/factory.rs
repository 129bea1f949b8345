//! Scope factories and the merge that resolves a partial [`ScopeConfig`].
//!
//! Resolution applies, in order:
//! 1. no roles in the config: the default role set, unchanged; partial roles
//!    are layered over the default;
//! 2. no lifetime in the config: a fresh root lifetime with the default
//!    supervision (isolated unless configured otherwise);
//! 3. `ui-immediate` not matching `ui`: rebind it to an immediate wrapper
//!    around `ui`, unless the policy preserves it.
//!
//! The result depends only on the config and the defaults passed in.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use dispatch_config::{DispatchConfig, RuntimeConfig, ScopeSettings};
use dispatch_types::{ConfigurationError, ImmediatePolicy, Role, Supervision};

use crate::lifetime::Lifetime;
use crate::roles::{DispatcherRoleSet, RoleOverrides, reconcile_immediate};
use crate::runtime::ProductionRuntime;
use crate::scope::{Elements, Scope, ScopeConfig, ScopeParts};
use crate::task::TaskTracker;

pub trait ScopeFactory: Send + Sync {
    fn create(&self, config: ScopeConfig) -> Result<Scope, ConfigurationError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> ScopeFactory for F
where
    F: Fn(ScopeConfig) -> Result<Scope, ConfigurationError> + Send + Sync,
{
    fn create(&self, config: ScopeConfig) -> Result<Scope, ConfigurationError> {
        self(config)
    }
}

/// What a factory fills in when a config leaves a slot empty.
#[derive(Clone, Debug)]
pub struct ScopeDefaults {
    /// `None` means configs must carry a complete role set.
    pub roles: Option<DispatcherRoleSet>,
    pub supervision: Supervision,
    pub primary_role: Role,
    pub immediate_policy: ImmediatePolicy,
    pub elements: Elements,
    /// Shared tracker for every scope this factory creates, if any.
    pub tracker: Option<Arc<TaskTracker>>,
}

impl ScopeDefaults {
    #[must_use]
    pub fn new(roles: DispatcherRoleSet) -> Self {
        Self::from_settings(&ScopeSettings::default(), Some(roles))
    }

    /// Defaults without a role set.
    #[must_use]
    pub fn without_roles() -> Self {
        Self::from_settings(&ScopeSettings::default(), None)
    }

    #[must_use]
    pub fn from_settings(settings: &ScopeSettings, roles: Option<DispatcherRoleSet>) -> Self {
        Self {
            roles,
            supervision: settings.supervision,
            primary_role: settings.primary_role,
            immediate_policy: settings.immediate_policy,
            elements: Elements::new(),
            tracker: None,
        }
    }

    #[must_use]
    pub fn supervision(mut self, supervision: Supervision) -> Self {
        self.supervision = supervision;
        self
    }

    #[must_use]
    pub fn primary_role(mut self, role: Role) -> Self {
        self.primary_role = role;
        self
    }

    #[must_use]
    pub fn immediate_policy(mut self, policy: ImmediatePolicy) -> Self {
        self.immediate_policy = policy;
        self
    }

    #[must_use]
    pub fn tracker(mut self, tracker: Arc<TaskTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }
}

/// Resolve a config's role binding against the default role set.
pub fn resolve_roles(
    overrides: Option<&RoleOverrides>,
    default: Option<&DispatcherRoleSet>,
    policy: ImmediatePolicy,
) -> Result<DispatcherRoleSet, ConfigurationError> {
    let merged = match (overrides, default) {
        (None, Some(default)) => default.clone(),
        (Some(overrides), Some(default)) => default.overlay(overrides),
        (Some(overrides), None) => overrides.clone().build()?,
        (None, None) => {
            return Err(ConfigurationError::IncompleteRoles {
                missing: Role::ALL.to_vec(),
            });
        }
    };
    Ok(reconcile_immediate(merged, policy))
}

/// Build a scope from `config`, filling empty slots from `defaults`.
pub fn merge(config: ScopeConfig, defaults: &ScopeDefaults) -> Result<Scope, ConfigurationError> {
    let (overrides, lifetime, primary, config_elements) = config.into_parts();
    let roles = resolve_roles(
        overrides.as_ref(),
        defaults.roles.as_ref(),
        defaults.immediate_policy,
    )?;
    let lifetime = lifetime.unwrap_or_else(|| Lifetime::new(defaults.supervision));
    let mut elements = defaults.elements.clone();
    elements.extend(&config_elements);
    let tracker = match &defaults.tracker {
        Some(tracker) => tracker.child(),
        None => TaskTracker::new(),
    };

    Ok(Scope::from_parts(ScopeParts {
        roles,
        lifetime,
        primary: primary.unwrap_or(defaults.primary_role),
        policy: defaults.immediate_policy,
        elements,
        tracker,
    }))
}

/// Merges every config against fixed defaults.
#[derive(Debug, Clone)]
pub struct DefaultScopeFactory {
    defaults: ScopeDefaults,
}

impl DefaultScopeFactory {
    #[must_use]
    pub fn new(defaults: ScopeDefaults) -> Self {
        Self { defaults }
    }

    #[must_use]
    pub fn for_roles(roles: DispatcherRoleSet) -> Self {
        Self::new(ScopeDefaults::new(roles))
    }

    #[must_use]
    pub fn defaults(&self) -> &ScopeDefaults {
        &self.defaults
    }
}

impl ScopeFactory for DefaultScopeFactory {
    fn create(&self, config: ScopeConfig) -> Result<Scope, ConfigurationError> {
        merge(config, &self.defaults)
    }

    fn name(&self) -> &str {
        "default"
    }
}

/// Factory built from a bare role-set function. Scopes get a fresh isolated
/// lifetime unless the config supplies one.
pub struct RoleSetFactory<F> {
    produce: F,
}

impl<F> RoleSetFactory<F>
where
    F: Fn() -> DispatcherRoleSet + Send + Sync,
{
    pub fn new(produce: F) -> Self {
        Self { produce }
    }
}

impl<F> ScopeFactory for RoleSetFactory<F>
where
    F: Fn() -> DispatcherRoleSet + Send + Sync,
{
    fn create(&self, config: ScopeConfig) -> Result<Scope, ConfigurationError> {
        let defaults = ScopeDefaults::new((self.produce)()).supervision(Supervision::Isolated);
        merge(config, &defaults)
    }

    fn name(&self) -> &str {
        "role-set"
    }
}

impl<F> fmt::Debug for RoleSetFactory<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleSetFactory").finish_non_exhaustive()
    }
}

/// The canonical factory: production roles, started on first use.
pub struct ProductionScopeFactory {
    runtime_config: RuntimeConfig,
    settings: ScopeSettings,
    runtime: Mutex<Option<Arc<ProductionRuntime>>>,
}

impl ProductionScopeFactory {
    #[must_use]
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            runtime_config: config.runtime.clone(),
            settings: config.scope,
            runtime: Mutex::new(None),
        }
    }

    /// Use an already running runtime.
    #[must_use]
    pub fn with_runtime(runtime: Arc<ProductionRuntime>, settings: ScopeSettings) -> Self {
        Self {
            runtime_config: runtime.config().clone(),
            settings,
            runtime: Mutex::new(Some(runtime)),
        }
    }

    /// The runtime, starting it if this is the first call.
    pub fn runtime(&self) -> Result<Arc<ProductionRuntime>, ConfigurationError> {
        let mut slot = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = slot.as_ref() {
            return Ok(Arc::clone(runtime));
        }
        let runtime = Arc::new(ProductionRuntime::start(&self.runtime_config)?);
        *slot = Some(Arc::clone(&runtime));
        Ok(runtime)
    }
}

impl ScopeFactory for ProductionScopeFactory {
    fn create(&self, config: ScopeConfig) -> Result<Scope, ConfigurationError> {
        let runtime = self.runtime()?;
        let defaults = ScopeDefaults::from_settings(&self.settings, Some(runtime.roles().clone()));
        merge(config, &defaults)
    }

    fn name(&self) -> &str {
        "production"
    }
}

impl fmt::Debug for ProductionScopeFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let started = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        f.debug_struct("ProductionScopeFactory")
            .field("settings", &self.settings)
            .field("started", &started)
            .finish_non_exhaustive()
    }
}
