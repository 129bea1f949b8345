//! Scopes and the partial configurations they are built from.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::ops::Add;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dispatch_types::{ChildFailure, ElementName, ImmediatePolicy, Role, ScopeId, Supervision};

use crate::lifetime::{Cancelled, Lifetime};
use crate::roles::{DispatcherRoleSet, RoleOverrides, reconcile_immediate};
use crate::task::{self, JoinHandle, Placement, TaskTracker};
use crate::timer::Delay;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Elements
// ============================================================================

type Element = Arc<dyn Any + Send + Sync>;

/// Named extra values carried by a scope.
#[derive(Clone, Default)]
pub struct Elements {
    values: BTreeMap<ElementName, Element>,
}

impl Elements {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value stored under `name`.
    pub fn insert<T: Any + Send + Sync>(&mut self, name: ElementName, value: T) {
        self.values.insert(name, Arc::new(value));
    }

    /// The value under `name`, if present and of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|value| value.downcast_ref())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &ElementName> {
        self.values.keys()
    }

    /// Copy every entry of `other` in; entries from `other` win.
    pub fn extend(&mut self, other: &Elements) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), Arc::clone(value));
        }
    }
}

impl fmt::Debug for Elements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// ============================================================================
// ScopeConfig
// ============================================================================

/// A partial scope description. Every slot is optional; setting a slot twice
/// keeps the last value.
#[derive(Clone, Default, Debug)]
pub struct ScopeConfig {
    roles: Option<RoleOverrides>,
    lifetime: Option<Lifetime>,
    primary: Option<Role>,
    elements: Elements,
}

impl ScopeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply a complete or partial role binding.
    #[must_use]
    pub fn roles(mut self, roles: impl Into<RoleOverrides>) -> Self {
        self.roles = Some(roles.into());
        self
    }

    #[must_use]
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    #[must_use]
    pub fn primary(mut self, role: Role) -> Self {
        self.primary = Some(role);
        self
    }

    #[must_use]
    pub fn element<T: Any + Send + Sync>(mut self, name: ElementName, value: T) -> Self {
        self.elements.insert(name, value);
        self
    }

    #[must_use]
    pub fn role_overrides(&self) -> Option<&RoleOverrides> {
        self.roles.as_ref()
    }

    #[must_use]
    pub fn lifetime_handle(&self) -> Option<&Lifetime> {
        self.lifetime.as_ref()
    }

    #[must_use]
    pub fn primary_role(&self) -> Option<Role> {
        self.primary
    }

    #[must_use]
    pub fn elements(&self) -> &Elements {
        &self.elements
    }

    pub(crate) fn into_parts(self) -> (Option<RoleOverrides>, Option<Lifetime>, Option<Role>, Elements) {
        (self.roles, self.lifetime, self.primary, self.elements)
    }

    /// Layer `other` over `self`. Roles compose per role; every other slot
    /// takes `other`'s value when it has one.
    #[must_use]
    pub fn merge(self, other: ScopeConfig) -> ScopeConfig {
        let roles = match (self.roles, other.roles) {
            (Some(left), Some(right)) => Some(left + right),
            (left, right) => right.or(left),
        };
        let mut elements = self.elements;
        elements.extend(&other.elements);
        ScopeConfig {
            roles,
            lifetime: other.lifetime.or(self.lifetime),
            primary: other.primary.or(self.primary),
            elements,
        }
    }
}

impl Add for ScopeConfig {
    type Output = ScopeConfig;

    fn add(self, rhs: ScopeConfig) -> ScopeConfig {
        self.merge(rhs)
    }
}

impl From<DispatcherRoleSet> for ScopeConfig {
    fn from(roles: DispatcherRoleSet) -> Self {
        Self::new().roles(roles)
    }
}

impl From<Lifetime> for ScopeConfig {
    fn from(lifetime: Lifetime) -> Self {
        Self::new().lifetime(lifetime)
    }
}

// ============================================================================
// Scope
// ============================================================================

struct ScopeInner {
    id: ScopeId,
    roles: DispatcherRoleSet,
    lifetime: Lifetime,
    primary: Role,
    policy: ImmediatePolicy,
    elements: Elements,
    tracker: Arc<TaskTracker>,
}

/// A resolved role set, one lifetime, and extra elements. Cheap to clone;
/// clones are the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

/// Everything a resolved scope is made of.
pub struct ScopeParts {
    pub roles: DispatcherRoleSet,
    pub lifetime: Lifetime,
    pub primary: Role,
    pub policy: ImmediatePolicy,
    pub elements: Elements,
    pub tracker: Arc<TaskTracker>,
}

impl Scope {
    /// A scope over `roles` and `lifetime` with default settings.
    #[must_use]
    pub fn new(roles: DispatcherRoleSet, lifetime: Lifetime) -> Self {
        Self::from_parts(ScopeParts {
            roles,
            lifetime,
            primary: Role::UiImmediate,
            policy: ImmediatePolicy::default(),
            elements: Elements::new(),
            tracker: TaskTracker::new(),
        })
    }

    #[must_use]
    pub fn from_parts(parts: ScopeParts) -> Self {
        let scope = Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId::new(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed)),
                roles: parts.roles,
                lifetime: parts.lifetime,
                primary: parts.primary,
                policy: parts.policy,
                elements: parts.elements,
                tracker: parts.tracker,
            }),
        };
        tracing::debug!(
            scope = %scope.id(),
            primary = %scope.primary_role(),
            supervision = %scope.lifetime().supervision(),
            "Scope created"
        );
        scope
    }

    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    #[must_use]
    pub fn roles(&self) -> &DispatcherRoleSet {
        &self.inner.roles
    }

    #[must_use]
    pub fn lifetime(&self) -> &Lifetime {
        &self.inner.lifetime
    }

    #[must_use]
    pub fn primary_role(&self) -> Role {
        self.inner.primary
    }

    #[must_use]
    pub fn immediate_policy(&self) -> ImmediatePolicy {
        self.inner.policy
    }

    #[must_use]
    pub fn elements(&self) -> &Elements {
        &self.inner.elements
    }

    #[must_use]
    pub fn element<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        self.inner.elements.get(name)
    }

    /// First child failure recorded against this scope.
    #[must_use]
    pub fn failure(&self) -> Option<ChildFailure> {
        self.inner.lifetime.failure()
    }

    /// Spawned tasks of this scope and its child scopes that have not finished.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.active()
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.inner.tracker
    }

    /// Whether both handles refer to the same scope instance.
    #[must_use]
    pub fn same_scope(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lifetime.is_active()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.lifetime.is_cancelled()
    }

    /// Cancel this scope, its tasks and every scope derived from it.
    pub fn cancel(&self) {
        if self.is_active() {
            tracing::debug!(scope = %self.id(), "Scope cancelled");
        }
        self.inner.lifetime.cancel();
    }

    #[must_use]
    pub fn cancelled(&self) -> Cancelled {
        self.inner.lifetime.cancelled()
    }

    fn placement(&self, role: Role) -> Placement {
        Placement {
            scope: self.inner.id,
            role,
            context: Arc::clone(self.inner.roles.get(role)),
            parent: self.inner.lifetime.clone(),
            tracker: Arc::clone(&self.inner.tracker),
        }
    }

    /// Run `future` on `role`. On a cancelled scope nothing runs and the
    /// handle resolves to `TaskError::Cancelled`.
    pub fn spawn<F, T>(&self, role: Role, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        task::spawn(self.placement(role), future)
    }

    /// Run a fallible `future` on `role`; an `Err` is recorded as a child failure.
    pub fn spawn_try<F, T>(&self, role: Role, future: F) -> JoinHandle<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        task::spawn_try(self.placement(role), future)
    }

    /// Run `future` on the scope's primary role.
    pub fn launch<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(self.inner.primary, future)
    }

    /// Run a plain closure on `role`.
    pub fn submit<F, T>(&self, role: Role, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(role, async move { f() })
    }

    /// Timer measured on the clock of `role`'s context.
    #[must_use]
    pub fn delay(&self, role: Role, duration: Duration) -> Delay {
        Delay::new(Arc::clone(self.inner.roles.get(role)), duration)
    }

    /// A child scope with the same roles and supervision.
    #[must_use]
    pub fn child(&self) -> Scope {
        self.derive(self.inner.lifetime.child(), self.inner.roles.clone())
    }

    /// A child scope with its own failure semantics.
    #[must_use]
    pub fn child_with(&self, supervision: Supervision) -> Scope {
        self.derive(
            self.inner.lifetime.child_with(supervision),
            self.inner.roles.clone(),
        )
    }

    /// A child scope with some roles rebound.
    #[must_use]
    pub fn child_on(&self, overrides: &RoleOverrides) -> Scope {
        let roles = reconcile_immediate(&self.inner.roles + overrides, self.inner.policy);
        self.derive(self.inner.lifetime.child(), roles)
    }

    /// A child scope that cancels itself after `duration` on the general role's clock.
    #[must_use]
    pub fn with_timeout(&self, duration: Duration) -> Scope {
        let lifetime = self
            .inner
            .lifetime
            .with_timeout(duration, self.inner.roles.general());
        self.derive(lifetime, self.inner.roles.clone())
    }

    fn derive(&self, lifetime: Lifetime, roles: DispatcherRoleSet) -> Scope {
        let child = Scope::from_parts(ScopeParts {
            roles,
            lifetime,
            primary: self.inner.primary,
            policy: self.inner.policy,
            elements: self.inner.elements.clone(),
            tracker: self.inner.tracker.child(),
        });
        tracing::debug!(parent = %self.id(), scope = %child.id(), "Child scope derived");
        child
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("primary", &self.inner.primary)
            .field("lifetime", &self.inner.lifetime)
            .field("roles", &self.inner.roles)
            .field("elements", &self.inner.elements)
            .finish_non_exhaustive()
    }
}
