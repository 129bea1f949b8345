//! Dispatcher role sets and the merge rules that complete them.
//!
//! A [`DispatcherRoleSet`] always binds all five roles. Partial bindings live
//! in [`RoleOverrides`] and only become a role set by being layered over a
//! complete one, or by [`RoleOverrides::build`] when every role is present.

use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use dispatch_types::{ConfigurationError, ContextId, ImmediatePolicy, Role, RoleMap};

use crate::context::{ContextRef, ExecutionContext, ImmediateContext};

/// Complete, immutable binding of every role to an execution context.
#[derive(Clone)]
pub struct DispatcherRoleSet {
    contexts: RoleMap<ContextRef>,
}

impl DispatcherRoleSet {
    /// Bind each role explicitly.
    #[must_use]
    pub fn new(
        general: ContextRef,
        io: ContextRef,
        ui: ContextRef,
        ui_immediate: ContextRef,
        unconstrained: ContextRef,
    ) -> Self {
        let mut contexts = RoleMap::from_fn(|_| Arc::clone(&general));
        contexts.set(Role::Io, io);
        contexts.set(Role::Ui, ui);
        contexts.set(Role::UiImmediate, ui_immediate);
        contexts.set(Role::Unconstrained, unconstrained);
        Self { contexts }
    }

    /// Bind every role to the same context.
    #[must_use]
    pub fn uniform(context: ContextRef) -> Self {
        Self {
            contexts: RoleMap::from_fn(|_| Arc::clone(&context)),
        }
    }

    pub fn from_fn(f: impl FnMut(Role) -> ContextRef) -> Self {
        Self {
            contexts: RoleMap::from_fn(f),
        }
    }

    #[must_use]
    pub fn get(&self, role: Role) -> &ContextRef {
        self.contexts.get(role)
    }

    #[must_use]
    pub fn general(&self) -> &ContextRef {
        self.get(Role::General)
    }

    #[must_use]
    pub fn io(&self) -> &ContextRef {
        self.get(Role::Io)
    }

    #[must_use]
    pub fn ui(&self) -> &ContextRef {
        self.get(Role::Ui)
    }

    #[must_use]
    pub fn ui_immediate(&self) -> &ContextRef {
        self.get(Role::UiImmediate)
    }

    #[must_use]
    pub fn unconstrained(&self) -> &ContextRef {
        self.get(Role::Unconstrained)
    }

    /// A copy with one role rebound.
    #[must_use]
    pub fn with(&self, role: Role, context: ContextRef) -> Self {
        let mut contexts = self.contexts.clone();
        contexts.set(role, context);
        Self { contexts }
    }

    /// Layer `overrides` on top: each role takes the override when present.
    #[must_use]
    pub fn overlay(&self, overrides: &RoleOverrides) -> Self {
        Self {
            contexts: RoleMap::from_fn(|role| {
                overrides
                    .get(role)
                    .unwrap_or_else(|| self.get(role))
                    .clone()
            }),
        }
    }

    /// Context id bound to each role.
    #[must_use]
    pub fn ids(&self) -> RoleMap<ContextId> {
        RoleMap::from_fn(|role| self.get(role).id())
    }

    /// Whether both sets bind every role to the same context identity.
    #[must_use]
    pub fn same_bindings(&self, other: &DispatcherRoleSet) -> bool {
        self.ids() == other.ids()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Role, &ContextRef)> {
        self.contexts.iter()
    }
}

impl fmt::Debug for DispatcherRoleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (role, context) in self.iter() {
            map.entry(&role.as_str(), &format_args!("{} ({})", context.label(), context.id()));
        }
        map.finish()
    }
}

/// A partial role binding supplied by a caller.
#[derive(Clone, Default)]
pub struct RoleOverrides {
    contexts: RoleMap<Option<ContextRef>>,
}

impl RoleOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn bind(mut self, role: Role, context: ContextRef) -> Self {
        self.contexts.set(role, Some(context));
        self
    }

    #[must_use]
    pub fn general(self, context: ContextRef) -> Self {
        self.bind(Role::General, context)
    }

    #[must_use]
    pub fn io(self, context: ContextRef) -> Self {
        self.bind(Role::Io, context)
    }

    #[must_use]
    pub fn ui(self, context: ContextRef) -> Self {
        self.bind(Role::Ui, context)
    }

    #[must_use]
    pub fn ui_immediate(self, context: ContextRef) -> Self {
        self.bind(Role::UiImmediate, context)
    }

    #[must_use]
    pub fn unconstrained(self, context: ContextRef) -> Self {
        self.bind(Role::Unconstrained, context)
    }

    #[must_use]
    pub fn get(&self, role: Role) -> Option<&ContextRef> {
        self.contexts.get(role).as_ref()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.iter().all(|(_, context)| context.is_none())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.contexts.missing().is_empty()
    }

    /// Promote to a complete role set. Fails with the unbound roles otherwise.
    pub fn build(self) -> Result<DispatcherRoleSet, ConfigurationError> {
        self.contexts
            .complete()
            .map(|contexts| DispatcherRoleSet { contexts })
            .map_err(|missing| ConfigurationError::IncompleteRoles { missing })
    }
}

impl From<DispatcherRoleSet> for RoleOverrides {
    fn from(set: DispatcherRoleSet) -> Self {
        Self {
            contexts: set.contexts.map(|_, context| Some(context)),
        }
    }
}

impl fmt::Debug for RoleOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (role, context) in self.contexts.iter() {
            if let Some(context) = context {
                map.entry(&role.as_str(), &context.label());
            }
        }
        map.finish()
    }
}

/// Right-biased composition: roles bound on the right win.
impl Add for DispatcherRoleSet {
    type Output = DispatcherRoleSet;

    fn add(self, rhs: DispatcherRoleSet) -> DispatcherRoleSet {
        rhs
    }
}

impl Add<RoleOverrides> for DispatcherRoleSet {
    type Output = DispatcherRoleSet;

    fn add(self, rhs: RoleOverrides) -> DispatcherRoleSet {
        self.overlay(&rhs)
    }
}

impl Add<&RoleOverrides> for &DispatcherRoleSet {
    type Output = DispatcherRoleSet;

    fn add(self, rhs: &RoleOverrides) -> DispatcherRoleSet {
        self.overlay(rhs)
    }
}

impl Add for RoleOverrides {
    type Output = RoleOverrides;

    fn add(self, rhs: RoleOverrides) -> RoleOverrides {
        let RoleOverrides { contexts: mut left } = self;
        for (role, context) in rhs.contexts.iter() {
            if let Some(context) = context {
                left.set(role, Some(Arc::clone(context)));
            }
        }
        RoleOverrides { contexts: left }
    }
}

/// Whether `ui_immediate` is what `ui` delegates to for immediate dispatch.
///
/// It matches when it wraps `ui` itself, or when `ui` already runs inline on
/// its own path and `ui_immediate` is the very same context.
#[must_use]
pub fn immediate_matches(ui: &dyn ExecutionContext, ui_immediate: &dyn ExecutionContext) -> bool {
    ui_immediate.immediate_target() == Some(ui.id())
        || (ui_immediate.id() == ui.id() && ui.is_self_immediate())
}

/// Rebind `ui-immediate` to an immediate wrapper around `ui` when they do not
/// match and `policy` asks for reconciliation.
#[must_use]
pub fn reconcile_immediate(roles: DispatcherRoleSet, policy: ImmediatePolicy) -> DispatcherRoleSet {
    if policy == ImmediatePolicy::Preserve
        || immediate_matches(roles.ui().as_ref(), roles.ui_immediate().as_ref())
    {
        return roles;
    }
    tracing::trace!(
        ui = %roles.ui().id(),
        ui_immediate = %roles.ui_immediate().id(),
        "Rebinding ui-immediate to match ui"
    );
    let immediate = ImmediateContext::wrap(roles.ui());
    roles.with(Role::UiImmediate, immediate)
}
