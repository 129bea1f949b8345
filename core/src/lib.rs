//! Structured concurrency for dispatch.
//!
//! This crate binds the five dispatcher roles to execution contexts, resolves
//! partial scope configurations against defaults, runs futures as tasks under
//! cancellable lifetimes, and holds the overridable factory registry that
//! decides how scopes are built.

pub mod context;
mod factory;
mod lifetime;
mod registry;
mod roles;
mod runtime;
mod scope;
mod task;
mod timer;

pub use context::{ContextRef, ExecutionContext, ImmediateContext, InlineContext, Job, TimerHandle};
pub use factory::{
    DefaultScopeFactory, ProductionScopeFactory, RoleSetFactory, ScopeDefaults, ScopeFactory,
    merge, resolve_roles,
};
pub use lifetime::{CallbackKey, Cancelled, Lifetime};
pub use registry::{FactoryOverride, FactoryRef, FactoryRegistry};
pub use roles::{DispatcherRoleSet, RoleOverrides, immediate_matches, reconcile_immediate};
pub use runtime::{BlockingContext, ProductionRuntime, UiThreadContext, WorkerContext};
pub use scope::{Elements, Scope, ScopeConfig, ScopeParts};
pub use task::{JoinHandle, TaskTracker, YieldNow, yield_now};
pub use timer::Delay;

pub use dispatch_types::{
    ChildFailure, ConfigurationError, ElementName, ImmediatePolicy, Role, ScopeId, Supervision,
    TaskError, TaskId,
};
