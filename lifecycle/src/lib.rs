//! Scopes whose lifetime follows a host's lifecycle events.
//!
//! A host delivers one ready and eventually one terminal signal per owner,
//! either by calling a [`LifecycleObserver`] directly or by sending
//! [`LifecycleEvent`]s into [`drive`]. Each owner gets at most one live scope.

mod bound;
mod observer;
mod scopes;

pub use bound::{LifecycleBoundScope, LifecycleState};
pub use observer::{LifecycleBus, LifecycleEvent, LifecycleEventSource, LifecycleObserver};
pub use scopes::{EVENT_CHANNEL_CAPACITY, LifecycleScopes, drive};

pub use dispatch_types::OwnerId;
