//! Scopes bound to host lifecycle signals.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::mpsc;

use dispatch_core::{FactoryRegistry, Role, TaskError};
use dispatch_lifecycle::{
    EVENT_CHANNEL_CAPACITY, LifecycleBoundScope, LifecycleBus, LifecycleEvent, LifecycleEventSource,
    LifecycleScopes, LifecycleState, OwnerId, drive,
};
use dispatch_test::TestScope;

use crate::common::init_tracing;

#[test]
fn double_ready_creates_one_scope() {
    init_tracing();
    let test = TestScope::new();
    let registry = Arc::new(FactoryRegistry::new(test.factory()));
    let bound = LifecycleBoundScope::new(OwnerId::new(7), registry);

    let first = bound.ready().expect("created");
    let second = bound.ready().expect("reused");

    assert!(first.same_scope(&second));
    assert_eq!(first.id(), second.id());
    assert_eq!(bound.scopes_created(), 1);
    test.cleanup().expect("no work");
}

#[test]
fn bus_drives_per_owner_scopes() {
    let test = TestScope::new();
    let scopes = Arc::new(LifecycleScopes::new(Arc::new(FactoryRegistry::new(test.factory()))));
    let bus = LifecycleBus::new();
    bus.subscribe(scopes.clone());

    bus.ready(OwnerId::new(1));
    bus.ready(OwnerId::new(1));
    bus.ready(OwnerId::new(2));
    assert_eq!(scopes.len(), 2);

    let scope = scopes.scope(OwnerId::new(1)).expect("owner 1 is live");
    let handle = scope.submit(Role::Io, || unreachable!("owner went away first"));
    bus.terminal(OwnerId::new(1));
    test.run_until_idle();

    let result: Option<Result<(), TaskError>> = handle.now_or_never();
    assert_eq!(result, Some(Err(TaskError::Cancelled)));
    assert_eq!(scopes.owners(), vec![OwnerId::new(2)]);

    scopes.cancel_all();
    assert!(scopes.is_empty());
    test.cleanup().expect("drained");
}

#[test]
fn bound_scope_observes_only_its_owner() {
    let test = TestScope::new();
    let bound = Arc::new(LifecycleBoundScope::new(
        OwnerId::new(3),
        Arc::new(FactoryRegistry::new(test.factory())),
    ));
    let bus = LifecycleBus::new();
    bus.subscribe(bound.clone());

    bus.ready(OwnerId::new(4));
    assert_eq!(bound.state(), LifecycleState::Unbound);
    bus.ready(OwnerId::new(3));
    assert_eq!(bound.state(), LifecycleState::Active);
    bus.terminal(OwnerId::new(3));
    bus.terminal(OwnerId::new(3));
    assert_eq!(bound.state(), LifecycleState::Cancelled);
    test.cleanup().expect("no work");
}

#[tokio::test]
async fn channel_driver_cancels_leftovers_on_close() {
    init_tracing();
    let test = TestScope::new();
    let scopes = Arc::new(LifecycleScopes::new(Arc::new(FactoryRegistry::new(test.factory()))));
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let driver = tokio::spawn(drive(Arc::clone(&scopes), rx));

    tx.send(LifecycleEvent::Ready(OwnerId::new(10))).await.expect("driver running");
    tx.send(LifecycleEvent::Ready(OwnerId::new(10))).await.expect("driver running");
    tx.send(LifecycleEvent::Ready(OwnerId::new(11))).await.expect("driver running");
    drop(tx);

    assert_eq!(driver.await.expect("driver finished"), 3);
    assert!(scopes.is_empty());
    test.cleanup().expect("no work");
}
