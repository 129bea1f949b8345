//! The production role set on a real runtime.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::runtime::Builder;

use dispatch_config::{DispatchConfig, RuntimeConfig, ScopeSettings};
use dispatch_core::{
    DefaultScopeFactory, FactoryRegistry, InlineContext, JoinHandle, ProductionRuntime,
    ProductionScopeFactory, Role, ScopeConfig, ScopeFactory, TaskError, immediate_matches,
};

use crate::common::{Log, init_tracing};

const WAIT: Duration = Duration::from_secs(5);

fn small_runtime() -> Arc<ProductionRuntime> {
    let config = RuntimeConfig {
        worker_threads: Some(2),
        max_io_threads: 2,
        thread_name: "dispatch-test".to_string(),
        ui_thread_name: "dispatch-test-ui".to_string(),
    };
    Arc::new(ProductionRuntime::start(&config).expect("runtime starts"))
}

/// Block the test thread on a handle without a runtime of its own.
fn wait<T: Send + 'static>(handle: JoinHandle<T>) -> Result<T, TaskError> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = Builder::new_current_thread()
            .build()
            .expect("waiter runtime");
        let _ = tx.send(runtime.block_on(handle));
    });
    rx.recv_timeout(WAIT).expect("handle resolved in time")
}

#[test]
fn io_override_is_synchronous_and_reset_restores_async_io() {
    init_tracing();
    let runtime = small_runtime();
    let registry = FactoryRegistry::new(Arc::new(ProductionScopeFactory::with_runtime(
        Arc::clone(&runtime),
        ScopeSettings::default(),
    )));

    let inline_io = runtime.roles().with(Role::Io, InlineContext::shared());
    registry.set(Arc::new(DefaultScopeFactory::for_roles(inline_io)));
    let overridden = registry.create(ScopeConfig::new()).expect("complete");
    let handle = overridden.submit(Role::Io, || thread::current().id());
    assert!(handle.is_finished());
    assert_eq!(handle.now_or_never(), Some(Ok(thread::current().id())));

    registry.reset();
    let restored = registry.create(ScopeConfig::new()).expect("complete");
    let (release, gate) = mpsc::channel::<()>();
    let handle = restored.submit(Role::Io, move || {
        gate.recv_timeout(WAIT).is_ok()
    });
    // The caller is not blocked by work that cannot finish yet.
    assert!(!handle.is_finished());
    release.send(()).expect("io job still waiting");
    assert_eq!(wait(handle), Ok(true));

    runtime.shutdown();
}

#[test]
fn ui_role_is_one_ordered_thread() {
    let runtime = small_runtime();
    let factory = ProductionScopeFactory::with_runtime(Arc::clone(&runtime), ScopeSettings::default());
    let scope = factory.create(ScopeConfig::new()).expect("complete");
    let log = Log::new();

    let handles: Vec<_> = (0..16)
        .map(|n| {
            let log = log.clone();
            scope.submit(Role::Ui, move || {
                log.push(n);
                thread::current().name().map(str::to_string)
            })
        })
        .collect();
    for handle in handles {
        let name = wait(handle).expect("ui job ran");
        assert_eq!(name.as_deref(), Some("dispatch-test-ui"));
    }

    assert_eq!(log.entries(), (0..16).collect::<Vec<_>>());
    runtime.shutdown();
}

#[test]
fn production_roles_are_consistent() {
    let runtime = small_runtime();
    let roles = runtime.roles();

    assert!(immediate_matches(roles.ui().as_ref(), roles.ui_immediate().as_ref()));
    assert!(!roles.ui().is_current());
    let ids: Vec<_> = roles.iter().map(|(_, context)| context.id()).collect();
    for (i, id) in ids.iter().enumerate() {
        assert!(!ids[i + 1..].contains(id), "roles share a context");
    }
    runtime.shutdown();
    assert!(!runtime.is_running());
}

#[test]
fn ui_immediate_runs_inline_on_the_ui_thread() {
    let runtime = small_runtime();
    let scope = ProductionScopeFactory::with_runtime(Arc::clone(&runtime), ScopeSettings::default())
        .create(ScopeConfig::new())
        .expect("complete");

    let inner_scope = scope.clone();
    let outer = scope.submit(Role::Ui, move || {
        let nested = inner_scope.submit(Role::UiImmediate, || 5);
        nested.is_finished()
    });
    assert_eq!(wait(outer), Ok(true));
    runtime.shutdown();
}

#[test]
fn shutdown_cancels_unstarted_work() {
    let runtime = small_runtime();
    let scope = ProductionScopeFactory::with_runtime(Arc::clone(&runtime), ScopeSettings::default())
        .create(ScopeConfig::new())
        .expect("complete");
    runtime.shutdown();
    runtime.shutdown();

    let handle = scope.submit(Role::Ui, || ());
    assert_eq!(wait(handle), Err(TaskError::Cancelled));
}

#[test]
fn lazy_factory_starts_runtime_on_first_create() {
    let config = DispatchConfig::parse(
        r#"
        [runtime]
        worker_threads = 1
        max_io_threads = 1
        ui_thread_name = "dispatch-lazy-ui"

        [scope]
        primary_role = "io"
        "#,
    )
    .expect("valid config");
    let factory = ProductionScopeFactory::new(&config);
    let scope = factory.create(ScopeConfig::new()).expect("runtime started");

    assert_eq!(scope.primary_role(), Role::Io);
    assert_eq!(wait(scope.launch(async { 1 + 1 })), Ok(2));
    factory.runtime().expect("already running").shutdown();
}
