//! Leak detection at test-scope teardown.

use std::future;
use std::time::Duration;

use dispatch_core::Role;
use dispatch_test::TestScope;
use dispatch_types::LeakedWorkError;

use crate::common::init_tracing;

#[test]
fn three_pending_units_are_reported_then_drained() {
    init_tracing();
    let test = TestScope::new();
    let _ = test.submit(Role::General, || ());
    let _ = test.submit(Role::Io, || ());
    let _ = test.submit(Role::Ui, || ());

    let err = test.cleanup().expect_err("three units outstanding");
    assert_eq!(
        err,
        LeakedWorkError {
            pending: 3,
            unfinished: 3,
        }
    );

    assert_eq!(test.run_until_idle(), 3);
    assert_eq!(test.pending_count(), 0);
    test.cleanup().expect("nothing left after draining");
}

#[test]
fn delayed_work_counts_until_the_clock_reaches_it() {
    let test = TestScope::new();
    let delay = test.delay(Role::General, Duration::from_secs(2));
    let _ = test.launch(delay);
    test.run_current();

    let err = test.cleanup().expect_err("timer still armed");
    assert_eq!(err.pending, 1);
    assert_eq!(err.unfinished, 1);

    test.advance_by(Duration::from_secs(2));
    test.cleanup().expect("timer fired");
}

#[test]
fn suspended_task_counts_as_unfinished() {
    let test = TestScope::new();
    let _ = test.spawn(Role::Ui, future::pending::<()>());
    test.run_current();

    let err = test.cleanup().expect_err("task never completes");
    assert_eq!(err.pending, 0);
    assert_eq!(err.unfinished, 1);

    test.cancel();
    test.run_current();
    test.cleanup().expect("cancelled task finished");
}

#[test]
#[should_panic(expected = "leaked work")]
fn unchecked_leak_fails_the_test() {
    let test = TestScope::new();
    let _ = test.submit(Role::General, || ());
}
