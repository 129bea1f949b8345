//! Submission order on the deterministic test role set.

use dispatch_core::{Role, yield_now};
use dispatch_test::TestScope;

use crate::common::{Log, init_tracing};

#[test]
fn same_role_work_runs_to_completion_in_order() {
    init_tracing();
    for first in Role::ALL {
        for second in Role::ALL {
            let test = TestScope::new();
            let log = Log::new();

            let w1 = log.clone();
            let _ = test.submit(first, move || {
                w1.push("w1 start");
                w1.push("w1 end");
            });
            let w2 = log.clone();
            let _ = test.submit(second, move || {
                w2.push("w2 start");
                w2.push("w2 end");
            });
            test.run_until_idle();

            assert_eq!(
                log.entries(),
                vec!["w1 start", "w1 end", "w2 start", "w2 end"],
                "{first} then {second}"
            );
            test.cleanup().expect("drained");
        }
    }
}

#[test]
fn suspended_work_resumes_behind_later_submissions() {
    let test = TestScope::new();
    let log = Log::new();

    let a = log.clone();
    let _ = test.spawn(Role::Ui, async move {
        a.push("a1");
        yield_now().await;
        a.push("a2");
    });
    let b = log.clone();
    let _ = test.submit(Role::Io, move || b.push("b"));
    test.run_until_idle();

    assert_eq!(log.entries(), vec!["a1", "b", "a2"]);
    test.cleanup().expect("drained");
}

#[test]
fn nothing_runs_without_the_harness() {
    let test = TestScope::new();
    let log = Log::new();
    for role in Role::ALL {
        let log = log.clone();
        let _ = test.submit(role, move || log.push(role));
    }

    assert!(log.entries().is_empty());
    assert_eq!(test.pending_count(), Role::ALL.len());
    assert_eq!(test.run_current(), Role::ALL.len());
    assert_eq!(log.entries(), Role::ALL.to_vec());
    test.cleanup().expect("drained");
}
