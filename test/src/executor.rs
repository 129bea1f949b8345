//! A single-threaded execution context driven by a virtual clock.
//!
//! Nothing runs until the test asks: [`TestExecutor::run_current`] drains work
//! that is due now, [`TestExecutor::advance_by`] moves the clock forward and
//! runs whatever comes due on the way, and [`TestExecutor::run_until_idle`]
//! keeps advancing until no work is left.

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dispatch_core::context::next_context_id;
use dispatch_core::{ContextRef, ExecutionContext, Job, TimerHandle};
use dispatch_types::ContextId;

thread_local! {
    static DRIVING: Cell<Option<ContextId>> = const { Cell::new(None) };
}

struct Driving(Option<ContextId>);

impl Driving {
    fn enter(id: ContextId) -> Self {
        Self(DRIVING.with(|cell| cell.replace(Some(id))))
    }
}

impl Drop for Driving {
    fn drop(&mut self) {
        DRIVING.with(|cell| cell.set(self.0));
    }
}

#[derive(Default)]
struct State {
    now: Duration,
    queue: VecDeque<Job>,
    timers: BTreeMap<(Duration, u64), Job>,
    next_timer: u64,
    executed: usize,
}

struct Inner {
    id: ContextId,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deterministic execution context with a manually advanced clock.
///
/// Clones share one queue and one clock.
#[derive(Clone)]
pub struct TestExecutor {
    inner: Arc<Inner>,
}

impl TestExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_context_id(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// This executor as a shareable context handle.
    #[must_use]
    pub fn context(&self) -> ContextRef {
        Arc::new(self.clone())
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Units of work queued or waiting on the clock.
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.inner.lock();
        state.queue.len() + state.timers.len()
    }

    /// Units of work run so far.
    #[must_use]
    pub fn executed(&self) -> usize {
        self.inner.lock().executed
    }

    /// Whether anything is queued for the current instant.
    #[must_use]
    pub fn has_ready_work(&self) -> bool {
        !self.inner.lock().queue.is_empty()
    }

    fn run_one(&self) -> bool {
        let job = {
            let mut state = self.inner.lock();
            let job = state.queue.pop_front();
            if job.is_some() {
                state.executed += 1;
            }
            job
        };
        match job {
            Some(job) => {
                let _driving = Driving::enter(self.inner.id);
                job();
                true
            }
            None => false,
        }
    }

    /// Move the earliest timer due at or before `limit` onto the queue,
    /// setting the clock to its deadline.
    fn fire_next_timer(&self, limit: Option<Duration>) -> bool {
        let mut state = self.inner.lock();
        let Some((&(due, seq), _)) = state.timers.first_key_value() else {
            return false;
        };
        if limit.is_some_and(|limit| due > limit) {
            return false;
        }
        let Some(job) = state.timers.remove(&(due, seq)) else {
            return false;
        };
        if due > state.now {
            state.now = due;
        }
        state.queue.push_back(job);
        true
    }

    /// Run everything queued for the current instant, including work queued by
    /// that work. Returns the number of units run.
    pub fn run_current(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Advance the clock by `duration`, running work as it comes due.
    pub fn advance_by(&self, duration: Duration) -> usize {
        let target = self.now() + duration;
        let mut ran = self.run_current();
        while self.fire_next_timer(Some(target)) {
            ran += self.run_current();
        }
        {
            let mut state = self.inner.lock();
            if state.now < target {
                state.now = target;
            }
        }
        tracing::trace!(now = ?target, ran, "Virtual clock advanced");
        ran
    }

    /// Run until neither queued nor delayed work remains, advancing the clock
    /// to each timer in turn.
    pub fn advance_until_idle(&self) -> usize {
        let mut ran = self.run_current();
        while self.fire_next_timer(None) {
            ran += self.run_current();
        }
        ran
    }

    /// Alias for [`TestExecutor::advance_until_idle`].
    pub fn run_until_idle(&self) -> usize {
        self.advance_until_idle()
    }
}

impl Default for TestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext for TestExecutor {
    fn id(&self) -> ContextId {
        self.inner.id
    }

    fn label(&self) -> &str {
        "test"
    }

    fn dispatch(&self, job: Job) {
        self.inner.lock().queue.push_back(job);
    }

    fn dispatch_after(&self, delay: Duration, job: Job) -> TimerHandle {
        let key = {
            let mut state = self.inner.lock();
            if delay.is_zero() {
                state.queue.push_back(job);
                return TimerHandle::inert();
            }
            let key = (state.now + delay, state.next_timer);
            state.next_timer += 1;
            state.timers.insert(key, job);
            key
        };
        let inner = Arc::downgrade(&self.inner);
        TimerHandle::new(move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            // Dropped outside the lock: a job may own work that re-enters.
            let removed = inner.lock().timers.remove(&key);
            if removed.is_some() {
                tracing::trace!(due = ?key.0, "Virtual timer cancelled");
            }
        })
    }

    fn is_current(&self) -> bool {
        DRIVING.with(|cell| cell.get() == Some(self.inner.id))
    }

    /// Every role of a test role set is this one queue, so it is already its
    /// own immediate variant.
    fn is_self_immediate(&self) -> bool {
        true
    }
}

impl fmt::Debug for TestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TestExecutor")
            .field("id", &self.inner.id)
            .field("now", &state.now)
            .field("queued", &state.queue.len())
            .field("timers", &state.timers.len())
            .field("executed", &state.executed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Job) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |label: &'static str| -> Job {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().expect("log lock").push(label))
        };
        (log, make)
    }

    #[test]
    fn nothing_runs_until_driven() {
        let executor = TestExecutor::new();
        let (log, job) = recorder();
        executor.dispatch(job("a"));
        assert_eq!(executor.pending(), 1);
        assert!(log.lock().expect("log lock").is_empty());

        assert_eq!(executor.run_current(), 1);
        assert_eq!(*log.lock().expect("log lock"), vec!["a"]);
        assert_eq!(executor.executed(), 1);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn runs_in_submission_order() {
        let executor = TestExecutor::new();
        let (log, job) = recorder();
        for label in ["first", "second", "third"] {
            executor.dispatch(job(label));
        }
        executor.run_current();
        assert_eq!(*log.lock().expect("log lock"), vec!["first", "second", "third"]);
    }

    #[test]
    fn timers_wait_for_clock() {
        let executor = TestExecutor::new();
        let (log, job) = recorder();
        executor.dispatch_after(Duration::from_millis(100), job("late")).detach();
        executor.dispatch_after(Duration::from_millis(50), job("early")).detach();

        assert_eq!(executor.run_current(), 0);
        assert_eq!(executor.advance_by(Duration::from_millis(60)), 1);
        assert_eq!(*log.lock().expect("log lock"), vec!["early"]);
        assert_eq!(executor.now(), Duration::from_millis(60));

        executor.advance_by(Duration::from_millis(40));
        assert_eq!(*log.lock().expect("log lock"), vec!["early", "late"]);
        assert_eq!(executor.now(), Duration::from_millis(100));
    }

    #[test]
    fn equal_deadlines_fire_in_submission_order() {
        let executor = TestExecutor::new();
        let (log, job) = recorder();
        executor.dispatch_after(Duration::from_secs(1), job("a")).detach();
        executor.dispatch_after(Duration::from_secs(1), job("b")).detach();
        executor.advance_until_idle();
        assert_eq!(*log.lock().expect("log lock"), vec!["a", "b"]);
    }

    #[test]
    fn advance_until_idle_moves_clock_to_last_timer() {
        let executor = TestExecutor::new();
        let (_, job) = recorder();
        executor.dispatch_after(Duration::from_secs(3), job("x")).detach();
        assert_eq!(executor.run_until_idle(), 1);
        assert_eq!(executor.now(), Duration::from_secs(3));
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn dropped_timer_leaves_the_clock() {
        let executor = TestExecutor::new();
        let (log, job) = recorder();
        let kept = executor.dispatch_after(Duration::from_secs(1), job("kept"));
        let dropped = executor.dispatch_after(Duration::from_secs(2), job("dropped"));
        assert_eq!(executor.pending(), 2);

        drop(dropped);
        assert_eq!(executor.pending(), 1);

        executor.run_until_idle();
        assert_eq!(*log.lock().expect("log lock"), vec!["kept"]);
        assert_eq!(executor.now(), Duration::from_secs(1));
        // Cancelling after the timer fired is a no-op.
        drop(kept);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn is_current_only_while_driving() {
        let executor = TestExecutor::new();
        assert!(!executor.is_current());

        let observed = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&observed);
        let inside = executor.clone();
        executor.dispatch(Box::new(move || {
            *slot.lock().expect("slot lock") = Some(inside.is_current());
        }));
        executor.run_current();

        assert_eq!(*observed.lock().expect("slot lock"), Some(true));
        assert!(!executor.is_current());
    }

    #[test]
    fn work_queued_by_work_runs_in_same_pass() {
        let executor = TestExecutor::new();
        let (log, job) = recorder();
        let inner = executor.clone();
        let follow_up = job("follow-up");
        let mut slot = Some(follow_up);
        let first = job("first");
        executor.dispatch(Box::new(move || {
            first();
            if let Some(next) = slot.take() {
                inner.dispatch(next);
            }
        }));
        assert_eq!(executor.run_current(), 2);
        assert_eq!(*log.lock().expect("log lock"), vec!["first", "follow-up"]);
    }
}
