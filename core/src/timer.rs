use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::context::{ContextRef, TimerHandle};

#[derive(Default)]
struct Slot {
    fired: bool,
    waker: Option<Waker>,
}

/// Resolves once `duration` has elapsed on a context's clock.
///
/// The timer is armed on first poll. Production contexts measure wall time;
/// the test executor measures its virtual clock. Dropping an armed `Delay`
/// removes its timer from the clock.
pub struct Delay {
    clock: ContextRef,
    duration: Duration,
    slot: Arc<Mutex<Slot>>,
    timer: Option<TimerHandle>,
}

impl Delay {
    #[must_use]
    pub fn new(clock: ContextRef, duration: Duration) -> Self {
        Self {
            clock,
            duration,
            slot: Arc::new(Mutex::new(Slot::default())),
            timer: None,
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.duration.is_zero() {
            return Poll::Ready(());
        }
        {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.fired {
                return Poll::Ready(());
            }
            slot.waker = Some(cx.waker().clone());
        }
        if self.timer.is_none() {
            let slot = Arc::clone(&self.slot);
            let timer = self.clock.dispatch_after(
                self.duration,
                Box::new(move || {
                    let waker = {
                        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                        slot.fired = true;
                        slot.waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }),
            );
            self.timer = Some(timer);
        }
        Poll::Pending
    }
}

impl fmt::Debug for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delay")
            .field("clock", &self.clock.label())
            .field("duration", &self.duration)
            .field("armed", &self.timer.is_some())
            .finish()
    }
}
