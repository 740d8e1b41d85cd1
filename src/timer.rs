//! Cancellable one-shot and repeating timers.
//!
//! [`delay`] resolves after a duration, [`timeout`] runs a closure after a duration, and
//! [`interval`] runs a closure repeatedly until cleared. Each timer is driven by an owned, named
//! thread that sleeps on a channel so that cancellation can wake it up early instead of letting it
//! sleep out its full duration.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::{
    promise::{driver, PromiseInner},
    sync::Mutex,
    Canceller, Eventual, Fault, Task,
};

/// Fault payload of an [`interval`] that was cleared before any tick completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared;

/// Returns a task that resolves once `after` has passed, along with its cancellation token.
///
/// The task resolves with the time that actually elapsed, which is at least `after`. Firing the
/// token first settles the task with the supplied reason instead and wakes the timer thread, so
/// a cancelled `delay` does not keep its thread sleeping.
pub fn delay(after: Duration) -> (Task<Duration>, Canceller<Duration>) {
    let inner = Arc::new(PromiseInner::new());
    let (nudge_tx, nudge_rx) = crossbeam_channel::unbounded();
    let canceller = Canceller::new(Arc::downgrade(&inner), Some(nudge_tx));
    let cell = inner.clone();
    let start = Instant::now();
    let thread = driver("delay", &inner, move || {
        match nudge_rx.recv_timeout(after) {
            // Cancelled; the token settled the cell before nudging.
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                cell.settle(Ok(start.elapsed()));
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Nothing can wake us early anymore; sleep out the rest.
                thread::sleep(after.saturating_sub(start.elapsed()));
                cell.settle(Ok(start.elapsed()));
            }
        }
    });
    (Task::from_driver(inner, canceller.clone(), thread), canceller)
}

/// Returns a task that runs `f` once `after` has passed, along with its cancellation token.
///
/// The task settles with `f`'s settlement: `f` may return a plain value or a [`Task`], and a
/// panic inside `f` becomes the task's [`Fault`]. Firing the token before the timer fires settles
/// the task with the supplied reason and prevents `f` from ever running; firing it later has no
/// effect on the result.
pub fn timeout<T, R, F>(f: F, after: Duration) -> (Task<T>, Canceller<T>)
where
    T: Send + 'static,
    R: Into<Eventual<T>>,
    F: FnOnce() -> R + Send + 'static,
{
    let inner = Arc::new(PromiseInner::new());
    let (nudge_tx, nudge_rx) = crossbeam_channel::unbounded();
    let canceller = Canceller::new(Arc::downgrade(&inner), Some(nudge_tx));
    let cell = inner.clone();
    let thread = driver("timeout", &inner, move || {
        let start = Instant::now();
        match nudge_rx.recv_timeout(after) {
            Ok(()) => return,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(after.saturating_sub(start.elapsed()));
            }
        }
        if cell.is_settled() {
            // Cancelled after the timer fired but before `f` started; still skip it.
            return;
        }
        let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(step) => {
                let step: Eventual<T> = step.into();
                step.settle()
            }
            Err(payload) => Err(Fault::from_payload(payload)),
        };
        cell.settle(outcome);
    });
    (Task::from_driver(inner, canceller.clone(), thread), canceller)
}

/// Returns a task that runs `f` every `every`, along with the [`Clearer`] that stops it.
///
/// The next tick is armed only once the previous tick's settlement is in, so a slow step stretches
/// the interval rather than piling up ticks. The task settles when the interval stops:
///
/// - [`Clearer::clear`] settles it with the last value a tick produced, or with a [`Cleared`]
///   fault if no tick has completed yet.
/// - [`Clearer::clear_with`] settles it with a caller-chosen reason.
/// - A faulting tick (a panic inside `f`, or a step task that rejects) stops the interval and
///   settles the task with that fault.
pub fn interval<T, R, F>(mut f: F, every: Duration) -> (Task<T>, Clearer<T>)
where
    T: Send + 'static,
    R: Into<Eventual<T>>,
    F: FnMut() -> R + Send + 'static,
{
    let inner = Arc::new(PromiseInner::new());
    let (nudge_tx, nudge_rx) = crossbeam_channel::unbounded();
    let last = Arc::new(Mutex::new(None));
    let clearer = Clearer {
        cell: Arc::downgrade(&inner),
        last: last.clone(),
        nudge: nudge_tx.clone(),
    };
    let canceller = Canceller::new(Arc::downgrade(&inner), Some(nudge_tx));
    let cell = inner.clone();
    let thread = driver("interval", &inner, move || loop {
        match nudge_rx.recv_timeout(every) {
            // Cleared or cancelled; the cell was settled before the nudge.
            Ok(()) => return,
            Err(RecvTimeoutError::Disconnected) => {
                // Neither a clearer nor the task remain, so no tick can be observed.
                cell.settle(Err(Fault::new(Cleared)));
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| f())) {
            Ok(step) => {
                let step: Eventual<T> = step.into();
                step.settle()
            }
            Err(payload) => Err(Fault::from_payload(payload)),
        };
        match outcome {
            Ok(value) => {
                *last.lock() = Some(value);
                if cell.is_settled() {
                    return;
                }
            }
            Err(fault) => {
                cell.settle(Err(fault));
                return;
            }
        }
    });
    (Task::from_driver(inner, canceller, thread), clearer)
}

/// Stops a running [`interval`].
///
/// Cheap to clone; any clone may clear. Clearing twice, or after the interval has already
/// settled, has no effect.
pub struct Clearer<T> {
    cell: Weak<PromiseInner<T>>,
    last: Arc<Mutex<Option<T>>>,
    nudge: Sender<()>,
}

impl<T> Clone for Clearer<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            last: self.last.clone(),
            nudge: self.nudge.clone(),
        }
    }
}

impl<T> Clearer<T> {
    /// Stops the interval, settling its task with the last value a tick produced.
    ///
    /// If no tick has completed yet, the task settles with a [`Cleared`] fault instead.
    pub fn clear(&self) {
        if let Some(cell) = self.cell.upgrade() {
            let outcome = match self.last.lock().take() {
                Some(value) => Ok(value),
                None => Err(Fault::new(Cleared)),
            };
            cell.settle(outcome);
        }
        let _ = self.nudge.send(());
    }

    /// Stops the interval, settling its task with `reason` instead of the last tick value.
    pub fn clear_with<R: Any + Send>(&self, reason: R) {
        if let Some(cell) = self.cell.upgrade() {
            cell.settle(Err(Fault::new(reason)));
        }
        let _ = self.nudge.send(());
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::resume_unwind,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use super::*;
    use crate::spawn;

    #[test]
    fn delay_resolves_after_the_requested_time() {
        let after = Duration::from_millis(30);
        let start = Instant::now();
        let (task, _cancel) = delay(after);
        let slept = task.block().unwrap();
        let elapsed = start.elapsed();
        assert!(slept >= after, "timer reported {slept:?}, expected at least {after:?}");
        assert!(elapsed >= after, "{elapsed:?} elapsed, expected at least {after:?}");
    }

    #[test]
    fn cancelling_a_delay_delivers_the_reason() {
        let (task, cancel) = delay(Duration::from_secs(60));
        cancel.cancel("nope");
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<&str>().unwrap(), "nope");
    }

    #[test]
    fn cancelling_a_delay_twice_keeps_the_first_reason() {
        let (task, cancel) = delay(Duration::from_secs(60));
        cancel.cancel("first");
        cancel.cancel("second");
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<&str>().unwrap(), "first");
    }

    #[test]
    fn timeout_runs_the_closure() {
        let (task, _cancel) = timeout(|| 40 + 2, Duration::from_millis(5));
        assert_eq!(task.block().unwrap(), 42);
    }

    #[test]
    fn timeout_step_may_return_a_task() {
        let (task, _cancel): (Task<i32>, Canceller<i32>) =
            timeout(|| spawn(|| 7), Duration::from_millis(5));
        assert_eq!(task.block().unwrap(), 7);
    }

    #[test]
    fn cancelled_timeout_never_runs_the_closure() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (task, cancel) = timeout(
            move || flag.store(true, Ordering::Relaxed),
            Duration::from_millis(30),
        );
        cancel.cancel("skip");
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<&str>().unwrap(), "skip");
        // `block` joined the timer thread, so the closure can no longer run.
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[test]
    fn timeout_panic_becomes_a_fault() {
        let (task, _cancel) = timeout(
            || -> () { resume_unwind(Box::new("broken step".to_string())) },
            Duration::from_millis(5),
        );
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<String>().unwrap(), "broken step");
    }

    #[test]
    fn interval_ticks_until_cleared() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = count.clone();
        let (task, clear) = interval(
            move || ticks.fetch_add(1, Ordering::Relaxed) + 1,
            Duration::from_millis(10),
        );
        while count.load(Ordering::Relaxed) < 3 {
            thread::sleep(Duration::from_millis(5));
        }
        clear.clear();
        let last = task.block().unwrap();
        // Tick 3 may still be writing its value when we clear, but tick 2's is in.
        assert!(last >= 2, "cleared with tick value {last}, expected at least 2");
        assert!(last <= count.load(Ordering::Relaxed));
    }

    #[test]
    fn clearing_before_any_tick_reports_cleared() {
        let (task, clear) = interval(|| 1, Duration::from_secs(60));
        clear.clear();
        let fault = task.block().unwrap_err();
        assert!(fault.is::<Cleared>());
    }

    #[test]
    fn clear_with_overrides_the_last_value() {
        let (task, clear) = interval(|| 1, Duration::from_millis(5));
        thread::sleep(Duration::from_millis(20));
        clear.clear_with("enough");
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<&str>().unwrap(), "enough");
    }

    #[test]
    fn faulting_tick_stops_the_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = count.clone();
        let (task, _clear) = interval(
            move || {
                if ticks.fetch_add(1, Ordering::Relaxed) == 1 {
                    resume_unwind(Box::new("tick two".to_string()));
                }
                0
            },
            Duration::from_millis(5),
        );
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<String>().unwrap(), "tick two");
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
