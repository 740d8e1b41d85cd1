//! Promise-flavored iteration: sequential and parallel mapping, folds, and a conditional loop.
//!
//! The sequential operations ([`map`], [`reduce`], and their strict `try_` variants) run their
//! steps strictly one after another: step *i + 1* starts only once step *i*'s settlement is in.
//! [`par_map`] starts every step up front instead. [`repeat`] re-runs a step while a condition
//! holds.
//!
//! All of them accept steps that return either a plain value or a [`Task`], and all of them catch
//! panics inside a step at the step boundary, converting them into [`Fault`]s instead of tearing
//! down the driver thread.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    promise::{driver, PromiseInner},
    Canceller, Eventual, Fault, Outcome, Task,
};

/// Fault payload of [`reduce_first`] and [`race`][crate::race] when given an empty input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptySequence;

/// Maps `f` over `seq` one element at a time, collecting every step's settlement.
///
/// The returned task resolves with one [`Outcome`] per input element, in input order. A step
/// fault (a panic inside `f`, or a step task that rejects) is recorded as that element's outcome
/// and iteration continues with the next element; it never aborts the rest of the iteration. Use
/// [`try_map`] to stop at the first fault instead.
///
/// An empty `seq` resolves immediately with an empty vector, without invoking `f` or spawning a
/// thread.
pub fn map<T, U, R, F>(seq: Vec<T>, mut f: F) -> Task<Vec<Outcome<U>>>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Into<Eventual<U>>,
    F: FnMut(T, usize) -> R + Send + 'static,
{
    if seq.is_empty() {
        return Task::ready(Vec::new());
    }
    let inner = Arc::new(PromiseInner::new());
    let canceller = Canceller::new(Arc::downgrade(&inner), None);
    let cell = inner.clone();
    let thread = driver("map", &inner, move || {
        let mut results = Vec::with_capacity(seq.len());
        for (i, element) in seq.into_iter().enumerate() {
            if cell.is_settled() {
                // Cancelled or dropped; the remaining elements are unobservable.
                return;
            }
            results.push(settle_step(|| f(element, i)));
        }
        cell.settle(Ok(results));
    });
    Task::from_driver(inner, canceller, thread)
}

/// Like [`map`], but the first step fault rejects the whole task and stops the iteration.
pub fn try_map<T, U, R, F>(seq: Vec<T>, mut f: F) -> Task<Vec<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Into<Eventual<U>>,
    F: FnMut(T, usize) -> R + Send + 'static,
{
    if seq.is_empty() {
        return Task::ready(Vec::new());
    }
    let inner = Arc::new(PromiseInner::new());
    let canceller = Canceller::new(Arc::downgrade(&inner), None);
    let cell = inner.clone();
    let thread = driver("try-map", &inner, move || {
        let mut results = Vec::with_capacity(seq.len());
        for (i, element) in seq.into_iter().enumerate() {
            if cell.is_settled() {
                return;
            }
            match settle_step(|| f(element, i)) {
                Ok(value) => results.push(value),
                Err(fault) => {
                    cell.settle(Err(fault));
                    return;
                }
            }
        }
        cell.settle(Ok(results));
    });
    Task::from_driver(inner, canceller, thread)
}

/// Folds `seq` from the left, threading each step's settlement into the next call.
///
/// Each step receives the previous step's entire settlement as its accumulator argument: after a
/// faulted step, the next step sees that `Err` and decides how to carry on. The returned task
/// settles with the final step's settlement, whatever it is. Use [`try_reduce`] to stop at the
/// first fault instead.
///
/// An empty `seq` resolves immediately with `init`, without invoking `f`.
pub fn reduce<T, A, R, F>(seq: Vec<T>, mut f: F, init: A) -> Task<A>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Into<Eventual<A>>,
    F: FnMut(Outcome<A>, T, usize) -> R + Send + 'static,
{
    if seq.is_empty() {
        return Task::ready(init);
    }
    let inner = Arc::new(PromiseInner::new());
    let canceller = Canceller::new(Arc::downgrade(&inner), None);
    let cell = inner.clone();
    let thread = driver("reduce", &inner, move || {
        let mut acc = Ok(init);
        for (i, element) in seq.into_iter().enumerate() {
            if cell.is_settled() {
                return;
            }
            acc = settle_step(|| f(acc, element, i));
        }
        cell.settle(acc);
    });
    Task::from_driver(inner, canceller, thread)
}

/// Like [`reduce`], but the first step fault rejects the whole task and stops the fold.
pub fn try_reduce<T, A, R, F>(seq: Vec<T>, mut f: F, init: A) -> Task<A>
where
    T: Send + 'static,
    A: Send + 'static,
    R: Into<Eventual<A>>,
    F: FnMut(A, T, usize) -> R + Send + 'static,
{
    if seq.is_empty() {
        return Task::ready(init);
    }
    let inner = Arc::new(PromiseInner::new());
    let canceller = Canceller::new(Arc::downgrade(&inner), None);
    let cell = inner.clone();
    let thread = driver("try-reduce", &inner, move || {
        let mut acc = init;
        for (i, element) in seq.into_iter().enumerate() {
            if cell.is_settled() {
                return;
            }
            match settle_step(|| f(acc, element, i)) {
                Ok(next) => acc = next,
                Err(fault) => {
                    cell.settle(Err(fault));
                    return;
                }
            }
        }
        cell.settle(Ok(acc));
    });
    Task::from_driver(inner, canceller, thread)
}

/// Like [`reduce`], but uses the first element as the initial accumulator.
///
/// The first step is called as `f(Ok(first.clone()), first, 0)`: the first element serves as
/// both the starting accumulator and the first processed element. An empty `seq` settles with an
/// [`EmptySequence`] fault, since there is nothing to start the fold with.
pub fn reduce_first<T, R, F>(seq: Vec<T>, mut f: F) -> Task<T>
where
    T: Clone + Send + 'static,
    R: Into<Eventual<T>>,
    F: FnMut(Outcome<T>, T, usize) -> R + Send + 'static,
{
    if seq.is_empty() {
        return Task::settled(Err(Fault::new(EmptySequence)));
    }
    let inner = Arc::new(PromiseInner::new());
    let canceller = Canceller::new(Arc::downgrade(&inner), None);
    let cell = inner.clone();
    let thread = driver("reduce-first", &inner, move || {
        let mut elements = seq.into_iter();
        let first = elements.next().unwrap();
        let mut acc = settle_step(|| f(Ok(first.clone()), first, 0));
        for (i, element) in elements.enumerate() {
            if cell.is_settled() {
                return;
            }
            acc = settle_step(|| f(acc, element, i + 1));
        }
        cell.settle(acc);
    });
    Task::from_driver(inner, canceller, thread)
}

/// Maps `f` over `seq`, starting every step before waiting on any of them.
///
/// The returned task resolves with the step values in input order once every step has settled.
/// The first settlement that is a fault rejects the whole task with that fault, in settlement
/// order, not input order; the remaining in-flight step tasks are then dropped, which cancels
/// and joins them. This is the opposite failure policy of [`map`], which records faults and
/// carries on.
///
/// An empty `seq` resolves immediately with an empty vector, without invoking `f` or spawning a
/// thread.
pub fn par_map<T, U, R, F>(seq: Vec<T>, mut f: F) -> Task<Vec<U>>
where
    T: Send + 'static,
    U: Send + 'static,
    R: Into<Eventual<U>>,
    F: FnMut(T, usize) -> R + Send + 'static,
{
    if seq.is_empty() {
        return Task::ready(Vec::new());
    }
    let inner = Arc::new(PromiseInner::new());
    let (nudge_tx, nudge_rx) = crossbeam_channel::unbounded();
    let canceller = Canceller::new(Arc::downgrade(&inner), Some(nudge_tx));
    let cell = inner.clone();
    let thread = driver("par-map", &inner, move || {
        let len = seq.len();
        let mut slots: Vec<Option<U>> = (0..len).map(|_| None).collect();
        let mut pending: Vec<Option<Task<U>>> = (0..len).map(|_| None).collect();
        let (settled_tx, settled_rx) = crossbeam_channel::unbounded();
        let mut outstanding = 0;
        for (i, element) in seq.into_iter().enumerate() {
            if cell.is_settled() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| f(element, i))) {
                Ok(produced) => {
                    let produced: Eventual<U> = produced.into();
                    match produced {
                        Eventual::Ready(value) => slots[i] = Some(value),
                        Eventual::Pending(task) => {
                            let tx = settled_tx.clone();
                            task.on_settle(Box::new(move || {
                                let _ = tx.send(i);
                            }));
                            pending[i] = Some(task);
                            outstanding += 1;
                        }
                    }
                }
                Err(payload) => {
                    // A panic while starting a step faults the whole operation; later elements
                    // are never started, and started ones are dropped below.
                    cell.settle(Err(Fault::from_payload(payload)));
                    return;
                }
            }
        }
        while outstanding > 0 {
            let index = crossbeam_channel::select! {
                recv(settled_rx) -> msg => match msg {
                    Ok(index) => index,
                    // We hold a sender, so the channel cannot disconnect.
                    Err(_) => unreachable!(),
                },
                recv(nudge_rx) -> _ => return,
            };
            let task = pending[index].take().unwrap();
            match task.block() {
                Ok(value) => {
                    slots[index] = Some(value);
                    outstanding -= 1;
                }
                Err(fault) => {
                    // First fault in settlement order rejects the task; dropping `pending`
                    // cancels and joins the rest.
                    cell.settle(Err(fault));
                    return;
                }
            }
        }
        cell.settle(Ok(slots.into_iter().map(|slot| slot.unwrap()).collect()));
    });
    Task::from_driver(inner, canceller, thread)
}

/// Runs `f`, then keeps re-running it while `condition()` returns `true`.
///
/// `f` always runs at least once; `condition` is evaluated fresh before every further run. The
/// returned task settles with the last run's settlement. Intermediate faults do not stop the
/// loop, only `condition` does, so the final settlement may itself be a fault. A panic inside
/// `condition` settles the task with that payload.
pub fn repeat<T, R, F, C>(mut f: F, mut condition: C) -> Task<T>
where
    T: Send + 'static,
    R: Into<Eventual<T>>,
    F: FnMut() -> R + Send + 'static,
    C: FnMut() -> bool + Send + 'static,
{
    let inner = Arc::new(PromiseInner::new());
    let canceller = Canceller::new(Arc::downgrade(&inner), None);
    let cell = inner.clone();
    let thread = driver("repeat", &inner, move || {
        let mut last = settle_step(|| f());
        loop {
            if cell.is_settled() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(&mut condition)) {
                Ok(true) => last = settle_step(|| f()),
                Ok(false) => break,
                Err(payload) => {
                    cell.settle(Err(Fault::from_payload(payload)));
                    return;
                }
            }
        }
        cell.settle(last);
    });
    Task::from_driver(inner, canceller, thread)
}

/// Runs one caller-supplied step, converting a panic into a fault and waiting out a step task.
fn settle_step<U, R>(step: impl FnOnce() -> R) -> Outcome<U>
where
    R: Into<Eventual<U>>,
{
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(produced) => {
            let produced: Eventual<U> = produced.into();
            produced.settle()
        }
        Err(payload) => Err(Fault::from_payload(payload)),
    }
}
