//! Promise-flavored control flow on plain OS threads: one-shot tasks, cancellable timers,
//! sequential and parallel iteration, racing, and a promise-based mutex.
//!
//! (if you need to run thousands of I/O-bound operations concurrently, an `async` runtime is the
//! right tool, and if you need data parallelism over large collections, check out [`rayon`]; this
//! library is for programs that want promise-shaped control flow over a handful of concurrent
//! operations without adopting a runtime)
//!
//! # Overview
//!
//! Everything in this crate produces a [`Task`]: a handle to exactly one future settlement. A
//! task either *resolves* with a value or *rejects* with a [`Fault`], and [`Task::block`] hands
//! over that [`Outcome`] exactly once. Tasks also implement [`std::future::Future`], so `async`
//! code can await them, but nothing here requires a runtime.
//!
//! ## Settlement
//!
//! The lowest layer is the [`promise`] pair: fulfilling or rejecting the [`Promise`] settles its
//! [`Task`], and dropping a promise unfulfilled settles the task with a [`PromiseDropped`]
//! fault, so a consumer can never be left hanging. Every other operation in the crate builds on
//! this cell, starting with [`spawn`], which runs a closure on its own thread and settles with
//! whatever the closure does.
//!
//! ## Cancellation and ownership
//!
//! The timer operations ([`delay`], [`timeout`], [`interval`]) hand back a [`Canceller`] (for
//! [`interval`], a [`Clearer`]) next to the task. Cancellation is cooperative and takes effect
//! at step boundaries: a step that is already running is never interrupted, but sleeps are cut
//! short and steps that have not started will not run. Dropping a [`Task`] cancels it the same
//! way and then joins its thread, so a concurrent operation cannot outlive the code that started
//! it.
//!
//! ## Steps
//!
//! The iteration operations ([`map`], [`par_map`], [`reduce`], [`repeat`], and friends) take
//! *steps*: closures that return either a plain value or another [`Task`] (any
//! `impl Into<Eventual<T>>`). A panic inside a step is caught at the step boundary and becomes
//! that step's [`Fault`] rather than tearing down the operation's thread.
//!
//! # Usage
//!
//! Running a computation and blocking on its settlement:
//!
//! ```
//! use soonish::spawn;
//!
//! let task = spawn(|| (1..=10).sum::<u32>());
//! assert_eq!(task.block().unwrap(), 55);
//! ```
//!
//! Mapping with asynchronous steps, sequentially; each step here is itself a task:
//!
//! ```
//! use std::time::Duration;
//! use soonish::{map, timeout};
//!
//! let task = map(vec![3u64, 1, 2], |n, _| {
//!     let (step, _cancel) = timeout(move || n * 10, Duration::from_millis(n));
//!     step
//! });
//! let scaled: Vec<u64> = task.block().unwrap().into_iter().map(|r| r.unwrap()).collect();
//! assert_eq!(scaled, vec![30, 10, 20]);
//! ```
//!
//! Racing two timers; the loser is cancelled instead of slept out:
//!
//! ```
//! use std::time::Duration;
//! use soonish::{delay, race};
//!
//! let (quick, _cancel_quick) = delay(Duration::from_millis(1));
//! let (slow, _cancel_slow) = delay(Duration::from_secs(60));
//! let elapsed = race(vec![quick, slow]).block().unwrap();
//! assert!(elapsed < Duration::from_secs(60));
//! ```
//!
//! Sequencing access with the promise-based [`Mutex`]:
//!
//! ```
//! use soonish::Mutex;
//!
//! let lock = Mutex::new();
//! let permit = lock.acquire().block().unwrap();
//! let waiting = lock.acquire();
//! assert!(!waiting.is_settled());
//! permit.release();
//! waiting.block().unwrap().release();
//! ```
//!
//! [`rayon`]: https://crates.io/crates/rayon

mod iter;
mod mutex;
mod promise;
mod race;
pub mod sync;
#[cfg(test)]
mod test;
mod timer;

pub use iter::{map, par_map, reduce, reduce_first, repeat, try_map, try_reduce, EmptySequence};
pub use mutex::{Mutex, Permit};
pub use promise::{
    promise, spawn, Cancelled, Canceller, Eventual, Fault, Outcome, Promise, PromiseDropped, Task,
};
pub use race::race;
pub use timer::{delay, interval, timeout, Cleared, Clearer};
