use std::{
    any::Any,
    fmt,
    future::Future,
    io, mem,
    panic::{self, resume_unwind, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, Waker},
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;

use crate::sync::{Condvar, Mutex};

/// Creates a connected pair of [`Promise`] and [`Task`].
pub fn promise<T>() -> (Promise<T>, Task<T>) {
    let inner = Arc::new(PromiseInner::new());
    (
        Promise {
            inner: inner.clone(),
            settled: false,
        },
        Task {
            inner,
            canceller: None,
            thread: None,
        },
    )
}

/// The settlement of a [`Task`]: either a value, or a [`Fault`].
pub type Outcome<T> = Result<T, Fault>;

/// An opaque failure or cancellation reason carried by a settled [`Task`].
///
/// A `Fault` wraps whatever payload the settling side supplied: a value passed to
/// [`Promise::reject`] or [`Canceller::cancel`], a panic payload caught at a step boundary, or one
/// of this crate's marker types ([`PromiseDropped`], [`Cancelled`], and friends). The combinators
/// in this crate never inspect the payload; they pass it through unchanged. Use [`Fault::is`] and
/// [`Fault::downcast`] to get it back out.
pub struct Fault(Box<dyn Any + Send>);

impl Fault {
    /// Wraps `reason` in a `Fault`.
    pub fn new<R: Any + Send>(reason: R) -> Self {
        Self(Box::new(reason))
    }

    /// Wraps an already-boxed payload without boxing it again.
    ///
    /// Panic payloads arrive in this shape from `catch_unwind`.
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        Self(payload)
    }

    /// Returns `true` if the payload is of type `R`.
    pub fn is<R: Any>(&self) -> bool {
        self.0.is::<R>()
    }

    /// Takes the payload out as an `R`, handing `self` back on a type mismatch.
    pub fn downcast<R: Any>(self) -> Result<R, Fault> {
        match self.0.downcast::<R>() {
            Ok(reason) => Ok(*reason),
            Err(payload) => Err(Self(payload)),
        }
    }

    /// Returns a reference to the payload if it is of type `R`.
    pub fn downcast_ref<R: Any>(&self) -> Option<&R> {
        self.0.downcast_ref::<R>()
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Panic payloads and ad-hoc reasons are usually strings; show those and the common
        // markers, stay opaque otherwise.
        if let Some(s) = self.downcast_ref::<&str>() {
            write!(f, "Fault({s:?})")
        } else if let Some(s) = self.downcast_ref::<String>() {
            write!(f, "Fault({s:?})")
        } else if self.is::<PromiseDropped>() {
            f.write_str("Fault(PromiseDropped)")
        } else if self.is::<Cancelled>() {
            f.write_str("Fault(Cancelled)")
        } else {
            f.write_str("Fault(..)")
        }
    }
}

/// Fault payload of a [`Promise`] that was dropped without being settled.
///
/// This typically means one of two things:
///
/// - The code holding the promise deliberately decided not to settle it (for example, because it
///   skipped processing an item).
/// - The thread holding the promise panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromiseDropped;

/// Fault payload of a task that was cancelled without an explicit reason.
///
/// [`race`][crate::race] fires the losers' cancellation tokens with this, and dropping an
/// unconsumed [`Task`] fires its own token with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

enum PromiseState<T> {
    Pending {
        wakers: Vec<Waker>,
        watchers: Vec<Box<dyn FnOnce() + Send>>,
    },
    Settled(Outcome<T>),
    Taken,
}

pub(crate) struct PromiseInner<T> {
    state: Mutex<PromiseState<T>>,
    condvar: Condvar,
}

impl<T> PromiseInner<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(PromiseState::Pending {
                wakers: Vec::new(),
                watchers: Vec::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Settles the cell, unless it is already settled. Returns whether this call did it.
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let (wakers, watchers) = {
            let mut state = self.state.lock();
            if !matches!(&*state, PromiseState::Pending { .. }) {
                // Settled before; late settlements (lost races, outdated cancellations) are
                // discarded along with `outcome`.
                return false;
            }
            match mem::replace(&mut *state, PromiseState::Settled(outcome)) {
                PromiseState::Pending { wakers, watchers } => (wakers, watchers),
                PromiseState::Settled(_) | PromiseState::Taken => unreachable!(),
            }
        };
        self.condvar.notify_one();
        // Wakers and watchers run outside the lock; they may immediately re-enter the cell.
        for waker in wakers {
            waker.wake();
        }
        for watcher in watchers {
            watcher();
        }
        true
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(&*self.state.lock(), PromiseState::Pending { .. })
    }

    /// Registers a callback to run once the cell settles. Runs it right away if it already has.
    pub(crate) fn on_settle(&self, watcher: Box<dyn FnOnce() + Send>) {
        let immediate = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Pending { watchers, .. } => {
                    watchers.push(watcher);
                    None
                }
                PromiseState::Settled(_) | PromiseState::Taken => Some(watcher),
            }
        };
        if let Some(watcher) = immediate {
            watcher();
        }
    }

    fn block_take(&self) -> Outcome<T> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                PromiseState::Pending { .. } => state = self.condvar.wait(state),
                PromiseState::Settled(_) => break,
                PromiseState::Taken => panic!("task already yielded its settlement"),
            }
        }
        match mem::replace(&mut *state, PromiseState::Taken) {
            PromiseState::Settled(outcome) => outcome,
            PromiseState::Pending { .. } | PromiseState::Taken => unreachable!(),
        }
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Outcome<T>> {
        let mut state = self.state.lock();
        match &mut *state {
            PromiseState::Pending { wakers, .. } => {
                wakers.push(cx.waker().clone());
                return Poll::Pending;
            }
            PromiseState::Settled(_) => {}
            PromiseState::Taken => panic!("task already yielded its settlement"),
        }
        match mem::replace(&mut *state, PromiseState::Taken) {
            PromiseState::Settled(outcome) => Poll::Ready(outcome),
            PromiseState::Pending { .. } | PromiseState::Taken => unreachable!(),
        }
    }
}

/// The producing half of a one-shot settlement cell.
///
/// Settling a [`Promise`] wakes the connected [`Task`]. A connected pair is created by calling
/// [`promise`].
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
    settled: bool,
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.settled {
            // No need to lock or notify again.
            return;
        }
        self.inner.settle(Err(Fault::new(PromiseDropped)));
    }
}

impl<T> Promise<T> {
    /// Resolves the promise with a value, consuming it.
    ///
    /// If a thread is currently waiting at [`Task::block`], it will be woken up.
    ///
    /// This method does not block or fail. If the connected [`Task`] was dropped, `value` is
    /// dropped and nothing happens.
    pub fn fulfill(self, value: T) {
        self.settle(Ok(value));
    }

    /// Rejects the promise with an arbitrary reason, consuming it.
    pub fn reject<R: Any + Send>(self, reason: R) {
        self.settle(Err(Fault::new(reason)));
    }

    /// Settles the promise with `outcome`, consuming it.
    pub fn settle(mut self, outcome: Outcome<T>) {
        self.inner.settle(outcome);
        self.settled = true;
    }

    /// Tests whether the connected [`Task`] still exists.
    ///
    /// The async mutex uses this to skip waiters that gave up before being served.
    pub(crate) fn is_connected(&self) -> bool {
        // Dropping the `Task` decrements the refcount, and cancellation tokens only hold weak
        // references, so a count of 2 means the consumer is still around.
        Arc::strong_count(&self.inner) == 2
    }
}

/// A cancellation token connected to a [`Task`].
///
/// Firing the token settles the task early, with a caller-chosen reason as its [`Fault`]. Tokens
/// are cheap to clone and any clone may fire; firing twice, or after the task has settled, has no
/// effect. Cancellation is cooperative: a step that is already running is not interrupted, but its
/// settlement will be discarded.
pub struct Canceller<T> {
    cell: Weak<PromiseInner<T>>,
    nudge: Option<Sender<()>>,
}

impl<T> Clone for Canceller<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            nudge: self.nudge.clone(),
        }
    }
}

impl<T> Canceller<T> {
    pub(crate) fn new(cell: Weak<PromiseInner<T>>, nudge: Option<Sender<()>>) -> Self {
        Self { cell, nudge }
    }

    /// Settles the connected task with `Err(Fault::new(reason))`, unless it has already settled.
    ///
    /// Also wakes the task's driver thread, if it has one, so it can exit instead of sleeping out
    /// its timer.
    pub fn cancel<R: Any + Send>(&self, reason: R) {
        if let Some(cell) = self.cell.upgrade() {
            cell.settle(Err(Fault::new(reason)));
        }
        if let Some(nudge) = &self.nudge {
            // The driver may have exited on its own already; all that matters is that it is not
            // left sleeping.
            let _ = nudge.send(());
        }
    }
}

/// A handle to a value of type `T` that becomes available once its settlement cell settles.
///
/// A `Task` settles exactly once, with an [`Outcome<T>`]: the value it resolved with, or a
/// [`Fault`]. It can be consumed synchronously with [`Task::block`], or asynchronously by
/// `await`ing it ([`Task`] implements [`Future`]). Polling a task after it yielded its settlement
/// panics.
///
/// Tasks returned by the timer and combinator functions of this crate own the thread driving
/// them, which enforces structured concurrency: consuming the task joins the thread, and dropping
/// an unconsumed task fires its cancellation token and then joins. A panic on the driver thread
/// (not one inside a caller-supplied step, which is caught and reported as a [`Fault`]) is
/// forwarded to the joining thread.
pub struct Task<T> {
    inner: Arc<PromiseInner<T>>,
    canceller: Option<Canceller<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            // Unblocks the driver; a no-op if the task already settled.
            canceller.cancel(Cancelled);
        }
        self.join_driver();
    }
}

impl<T> Task<T> {
    /// Returns a task that has already resolved with `value`.
    pub fn ready(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// Returns a task that has already settled with `outcome`.
    pub fn settled(outcome: Outcome<T>) -> Self {
        Self {
            inner: Arc::new(PromiseInner {
                state: Mutex::new(PromiseState::Settled(outcome)),
                condvar: Condvar::new(),
            }),
            canceller: None,
            thread: None,
        }
    }

    /// Assembles a driver-backed task, downgrading a failed thread spawn into a settlement.
    pub(crate) fn from_driver(
        inner: Arc<PromiseInner<T>>,
        canceller: Canceller<T>,
        spawned: io::Result<JoinHandle<()>>,
    ) -> Self {
        let thread = match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                inner.settle(Err(Fault::new(err)));
                None
            }
        };
        Self {
            inner,
            canceller: Some(canceller),
            thread,
        }
    }

    /// Blocks the calling thread until the task settles, and returns the settlement.
    ///
    /// If the task owns a driver thread, the thread is joined before this returns.
    pub fn block(mut self) -> Outcome<T> {
        let outcome = self.inner.block_take();
        self.canceller = None;
        self.join_driver();
        outcome
    }

    /// Returns whether the task has settled.
    ///
    /// If this returns `true`, [`Task::block`] will return immediately, without blocking.
    pub fn is_settled(&self) -> bool {
        self.inner.is_settled()
    }

    /// Fires the task's cancellation token with `reason`.
    ///
    /// Tasks that were created without a token (such as [`Task::ready`] or the async mutex's
    /// waiters) ignore this.
    pub fn cancel<R: Any + Send>(&self, reason: R) {
        if let Some(canceller) = &self.canceller {
            canceller.cancel(reason);
        }
    }

    /// Registers a callback to run once the task settles, from whichever thread settles it.
    pub(crate) fn on_settle(&self, watcher: Box<dyn FnOnce() + Send>) {
        self.inner.on_settle(watcher);
    }

    fn join_driver(&mut self) {
        // Wait for the driver to exit and propagate its panic if it panicked.
        if let Some(handle) = self.thread.take() {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}

impl<T> Future for Task<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_take(cx)
    }
}

/// A step result that is either immediate or still in flight.
///
/// Caller-supplied steps return `impl Into<Eventual<T>>`, so they can hand back either a plain
/// `T` or a [`Task<T>`] and the combinators treat both uniformly. A plain value is wrapped without
/// spawning anything.
pub enum Eventual<T> {
    /// The step produced its value synchronously.
    Ready(T),
    /// The step produced a task that settles later.
    Pending(Task<T>),
}

impl<T> From<T> for Eventual<T> {
    fn from(value: T) -> Self {
        Eventual::Ready(value)
    }
}

impl<T> From<Task<T>> for Eventual<T> {
    fn from(task: Task<T>) -> Self {
        Eventual::Pending(task)
    }
}

impl<T> Eventual<T> {
    /// Waits for the settlement, blocking while the step is still in flight.
    pub fn settle(self) -> Outcome<T> {
        match self {
            Eventual::Ready(value) => Ok(value),
            Eventual::Pending(task) => task.block(),
        }
    }
}

/// Runs a closure on an owned background thread, returning a [`Task`] that settles with its
/// result.
///
/// A panic inside `f` settles the task with the panic payload as a [`Fault`]; it is not forwarded
/// as a panic. Dropping the returned task joins the thread, so `spawn` cannot leak a running
/// thread past its owner's scope.
pub fn spawn<T, F>(f: F) -> Task<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let inner = Arc::new(PromiseInner::new());
    let cell = inner.clone();
    match driver("spawn", &inner, move || {
        let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => Ok(value),
            Err(payload) => Err(Fault::from_payload(payload)),
        };
        cell.settle(outcome);
    }) {
        Ok(handle) => Task {
            inner,
            canceller: None,
            thread: Some(handle),
        },
        Err(err) => {
            // The closure never ran, so the cell is still pending.
            inner.settle(Err(Fault::new(err)));
            Task {
                inner,
                canceller: None,
                thread: None,
            }
        }
    }
}

/// Spawns a named driver thread that is expected to settle `cell` before it exits.
///
/// If the driver unwinds without settling (a bug in this crate, not a caller step, since those
/// are caught at the step boundary), the cell is settled with [`PromiseDropped`] so that no
/// consumer is left blocked, and the panic is then propagated by the join in [`Task`].
pub(crate) fn driver<T, F>(
    name: &'static str,
    cell: &Arc<PromiseInner<T>>,
    f: F,
) -> io::Result<JoinHandle<()>>
where
    T: Send + 'static,
    F: FnOnce() + Send + 'static,
{
    let guard_cell = cell.clone();
    thread::Builder::new().name(name.into()).spawn(move || {
        log::trace!("driver '{name}' starting");
        let _guard = defer(move || {
            guard_cell.settle(Err(Fault::new(PromiseDropped)));
            log::trace!("driver '{name}' exiting");
        });
        f();
    })
}

/// Drop guard that runs `cb` when dropped, including during unwinding.
#[must_use]
struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}
