//! A mutual exclusion primitive whose lock operation settles a promise instead of blocking.

use std::{collections::VecDeque, fmt, sync::Arc};

use crate::{promise::promise, sync, Promise, Task};

/// A promise-based lock with first-come, first-served hand-off.
///
/// [`Mutex::acquire`] settles immediately when the lock is free and otherwise returns a pending
/// [`Task`] that resolves with a [`Permit`] once every earlier caller has released theirs. The
/// permit is the lock: dropping it (or calling [`Permit::release`]) passes the lock to the next
/// waiter in line. Double release, and release by anything other than the holder, cannot be
/// written down: releasing consumes the [`Permit`], and only the holder ever owns one.
///
/// Unlike [`sync::Mutex`], this lock does not guard a value; it sequences access to whatever the
/// callers agree it protects.
#[derive(Clone)]
pub struct Mutex {
    core: Arc<Core>,
}

struct Core {
    state: sync::Mutex<LockState>,
}

struct LockState {
    locked: bool,
    waiters: VecDeque<Promise<Permit>>,
}

/// Proof of exclusive access, handed out by [`Mutex::acquire`].
///
/// The lock is held for exactly as long as the permit is alive.
pub struct Permit {
    core: Arc<Core>,
}

impl Mutex {
    /// Creates an unlocked mutex.
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                state: sync::Mutex::new(LockState {
                    locked: false,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Takes the lock, or queues up for it.
    ///
    /// When the lock is free this settles on the spot, without spawning anything, and the
    /// returned task's [`Task::block`] will not block. Otherwise the task resolves once every
    /// caller queued before this one has released its [`Permit`], in acquisition order.
    ///
    /// Dropping the task while still queued gives up the claim; the lock then skips it on
    /// hand-off.
    pub fn acquire(&self) -> Task<Permit> {
        let mut state = self.core.state.lock();
        if !state.locked {
            state.locked = true;
            drop(state);
            return Task::ready(Permit {
                core: self.core.clone(),
            });
        }
        let (promise, task) = promise();
        state.waiters.push_back(promise);
        task
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.core.state.try_lock() {
            Ok(state) => f
                .debug_struct("Mutex")
                .field("locked", &state.locked)
                .field("waiters", &state.waiters.len())
                .finish(),
            Err(_) => f.debug_struct("Mutex").finish_non_exhaustive(),
        }
    }
}

impl Core {
    /// Releases the lock, handing it to the first waiter that still wants it.
    fn release(core: &Arc<Core>) {
        loop {
            let waiter = {
                let mut state = core.state.lock();
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.locked = false;
                        return;
                    }
                }
            };
            // Settling runs watcher callbacks, so the queue lock is released first.
            if waiter.is_connected() {
                waiter.fulfill(Permit { core: core.clone() });
                return;
            }
            // The waiter dropped its task; its claim lapses and the next one gets the lock.
        }
    }
}

impl Permit {
    /// Releases the lock.
    ///
    /// Equivalent to dropping the permit, but reads better at call sites.
    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        Core::release(&self.core);
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;

    #[test]
    fn a_free_mutex_settles_on_the_spot() {
        let mutex = Mutex::new();
        let task = mutex.acquire();
        assert!(task.is_settled());
        let permit = task.block().unwrap();
        permit.release();
        assert!(mutex.acquire().is_settled());
    }

    #[test]
    fn a_held_mutex_queues_the_caller() {
        let mutex = Mutex::new();
        let permit = mutex.acquire().block().unwrap();
        let queued = mutex.acquire();
        assert!(!queued.is_settled());
        permit.release();
        assert!(queued.is_settled());
        queued.block().unwrap();
    }

    #[test]
    fn waiters_acquire_in_fifo_order() {
        let mutex = Mutex::new();
        let permit = mutex.acquire().block().unwrap();
        let (events_tx, events) = mpsc::channel();
        let mut threads = Vec::new();
        for i in 0..3 {
            // Queue up strictly one at a time so the expected order is deterministic.
            let task = mutex.acquire();
            let events_tx = events_tx.clone();
            threads.push(thread::spawn(move || {
                let permit = task.block().unwrap();
                events_tx.send(i).unwrap();
                permit.release();
            }));
        }
        permit.release();
        let order: Vec<i32> = (0..3).map(|_| events.recv().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn dropping_the_permit_releases_the_lock() {
        let mutex = Mutex::new();
        let permit = mutex.acquire().block().unwrap();
        let queued = mutex.acquire();
        drop(permit);
        assert!(queued.is_settled());
        drop(queued);
        assert!(mutex.acquire().is_settled());
    }

    #[test]
    fn a_dropped_waiter_is_skipped_on_hand_off() {
        let mutex = Mutex::new();
        let permit = mutex.acquire().block().unwrap();
        let first = mutex.acquire();
        let second = mutex.acquire();
        drop(first);
        permit.release();
        // The lapsed claim went to `second` instead.
        assert!(second.is_settled());
        second.block().unwrap();
    }

    #[test]
    fn clones_share_the_lock() {
        let mutex = Mutex::new();
        let clone = mutex.clone();
        let permit = mutex.acquire().block().unwrap();
        let queued = clone.acquire();
        assert!(!queued.is_settled());
        permit.release();
        queued.block().unwrap();
    }

    #[test]
    fn hand_off_survives_dropping_the_mutex_handle() {
        let mutex = Mutex::new();
        let permit = mutex.acquire().block().unwrap();
        let queued = mutex.acquire();
        // The permit and the queued waiter keep the shared state alive on their own.
        drop(mutex);
        permit.release();
        queued.block().unwrap().release();
    }

    #[test]
    fn acquisition_can_be_awaited() {
        let mutex = Mutex::new();
        let permit = mutex.acquire().block().unwrap();
        let queued = mutex.acquire();
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            permit.release();
        });
        crate::test::block_on(queued).unwrap().release();
        release.join().unwrap();
    }

    #[test]
    fn debug_reports_the_queue() {
        let mutex = Mutex::new();
        let _permit = mutex.acquire().block().unwrap();
        let _queued = mutex.acquire();
        assert_eq!(format!("{mutex:?}"), "Mutex { locked: true, waiters: 1 }");
    }
}
