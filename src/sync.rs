//! The slice of [`std::sync`] this crate uses, without lock poisoning.
//!
//! [`std::sync::Mutex`] poisons itself when the thread holding it panics, turning every later
//! `lock` call into a `Result` that is almost always unwrapped. This crate already has a channel
//! for panics: a panic inside a user step is caught at the step boundary and carried to the
//! task's consumer as a [`Fault`][crate::Fault], and internal driver panics resurface when the
//! task is joined. Poisoning would add a second, unordered report of the same event, so the
//! locks here simply hand out the guard and let the settlement machinery do the telling.
//!
//! Only the operations the crate needs are mirrored: plain `lock`/`try_lock` and a
//! [`Condvar`] with `wait`/`notify_one`.

use std::{
    error::Error,
    fmt,
    ops::{Deref, DerefMut},
    sync,
};

pub type TryLockResult<Guard> = Result<Guard, TryLockError>;

#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }

    pub fn try_lock(&self) -> TryLockResult<MutexGuard<'_, T>> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(sync::TryLockError::Poisoned(poison)) => poison.into_inner(),
            Err(sync::TryLockError::WouldBlock) => return Err(TryLockError),
        };

        Ok(MutexGuard { inner: guard })
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Ok(val) => s.field("data", &&*val),
            Err(TryLockError) => s.field("data", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TryLockError;

impl Error for TryLockError {}

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("`try_lock` failed because the operation would block")
    }
}

#[derive(Debug, Default)]
pub struct Condvar {
    inner: sync::Condvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Self {
            inner: sync::Condvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let guard = match self.inner.wait(guard.inner) {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        MutexGuard { inner: guard }
    }

    pub fn notify_one(&self) {
        self.inner.notify_one();
    }
}
