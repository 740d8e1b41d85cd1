//! Internal unit test utilities.

use std::{
    future::Future,
    pin::pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Wake, Waker},
};

/// Polls a future to completion on the current thread, returning its output.
///
/// This is all the executor the tests need: settlement wakes the waker from whichever thread
/// settles, and the poll loop sleeps on a condvar in between.
pub fn block_on<R, F: Future<Output = R>>(fut: F) -> R {
    #[derive(Default)]
    struct ThreadWaker {
        /// Wake-ups bump the epoch and notify; the poll loop sleeps until the epoch moves.
        epoch: Mutex<u64>,
        condvar: Condvar,
    }
    impl Wake for ThreadWaker {
        fn wake(self: Arc<Self>) {
            *self.epoch.lock().unwrap() += 1;
            self.condvar.notify_one();
        }
    }

    let arc = Arc::new(ThreadWaker::default());
    let waker = Waker::from(arc.clone());
    let mut cx = Context::from_waker(&waker);

    let mut fut = pin!(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(value) => return value,
            Poll::Pending => {
                let guard = arc.epoch.lock().unwrap();
                let seen = *guard;
                drop(arc.condvar.wait_while(guard, |n| *n == seen).unwrap());
            }
        }
    }
}
