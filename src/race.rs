//! First-settlement-wins selection over a set of tasks.

use std::sync::Arc;

use crate::{
    iter::EmptySequence,
    promise::{driver, PromiseInner},
    Cancelled, Canceller, Fault, Task,
};

/// Settles with the first of `tasks` to settle, for better or worse.
///
/// The winner's settlement is adopted wholesale, so a task that rejects first makes the race
/// reject. Once a winner is in, every other entrant is cancelled with [`Cancelled`], in the
/// order they were passed in, before the winning settlement is published. Blocking on the
/// race's task additionally waits for the losers' driver threads to wind down.
///
/// Cancelling the race (or dropping its [`Task`]) cancels all entrants.
///
/// An empty field settles with an [`EmptySequence`] fault immediately. There is nothing that
/// could ever win it, and a task that can never settle deadlocks whoever blocks on it.
pub fn race<T: Send + 'static>(tasks: Vec<Task<T>>) -> Task<T> {
    if tasks.is_empty() {
        return Task::settled(Err(Fault::new(EmptySequence)));
    }
    let inner = Arc::new(PromiseInner::new());
    let (nudge_tx, nudge_rx) = crossbeam_channel::unbounded();
    let canceller = Canceller::new(Arc::downgrade(&inner), Some(nudge_tx));
    let cell = inner.clone();
    let thread = driver("race", &inner, move || {
        let (settled_tx, settled_rx) = crossbeam_channel::unbounded();
        let mut entrants: Vec<Option<Task<T>>> = tasks
            .into_iter()
            .enumerate()
            .map(|(i, task)| {
                let tx = settled_tx.clone();
                task.on_settle(Box::new(move || {
                    let _ = tx.send(i);
                }));
                Some(task)
            })
            .collect();
        let index = crossbeam_channel::select! {
            recv(settled_rx) -> msg => match msg {
                Ok(index) => index,
                // We hold a sender, so the channel cannot disconnect.
                Err(_) => unreachable!(),
            },
            // The race itself was cancelled; dropping `entrants` cancels and joins them all.
            recv(nudge_rx) -> _ => return,
        };
        let winner = entrants[index].take().unwrap();
        let outcome = winner.block();
        for entrant in entrants.iter().flatten() {
            entrant.cancel(Cancelled);
        }
        cell.settle(outcome);
        // Dropping `entrants` joins the losers' threads before this driver exits.
    });
    Task::from_driver(inner, canceller, thread)
}

#[cfg(test)]
mod tests {
    use std::{
        panic::resume_unwind,
        sync::atomic::{AtomicBool, Ordering},
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{delay, sync::Mutex, timeout};

    #[test]
    fn the_first_task_to_settle_wins() {
        let (fast, _cancel_fast) = delay(Duration::from_millis(5));
        let (slow, _cancel_slow) = delay(Duration::from_secs(60));
        let start = Instant::now();
        let elapsed = race(vec![fast, slow]).block().unwrap();
        assert!(
            elapsed < Duration::from_secs(1),
            "winner slept {elapsed:?}, expected the 5 ms entrant"
        );
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "{:?} elapsed, the loser was slept out instead of cancelled",
            start.elapsed()
        );
    }

    #[test]
    fn a_rejecting_winner_rejects_the_race() {
        let (failing, _cancel_failing) = timeout(
            || -> u32 { resume_unwind(Box::new("lost cause".to_string())) },
            Duration::from_millis(5),
        );
        let (healthy, _cancel_healthy) = timeout(|| 7, Duration::from_secs(60));
        let fault = race(vec![failing, healthy]).block().unwrap_err();
        assert_eq!(fault.downcast::<String>().unwrap(), "lost cause");
    }

    #[test]
    fn losers_never_run_their_steps() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let (fast, _cancel_fast) = timeout(|| (), Duration::from_millis(5));
        let (slow, _cancel_slow) = timeout(
            move || flag.store(true, Ordering::Relaxed),
            Duration::from_secs(60),
        );
        race(vec![fast, slow]).block().unwrap();
        // Blocking on the race joins the losers' drivers, so the flag is final by now.
        assert!(!ran.load(Ordering::Relaxed));
    }

    #[test]
    fn losers_are_cancelled_in_entry_order_after_the_winner() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entrants = Vec::new();
        for i in 0..4 {
            let after = if i == 1 {
                Duration::from_millis(5)
            } else {
                Duration::from_secs(60)
            };
            let (task, _cancel) = delay(after);
            let seen = log.clone();
            // Attached before the race's own watcher, so each entrant logs first.
            task.on_settle(Box::new(move || seen.lock().push(i)));
            entrants.push(task);
        }
        race(entrants).block().unwrap();
        // The winner settles first, then the losers are cancelled in entry order.
        assert_eq!(*log.lock(), vec![1, 0, 2, 3]);
    }

    #[test]
    fn cancelling_the_race_cancels_every_entrant() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut entrants = Vec::new();
        for i in 0..2 {
            let (slow, _cancel) = delay(Duration::from_secs(60));
            let seen = log.clone();
            slow.on_settle(Box::new(move || seen.lock().push(i)));
            entrants.push(slow);
        }
        let task = race(entrants);
        task.cancel("called off".to_string());
        let start = Instant::now();
        let fault = task.block().unwrap_err();
        assert_eq!(fault.downcast::<String>().unwrap(), "called off");
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "{:?} elapsed, an entrant was slept out instead of cancelled",
            start.elapsed()
        );
        assert_eq!(*log.lock(), vec![0, 1]);
    }

    #[test]
    fn an_empty_race_faults_instead_of_hanging() {
        let task = race(Vec::<Task<i32>>::new());
        assert!(task.is_settled());
        let fault = task.block().unwrap_err();
        assert!(fault.is::<EmptySequence>());
    }
}
