//! The rendezvous between blocking user calls and the protocol machinery.
//!
//! Every control block carries a [`WaitContext`]. A user thread that cannot
//! make progress sleeps on it, which atomically releases the table mutex and
//! holds it again on wake. Segment arrival, timers, and shutdown wake or
//! interrupt sleepers while holding the same mutex, so state transitions and
//! wake-ups are totally ordered per control block.

use std::sync::{Condvar, MutexGuard};
use std::sync::Arc;

/// Per-control-block wait state: a condition variable handle, the number of
/// threads currently sleeping, and whether the sleepers were interrupted.
///
/// The count and flag live behind the same mutex as the data the sleepers
/// are waiting on; only the condvar itself is shared out so that a sleeper
/// can hold a reference to it across the wait.
#[derive(Debug, Default)]
pub(crate) struct WaitContext {
    cond: Arc<Condvar>,
    waiters: usize,
    interrupted: bool,
}

impl WaitContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every thread sleeping on this context.
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    /// Marks the context interrupted and wakes every sleeper. Each sleeper
    /// observes the flag on wake and unwinds; the last one out clears it.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
        self.cond.notify_all();
    }

    /// Whether the context can be torn down. Fails while threads are still
    /// sleeping on it, which is the release protocol's signal to wake them
    /// and let the last waiter finish the job.
    pub fn can_destroy(&self) -> bool {
        self.waiters == 0
    }
}

/// Puts the calling thread to sleep on the wait context that `ctx_of`
/// selects out of the guarded data. The mutex is released for the duration
/// of the sleep and held again when this returns. The boolean is true when
/// the sleep was ended by an interrupt rather than a wake.
///
/// Callers must re-check their predicate after waking: wake-ups are
/// broadcast to all sleepers and the condvar may also wake spuriously.
pub(crate) fn sleep<'a, T>(
    mut guard: MutexGuard<'a, T>,
    ctx_of: impl Fn(&mut T) -> &mut WaitContext,
) -> (MutexGuard<'a, T>, bool) {
    let ctx = ctx_of(&mut guard);
    if ctx.interrupted {
        return (guard, true);
    }
    ctx.waiters += 1;
    let cond = ctx.cond.clone();
    let mut guard = cond.wait(guard).unwrap();
    let ctx = ctx_of(&mut guard);
    ctx.waiters -= 1;
    if ctx.interrupted {
        if ctx.waiters == 0 {
            ctx.interrupted = false;
        }
        return (guard, true);
    }
    (guard, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Guarded {
        ready: bool,
        ctx: WaitContext,
    }

    #[test]
    fn wake_reacquires_the_lock() {
        let shared = Arc::new(Mutex::new(Guarded::default()));

        let sleeper = {
            let shared = shared.clone();
            thread::spawn(move || {
                let mut guard = shared.lock().unwrap();
                while !guard.ready {
                    let (reacquired, interrupted) = sleep(guard, |g| &mut g.ctx);
                    guard = reacquired;
                    assert!(!interrupted);
                }
            })
        };

        thread::sleep(Duration::from_millis(50));
        {
            let mut guard = shared.lock().unwrap();
            guard.ready = true;
            guard.ctx.wake();
        }
        sleeper.join().unwrap();
        assert!(shared.lock().unwrap().ctx.can_destroy());
    }

    #[test]
    fn interrupt_unblocks_all_sleepers() {
        let shared = Arc::new(Mutex::new(Guarded::default()));

        let sleepers: Vec<_> = (0..3)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    let guard = shared.lock().unwrap();
                    let (_guard, interrupted) = sleep(guard, |g| &mut g.ctx);
                    interrupted
                })
            })
            .collect();

        while shared.lock().unwrap().ctx.waiters < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        shared.lock().unwrap().ctx.interrupt();
        for sleeper in sleepers {
            assert!(sleeper.join().unwrap());
        }

        // The last waiter out clears the flag so the context is reusable
        let guard = shared.lock().unwrap();
        assert!(!guard.ctx.interrupted);
        assert!(guard.ctx.can_destroy());
    }
}
