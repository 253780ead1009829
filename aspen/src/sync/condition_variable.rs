//! Condition variable.
//!
//! A condition variable lets a thread block until shared state, guarded by a
//! [`Mutex`], reaches some condition, without consuming CPU while waiting.
//! The APIs take the mutex (or its guard) as an argument, which keeps the
//! classic check-and-sleep race structurally impossible: a waiter enqueues
//! itself while still holding the mutex, and a signaler can only signal
//! while holding the same mutex.

use crate::{
    sync::mutex::{Mutex, MutexGuard},
    sync::spinlock::SpinLock,
    thread::{Current, ParkHandle},
};
use std::collections::VecDeque;

/// A condition variable.
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. They are
/// associated with a boolean predicate and a [`Mutex`]; the predicate is
/// always verified under the mutex before the thread blocks.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<ParkHandle>>,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// Takes the [`Mutex`] and checks the predicate under it. While the
    /// predicate holds, the thread sleeps with the mutex released; each
    /// wake-up reacquires the mutex and re-evaluates. Returns with the mutex
    /// held and the predicate false.
    ///
    /// There is no need to check the predicate before calling; the entire
    /// check-and-sleep loop lives here.
    pub fn wait_while<'a, T: ?Sized>(
        &self,
        mutex: &'a Mutex<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        loop {
            let mut guard = mutex.lock();
            if !predicate(&mut guard) {
                return guard;
            }
            Current::park_with(move |handle| {
                let mut waiters = self.waiters.lock();
                waiters.push_back(handle);
                waiters.unlock();
                guard.unlock();
            });
        }
    }

    /// Wakes up one thread blocked on this condvar, then releases `guard`.
    ///
    /// Calls to `signal` are not buffered: with no waiter queued, the only
    /// effect is the unlock.
    pub fn signal<T: ?Sized>(&self, guard: MutexGuard<'_, T>) {
        let mut waiters = self.waiters.lock();
        let next = waiters.pop_front();
        waiters.unlock();
        guard.unlock();
        if let Some(handle) = next {
            handle.unpark();
        }
    }

    /// Wakes up all threads blocked on this condvar, then releases `guard`.
    pub fn broadcast<T: ?Sized>(&self, guard: MutexGuard<'_, T>) {
        let mut waiters = self.waiters.lock();
        let woken: Vec<ParkHandle> = waiters.drain(..).collect();
        waiters.unlock();
        guard.unlock();
        for handle in woken {
            handle.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadBuilder;
    use std::sync::Arc;

    #[test]
    fn handoff() {
        let state = Arc::new((Mutex::new(0usize), ConditionVariable::new()));
        let consumer_state = Arc::clone(&state);
        let consumer = ThreadBuilder::new("consumer").spawn(move || {
            let (counter, cond) = &*consumer_state;
            let mut guard = cond.wait_while(counter, |v| *v < 10);
            *guard = 0;
            guard.unlock();
        });
        let (counter, cond) = &*state;
        for _ in 0..10 {
            let mut guard = counter.lock();
            *guard += 1;
            cond.signal(guard);
        }
        consumer.join();
        let guard = counter.lock();
        assert_eq!(*guard, 0);
        guard.unlock();
    }

    #[test]
    fn broadcast_wakes_everyone() {
        const WAITERS: usize = 4;
        let state = Arc::new((Mutex::new(false), ConditionVariable::new()));
        let mut handles = Vec::new();
        for _ in 0..WAITERS {
            let state = Arc::clone(&state);
            handles.push(ThreadBuilder::new("waiter").spawn(move || {
                let (ready, cond) = &*state;
                cond.wait_while(ready, |go| !*go).unlock();
            }));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        let (ready, cond) = &*state;
        let mut guard = ready.lock();
        *guard = true;
        cond.broadcast(guard);
        for h in handles {
            h.join();
        }
    }
}
