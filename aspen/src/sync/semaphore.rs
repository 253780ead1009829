//! Counting semaphore.
//!
//! A semaphore maintains a count of available permits. [`Semaphore::wait`]
//! takes a permit, blocking while none are available; [`Semaphore::signal`]
//! returns one and wakes a blocked thread. A semaphore initialized with zero
//! permits doubles as a one-shot event: the waiter blocks until another
//! thread signals.

use crate::sync::{condition_variable::ConditionVariable, mutex::Mutex};

/// Counting semaphore.
///
/// Unlike a mutex, a semaphore has no notion of an owner: any thread may
/// signal, and `wait`/`signal` calls need not pair up within one thread.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: ConditionVariable,
}

impl Semaphore {
    /// Creates a new semaphore holding `permits` permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: ConditionVariable::new(),
        }
    }

    /// Waits until a permit becomes available, then takes it.
    pub fn wait(&self) {
        let mut guard = self.available.wait_while(&self.permits, |p| *p == 0);
        *guard -= 1;
        guard.unlock();
    }

    /// Releases a permit, waking one blocked waiter if any.
    pub fn signal(&self) {
        let mut guard = self.permits.lock();
        *guard += 1;
        self.available.signal(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadBuilder;
    use std::sync::Arc;

    #[test]
    fn rendezvous() {
        let sema = Arc::new(Semaphore::new(0));
        let signaler = Arc::clone(&sema);
        let handle = ThreadBuilder::new("signaler").spawn(move || {
            signaler.signal();
        });
        sema.wait();
        handle.join();
    }

    #[test]
    fn bounds_concurrency() {
        const PERMITS: usize = 3;
        let sema = Arc::new(Semaphore::new(PERMITS));
        let peak = Arc::new(Mutex::new((0usize, 0usize)));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let sema = Arc::clone(&sema);
            let peak = Arc::clone(&peak);
            handles.push(ThreadBuilder::new("holder").spawn(move || {
                sema.wait();
                let mut guard = peak.lock();
                guard.0 += 1;
                guard.1 = guard.1.max(guard.0);
                guard.unlock();
                std::thread::sleep(std::time::Duration::from_millis(5));
                let mut guard = peak.lock();
                guard.0 -= 1;
                guard.unlock();
                sema.signal();
            }));
        }
        for h in handles {
            h.join();
        }
        let guard = peak.lock();
        assert!(guard.1 <= PERMITS);
        guard.unlock();
    }
}
