//! Sleeping mutex.
//!
//! Unlike [`SpinLock`], a [`Mutex`] **blocks** threads trying to acquire it
//! while another thread holds the lock. The mutex keeps a queue of threads
//! sleeping on it; unlocking wakes the queue head. Spin for short critical
//! sections, sleep for long ones.
//!
//! [`SpinLock`]: crate::sync::SpinLock

use crate::{
    sync::spinlock::{SpinLock, WouldBlock},
    thread::{Current, ParkHandle},
};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use std::collections::VecDeque;

pub(super) struct MutexInner {
    locked: bool,
    waiters: VecDeque<ParkHandle>,
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will block threads waiting for the lock to become available.
/// Each mutex has a type parameter which represents the data that it is
/// protecting. The data can only be accessed through the guards returned
/// from [`lock`] and [`try_lock`], which guarantees that the data is only
/// ever accessed when the mutex is locked.
///
/// As with [`SpinLock`], the guard must be released with an explicit
/// [`MutexGuard::unlock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
/// [`SpinLock`]: crate::sync::SpinLock
pub struct Mutex<T: ?Sized> {
    inner: SpinLock<MutexInner>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            inner: SpinLock::new(MutexInner {
                locked: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking the current thread until it is able to
    /// do so.
    ///
    /// If the lock is held, the calling thread is enqueued and parked; the
    /// holder's `unlock` wakes it. Upon returning, the thread is the only
    /// thread with the lock held.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut state = self.inner.lock();
            if !state.locked {
                state.locked = true;
                state.unlock();
                return MutexGuard {
                    lock: self,
                    _not_send: PhantomData,
                };
            }
            // Enqueue under the state lock, then sleep. The waker pops under
            // the same lock, so the wake-up cannot be lost.
            Current::park_with(move |handle| {
                state.waiters.push_back(handle);
                state.unlock();
            });
        }
    }

    /// Attempts to acquire this lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`WouldBlock`] if the mutex is already locked.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        let mut state = self.inner.lock();
        let acquired = !state.locked;
        if acquired {
            state.locked = true;
        }
        state.unlock();
        if acquired {
            Ok(MutexGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(WouldBlock)
        }
    }

    fn release(&self) {
        let mut state = self.inner.lock();
        state.locked = false;
        let next = state.waiters.pop_front();
        state.unlock();
        if let Some(handle) = next {
            handle.unpark();
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex.
///
/// The lock must be explicitly released by the [`unlock`] method; dropping
/// the guard outside of an unwind panics.
///
/// The data protected by the mutex can be accessed through this guard.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> MutexGuard<'_, T> {
    /// Releases the underlying [`Mutex`], waking one queued waiter.
    pub fn unlock(self) {
        self.lock.release();
        core::mem::forget(self);
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.lock.release();
        } else {
            panic!("`.unlock()` must be explicitly called for MutexGuard.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadBuilder;
    use std::sync::Arc;

    #[test]
    fn contended_increments() {
        const N: usize = 8;
        let data = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..N {
            let data = Arc::clone(&data);
            handles.push(ThreadBuilder::new("work").spawn(move || {
                for _ in 0..500 {
                    let mut guard = data.lock();
                    *guard += 1;
                    guard.unlock();
                }
            }));
        }
        for h in handles {
            h.join();
        }
        let guard = data.lock();
        assert_eq!(*guard, N * 500);
        guard.unlock();
    }

    #[test]
    fn try_lock_reports_contention() {
        let m = Mutex::new(());
        let guard = m.lock();
        assert!(m.try_lock().is_err());
        guard.unlock();
        m.try_lock().unwrap().unlock();
    }
}
