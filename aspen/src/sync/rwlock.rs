//! RwLock implementations.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};
use crossbeam_utils::Backoff;

use super::spinlock::WouldBlock;

/// A reader-writer lock.
///
/// This type of lock allows a number of readers or at most one writer at any
/// point in time. The write portion of this lock typically allows
/// modification of the underlying data (exclusive access) and the read
/// portion typically allows for read-only access (shared access).
///
/// Waiting spins; the lock is intended for short sections such as consulting
/// a cached on-disk structure. Unlike [`SpinLock`], the guards release on
/// drop.
///
/// [`SpinLock`]: crate::sync::SpinLock
pub struct RwLock<T: ?Sized + Send> {
    // Reader count, with the writer claim in the top bit.
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

const WRITER: usize = 1 << (usize::BITS - 1);

unsafe impl<T: ?Sized + Send> Sync for RwLock<T> {}
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}

impl<T: Send> RwLock<T> {
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    pub const fn new(data: T) -> RwLock<T> {
        RwLock {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this `RwLock`, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized + Send> RwLock<T> {
    /// Locks this rwlock with shared read access, blocking the current
    /// thread until it can be acquired.
    ///
    /// There may be other readers inside the lock when this returns. The
    /// returned guard releases the shared access when dropped.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            match self.try_read() {
                Ok(guard) => return guard,
                Err(WouldBlock) => backoff.snooze(),
            }
        }
    }

    /// Attempts to acquire this rwlock with shared read access.
    ///
    /// This function does not block.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, WouldBlock> {
        let prev = self.state.load(Ordering::Relaxed);
        if prev & WRITER != 0 {
            return Err(WouldBlock);
        }
        if self
            .state
            .compare_exchange(prev, prev + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(RwLockReadGuard { lock: self })
        } else {
            Err(WouldBlock)
        }
    }

    /// Locks this rwlock with exclusive write access, blocking the current
    /// thread until it can be acquired.
    ///
    /// This function will not return while other writers or other readers
    /// currently have access to the lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            match self.try_write() {
                Ok(guard) => return guard,
                Err(WouldBlock) => backoff.snooze(),
            }
        }
    }

    /// Attempts to lock this rwlock with exclusive write access.
    ///
    /// This function does not block.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, WouldBlock> {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(RwLockWriteGuard { lock: self })
        } else {
            Err(WouldBlock)
        }
    }
}

impl<T: Send> core::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("RwLock")
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish()
    }
}

/// RAII structure used to release the shared read access of a lock when
/// dropped.
pub struct RwLockReadGuard<'a, T: ?Sized + Send + 'a> {
    lock: &'a RwLock<T>,
}

/// RAII structure used to release the exclusive write access of a lock when
/// dropped.
pub struct RwLockWriteGuard<'a, T: ?Sized + Send + 'a> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized + Send> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized + Send> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized + Send> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized + Send> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.lock.state.load(Ordering::Acquire) & WRITER, 0);
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

impl<T: ?Sized + Send> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        debug_assert_eq!(self.lock.state.load(Ordering::Acquire), WRITER);
        self.lock.state.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn readers_share() {
        let lock = RwLock::new(7);
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a + *b, 14);
        assert!(lock.try_write().is_err());
    }

    #[test]
    fn writer_excludes() {
        let lock = Arc::new(RwLock::new(0usize));
        {
            let guard = lock.write();
            assert!(lock.try_read().is_err());
            drop(guard);
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.write() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 4000);
    }
}
