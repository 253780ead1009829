//! Synchronization primitives.
//!
//! Two families live here. The spin family ([`SpinLock`], [`RwLock`]) burns
//! cycles while waiting and is meant for short critical sections. The
//! sleeping family ([`Mutex`], [`ConditionVariable`], [`Semaphore`]) parks
//! the waiting thread through [`Current::park_with`] and is meant for
//! sections that may block on I/O or on other threads.
//!
//! [`SpinLock`] and [`Mutex`] guards do **not** release on drop: the holder
//! must call `unlock()` explicitly, and forgetting to do so panics. This
//! keeps every lock hand-off visible in the code.
//!
//! [`Current::park_with`]: crate::thread::Current::park_with

pub mod condition_variable;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use condition_variable::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
