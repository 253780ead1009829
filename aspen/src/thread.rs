//! Kernel threads.
//!
//! AspenOS subsystems create threads through [`ThreadBuilder`] and block
//! through [`Current::park_with`]. A parked thread sleeps until some other
//! thread calls [`ParkHandle::unpark`] on the handle it published: the
//! primitive the sleeping locks in [`crate::sync`] are built from.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::KernelError;

/// The handle to wake up a parked thread.
///
/// Produced inside [`Current::park_with`] and consumed by the single waker;
/// waking is one-shot.
pub struct ParkHandle {
    thread: std::thread::Thread,
    woken: Arc<AtomicBool>,
}

impl ParkHandle {
    /// Wakes up the thread that published this handle.
    pub fn unpark(self) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Operations on the current thread.
pub struct Current;

impl Current {
    /// Parks the current thread after running `f` with the wake-up handle.
    ///
    /// `f` runs *before* the thread sleeps; it is the caller's window to
    /// publish the handle (e.g. push it on a waiter queue) and release the
    /// locks the waker will need. The thread then sleeps until the handle is
    /// consumed by [`ParkHandle::unpark`]; spurious OS wake-ups are absorbed.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let woken = Arc::new(AtomicBool::new(false));
        f(ParkHandle {
            thread: std::thread::current(),
            woken: Arc::clone(&woken),
        });
        while !woken.load(Ordering::Acquire) {
            std::thread::park();
        }
    }
}

/// An owned permission to join on a thread.
pub struct JoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle {
    /// Waits for the associated thread to finish.
    pub fn join(self) {
        let _ = self.0.join();
    }
}

/// A builder for kernel threads.
///
/// ```
/// use aspen::thread::ThreadBuilder;
///
/// ThreadBuilder::new("worker").spawn(|| { /* ... */ }).join();
/// ```
pub struct ThreadBuilder {
    name: String,
}

impl ThreadBuilder {
    /// Creates a new builder for a thread named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Spawns the thread. Panics if the host refuses to create it.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        self.try_spawn(thread_fn)
            .expect("failed to spawn kernel thread")
    }

    /// Spawns the thread, reporting failure instead of panicking.
    ///
    /// Best-effort helpers (cache read-ahead) use this so that resource
    /// exhaustion degrades service instead of taking the kernel down.
    pub fn try_spawn<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        std::thread::Builder::new()
            .name(self.name)
            .spawn(thread_fn)
            .map(JoinHandle)
            .map_err(|_| KernelError::NotSupportedOperation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SpinLock;

    #[test]
    fn park_then_unpark() {
        let slot: Arc<SpinLock<Option<ParkHandle>>> = Arc::new(SpinLock::new(None));
        let publisher = Arc::clone(&slot);
        let joiner = ThreadBuilder::new("parker").spawn(move || {
            Current::park_with(|handle| {
                let mut guard = publisher.lock();
                *guard = Some(handle);
                guard.unlock();
            });
        });
        // Busy-wait for the handle to be published, then wake the thread.
        let handle = loop {
            let mut guard = slot.lock();
            if let Some(handle) = guard.take() {
                guard.unlock();
                break handle;
            }
            guard.unlock();
            std::thread::yield_now();
        };
        handle.unpark();
        joiner.join();
    }
}
