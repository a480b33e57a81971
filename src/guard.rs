use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use tracing::trace;

/// Process-wide mutual exclusion for the plugin interface.
///
/// Every entry point runs inside this guard, so at most one logical engine
/// operation is in flight at a time. Unlike a plain mutex guard, the lock can
/// be released and reacquired by the same call frame that currently holds it:
/// the callback bridges release it for the whole window a host callback runs,
/// then take it back before returning control to the engine. The scoped
/// wrapper ([`InterfaceGuard::scoped`]) covers the common acquire-on-entry /
/// release-on-exit case including early returns.
///
/// Acquisition never times out and never fails; contention blocks the calling
/// thread. There is no ownership check: the release-before-calling-out
/// discipline of the bridges is what keeps reentrant host calls deadlock-free.
pub struct InterfaceGuard {
    held: Mutex<bool>,
    freed: Condvar,
    acquisitions: AtomicU64,
}

impl InterfaceGuard {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(false),
            freed: Condvar::new(),
            acquisitions: AtomicU64::new(0),
        }
    }

    /// Blocks until exclusive ownership is obtained.
    pub fn acquire(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = self
                .freed
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        trace!("interface guard acquired");
    }

    /// Relinquishes ownership and wakes one waiter.
    pub fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(*held, "released an interface guard nobody holds");
        *held = false;
        drop(held);
        self.freed.notify_one();
        trace!("interface guard released");
    }

    /// Acquires the guard and returns a token that releases it on drop.
    pub fn scoped(&self) -> InterfaceLock<'_> {
        self.acquire();
        InterfaceLock { guard: self }
    }

    /// Whether any call frame currently holds the guard.
    pub fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total number of times the guard has been acquired, scoped or not.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

impl Default for InterfaceGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope token for [`InterfaceGuard::scoped`].
pub struct InterfaceLock<'a> {
    guard: &'a InterfaceGuard,
}

impl Drop for InterfaceLock<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn scoped_releases_on_drop() {
        let guard = InterfaceGuard::new();
        {
            let _lock = guard.scoped();
            assert!(guard.is_held());
        }
        assert!(!guard.is_held());
        assert_eq!(guard.acquisitions(), 1);
    }

    #[test]
    fn release_reacquire_within_scope() {
        let guard = InterfaceGuard::new();
        let _lock = guard.scoped();
        guard.release();
        assert!(!guard.is_held());
        guard.acquire();
        assert!(guard.is_held());
        assert_eq!(guard.acquisitions(), 2);
    }

    #[test]
    fn contention_blocks_until_released() {
        let guard = Arc::new(InterfaceGuard::new());
        guard.acquire();
        let worker = {
            let guard = Arc::clone(&guard);
            std::thread::spawn(move || {
                let _lock = guard.scoped();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!worker.is_finished());
        guard.release();
        worker.join().unwrap();
        assert!(!guard.is_held());
    }
}
