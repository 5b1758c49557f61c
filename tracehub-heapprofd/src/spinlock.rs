// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A minimal spinlock protecting the client runtime's global state (§4.N).
//! Used instead of `std::sync::Mutex` because the hot path (`report_*`)
//! needs a bounded try-acquire that gives up after a fixed number of spins
//! rather than parking the thread, and the atfork handler needs to force
//! the lock back to unlocked state with no cooperation from whoever held
//! it (they don't exist in the post-fork child).

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `SpinGuard`,
// acquired by winning the `locked` CAS; this gives the same exclusivity
// guarantee a `Mutex<T>` does.
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub fn new(data: T) -> Self {
        Spinlock { locked: AtomicBool::new(false), data: UnsafeCell::new(data) }
    }

    /// Blocks until the lock is acquired. Used for the cold paths
    /// (`init_session`, the atfork handler), never from `report_*`.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        loop {
            if self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                return SpinGuard { lock: self };
            }
            std::hint::spin_loop();
        }
    }

    /// Spins at most `max_spins` times before giving up. `report_*` use
    /// this; a `None` here is fatal for the caller, per §4.N ("spinlock
    /// acquisition failure after the bounded spin is fatal: it signals
    /// memory corruption or a runaway producer").
    pub fn try_lock_bounded(&self, max_spins: usize) -> Option<SpinGuard<'_, T>> {
        for _ in 0..max_spins {
            if self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                return Some(SpinGuard { lock: self });
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Forces the lock back to unlocked state regardless of who (if anyone)
    /// currently holds it. Only safe to call from the post-fork child,
    /// where the only thread that survived the fork is the one calling
    /// this, so no other thread can be mid-access to `data`.
    ///
    /// # Safety
    /// The caller must guarantee no other thread holding this lock (or a
    /// reference derived from it) still runs concurrently with the caller.
    pub unsafe fn force_unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a `SpinGuard` means we won the CAS in `lock`/
        // `try_lock_bounded` and haven't dropped it yet.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `Deref`; `&mut self` here excludes aliasing this guard.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_grants_exclusive_access() {
        let lock = Spinlock::new(0);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_bounded_fails_while_already_held() {
        let lock = Arc::new(Spinlock::new(0));
        let _guard = lock.lock();
        assert!(lock.try_lock_bounded(8).is_none());
    }

    #[test]
    fn try_lock_bounded_succeeds_once_released() {
        let lock = Spinlock::new(0);
        {
            let _guard = lock.lock();
        }
        assert!(lock.try_lock_bounded(8).is_some());
    }

    #[test]
    fn force_unlock_recovers_from_a_stuck_lock() {
        let lock = Spinlock::new(5);
        let guard = lock.lock();
        std::mem::forget(guard);
        assert!(lock.try_lock_bounded(4).is_none());
        // SAFETY: test simulates the post-fork scenario where the holder no
        // longer exists to release it itself.
        unsafe { lock.force_unlock() };
        assert_eq!(*lock.lock(), 5);
    }
}
