// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Non-owning, sequence-checked references into objects that live on a
//! single thread (§4.D).
//!
//! The backing storage is `Arc<Mutex<..>>` rather than `Rc<RefCell<..>>` so
//! that a `WeakPtr` can be captured by a task posted from a *different*
//! thread (the common case: a producer-thread callback captures a weak
//! handle into a service-thread object). The mutex is never contended in
//! practice because every access is required to happen on the owning
//! thread; it exists only so the handle itself is `Send`. What actually
//! enforces single-threaded semantics is the thread-id check in
//! [`WeakPtr::with`].

use std::sync::{Arc, Mutex, Weak};
use tracehub_common::threading::get_current_thread_id;

struct Inner<T> {
    value: T,
    alive: bool,
}

/// Owns a `T` and hands out [`WeakPtr`]s into it. Must be created on the
/// thread that will own `T` for its whole lifetime.
pub struct WeakPtrFactory<T> {
    inner: Arc<Mutex<Inner<T>>>,
    owner_thread: i64,
}

impl<T> WeakPtrFactory<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { value, alive: true })),
            owner_thread: get_current_thread_id(),
        }
    }

    /// Returns a new non-owning handle. May be sent to any thread, but may
    /// only be dereferenced on the thread that created this factory.
    pub fn get_weak_ptr(&self) -> WeakPtr<T> {
        WeakPtr {
            inner: Arc::downgrade(&self.inner),
            owner_thread: self.owner_thread,
        }
    }

    /// Runs `f` with a reference to the owned value, from the owning
    /// thread or otherwise.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock().expect("weak_ptr_factory mutex poisoned");
        f(&guard.value)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().expect("weak_ptr_factory mutex poisoned");
        f(&mut guard.value)
    }
}

impl<T> Drop for WeakPtrFactory<T> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.alive = false;
        }
    }
}

/// A non-owning, thread-checked reference produced by [`WeakPtrFactory`].
#[derive(Clone)]
pub struct WeakPtr<T> {
    inner: Weak<Mutex<Inner<T>>>,
    owner_thread: i64,
}

impl<T> WeakPtr<T> {
    /// Runs `f` with a reference to the pointee, or returns `None` if the
    /// factory has been dropped.
    ///
    /// # Panics
    /// Panics if called from a thread other than the one that created the
    /// originating [`WeakPtrFactory`] — dereferencing a weak handle off its
    /// owning thread is a programmer error (§9).
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        assert_eq!(
            get_current_thread_id(),
            self.owner_thread,
            "WeakPtr dereferenced from a thread other than its factory's owner"
        );
        let strong = self.inner.upgrade()?;
        let guard = strong.lock().expect("weak_ptr mutex poisoned");
        if !guard.alive {
            return None;
        }
        Some(f(&guard.value))
    }

    /// Like [`WeakPtr::with`] but allows mutation.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        assert_eq!(
            get_current_thread_id(),
            self.owner_thread,
            "WeakPtr dereferenced from a thread other than its factory's owner"
        );
        let strong = self.inner.upgrade()?;
        let mut guard = strong.lock().expect("weak_ptr mutex poisoned");
        if !guard.alive {
            return None;
        }
        Some(f(&mut guard.value))
    }

    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .map(|s| s.lock().map(|g| g.alive).unwrap_or(false))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_ptr_resolves_while_factory_alive() {
        let factory = WeakPtrFactory::new(42u32);
        let weak = factory.get_weak_ptr();
        assert_eq!(weak.with(|v| *v), Some(42));
    }

    #[test]
    fn weak_ptr_is_cleared_when_factory_drops() {
        let factory = WeakPtrFactory::new(42u32);
        let weak = factory.get_weak_ptr();
        drop(factory);
        assert_eq!(weak.with(|v| *v), None);
        assert!(!weak.is_alive());
    }

    #[test]
    fn weak_ptr_can_cross_threads_before_use() {
        let factory = WeakPtrFactory::new(String::from("hello"));
        let weak = factory.get_weak_ptr();
        let moved = std::thread::spawn(move || weak).join().unwrap();
        // Still bound to the original (now-gone) owner thread: any
        // dereference from this thread must panic.
        let result = std::panic::catch_unwind(move || moved.with(|s| s.clone()));
        assert!(result.is_err());
        drop(factory);
    }

    #[test]
    fn mutation_is_visible() {
        let factory = WeakPtrFactory::new(0u32);
        let weak = factory.get_weak_ptr();
        weak.with_mut(|v| *v += 1);
        assert_eq!(weak.with(|v| *v), Some(1));
    }
}
