// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A mutex/condvar FIFO with configurable capacity (§4.O). `add` blocks
//! while full, `get` blocks while empty, and `shutdown` unblocks every
//! waiter on both sides so worker threads can notice and exit.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct State<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedQueue capacity must be positive");
        BoundedQueue {
            capacity,
            state: Mutex::new(State { items: VecDeque::new(), shutdown: false }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Pushes `item`, blocking while the queue is full. Returns `false`
    /// without pushing if the queue has been shut down, either before the
    /// call or while waiting for room.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return false;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            state = self.not_full.wait(state).unwrap();
        }
    }

    /// Pops the oldest item, blocking while the queue is empty. Returns
    /// `None` once the queue is shut down and drained.
    pub fn get(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if state.shutdown {
                return None;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Unblocks every waiter on both `add` and `get`. Idempotent and safe to
    /// call from any thread, any number of times; callers are expected to
    /// treat the first `false`/`None` they see as their cue to exit.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn add_then_get_round_trips() {
        let q = BoundedQueue::new(4);
        assert!(q.add(1));
        assert!(q.add(2));
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.get(), Some(2));
    }

    #[test]
    fn add_blocks_until_capacity_frees_up() {
        let q = Arc::new(BoundedQueue::new(1));
        assert!(q.add(1));

        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.add(2));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(q.get(), Some(1));
        assert!(handle.join().unwrap());
        assert_eq!(q.get(), Some(2));
    }

    #[test]
    fn shutdown_unblocks_a_waiting_get() {
        let q = Arc::new(BoundedQueue::<u32>::new(4));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.get());
        std::thread::sleep(Duration::from_millis(50));
        q.shutdown();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn shutdown_unblocks_a_waiting_add_and_rejects_new_ones() {
        let q = Arc::new(BoundedQueue::new(1));
        assert!(q.add(1));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.add(2));
        std::thread::sleep(Duration::from_millis(50));
        q.shutdown();
        assert!(!handle.join().unwrap());
        assert!(!q.add(3));
    }

    #[test]
    fn get_still_drains_items_queued_before_shutdown() {
        let q = BoundedQueue::new(4);
        assert!(q.add(1));
        q.shutdown();
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.get(), None);
    }
}
