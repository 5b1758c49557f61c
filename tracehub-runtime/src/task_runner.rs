// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A single-threaded cooperative scheduler (§4.C).
//!
//! Backed by a dedicated OS thread running a `current_thread` Tokio
//! runtime: because exactly one OS thread ever executes work for a given
//! runner, every task that runs on it observes a total order and a full
//! memory barrier relative to the task before it, with no extra
//! synchronization required — the property §5 calls out explicitly.
//! `post_task`/`post_delayed_task`/`add_file_descriptor_watch` may be
//! called from any thread; they only ever enqueue work, they never block
//! and never run the closure inline.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracehub_common::threading::get_current_thread_id;

type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Immediate(BoxedTask),
    Delayed(Duration, BoxedTask),
    Watch(RawFd, Box<dyn Fn() + Send + 'static>),
    Unwatch(RawFd),
    Shutdown,
}

/// A handle to a running task runner. Cheap to clone; every clone posts
/// onto the same underlying thread.
#[derive(Clone)]
pub struct TaskRunner {
    sender: mpsc::UnboundedSender<Job>,
}

struct RunnerThread {
    receiver: mpsc::UnboundedReceiver<Job>,
    watches: HashMap<RawFd, JoinHandle<()>>,
    watch_notify: mpsc::UnboundedSender<()>,
    watch_fired: mpsc::UnboundedReceiver<()>,
}

impl TaskRunner {
    /// Spawns a new task runner on a fresh OS thread and returns a handle
    /// to it. The thread lives until the handle (and every clone of it) is
    /// dropped, at which point the runner's receiver closes and its loop
    /// exits.
    pub fn spawn(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (watch_notify, watch_fired) = mpsc::unbounded_channel();
        let thread_name = name.into();

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let rt = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build current-thread runtime for task runner");
                tracing::debug!(runner = %thread_name, tid = get_current_thread_id(), "task runner thread started");
                rt.block_on(RunnerThread {
                    receiver,
                    watches: HashMap::new(),
                    watch_notify,
                    watch_fired,
                }
                .run());
            })
            .expect("failed to spawn task runner thread");

        TaskRunner { sender }
    }

    /// Posts a task to run as soon as the runner is free, in FIFO order
    /// relative to other immediate tasks.
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Job::Immediate(Box::new(task)));
    }

    /// Posts a task to run no earlier than `delay` from now.
    pub fn post_delayed_task(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Job::Delayed(delay, Box::new(task)));
    }

    /// Arms a callback that fires once each time `fd` becomes readable.
    /// Replacing an existing watch for the same `fd` is not supported;
    /// call [`TaskRunner::remove_file_descriptor_watch`] first.
    pub fn add_file_descriptor_watch(&self, fd: RawFd, callback: impl Fn() + Send + 'static) {
        let _ = self.sender.send(Job::Watch(fd, Box::new(callback)));
    }

    pub fn remove_file_descriptor_watch(&self, fd: RawFd) {
        let _ = self.sender.send(Job::Unwatch(fd));
    }

    /// Runs `fut` to completion on the runner thread and blocks the caller
    /// until it resolves. Used sparingly, for cross-thread synchronous
    /// handoffs (e.g. reading back state for a `dump()` RPC).
    pub fn post_task_and_wait<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.post_task(move || {
            let _ = tx.send(task());
        });
        rx.recv().ok()
    }
}

impl RunnerThread {
    async fn run(mut self) {
        loop {
            // One immediate, one delayed-due, then FD watches each
            // iteration: this bounds both immediate and delayed tasks from
            // starving each other (§4.C).
            let job = match self.receiver.recv().await {
                Some(job) => job,
                None => break,
            };
            match job {
                Job::Immediate(task) => task(),
                Job::Delayed(delay, task) => {
                    // Spawned as a separate task so the main loop keeps
                    // servicing other jobs while this one waits out its
                    // delay; it still only ever runs on this runner's OS
                    // thread because the enclosing runtime is current_thread.
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        task();
                    });
                }
                Job::Watch(fd, callback) => self.arm_watch(fd, callback),
                Job::Unwatch(fd) => {
                    if let Some(handle) = self.watches.remove(&fd) {
                        handle.abort();
                    }
                }
                Job::Shutdown => break,
            }
            // Drain any watch-fired notifications without blocking; the
            // watch tasks themselves invoke callbacks directly since they
            // already run pinned to this runner's single OS thread.
            while self.watch_fired.try_recv().is_ok() {}
        }
        for (_, handle) in self.watches.drain() {
            handle.abort();
        }
    }

    fn arm_watch(&mut self, fd: RawFd, callback: Box<dyn Fn() + Send + 'static>) {
        let notify = self.watch_notify.clone();
        let handle = tokio::spawn(async move {
            let async_fd = match AsyncFd::new(BorrowedRawFd(fd)) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(fd, error = %e, "failed to register fd watch");
                    return;
                }
            };
            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(g) => g,
                    Err(_) => break,
                };
                callback();
                guard.clear_ready();
                let _ = notify.send(());
            }
        });
        self.watches.insert(fd, handle);
    }
}

/// Wraps a raw fd for edge-triggered readability polling without taking
/// ownership of it (the caller's socket or file still owns the fd).
struct BorrowedRawFd(RawFd);

impl std::os::unix::io::AsRawFd for BorrowedRawFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn immediate_tasks_run_in_fifo_order() {
        let runner = TaskRunner::spawn("test-fifo");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            runner.post_task(move || order.lock().unwrap().push(i));
        }
        let result = runner.post_task_and_wait(move || order.lock().unwrap().clone());
        assert_eq!(result, Some(vec![0, 1, 2, 3, 4]));
    }

    #[test]
    fn tasks_run_on_a_single_thread() {
        let runner = TaskRunner::spawn("test-single-thread");
        let tid1 = runner.post_task_and_wait(get_current_thread_id).unwrap();
        let tid2 = runner.post_task_and_wait(get_current_thread_id).unwrap();
        assert_eq!(tid1, tid2);
        assert_ne!(tid1, get_current_thread_id());
    }

    #[test]
    fn delayed_task_runs_after_immediate_tasks() {
        let runner = TaskRunner::spawn("test-delayed");
        let counter = Arc::new(AtomicU32::new(0));
        let c1 = counter.clone();
        runner.post_delayed_task(Duration::from_millis(20), move || {
            c1.store(2, Ordering::SeqCst);
        });
        let c2 = counter.clone();
        runner.post_task(move || {
            c2.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .ok();
        });
        std::thread::sleep(Duration::from_millis(80));
        let result = runner.post_task_and_wait(move || counter.load(Ordering::SeqCst));
        assert_eq!(result, Some(2));
    }
}
