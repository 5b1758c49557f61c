// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bridges the async IPC world to [`TracingServiceCore`], which is meant
//! to run on exactly one `TaskRunner` thread (§4.C/§4.K). Grounded on the
//! `Arc<Mutex<...>>`-around-single-owner-thread-state shape
//! `tracehub_ftrace::FtraceController` already uses for the same reason:
//! the mutex is never contended in practice (every access is serialized
//! through `post_task`), it just lets the state be `Send` across the
//! closures `TaskRunner::spawn` requires.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracehub_runtime::TaskRunner;
use tracehub_service::TracingServiceCore;

#[derive(Clone)]
pub struct ServiceHandle {
    runner: TaskRunner,
    core: Arc<Mutex<TracingServiceCore>>,
}

impl ServiceHandle {
    pub fn new(runner: TaskRunner) -> Self {
        ServiceHandle {
            runner,
            core: Arc::new(Mutex::new(TracingServiceCore::new())),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Runs `f` against the core on the service's own task-runner thread
    /// and awaits the result. `post_task_and_wait` itself blocks a thread,
    /// so it's wrapped in `spawn_blocking` here to avoid starving a tokio
    /// worker thread that might be servicing other IPC connections.
    pub async fn with_core<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut TracingServiceCore) -> T + Send + 'static,
    {
        let core = self.core.clone();
        let runner = self.runner.clone();
        tokio::task::spawn_blocking(move || {
            runner
                .post_task_and_wait(move || f(&mut core.lock().expect("service core mutex poisoned")))
                .expect("service task runner is still alive")
        })
        .await
        .expect("with_core blocking task panicked")
    }

    /// Schedules `f` to run against the core on the runner thread after
    /// `delay`, without waiting for a result (§4.K.1's `duration_ms`
    /// auto-disable and periodic file-drain tasks).
    pub fn post_delayed_with_core<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(&mut TracingServiceCore) + Send + 'static,
    {
        let core = self.core.clone();
        self.runner.post_delayed_task(delay, move || {
            f(&mut core.lock().expect("service core mutex poisoned"));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_core_runs_on_the_service_runner_thread() {
        let handle = ServiceHandle::new(TaskRunner::spawn("test-service-core"));
        let count = handle.with_core(|core| core.producer_count()).await;
        assert_eq!(count, 0);
    }
}
