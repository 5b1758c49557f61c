// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

#[async_trait::async_trait]
pub trait Worker {
    /// Main worker function.
    async fn run(&mut self);

    /// Called between each `run` to wait for the next run.
    async fn trigger(&mut self);

    /// Alternative trigger called on start, to allow a first run right away.
    /// Defaults to `trigger`'s behavior.
    async fn initial_trigger(&mut self) {
        self.trigger().await
    }

    /// Hook called when the owning process is shutting down.
    fn shutdown(&mut self) {}
}

#[async_trait]
impl Worker for Box<dyn Worker + Send + Sync> {
    async fn run(&mut self) {
        (**self).run().await
    }

    async fn trigger(&mut self) {
        (**self).trigger().await
    }

    async fn initial_trigger(&mut self) {
        (**self).initial_trigger().await
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}
