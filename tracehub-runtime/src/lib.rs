// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded cooperative task runner (§4.C), weak-handle utility
//! (§4.D) and watchdog (§4.E). Each producer, the service, and each consumer
//! anchors its state to exactly one `TaskRunner`; cross-thread hand-offs
//! happen only by posting a task onto another runner.

pub mod task_runner;
pub mod watchdog;
pub mod weak_ptr;

pub use task_runner::TaskRunner;
pub use watchdog::Watchdog;
pub use weak_ptr::{WeakPtr, WeakPtrFactory};
