// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracing service core (§4.K): sessions, producers, commit-data
//! handling, the flush protocol, and buffer draining. Has no IPC
//! dependency of its own; `tracehub-ipc` and `tracehubd` wire this crate's
//! [`TracingServiceCore`] and [`producer::ProducerChannel`] to the wire.

pub mod config;
pub mod core;
pub mod ids;
pub mod producer;
pub mod session;

pub use core::{BufferStats, ChunkToMove, ChunkToPatch, StatsSnapshot, TracingServiceCore};
pub use producer::{Producer, ProducerChannel};
pub use session::TracingSession;
