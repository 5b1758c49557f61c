// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `tracehubd`: the central tracing service daemon (§4). Owns one
//! `TracingServiceCore` on a dedicated `TaskRunner` thread, and exposes it
//! to producers and consumers over two separate UNIX-socket IPC surfaces.

pub mod config;
pub mod consumer_port;
pub mod core_handle;
pub mod file_drain;
pub mod producer_port;
pub mod producer_registry;
pub mod wire;
