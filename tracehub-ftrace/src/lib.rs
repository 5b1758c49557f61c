// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ftrace controller (§4.M): per-CPU `trace_pipe_raw` draining and the
//! kmem-pressure trigger, plus the `/proc/<pid>/stat` parser the process
//! matcher needs to resolve a pid's `comm`. Has no IPC dependency of its
//! own, the same way `tracehub-service` doesn't; whatever wires a producer
//! connection to this controller implements [`controller::FtraceSink`].

pub mod controller;
pub mod proc_stat;
pub mod procfs;

pub use controller::{FtraceController, FtraceSink, TriggerDebouncer};
pub use proc_stat::{parse_stat, ProcStat, ProcStatError};
pub use procfs::{FakeFtraceProcfs, FtraceProcfs, RealFtraceProcfs};
