// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The embedded heap profiler client runtime (§4.N/§4.O): the global heap
//! table and spinlocked session state processes carry once `init_session`
//! is called, the hook-intake/unwinder/bookkeeping pipeline, and the
//! process matcher that maps consumer selectors to live processes. Has no
//! IPC dependency of its own; `tracehubd`/the producer side of
//! `tracehub-ipc` implement [`client::RecordSink`] to connect a session to
//! the rest of the system.

pub mod ahinfo;
pub mod client;
pub mod pipeline;
pub mod process_matcher;
pub mod queue;
pub mod sampler;
pub mod spinlock;

pub use ahinfo::{HeapId, HeapTable, HeapTableError, SessionInfo};
pub use client::{ClientRuntime, RecordSink};
pub use pipeline::{AllocRecord, BookkeepingSink, FreeRecord, Pipeline, StackUnwinder, UnwindingRecord};
pub use process_matcher::{MatchDelegate, Process, ProcessHandle, ProcessMatcher, ProcessSetSpec, ProcessSetSpecHandle, SetId};
pub use queue::BoundedQueue;
pub use sampler::PoissonSampler;
pub use spinlock::Spinlock;
