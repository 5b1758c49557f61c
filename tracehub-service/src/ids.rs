// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The identifier spaces §3 calls out: `TracingSessionID` and
//! `DataSourceInstanceID` are per-service monotonic counters;
//! `DataSourceID` names a registration, not an instance.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TracingSessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DataSourceInstanceId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ProducerId(pub u16);

/// Identifies the IPC connection driving a tracing session, assigned by
/// whatever wires this crate to `tracehub-ipc` (a consumer never mints its
/// own id). Used to enforce "a consumer can drive at most one session"
/// (§4.K.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConsumerId(pub u64);

/// Globally unique across all active sessions, minted from a bitmap
/// allocator of size `kMaxTraceBufferID` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BufferId(pub u16);

pub const K_MAX_TRACE_BUFFER_ID: usize = 1024;

/// A per-service monotonic counter minting one id space. Never wraps in
/// practice (§3: these counters are per-process-lifetime, not persisted).
#[derive(Debug, Default)]
pub struct IdCounter(AtomicU64);

impl IdCounter {
    pub fn new() -> Self {
        IdCounter(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_starts_at_one_and_is_monotonic() {
        let c = IdCounter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.next(), 3);
    }
}
