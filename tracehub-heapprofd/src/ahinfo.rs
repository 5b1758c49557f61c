// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The global heap registration table (§4.N): up to 256 named heaps, each
//! with its own enable/disable callbacks and sampler. Registered once per
//! heap (typically at process startup, by whatever embeds this crate's
//! hooks), then enabled/disabled as a whole whenever a profiling session
//! starts or the atfork handler tears one down.

use crate::sampler::PoissonSampler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracehub_common::error::FfiSafeErrorMessage;

/// The maximum number of heaps `init_session` and the client runtime will
/// track, mirroring the original implementation's fixed-size table.
pub const MAX_HEAPS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapTableError {
    #[error("heap table is full ({MAX_HEAPS} heaps already registered)")]
    Full,
}

impl FfiSafeErrorMessage for HeapTableError {
    fn as_static_str(&self) -> &'static str {
        match self {
            Self::Full => "heap table is full",
        }
    }
}

/// A newtype index into the heap table, handed back by `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(pub usize);

/// Passed to a heap's `on_enable` callback: the sampling interval this
/// session wants applied, and whatever else a real session config would
/// carry (kept minimal here since the client runtime does not itself parse
/// `TraceConfig`; that happens service-side).
pub struct SessionInfo {
    pub sampling_interval_bytes: u64,
}

type EnableCallback = Box<dyn Fn(&SessionInfo) + Send + Sync>;
type DisableCallback = Box<dyn Fn() + Send + Sync>;

pub struct AHeapInfo {
    pub name: String,
    on_enable: Option<EnableCallback>,
    on_disable: Option<DisableCallback>,
    sampler: Mutex<PoissonSampler>,
    enabled: AtomicBool,
}

impl AHeapInfo {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Samples one allocation of `size` bytes against this heap's sampler.
    /// Always `None` if the heap isn't currently enabled.
    pub fn sample(&self, size: u64) -> Option<u64> {
        if !self.is_enabled() {
            return None;
        }
        self.sampler.lock().unwrap().sample(size)
    }

    fn enable(&self, session: &SessionInfo) {
        self.enabled.store(true, Ordering::Release);
        if let Some(cb) = &self.on_enable {
            cb(session);
        }
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        if let Some(cb) = &self.on_disable {
            cb();
        }
    }
}

/// The process-wide heap table. Registration is expected to happen before
/// any profiling session starts; the table itself never shrinks, so a
/// `HeapId` stays valid for the life of the process.
#[derive(Default)]
pub struct HeapTable {
    heaps: Mutex<Vec<AHeapInfo>>,
}

impl HeapTable {
    pub fn new() -> Self {
        HeapTable { heaps: Mutex::new(Vec::new()) }
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        sampling_interval_bytes: u64,
        on_enable: Option<EnableCallback>,
        on_disable: Option<DisableCallback>,
    ) -> Result<HeapId, HeapTableError> {
        let mut heaps = self.heaps.lock().unwrap();
        if heaps.len() >= MAX_HEAPS {
            return Err(HeapTableError::Full);
        }
        heaps.push(AHeapInfo {
            name: name.into(),
            on_enable,
            on_disable,
            sampler: Mutex::new(PoissonSampler::new(sampling_interval_bytes)),
            enabled: AtomicBool::new(false),
        });
        Ok(HeapId(heaps.len() - 1))
    }

    pub fn len(&self) -> usize {
        self.heaps.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample(&self, heap_id: HeapId, size: u64) -> Option<u64> {
        let heaps = self.heaps.lock().unwrap();
        heaps.get(heap_id.0).and_then(|heap| heap.sample(size))
    }

    pub fn is_enabled(&self, heap_id: HeapId) -> bool {
        let heaps = self.heaps.lock().unwrap();
        heaps.get(heap_id.0).is_some_and(AHeapInfo::is_enabled)
    }

    /// Enables every registered heap, firing each one's `on_enable` outside
    /// this function's own lock scope so a callback calling back into this
    /// table (e.g. to register another heap) doesn't deadlock.
    pub fn enable_all(&self, session: &SessionInfo) {
        let heaps = self.heaps.lock().unwrap();
        for heap in heaps.iter() {
            heap.enable(session);
        }
    }

    /// Disables every registered heap, firing each one's `on_disable`. Used
    /// both for an ordinary session teardown and by the post-fork child
    /// handler (§4.N).
    pub fn disable_all(&self) {
        let heaps = self.heaps.lock().unwrap();
        for heap in heaps.iter() {
            heap.disable();
        }
    }
}
