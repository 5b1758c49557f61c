// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The embedded client runtime (§4.N): `init_session`, the three
//! `report_*` hooks, and the atfork handler that reclaims the spinlock and
//! disables every heap in a forked child.

use crate::ahinfo::{HeapId, HeapTable, SessionInfo};
use crate::spinlock::Spinlock;
use std::sync::{Arc, OnceLock, Once};

/// The bound on spin attempts before a `report_*` call gives up and aborts
/// (§4.N: failure after the bound signals corruption, not contention).
const REPORT_SPIN_BOUND: usize = 1_000;

/// Where `report_*` forwards sampled records. Implemented by whatever wires
/// this crate's client runtime to the three-stage pipeline in
/// [`crate::pipeline`]; kept as a trait so the spinlock/sampling logic here
/// is testable without a running pipeline.
pub trait RecordSink: Send + Sync {
    fn report_allocation(&self, heap_id: HeapId, alloc_id: u64, sampled_size: u64);
    fn report_free(&self, heap_id: HeapId, alloc_id: u64);
}

struct ActiveSession {
    sink: Arc<dyn RecordSink>,
}

/// Global per-process state: the heap table and the currently active
/// session, if any. A process has exactly one of these; construct it once
/// via [`ClientRuntime::global`].
pub struct ClientRuntime {
    heaps: Arc<HeapTable>,
    session: Spinlock<Option<ActiveSession>>,
    atfork_installed: Once,
}

static GLOBAL: OnceLock<Arc<ClientRuntime>> = OnceLock::new();

impl ClientRuntime {
    fn new(heaps: Arc<HeapTable>) -> Self {
        ClientRuntime { heaps, session: Spinlock::new(None), atfork_installed: Once::new() }
    }

    /// Returns the process-wide runtime, constructing it (and its heap
    /// table) on first call.
    pub fn global() -> Arc<ClientRuntime> {
        GLOBAL.get_or_init(|| Arc::new(ClientRuntime::new(Arc::new(HeapTable::new())))).clone()
    }

    pub fn heaps(&self) -> &Arc<HeapTable> {
        &self.heaps
    }

    /// Idempotent per process: returns `true` whether this call started the
    /// session or one was already active. Installs the atfork handler on
    /// first call, ever.
    pub fn init_session(self: &Arc<Self>, sink: Arc<dyn RecordSink>, sampling_interval_bytes: u64) -> bool {
        self.install_atfork_handler_once();

        let mut guard = self.session.lock();
        if guard.is_some() {
            return true;
        }
        *guard = Some(ActiveSession { sink });
        drop(guard);

        self.heaps.enable_all(&SessionInfo { sampling_interval_bytes });
        true
    }

    fn install_atfork_handler_once(self: &Arc<Self>) {
        self.atfork_installed.call_once(|| {
            // The singleton this handler reaches for at fork time; `global()`
            // always returns the same instance, so storing `self` here isn't
            // necessary as long as this is only ever called on the global
            // instance (it is: `init_session` is only reachable through
            // `ClientRuntime::global()`).
            // SAFETY: pthread_atfork's child handler runs with exactly one
            // thread alive (the one that called fork), so calling back into
            // `GLOBAL` here never races another thread.
            unsafe {
                libc::pthread_atfork(None, None, Some(atfork_child_handler));
            }
        });
    }

    /// Runs in the post-fork child (§4.N): resets the spinlock, disables
    /// every heap (firing `on_disable`), and drops the active session
    /// without running its destructor logic that would assume a live
    /// multi-threaded process — by design, this deliberately leaks whatever
    /// state other threads were holding through the old session, since
    /// those threads no longer exist in the child and can never clean up
    /// after themselves.
    fn handle_post_fork_child(&self) {
        // SAFETY: we are the one surviving thread immediately after fork;
        // no other thread can hold this lock concurrently.
        unsafe { self.session.force_unlock() };
        self.heaps.disable_all();
        let mut guard = self.session.lock();
        let leaked = std::mem::take(&mut *guard);
        std::mem::forget(leaked);
    }

    /// Samples and forwards an allocation record if a session is active and
    /// the heap is enabled. Returns `false` (never records) if no session
    /// is active or the heap didn't choose to sample this allocation;
    /// aborts the process if the spinlock can't be acquired within the
    /// bound (§4.N).
    pub fn report_allocation(&self, heap_id: HeapId, alloc_id: u64, size: u64) -> bool {
        let Some(guard) = self.session.try_lock_bounded(REPORT_SPIN_BOUND) else {
            tracing::error!(alloc_id, size, "failed to acquire client spinlock within bound, aborting");
            std::process::abort();
        };
        let Some(session) = guard.as_ref() else {
            return false;
        };
        let Some(sampled_size) = self.heaps.sample(heap_id, size) else {
            return false;
        };
        session.sink.report_allocation(heap_id, alloc_id, sampled_size);
        true
    }

    pub fn report_free(&self, heap_id: HeapId, alloc_id: u64) {
        let Some(guard) = self.session.try_lock_bounded(REPORT_SPIN_BOUND) else {
            tracing::error!(alloc_id, "failed to acquire client spinlock within bound, aborting");
            std::process::abort();
        };
        let Some(session) = guard.as_ref() else {
            return;
        };
        session.sink.report_free(heap_id, alloc_id);
    }
}

extern "C" fn atfork_child_handler() {
    if let Some(runtime) = GLOBAL.get() {
        runtime.handle_post_fork_child();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        allocations: StdMutex<Vec<(u64, u64)>>,
        frees: StdMutex<Vec<u64>>,
    }

    impl RecordSink for RecordingSink {
        fn report_allocation(&self, _heap_id: HeapId, alloc_id: u64, sampled_size: u64) {
            self.allocations.lock().unwrap().push((alloc_id, sampled_size));
        }

        fn report_free(&self, _heap_id: HeapId, alloc_id: u64) {
            self.frees.lock().unwrap().push(alloc_id);
        }
    }

    fn fresh_runtime() -> (Arc<ClientRuntime>, HeapId) {
        let heaps = Arc::new(HeapTable::new());
        let heap_id = heaps.register("test-heap", 1, None, None).unwrap();
        (Arc::new(ClientRuntime::new(heaps)), heap_id)
    }

    #[test]
    fn report_allocation_without_a_session_is_a_no_op() {
        let (runtime, heap_id) = fresh_runtime();
        assert!(!runtime.report_allocation(heap_id, 1, 128));
    }

    #[test]
    fn init_session_enables_heaps_and_allows_reporting() {
        let (runtime, heap_id) = fresh_runtime();
        let sink = Arc::new(RecordingSink::default());
        assert!(runtime.init_session(sink.clone(), 1));
        assert!(runtime.heaps().is_enabled(heap_id));

        runtime.report_allocation(heap_id, 7, 256);
        runtime.report_free(heap_id, 7);
        assert_eq!(sink.allocations.lock().unwrap().len(), 1);
        assert_eq!(sink.frees.lock().unwrap(), &[7]);
    }

    #[test]
    fn init_session_is_idempotent() {
        let (runtime, _heap_id) = fresh_runtime();
        let sink_a = Arc::new(RecordingSink::default());
        let sink_b = Arc::new(RecordingSink::default());
        assert!(runtime.init_session(sink_a, 1));
        assert!(runtime.init_session(sink_b.clone(), 1));

        // The second sink never became active; only the first session's sink
        // receives reports.
        let heap_id = runtime.heaps().register("second", 1, None, None).unwrap();
        runtime.report_allocation(heap_id, 1, 10);
        assert!(sink_b.allocations.lock().unwrap().is_empty());
    }

    #[test]
    fn post_fork_child_handler_disables_heaps_and_drops_session() {
        let (runtime, heap_id) = fresh_runtime();
        let sink = Arc::new(RecordingSink::default());
        runtime.init_session(sink, 1);
        assert!(runtime.heaps().is_enabled(heap_id));

        runtime.handle_post_fork_child();

        assert!(!runtime.heaps().is_enabled(heap_id));
        assert!(!runtime.report_allocation(heap_id, 1, 10));
    }
}
