// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The three-stage pipeline (§4.O): hook intake feeds a fixed pool of
//! unwinder threads keyed by `pid % num_unwinders`, unwinders feed a single
//! bookkeeping thread, and frees skip straight to bookkeeping. Everything
//! between stages is a [`BoundedQueue`].

use crate::ahinfo::HeapId;
use crate::queue::BoundedQueue;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

pub struct UnwindingRecord {
    pub pid: u32,
    pub heap_id: HeapId,
    pub alloc_id: u64,
    pub size: u64,
    pub stack_bytes: Vec<u8>,
}

pub struct AllocRecord {
    pub pid: u32,
    pub heap_id: HeapId,
    pub alloc_id: u64,
    pub size: u64,
    pub frames: Vec<u64>,
}

pub struct FreeRecord {
    pub pid: u32,
    pub heap_id: HeapId,
    pub alloc_id: u64,
}

enum BookkeepingRecord {
    Alloc(AllocRecord),
    Free(FreeRecord),
}

/// Unwinds a sampled allocation's captured stack against the target
/// process's `/proc/<pid>/maps`/`/proc/<pid>/mem`. Implemented by whatever
/// holds the per-process FDs handed over on first connect; this crate only
/// sequences the calls.
pub trait StackUnwinder: Send + Sync {
    fn unwind(&self, pid: u32, stack_bytes: &[u8]) -> Vec<u64>;
}

/// Receives fully processed records from the bookkeeping thread. Owns the
/// per-process call-stack tree and live-heap map; out of scope for this
/// crate beyond the trait boundary.
pub trait BookkeepingSink: Send + Sync {
    fn record_alloc(&self, record: AllocRecord);
    fn record_free(&self, record: FreeRecord);
}

/// Wires the three stages together and owns every worker thread. Dropping
/// a `Pipeline` does not itself stop the threads; call [`Pipeline::shutdown`]
/// first, the same explicit-teardown discipline
/// [`tracehub_service::TracingServiceCore::disable_tracing`] uses.
pub struct Pipeline {
    unwinder_queues: Vec<Arc<BoundedQueue<UnwindingRecord>>>,
    bookkeeping_queue: Arc<BoundedQueue<BookkeepingRecord>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawns `num_unwinders` unwinder threads (§4.O: typically 5) and one
    /// bookkeeping thread, each bounded to `queue_capacity` records.
    pub fn start(
        num_unwinders: usize,
        queue_capacity: usize,
        unwinder: Arc<dyn StackUnwinder>,
        sink: Arc<dyn BookkeepingSink>,
    ) -> Arc<Pipeline> {
        assert!(num_unwinders > 0, "pipeline needs at least one unwinder thread");

        let bookkeeping_queue = Arc::new(BoundedQueue::new(queue_capacity));
        let mut unwinder_queues = Vec::with_capacity(num_unwinders);
        let mut threads = Vec::with_capacity(num_unwinders + 1);

        for _ in 0..num_unwinders {
            let queue: Arc<BoundedQueue<UnwindingRecord>> = Arc::new(BoundedQueue::new(queue_capacity));
            unwinder_queues.push(queue.clone());
            let unwinder = unwinder.clone();
            let bookkeeping_queue = bookkeeping_queue.clone();
            threads.push(std::thread::spawn(move || unwinder_loop(queue, unwinder, bookkeeping_queue)));
        }

        {
            let bookkeeping_queue = bookkeeping_queue.clone();
            threads.push(std::thread::spawn(move || bookkeeping_loop(bookkeeping_queue, sink)));
        }

        Arc::new(Pipeline { unwinder_queues, bookkeeping_queue, threads: Mutex::new(threads) })
    }

    /// Submits a sampled allocation to the unwinder queue keyed by
    /// `pid % num_unwinders`, so every allocation from a given process
    /// always unwinds on the same thread. Returns `false` if the pipeline
    /// has already been shut down.
    pub fn submit_allocation(&self, pid: u32, heap_id: HeapId, alloc_id: u64, size: u64, stack_bytes: Vec<u8>) -> bool {
        let idx = pid as usize % self.unwinder_queues.len();
        self.unwinder_queues[idx].add(UnwindingRecord { pid, heap_id, alloc_id, size, stack_bytes })
    }

    /// Submits a free record directly to the bookkeeping queue, skipping
    /// unwinding entirely (§4.O).
    pub fn submit_free(&self, pid: u32, heap_id: HeapId, alloc_id: u64) -> bool {
        self.bookkeeping_queue.add(BookkeepingRecord::Free(FreeRecord { pid, heap_id, alloc_id }))
    }

    /// Shuts down every queue and joins every worker thread, in the order
    /// §4.O specifies: shut down queues first (unblocking any waiter), then
    /// join.
    pub fn shutdown(&self) {
        for queue in &self.unwinder_queues {
            queue.shutdown();
        }
        self.bookkeeping_queue.shutdown();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn unwinder_loop(
    queue: Arc<BoundedQueue<UnwindingRecord>>,
    unwinder: Arc<dyn StackUnwinder>,
    bookkeeping_queue: Arc<BoundedQueue<BookkeepingRecord>>,
) {
    while let Some(record) = queue.get() {
        let frames = unwinder.unwind(record.pid, &record.stack_bytes);
        let alloc = AllocRecord { pid: record.pid, heap_id: record.heap_id, alloc_id: record.alloc_id, size: record.size, frames };
        if !bookkeeping_queue.add(BookkeepingRecord::Alloc(alloc)) {
            break;
        }
    }
}

fn bookkeeping_loop(queue: Arc<BoundedQueue<BookkeepingRecord>>, sink: Arc<dyn BookkeepingSink>) {
    while let Some(record) = queue.get() {
        match record {
            BookkeepingRecord::Alloc(alloc) => sink.record_alloc(alloc),
            BookkeepingRecord::Free(free) => sink.record_free(free),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct IdentityUnwinder;
    impl StackUnwinder for IdentityUnwinder {
        fn unwind(&self, _pid: u32, stack_bytes: &[u8]) -> Vec<u64> {
            stack_bytes.iter().map(|b| *b as u64).collect()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        allocs: StdMutex<Vec<AllocRecord>>,
        frees: StdMutex<Vec<FreeRecord>>,
    }

    impl BookkeepingSink for RecordingSink {
        fn record_alloc(&self, record: AllocRecord) {
            self.allocs.lock().unwrap().push(record);
        }

        fn record_free(&self, record: FreeRecord) {
            self.frees.lock().unwrap().push(record);
        }
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !check() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn allocation_flows_through_unwinding_into_bookkeeping() {
        let unwinder = Arc::new(IdentityUnwinder);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(2, 8, unwinder, sink.clone());

        assert!(pipeline.submit_allocation(42, HeapId(0), 1, 128, vec![1, 2, 3]));
        wait_until(|| !sink.allocs.lock().unwrap().is_empty());

        let allocs = sink.allocs.lock().unwrap();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].frames, vec![1, 2, 3]);
        drop(allocs);
        pipeline.shutdown();
    }

    #[test]
    fn free_bypasses_unwinding() {
        let unwinder = Arc::new(IdentityUnwinder);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(2, 8, unwinder, sink.clone());

        assert!(pipeline.submit_free(42, HeapId(0), 1));
        wait_until(|| !sink.frees.lock().unwrap().is_empty());
        assert_eq!(sink.frees.lock().unwrap().len(), 1);
        pipeline.shutdown();
    }

    #[test]
    fn same_pid_always_routes_to_the_same_unwinder_queue() {
        let unwinder = Arc::new(IdentityUnwinder);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(4, 8, unwinder, sink);
        let idx_a = 42usize % pipeline.unwinder_queues.len();
        let idx_b = 42usize % pipeline.unwinder_queues.len();
        assert_eq!(idx_a, idx_b);
        pipeline.shutdown();
    }

    #[test]
    fn shutdown_stops_accepting_new_work() {
        let unwinder = Arc::new(IdentityUnwinder);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(1, 8, unwinder, sink);
        pipeline.shutdown();
        assert!(!pipeline.submit_free(1, HeapId(0), 1));
    }
}
