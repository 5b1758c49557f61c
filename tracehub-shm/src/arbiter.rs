// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-side shared-memory arbiter (§4.G): hands out free chunks to
//! trace writers, batches completed chunks into commit-data RPCs, and
//! drives the producer side of the flush protocol.

use crate::smb::SharedMemoryBuffer;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub type FlushRequestId = u64;
pub type WriterId = u16;

/// What happens when no chunk is free at acquire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Return `None`; the caller drops the write (§4.G.1 "drop-on-full").
    DropOnFull,
    /// Block the caller until a chunk frees up. Modeled here as a hint the
    /// caller polls on; the arbiter has no blocking primitive of its own
    /// since callers run on task-runner threads that must not block.
    Stall,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkRef {
    pub page_idx: usize,
    pub chunk_idx: usize,
}

/// A writer created before any target buffer is known. Buffers locally
/// until bound to a real SMB chunk, per §4.G.4.
#[derive(Default)]
struct StartupWriter {
    buffered: Vec<u8>,
}

struct State {
    /// Page scan cursor for round-robin `try_acquire_chunk_for_writing`.
    next_page: usize,
    pending_commits: Vec<ChunkRef>,
    flush_in_flight: HashMap<FlushRequestId, HashSet<WriterId>>,
    startup_writers: HashMap<WriterId, StartupWriter>,
    /// Next `chunk_id` to hand out per writer (§4.F: `ChunkKey{producer_id,
    /// writer_id, chunk_id}` must uniquely and monotonically identify a
    /// writer's successive chunks, which the physical slot's leftover
    /// value from a prior writer can't guarantee on its own).
    next_chunk_id: HashMap<WriterId, u32>,
}

/// Owns one SMB and the commit-data channel to the service, on the
/// producer side.
pub struct SharedMemoryArbiter {
    smb: Mutex<SharedMemoryBuffer>,
    state: Mutex<State>,
    overflow_policy: OverflowPolicy,
}

impl SharedMemoryArbiter {
    pub fn new(smb: SharedMemoryBuffer, overflow_policy: OverflowPolicy) -> Self {
        SharedMemoryArbiter {
            smb: Mutex::new(smb),
            state: Mutex::new(State {
                next_page: 0,
                pending_commits: Vec::new(),
                flush_in_flight: HashMap::new(),
                startup_writers: HashMap::new(),
                next_chunk_id: HashMap::new(),
            }),
            overflow_policy,
        }
    }

    /// Finds a free chunk, scanning pages round-robin from the last
    /// successful page so writers spread load across the SMB rather than
    /// hammering page 0.
    pub fn try_acquire_chunk_for_writing(&self, writer_id: WriterId) -> Option<ChunkRef> {
        let smb = self.smb.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        let num_pages = smb.num_pages();
        if num_pages == 0 {
            return None;
        }
        let chunks_per_page = smb.chunks_per_page();
        for offset in 0..num_pages {
            let page_idx = (state.next_page + offset) % num_pages;
            for chunk_idx in 0..chunks_per_page {
                let chunk_id = *state.next_chunk_id.get(&writer_id).unwrap_or(&0);
                if smb.chunk_header(page_idx, chunk_idx).try_acquire_for_writing(writer_id, chunk_id) {
                    state.next_page = (page_idx + 1) % num_pages;
                    state.next_chunk_id.insert(writer_id, chunk_id.wrapping_add(1));
                    return Some(ChunkRef { page_idx, chunk_idx });
                }
            }
        }
        None
    }

    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow_policy
    }

    /// Marks a chunk complete and queues its reference for the next
    /// commit-data batch. The caller is responsible for actually flushing
    /// the batch (e.g. via a debounced task-runner post); this just
    /// accumulates state.
    pub fn release_chunk_as_complete(&self, chunk_ref: ChunkRef, packet_count: u32, flags: u8) {
        let smb = self.smb.lock().unwrap();
        smb.chunk_header(chunk_ref.page_idx, chunk_ref.chunk_idx)
            .release_as_complete(packet_count, flags);
        self.state.lock().unwrap().pending_commits.push(chunk_ref);
    }

    /// Runs `write` with the chunk's body bytes, for use between
    /// acquiring it for writing and releasing it as complete. Held
    /// through a closure (rather than returning the slice directly) so
    /// the SMB lock guard's lifetime doesn't leak into the caller.
    pub fn with_chunk_body_mut<R>(&self, chunk_ref: ChunkRef, write: impl FnOnce(&mut [u8]) -> R) -> R {
        let smb = self.smb.lock().unwrap();
        write(smb.chunk_body_mut(chunk_ref.page_idx, chunk_ref.chunk_idx))
    }

    /// Grants access to a completed chunk's body for retrieval (e.g. the
    /// service side copying it out during commit-data handling).
    pub fn with_chunk_body<R>(&self, chunk_ref: ChunkRef, read: impl FnOnce(&[u8]) -> R) -> R {
        let smb = self.smb.lock().unwrap();
        read(smb.chunk_body(chunk_ref.page_idx, chunk_ref.chunk_idx))
    }

    /// Drains and returns the chunks queued for the next commit-data RPC.
    pub fn drain_pending_commits(&self) -> Vec<ChunkRef> {
        std::mem::take(&mut self.state.lock().unwrap().pending_commits)
    }

    /// Registers that `flush_request_id` is waiting on acknowledgment from
    /// `writer_ids` (§4.G.3).
    pub fn begin_flush(&self, flush_request_id: FlushRequestId, writer_ids: impl IntoIterator<Item = WriterId>) {
        self.state
            .lock()
            .unwrap()
            .flush_in_flight
            .insert(flush_request_id, writer_ids.into_iter().collect());
    }

    /// Acknowledges that `writer_id`'s chunks for `flush_request_id` have
    /// been committed. Returns `true` once every writer tracked under this
    /// flush has acknowledged, meaning `NotifyFlushComplete` should fire.
    pub fn ack_flush_writer(&self, flush_request_id: FlushRequestId, writer_id: WriterId) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(remaining) = state.flush_in_flight.get_mut(&flush_request_id) else {
            return false;
        };
        remaining.remove(&writer_id);
        if remaining.is_empty() {
            state.flush_in_flight.remove(&flush_request_id);
            true
        } else {
            false
        }
    }

    /// Registers a startup writer that has no bound target buffer yet.
    pub fn register_startup_writer(&self, writer_id: WriterId) {
        self.state
            .lock()
            .unwrap()
            .startup_writers
            .insert(writer_id, StartupWriter::default());
    }

    pub fn startup_write(&self, writer_id: WriterId, bytes: &[u8]) {
        if let Some(w) = self.state.lock().unwrap().startup_writers.get_mut(&writer_id) {
            w.buffered.extend_from_slice(bytes);
        }
    }

    /// Binds a startup writer to the real SMB, returning its buffered
    /// bytes so the caller can replay them into freshly-acquired chunks.
    /// Returns `None` if the writer was never registered or already bound.
    pub fn bind_startup_writer(&self, writer_id: WriterId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .startup_writers
            .remove(&writer_id)
            .map(|w| w.buffered)
    }
}

/// A chunk the service has just drained out of a producer's SMB during
/// `CommitData` handling, with its untrusted header fields snapshotted
/// (§4.K.3: "read the `ChunkHeader` fields once, snapshot to locals").
pub struct CommittedChunk {
    pub writer_id: u16,
    pub chunk_id: u32,
    pub packet_count: u32,
    pub flags: u8,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkTakeError {
    #[error("page/chunk index out of range")]
    OutOfRange,
    #[error("chunk was not in CompleteProducer state when the service tried to acquire it for reading")]
    NotComplete,
    #[error(transparent)]
    Abi(#[from] crate::page::AbiViolation),
}

/// The service's view of one producer's SMB while handling `CommitData`
/// (§4.K.3). Kept distinct from [`SharedMemoryArbiter`], which is the
/// producer-side handle: the service only ever drains chunks here, never
/// writes them.
pub struct SharedMemoryReader {
    smb: SharedMemoryBuffer,
}

impl SharedMemoryReader {
    pub fn new(smb: SharedMemoryBuffer) -> Self {
        SharedMemoryReader { smb }
    }

    pub fn num_pages(&self) -> usize {
        self.smb.num_pages()
    }

    pub fn chunks_per_page(&self) -> usize {
        self.smb.chunks_per_page()
    }

    pub fn try_clone_fd(&self) -> std::io::Result<std::os::fd::OwnedFd> {
        self.smb.try_clone_fd()
    }

    /// Transitions chunk `(page_idx, chunk_idx)` from `CompleteProducer`
    /// to `ReadingService`, snapshots and validates its untrusted fields
    /// and body, then unconditionally transitions it back to `Free`
    /// regardless of validation outcome (§4.F: a malformed chunk is still
    /// returned to the pool, never stuck).
    pub fn take_committed_chunk(
        &self,
        page_idx: usize,
        chunk_idx: usize,
        max_writer_id: u16,
    ) -> Result<CommittedChunk, ChunkTakeError> {
        if page_idx >= self.smb.num_pages() || chunk_idx >= self.smb.chunks_per_page() {
            return Err(ChunkTakeError::OutOfRange);
        }
        let header = self.smb.chunk_header(page_idx, chunk_idx);
        if !header.try_acquire_for_reading() {
            return Err(ChunkTakeError::NotComplete);
        }
        let body = self.smb.chunk_body(page_idx, chunk_idx);
        let validation = crate::page::validate_chunk(&header, body, max_writer_id);
        let snapshot = CommittedChunk {
            writer_id: header.writer_id(),
            chunk_id: header.chunk_id(),
            packet_count: header.packet_count(),
            flags: header.packet_flags(),
            body: body.to_vec(),
        };
        header.release_as_free();
        validation.map(|()| snapshot).map_err(ChunkTakeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ChunkState;

    fn test_smb() -> SharedMemoryBuffer {
        let page_size = page_size::get();
        SharedMemoryBuffer::create("tracehub-arbiter-test", page_size * 2, page_size, page_size / 4).unwrap()
    }

    #[test]
    fn acquires_free_chunks_round_robin() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        let first = arbiter.try_acquire_chunk_for_writing(1).unwrap();
        assert_eq!(first.page_idx, 0);
    }

    #[test]
    fn drops_when_smb_is_full() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        let mut acquired = Vec::new();
        while let Some(c) = arbiter.try_acquire_chunk_for_writing(1) {
            acquired.push(c);
        }
        assert!(arbiter.try_acquire_chunk_for_writing(1).is_none());
        assert_eq!(acquired.len(), 8);
    }

    #[test]
    fn successive_chunks_from_one_writer_get_monotonic_chunk_ids() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        let first = arbiter.try_acquire_chunk_for_writing(1).unwrap();
        let second = arbiter.try_acquire_chunk_for_writing(1).unwrap();
        let smb = arbiter.smb.lock().unwrap();
        let first_id = smb.chunk_header(first.page_idx, first.chunk_idx).chunk_id();
        let second_id = smb.chunk_header(second.page_idx, second.chunk_idx).chunk_id();
        assert_eq!(first_id, 0);
        assert_eq!(second_id, 1);
    }

    #[test]
    fn a_new_writer_reusing_a_freed_slot_does_not_inherit_the_old_chunk_id() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        let chunk = arbiter.try_acquire_chunk_for_writing(1).unwrap();
        {
            let smb = arbiter.smb.lock().unwrap();
            assert_eq!(smb.chunk_header(chunk.page_idx, chunk.chunk_idx).chunk_id(), 0);
        }
        arbiter.release_chunk_as_complete(chunk, 0, 0);
        {
            let smb = arbiter.smb.lock().unwrap();
            smb.chunk_header(chunk.page_idx, chunk.chunk_idx).try_acquire_for_reading();
            smb.chunk_header(chunk.page_idx, chunk.chunk_idx).release_as_free();
        }

        let reused = arbiter.try_acquire_chunk_for_writing(2).unwrap();
        assert_eq!(reused.page_idx, chunk.page_idx);
        assert_eq!(reused.chunk_idx, chunk.chunk_idx);
        let smb = arbiter.smb.lock().unwrap();
        assert_eq!(smb.chunk_header(reused.page_idx, reused.chunk_idx).chunk_id(), 0);
    }

    #[test]
    fn flush_completes_once_every_writer_acks() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        arbiter.begin_flush(1, [10, 11]);
        assert!(!arbiter.ack_flush_writer(1, 10));
        assert!(arbiter.ack_flush_writer(1, 11));
    }

    #[test]
    fn complete_chunk_transitions_state_and_queues_commit() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        let chunk = arbiter.try_acquire_chunk_for_writing(3).unwrap();
        arbiter.release_chunk_as_complete(chunk, 1, 0);
        let smb = arbiter.smb.lock().unwrap();
        assert_eq!(smb.chunk_header(chunk.page_idx, chunk.chunk_idx).state(), ChunkState::CompleteProducer);
        drop(smb);
        assert_eq!(arbiter.drain_pending_commits().len(), 1);
        assert_eq!(arbiter.drain_pending_commits().len(), 0);
    }

    #[test]
    fn startup_writer_buffers_until_bound() {
        let arbiter = SharedMemoryArbiter::new(test_smb(), OverflowPolicy::DropOnFull);
        arbiter.register_startup_writer(99);
        arbiter.startup_write(99, b"hello");
        assert_eq!(arbiter.bind_startup_writer(99), Some(b"hello".to_vec()));
        assert_eq!(arbiter.bind_startup_writer(99), None);
    }
}
