// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory ABI (§4.F): the chunk header layout and the producer/
//! service chunk-ownership state machine. Every field written by the
//! producer except the state byte itself is untrusted until the service
//! validates it after acquiring the chunk for reading.
//!
//! A [`ChunkHeaderView`] borrows bytes living inside the mmap'd SMB
//! region itself (see `region.rs`/`smb.rs`), not a per-process copy, so
//! the producer and the service really do coordinate through the same
//! shared memory: the CAS below is only meaningful because both sides'
//! `AtomicU8` reference the identical physical page.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Bytes occupied by one chunk's header at the front of its slot:
/// `writer_id: u32, chunk_id: u32, packet_count: u32, packet_flags: u8,
/// state: u8`, padded to an 8-byte-aligned size.
pub const CHUNK_HEADER_SIZE: usize = 16;

/// Chunk ownership states. `Free -> WritingProducer -> CompleteProducer
/// -> ReadingService -> Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkState {
    Free = 0,
    WritingProducer = 1,
    CompleteProducer = 2,
    ReadingService = 3,
}

impl ChunkState {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::WritingProducer),
            2 => Some(Self::CompleteProducer),
            3 => Some(Self::ReadingService),
            _ => None,
        }
    }
}

/// Flags in the chunk header's `packet_flags` byte, per §4.F.
pub const FLAG_FIRST_CONTINUES_PREV: u8 = 1 << 0;
pub const FLAG_LAST_CONTINUES_NEXT: u8 = 1 << 1;

/// A live view over one chunk header's bytes inside the shared mapping.
/// Cheap to construct; holds no data of its own besides the pointer.
pub struct ChunkHeaderView<'a> {
    base: *mut u8,
    _marker: PhantomData<&'a ()>,
}

impl<'a> ChunkHeaderView<'a> {
    /// # Safety
    /// `base` must point to at least [`CHUNK_HEADER_SIZE`] writable bytes,
    /// valid for `'a`, 4-byte aligned, and not concurrently accessed
    /// through a non-atomic Rust reference (other processes may access it
    /// concurrently through their own `ChunkHeaderView`, which is fine:
    /// that is the whole point of the atomics below).
    pub unsafe fn new(base: *mut u8) -> Self {
        ChunkHeaderView { base, _marker: PhantomData }
    }

    fn writer_id_atomic(&self) -> &AtomicU32 {
        // SAFETY: see `new`'s contract; offset 0, 4-byte aligned.
        unsafe { AtomicU32::from_ptr(self.base as *mut u32) }
    }

    fn chunk_id_atomic(&self) -> &AtomicU32 {
        // SAFETY: see `new`'s contract; offset 4, 4-byte aligned.
        unsafe { AtomicU32::from_ptr(self.base.add(4) as *mut u32) }
    }

    fn packet_count_atomic(&self) -> &AtomicU32 {
        // SAFETY: see `new`'s contract; offset 8, 4-byte aligned.
        unsafe { AtomicU32::from_ptr(self.base.add(8) as *mut u32) }
    }

    fn packet_flags_atomic(&self) -> &AtomicU8 {
        // SAFETY: see `new`'s contract; offset 12.
        unsafe { AtomicU8::from_ptr(self.base.add(12)) }
    }

    fn state_atomic(&self) -> &AtomicU8 {
        // SAFETY: see `new`'s contract; offset 13.
        unsafe { AtomicU8::from_ptr(self.base.add(13)) }
    }

    /// Zeroes the header. Only valid to call on a chunk already known to
    /// be `Free` and unobserved by any other party (buffer setup).
    pub fn reset(&self) {
        self.writer_id_atomic().store(0, Ordering::Relaxed);
        self.chunk_id_atomic().store(0, Ordering::Relaxed);
        self.packet_count_atomic().store(0, Ordering::Relaxed);
        self.packet_flags_atomic().store(0, Ordering::Relaxed);
        self.state_atomic().store(ChunkState::Free as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> ChunkState {
        ChunkState::from_u8(self.state_atomic().load(Ordering::Acquire)).unwrap_or(ChunkState::Free)
    }

    /// Producer: `Free -> WritingProducer`. Returns `false` if the chunk
    /// was not free (contended with another producer thread, or not yet
    /// drained by the service). `chunk_id` must be the caller's own
    /// per-writer monotonic counter: the physical slot may hold a stale
    /// value left by whichever writer last owned it, so it's written
    /// outright rather than incremented in place.
    pub fn try_acquire_for_writing(&self, writer_id: u16, chunk_id: u32) -> bool {
        let acquired = self
            .state_atomic()
            .compare_exchange(
                ChunkState::Free as u8,
                ChunkState::WritingProducer as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if acquired {
            self.writer_id_atomic().store(writer_id as u32, Ordering::Relaxed);
            self.chunk_id_atomic().store(chunk_id, Ordering::Relaxed);
        }
        acquired
    }

    /// Producer: `WritingProducer -> CompleteProducer`, publishing
    /// `packet_count`/`flags` with release semantics so the service
    /// observes them no-later-than the state transition.
    pub fn release_as_complete(&self, packet_count: u32, flags: u8) {
        self.packet_count_atomic().store(packet_count, Ordering::Relaxed);
        self.packet_flags_atomic().store(flags, Ordering::Relaxed);
        self.state_atomic().store(ChunkState::CompleteProducer as u8, Ordering::Release);
    }

    /// Service: `CompleteProducer -> ReadingService`. A failed CAS here
    /// (chunk not actually complete) is something the caller must count,
    /// per §4.F — the chunk is left untouched rather than forced.
    pub fn try_acquire_for_reading(&self) -> bool {
        self.state_atomic()
            .compare_exchange(
                ChunkState::CompleteProducer as u8,
                ChunkState::ReadingService as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Service: `ReadingService -> Free`, releasing the chunk back to
    /// producers.
    pub fn release_as_free(&self) {
        self.state_atomic().store(ChunkState::Free as u8, Ordering::Release);
    }

    pub fn writer_id(&self) -> u16 {
        self.writer_id_atomic().load(Ordering::Relaxed) as u16
    }

    pub fn chunk_id(&self) -> u32 {
        self.chunk_id_atomic().load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count_atomic().load(Ordering::Relaxed)
    }

    pub fn packet_flags(&self) -> u8 {
        self.packet_flags_atomic().load(Ordering::Relaxed)
    }
}

/// Failure reasons from validating an untrusted chunk after acquiring it
/// for reading (§4.F). Every variant is counted as an ABI violation, never
/// propagated as a hard error — a misbehaving producer must not be able to
/// take down the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbiViolation {
    #[error("writer_id {0} exceeds max_writer_id {1}")]
    WriterIdOutOfRange(u16, u16),
    #[error("packet count {0} exceeds chunk body capacity {1}")]
    PacketCountExceedsBody(u32, u32),
    #[error("packet fragment varint length table is internally inconsistent")]
    InconsistentFragmentLayout,
    #[error("try_acquire_for_reading failed: chunk was not in CompleteProducer state")]
    NotComplete,
}

/// Validates a chunk the service has just acquired for reading against the
/// untrusted fields a producer wrote. `body` is the chunk's payload region
/// (the bytes after the header).
pub fn validate_chunk(header: &ChunkHeaderView<'_>, body: &[u8], max_writer_id: u16) -> Result<(), AbiViolation> {
    let writer_id = header.writer_id();
    if writer_id > max_writer_id {
        return Err(AbiViolation::WriterIdOutOfRange(writer_id, max_writer_id));
    }
    let count = header.packet_count();
    if count as usize > body.len() {
        return Err(AbiViolation::PacketCountExceedsBody(count, body.len() as u32));
    }
    validate_fragment_layout(body, count)
}

/// Walks `count` varint-prefixed fragments and checks they fit exactly
/// within `body` without overrunning it.
fn validate_fragment_layout(body: &[u8], count: u32) -> Result<(), AbiViolation> {
    let mut offset = 0usize;
    for _ in 0..count {
        let (len, consumed) = read_varint(&body[offset..]).ok_or(AbiViolation::InconsistentFragmentLayout)?;
        offset += consumed;
        let len = len as usize;
        if offset + len > body.len() {
            return Err(AbiViolation::InconsistentFragmentLayout);
        }
        offset += len;
    }
    Ok(())
}

/// Reads an unsigned LEB128 varint, returning `(value, bytes_consumed)`.
pub(crate) fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
