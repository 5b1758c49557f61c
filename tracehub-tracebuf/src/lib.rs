// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The session-owned central trace buffer (§4.L): a contiguous byte store
//! that the service copies producer chunks into, indexed by
//! `(producer_id, writer_id, chunk_id)`, plus ordered packet reassembly
//! across chunk boundaries.

use std::collections::{HashMap, HashSet, VecDeque};

pub type ProducerId = u16;
pub type WriterId = u16;
pub type ChunkId = u32;

const FLAG_FIRST_CONTINUES_PREV: u8 = 1 << 0;
const FLAG_LAST_CONTINUES_NEXT: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub producer_id: ProducerId,
    pub writer_id: WriterId,
    pub chunk_id: ChunkId,
}

/// How a [`TraceBuffer`] behaves once it has no room for an incoming
/// chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillPolicy {
    /// Overwrite the oldest chunks to make room (§4.L default).
    Ring,
    /// Stop accepting new chunks once the byte budget is exhausted
    /// (SPEC_FULL.md §D resolution of the DISCARD-mode open question).
    Discard,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceBufferError {
    #[error("writer_id 0 is reserved and invalid")]
    ZeroWriterId,
    #[error("chunk of {0} bytes exceeds buffer capacity {1}")]
    ChunkTooLarge(usize, usize),
    #[error("buffer is in Discard fill mode and has no room for this chunk")]
    Discarded,
}

#[derive(Debug, Clone, Copy)]
struct ChunkSlot {
    offset: usize,
    len: usize,
    producer_uid: u32,
    num_frags: u32,
    flags: u8,
    seq: u64,
}

fn ranges_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    a_start < b_end && b_start < a_end
}

/// A session-owned packet store. See module docs.
pub struct TraceBuffer {
    data: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    index: HashMap<ChunkKey, ChunkSlot>,
    order: VecDeque<ChunkKey>,
    next_seq: u64,
    policy: FillPolicy,
    discard_exhausted: bool,
    chunks_overwritten: u64,
    patches_failed: u64,
}

impl TraceBuffer {
    pub fn new(capacity: usize, policy: FillPolicy) -> Self {
        TraceBuffer {
            data: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            index: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            policy,
            discard_exhausted: false,
            chunks_overwritten: 0,
            patches_failed: 0,
        }
    }

    pub fn chunks_overwritten(&self) -> u64 {
        self.chunks_overwritten
    }

    pub fn patches_failed(&self) -> u64 {
        self.patches_failed
    }

    /// Copies a producer chunk's body into the buffer, indexed by
    /// `(producer_id, writer_id, chunk_id)` so later patches can find it.
    pub fn copy_chunk(
        &mut self,
        key: ChunkKey,
        producer_uid: u32,
        num_frags: u32,
        flags: u8,
        src: &[u8],
    ) -> Result<(), TraceBufferError> {
        if key.writer_id == 0 {
            return Err(TraceBufferError::ZeroWriterId);
        }
        let size = src.len();
        if size > self.capacity {
            return Err(TraceBufferError::ChunkTooLarge(size, self.capacity));
        }

        match self.policy {
            FillPolicy::Discard => {
                if self.discard_exhausted || self.write_pos + size > self.capacity {
                    self.discard_exhausted = true;
                    return Err(TraceBufferError::Discarded);
                }
            }
            FillPolicy::Ring => {
                if self.write_pos + size > self.capacity {
                    self.write_pos = 0;
                }
            }
        }

        let start = self.write_pos;
        let end = start + size;
        self.evict_overlapping(start, end);
        self.data[start..end].copy_from_slice(src);

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(
            key,
            ChunkSlot {
                offset: start,
                len: size,
                producer_uid,
                num_frags,
                flags,
                seq,
            },
        );
        self.order.push_back(key);
        self.write_pos = if self.capacity == 0 { 0 } else { end % self.capacity };
        Ok(())
    }

    fn evict_overlapping(&mut self, start: usize, end: usize) {
        let mut evicted = HashSet::new();
        for key in self.order.iter() {
            if let Some(slot) = self.index.get(key) {
                if ranges_overlap(slot.offset, slot.offset + slot.len, start, end) {
                    evicted.insert(*key);
                }
            }
        }
        if evicted.is_empty() {
            return;
        }
        for key in &evicted {
            self.index.remove(key);
        }
        self.chunks_overwritten += evicted.len() as u64;
        self.order.retain(|k| !evicted.contains(k));
    }

    /// Applies in-place byte patches to an already-copied chunk.
    /// `has_more` signals whether the producer will send further patches
    /// for this same chunk; bookkeeping for that belongs to the caller
    /// (the service core tracks per-chunk pending-patch state), not here.
    pub fn try_patch_chunk_contents(&mut self, key: ChunkKey, patches: &[(u32, Vec<u8>)], _has_more: bool) -> bool {
        let Some(slot) = self.index.get(&key).copied() else {
            self.patches_failed += 1;
            return false;
        };
        for (patch_offset, patch_bytes) in patches {
            let po = *patch_offset as usize;
            if po.checked_add(patch_bytes.len()).map_or(true, |end| end > slot.len) {
                self.patches_failed += 1;
                return false;
            }
        }
        for (patch_offset, patch_bytes) in patches {
            let abs = slot.offset + *patch_offset as usize;
            self.data[abs..abs + patch_bytes.len()].copy_from_slice(patch_bytes);
        }
        true
    }

    pub fn begin_read(&self) -> TraceBufferReader<'_> {
        TraceBufferReader {
            buffer: self,
            chunks: self.order.iter().copied().collect(),
            cursor: 0,
            pending: HashMap::new(),
            output: VecDeque::new(),
            reassembly_violations: 0,
        }
    }
}

/// Reads packets out of a [`TraceBuffer`] in write order, reassembling
/// fragments split across chunk boundaries.
pub struct TraceBufferReader<'a> {
    buffer: &'a TraceBuffer,
    chunks: Vec<ChunkKey>,
    cursor: usize,
    pending: HashMap<(ProducerId, WriterId), Vec<u8>>,
    output: VecDeque<(Vec<u8>, u32)>,
    reassembly_violations: u64,
}

impl<'a> TraceBufferReader<'a> {
    /// Number of continuation fragments dropped because their predecessor
    /// chunk was evicted or never arrived, rather than reassembled into a
    /// truncated packet (§4.L / SPEC_FULL.md §D).
    pub fn reassembly_violations(&self) -> u64 {
        self.reassembly_violations
    }

    /// Yields the next packet in write order, paired with the trusted
    /// producer uid the service annotated it with. Returns `None` once
    /// every available chunk has been consumed; packets whose final
    /// fragment chunk hasn't arrived yet are held back rather than
    /// flushed as incomplete.
    pub fn read_next_trace_packet(&mut self) -> Option<(Vec<u8>, u32)> {
        loop {
            if let Some(packet) = self.output.pop_front() {
                return Some(packet);
            }
            if self.cursor >= self.chunks.len() {
                return None;
            }
            let key = self.chunks[self.cursor];
            self.cursor += 1;
            self.process_chunk(key);
        }
    }

    fn process_chunk(&mut self, key: ChunkKey) {
        let Some(slot) = self.buffer.index.get(&key).copied() else {
            return;
        };
        let body = &self.buffer.data[slot.offset..slot.offset + slot.len];
        let Some(fragments) = parse_fragments(body, slot.num_frags) else {
            self.reassembly_violations += 1;
            return;
        };
        let writer_key = (key.producer_id, key.writer_id);
        let last_idx = fragments.len().saturating_sub(1);
        for (i, frag) in fragments.into_iter().enumerate() {
            let continues_prev = i == 0 && slot.flags & FLAG_FIRST_CONTINUES_PREV != 0;
            let continues_next = i == last_idx && slot.flags & FLAG_LAST_CONTINUES_NEXT != 0;

            let buf = if continues_prev {
                match self.pending.remove(&writer_key) {
                    Some(mut partial) => {
                        partial.extend_from_slice(frag);
                        partial
                    }
                    None => {
                        // Predecessor chunk is gone: reassembling would
                        // yield a truncated packet. Drop it instead.
                        self.reassembly_violations += 1;
                        continue;
                    }
                }
            } else {
                frag.to_vec()
            };

            if continues_next {
                self.pending.insert(writer_key, buf);
            } else {
                self.output.push_back((buf, slot.producer_uid));
            }
        }
    }
}

/// Parses `count` varint-length-prefixed fragments out of `body`. Returns
/// `None` if the layout is internally inconsistent (should not happen for
/// chunks already validated by `tracehub-shm::page::validate_chunk`, but
/// this crate makes no assumption about its caller).
fn parse_fragments(body: &[u8], count: u32) -> Option<Vec<&[u8]>> {
    let mut offset = 0usize;
    let mut fragments = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (len, consumed) = read_varint(&body[offset..])?;
        offset += consumed;
        let len = len as usize;
        if offset + len > body.len() {
            return None;
        }
        fragments.push(&body[offset..offset + len]);
        offset += len;
    }
    Some(fragments)
}

fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_fragments(frags: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in frags {
            let mut len = f.len() as u64;
            loop {
                let mut byte = (len & 0x7f) as u8;
                len >>= 7;
                if len != 0 {
                    byte |= 0x80;
                }
                out.push(byte);
                if len == 0 {
                    break;
                }
            }
            out.extend_from_slice(f);
        }
        out
    }

    fn key(producer: u16, writer: u16, chunk: u32) -> ChunkKey {
        ChunkKey { producer_id: producer, writer_id: writer, chunk_id: chunk }
    }

    #[test]
    fn copy_and_read_single_fragment_packet() {
        let mut buf = TraceBuffer::new(4096, FillPolicy::Ring);
        let body = encode_fragments(&[b"hello"]);
        buf.copy_chunk(key(1, 1, 1), 42, 1, 0, &body).unwrap();
        let mut reader = buf.begin_read();
        assert_eq!(reader.read_next_trace_packet(), Some((b"hello".to_vec(), 42)));
        assert_eq!(reader.read_next_trace_packet(), None);
    }

    #[test]
    fn reassembles_packet_split_across_two_chunks() {
        let mut buf = TraceBuffer::new(4096, FillPolicy::Ring);
        let c1 = encode_fragments(&[b"hel"]);
        buf.copy_chunk(key(1, 1, 1), 1, 1, FLAG_LAST_CONTINUES_NEXT, &c1).unwrap();
        let c2 = encode_fragments(&[b"lo"]);
        buf.copy_chunk(key(1, 1, 2), 1, 1, FLAG_FIRST_CONTINUES_PREV, &c2).unwrap();
        let mut reader = buf.begin_read();
        assert_eq!(reader.read_next_trace_packet(), Some((b"hello".to_vec(), 1)));
    }

    #[test]
    fn missing_predecessor_chunk_drops_rather_than_truncates() {
        let mut buf = TraceBuffer::new(4096, FillPolicy::Ring);
        let c2 = encode_fragments(&[b"lo", b"standalone"]);
        buf.copy_chunk(key(1, 1, 2), 1, 2, FLAG_FIRST_CONTINUES_PREV, &c2).unwrap();
        let mut reader = buf.begin_read();
        assert_eq!(reader.read_next_trace_packet(), Some((b"standalone".to_vec(), 1)));
        assert_eq!(reader.read_next_trace_packet(), None);
        assert_eq!(reader.reassembly_violations(), 1);
    }

    #[test]
    fn zero_writer_id_is_rejected() {
        let mut buf = TraceBuffer::new(4096, FillPolicy::Ring);
        let err = buf.copy_chunk(key(1, 0, 1), 1, 0, 0, &[]).unwrap_err();
        assert!(matches!(err, TraceBufferError::ZeroWriterId));
    }

    #[test]
    fn ring_mode_overwrites_oldest_and_counts_it() {
        let mut buf = TraceBuffer::new(16, FillPolicy::Ring);
        buf.copy_chunk(key(1, 1, 1), 1, 0, 0, &[0u8; 10]).unwrap();
        buf.copy_chunk(key(1, 1, 2), 1, 0, 0, &[1u8; 10]).unwrap();
        assert_eq!(buf.chunks_overwritten(), 1);
        assert!(buf.try_patch_chunk_contents(key(1, 1, 1), &[(0, vec![9])], false) == false);
    }

    #[test]
    fn discard_mode_rejects_once_out_of_room() {
        let mut buf = TraceBuffer::new(16, FillPolicy::Discard);
        buf.copy_chunk(key(1, 1, 1), 1, 0, 0, &[0u8; 10]).unwrap();
        let err = buf.copy_chunk(key(1, 1, 2), 1, 0, 0, &[1u8; 10]).unwrap_err();
        assert!(matches!(err, TraceBufferError::Discarded));
        // Even a chunk that would otherwise fit is rejected once exhausted.
        let err2 = buf.copy_chunk(key(1, 1, 3), 1, 0, 0, &[1u8; 2]).unwrap_err();
        assert!(matches!(err2, TraceBufferError::Discarded));
    }

    #[test]
    fn patch_applies_in_place() {
        let mut buf = TraceBuffer::new(4096, FillPolicy::Ring);
        buf.copy_chunk(key(1, 1, 1), 1, 0, 0, &[0u8; 8]).unwrap();
        assert!(buf.try_patch_chunk_contents(key(1, 1, 1), &[(2, vec![0xFF, 0xFF])], false));
        let mut reader = buf.begin_read();
        // No fragments were declared (num_frags=0), so nothing is yielded,
        // but the patch should not have panicked or corrupted bookkeeping.
        assert_eq!(reader.read_next_trace_packet(), None);
    }

    #[test]
    fn patch_to_unknown_chunk_fails_and_counts() {
        let mut buf = TraceBuffer::new(4096, FillPolicy::Ring);
        assert!(!buf.try_patch_chunk_contents(key(9, 9, 9), &[(0, vec![1])], false));
        assert_eq!(buf.patches_failed(), 1);
    }
}
