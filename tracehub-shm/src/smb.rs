// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The SMB (shared memory buffer) layout (§4.F): a contiguous mmap'd
//! region divided into equal-sized pages, each page holding a fixed
//! number of equal-sized chunks, each chunk a header immediately
//! followed by its body. Both producer and service construct a
//! `SharedMemoryBuffer` over the same memfd (producer via `create`,
//! service via `from_fd`) so `ChunkHeaderView`s really do alias.

use crate::page::{ChunkHeaderView, CHUNK_HEADER_SIZE};
use crate::region::ShmRegion;
use std::os::fd::OwnedFd;
use tracehub_common::error::ShmError;

/// Hard ceiling on a single page's size, matching the spec's "power-of-two
/// multiple of the OS page size, <= a hard maximum" constraint.
pub const MAX_PAGE_SIZE: usize = 1 << 20;

pub struct SharedMemoryBuffer {
    region: ShmRegion,
    page_size: usize,
    chunk_size: usize,
    num_pages: usize,
}

impl SharedMemoryBuffer {
    /// Creates a fresh SMB of `total_size` bytes, split into
    /// `page_size`-byte pages, each page split into `chunk_size`-byte
    /// chunk slots (header + body). Zeroes every chunk header to `Free`.
    pub fn create(name: &str, total_size: usize, page_size: usize, chunk_size: usize) -> Result<Self, ShmError> {
        validate_layout(total_size, page_size, chunk_size)?;
        let region = ShmRegion::create(name, total_size)?;
        let num_pages = total_size / page_size;
        let buf = SharedMemoryBuffer { region, page_size, chunk_size, num_pages };
        for page_idx in 0..buf.num_pages {
            for chunk_idx in 0..buf.chunks_per_page() {
                buf.chunk_header(page_idx, chunk_idx).reset();
            }
        }
        Ok(buf)
    }

    /// Wraps an SMB fd received from another process (e.g. the service
    /// mapping a producer's SMB after `OnTracingSetup`). Does not reset
    /// headers, since the other side may already be writing into them.
    pub fn from_fd(fd: OwnedFd, total_size: usize, page_size: usize, chunk_size: usize) -> Result<Self, ShmError> {
        validate_layout(total_size, page_size, chunk_size)?;
        let region = ShmRegion::from_fd(fd, total_size)?;
        let num_pages = total_size / page_size;
        Ok(SharedMemoryBuffer { region, page_size, chunk_size, num_pages })
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn chunks_per_page(&self) -> usize {
        self.page_size / self.chunk_size
    }

    fn chunk_offset(&self, page_idx: usize, chunk_idx: usize) -> usize {
        assert!(page_idx < self.num_pages, "page index out of range");
        assert!(chunk_idx < self.chunks_per_page(), "chunk index out of range");
        page_idx * self.page_size + chunk_idx * self.chunk_size
    }

    /// A live view of chunk `(page_idx, chunk_idx)`'s header, backed by
    /// the shared mapping.
    pub fn chunk_header(&self, page_idx: usize, chunk_idx: usize) -> ChunkHeaderView<'_> {
        let offset = self.chunk_offset(page_idx, chunk_idx);
        // SAFETY: `offset` is within the mapped region (checked by the
        // bounds asserts in `chunk_offset`) and leaves at least
        // `CHUNK_HEADER_SIZE` bytes before the chunk body starts, since
        // `validate_layout` requires `chunk_size > CHUNK_HEADER_SIZE`.
        unsafe { ChunkHeaderView::new(self.region.as_ptr().add(offset)) }
    }

    /// The chunk's payload bytes, immediately following its header.
    pub fn chunk_body(&self, page_idx: usize, chunk_idx: usize) -> &[u8] {
        let offset = self.chunk_offset(page_idx, chunk_idx) + CHUNK_HEADER_SIZE;
        let len = self.chunk_size - CHUNK_HEADER_SIZE;
        &self.region.as_slice()[offset..offset + len]
    }

    /// Mutable access to the chunk's payload bytes. Takes `&self` rather
    /// than `&mut self` since this is shared memory: the chunk ownership
    /// state machine in `page.rs`, not Rust's borrow checker, is what
    /// guarantees only the chunk's current owner writes here.
    pub fn chunk_body_mut(&self, page_idx: usize, chunk_idx: usize) -> &mut [u8] {
        let offset = self.chunk_offset(page_idx, chunk_idx) + CHUNK_HEADER_SIZE;
        let len = self.chunk_size - CHUNK_HEADER_SIZE;
        // SAFETY: offset/len computed identically to `chunk_body`; callers
        // only take this after winning `try_acquire_for_writing`'s CAS, so
        // no other party holds a body reference to this chunk.
        unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(offset), len) }
    }

    pub fn try_clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.region.try_clone_fd()
    }
}

fn validate_layout(total_size: usize, page_size: usize, chunk_size: usize) -> Result<(), ShmError> {
    let os_page = page_size::get();
    if page_size == 0 || page_size % os_page != 0 || !page_size.is_power_of_two() {
        return Err(ShmError::InvalidPageSize(page_size));
    }
    if page_size > MAX_PAGE_SIZE {
        return Err(ShmError::InvalidPageSize(page_size));
    }
    if chunk_size <= CHUNK_HEADER_SIZE || page_size % chunk_size != 0 {
        return Err(ShmError::InvalidPageSize(chunk_size));
    }
    if total_size % page_size != 0 {
        return Err(ShmError::InvalidShmSize(total_size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::ChunkState;

    #[test]
    fn creates_expected_page_and_chunk_count() {
        let page_size = page_size::get();
        let smb = SharedMemoryBuffer::create("tracehub-smb-test", page_size * 4, page_size, page_size / 4).unwrap();
        assert_eq!(smb.num_pages(), 4);
        assert_eq!(smb.chunks_per_page(), 4);
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let os_page = page_size::get();
        let bad = os_page * 3;
        let err = SharedMemoryBuffer::create("tracehub-smb-bad", bad * 2, bad, os_page);
        assert!(matches!(err, Err(ShmError::InvalidPageSize(_))));
    }

    #[test]
    fn fresh_chunks_start_free() {
        let page_size = page_size::get();
        let smb = SharedMemoryBuffer::create("tracehub-smb-free", page_size, page_size, page_size / 2).unwrap();
        assert_eq!(smb.chunk_header(0, 0).state(), ChunkState::Free);
    }

    #[test]
    fn body_write_is_visible_through_a_second_mapping_of_the_same_fd() {
        let page_size = page_size::get();
        let producer_side =
            SharedMemoryBuffer::create("tracehub-smb-shared", page_size, page_size, page_size / 2).unwrap();
        producer_side.chunk_body_mut(0, 0)[0] = 0x42;
        let fd = producer_side.try_clone_fd().unwrap();
        let service_side = SharedMemoryBuffer::from_fd(fd, page_size, page_size, page_size / 2).unwrap();
        assert_eq!(service_side.chunk_body(0, 0)[0], 0x42);
    }
}
