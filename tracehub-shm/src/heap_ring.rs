// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spin-locked ring buffer used to ferry heapprofd allocation records from
//! the profiled process to the bookkeeping thread (§4.H). The data region
//! is mapped twice, back to back, into contiguous virtual memory so a
//! writer or reader can treat any `[offset, offset + len)` slice as
//! contiguous even when it wraps past the nominal end of the buffer.

use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracehub_common::error::ShmError;

/// How long a caller is willing to spin waiting for the metadata lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinMode {
    /// Bounded spin (~10000 iterations), yielding the thread for 1ms every
    /// 1024th spin. Used by writers, who must never block the profiled
    /// process's allocation path indefinitely.
    Try,
    /// Unbounded spin with a cooperative yield every iteration. Used by the
    /// reader, which has nothing better to do than wait for data.
    Blocking,
}

const TRY_SPIN_LIMIT: u32 = 10_000;
const TRY_SPIN_YIELD_EVERY: u32 = 1024;

struct SpinLock {
    locked: AtomicU8,
}

impl SpinLock {
    fn new() -> Self {
        SpinLock { locked: AtomicU8::new(0) }
    }

    /// Attempts to acquire the lock under `mode`. Returns `false` only in
    /// `Try` mode after exhausting the spin budget.
    fn acquire(&self, mode: SpinMode) -> bool {
        let mut spins: u32 = 0;
        loop {
            if self
                .locked
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            spins += 1;
            match mode {
                SpinMode::Try => {
                    if spins >= TRY_SPIN_LIMIT {
                        return false;
                    }
                    if spins % TRY_SPIN_YIELD_EVERY == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    } else {
                        std::hint::spin_loop();
                    }
                }
                SpinMode::Blocking => {
                    std::thread::yield_now();
                }
            }
        }
    }

    fn release(&self) {
        self.locked.store(0, Ordering::Release);
    }
}

/// Process-shared ring buffer bookkeeping: the spinlock, the read/write
/// cursors, and failure counters. Lives in its own single-page mapping
/// separate from the double-mapped data region, since its layout never
/// wraps.
#[repr(C)]
pub struct MetadataPage {
    lock: SpinLock,
    read_pos: AtomicU64,
    write_pos: AtomicU64,
    frozen: AtomicU8,
    num_writes_failed: AtomicU32,
    num_reads_failed: AtomicU32,
}

impl MetadataPage {
    fn new() -> Self {
        MetadataPage {
            lock: SpinLock::new(),
            read_pos: AtomicU64::new(0),
            write_pos: AtomicU64::new(0),
            frozen: AtomicU8::new(0),
            num_writes_failed: AtomicU32::new(0),
            num_reads_failed: AtomicU32::new(0),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire) != 0
    }

    fn freeze(&self) {
        self.frozen.store(1, Ordering::Release);
    }

    pub fn num_writes_failed(&self) -> u32 {
        self.num_writes_failed.load(Ordering::Relaxed)
    }

    pub fn num_reads_failed(&self) -> u32 {
        self.num_reads_failed.load(Ordering::Relaxed)
    }
}

/// Virtual memory backing the ring: one memfd mapped twice, consecutively,
/// so offsets in `[0, 2*capacity)` are all valid addresses.
struct DoubleMappedRegion {
    memfd: OwnedFd,
    base: NonNull<u8>,
    capacity: usize,
}

unsafe impl Send for DoubleMappedRegion {}
unsafe impl Sync for DoubleMappedRegion {}

impl DoubleMappedRegion {
    fn create(capacity: usize) -> Result<Self, ShmError> {
        if capacity == 0 || !capacity.is_power_of_two() || capacity % page_size::get() != 0 {
            return Err(ShmError::InvalidShmSize(capacity));
        }
        let memfd = memfd::MemfdOptions::default()
            .allow_sealing(true)
            .close_on_exec(true)
            .create("tracehub-heap-ring")
            .map_err(|e| ShmError::Create(std::io::Error::other(e)))?;
        let fd: OwnedFd = memfd.into_file().into();
        ftruncate(&fd, capacity as i64).map_err(|e| ShmError::Create(std::io::Error::from(e)))?;

        let total = NonZeroUsize::new(capacity * 2).unwrap();
        // SAFETY: reserves a private anonymous region purely to pick a base
        // address; nothing else maps over it before the two MAP_FIXED
        // calls below replace it.
        let reservation = unsafe {
            mmap_anonymous(None, total, ProtFlags::PROT_NONE, MapFlags::MAP_PRIVATE)
        }
        .map_err(|e| ShmError::Map(std::io::Error::from(e)))?;

        let cap_nz = NonZeroUsize::new(capacity).unwrap();
        let base_addr = NonZeroUsize::new(reservation.as_ptr() as usize).unwrap();
        // SAFETY: `base_addr` was just reserved above and is large enough
        // for two `capacity`-sized mappings; MAP_FIXED replaces the
        // anonymous reservation at this exact address.
        unsafe {
            mmap(
                Some(base_addr),
                cap_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(|e| ShmError::Map(std::io::Error::from(e)))?;
        let second_addr = NonZeroUsize::new(base_addr.get() + capacity).unwrap();
        // SAFETY: same memfd, second half of the reservation, offset 0 so
        // both mappings alias the same pages.
        unsafe {
            mmap(
                Some(second_addr),
                cap_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(|e| ShmError::Map(std::io::Error::from(e)))?;

        Ok(DoubleMappedRegion {
            memfd: fd,
            base: NonNull::new(reservation.as_ptr().cast()).unwrap(),
            capacity,
        })
    }

    fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for DoubleMappedRegion {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the `2*capacity` virtual range reserved in
        // `create`.
        unsafe {
            let _ = munmap(self.base.cast(), self.capacity * 2);
        }
    }
}

/// A length-prefixed entry ring buffer. `capacity` must be a power of two
/// and a multiple of the OS page size.
pub struct HeapRing {
    meta: MetadataPage,
    region: DoubleMappedRegion,
}

unsafe impl Send for HeapRing {}
unsafe impl Sync for HeapRing {}

/// Four-byte little-endian length prefix, matching the producer side's
/// trace-packet framing convention elsewhere in this workspace.
const LEN_PREFIX_SIZE: usize = 4;

/// Rounds `len` up to the next multiple of 8 (§3: every ring record is
/// aligned to 8 bytes and padded up; both `read_pos` and `write_pos` stay
/// multiples of 8).
fn align_up_8(len: usize) -> usize {
    (len + 7) & !7
}

impl HeapRing {
    pub fn create(capacity: usize) -> Result<Self, ShmError> {
        Ok(HeapRing {
            meta: MetadataPage::new(),
            region: DoubleMappedRegion::create(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.capacity
    }

    pub fn metadata(&self) -> &MetadataPage {
        &self.meta
    }

    fn used(&self, read_pos: u64, write_pos: u64) -> u64 {
        write_pos - read_pos
    }

    /// Reserves space for a `payload_len`-byte record and returns a
    /// writable slice positioned contiguously in virtual memory (thanks to
    /// the double mapping). The record is not visible to readers until
    /// [`Self::end_write`] is called.
    pub fn begin_write(&self, mode: SpinMode, payload_len: usize) -> Option<&mut [u8]> {
        let entry_len = align_up_8(LEN_PREFIX_SIZE + payload_len);
        if entry_len > self.capacity() {
            return None;
        }
        if !self.meta.lock.acquire(mode) {
            return None;
        }
        if self.meta.is_frozen() {
            self.meta.lock.release();
            return None;
        }
        let read_pos = self.meta.read_pos.load(Ordering::Acquire);
        let write_pos = self.meta.write_pos.load(Ordering::Relaxed);
        let cap = self.capacity() as u64;
        if self.used(read_pos, write_pos) + entry_len as u64 > cap {
            self.meta.num_writes_failed.fetch_add(1, Ordering::Relaxed);
            self.meta.lock.release();
            return None;
        }
        let offset = (write_pos % cap) as usize;
        // SAFETY: the double mapping guarantees `[offset, offset+capacity)`
        // is valid; `entry_len <= capacity` was checked above so the slice
        // never reads past the second copy.
        let slice = unsafe { std::slice::from_raw_parts_mut(self.region.as_ptr().add(offset), entry_len) };
        slice[..LEN_PREFIX_SIZE].copy_from_slice(&(payload_len as u32).to_le_bytes());
        // Padding bytes (if any) between the payload and the aligned entry
        // end are never read; zeroing them just keeps a freshly-reused slot
        // legible under a debugger.
        for b in slice[LEN_PREFIX_SIZE + payload_len..].iter_mut() {
            *b = 0;
        }
        Some(&mut slice[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + payload_len])
        // Lock intentionally held across the write; released in `end_write`.
    }

    /// Publishes a record written via [`Self::begin_write`] and releases
    /// the lock acquired there.
    pub fn end_write(&self, payload_len: usize) {
        let entry_len = align_up_8(LEN_PREFIX_SIZE + payload_len);
        self.meta.write_pos.fetch_add(entry_len as u64, Ordering::Release);
        self.meta.lock.release();
    }

    /// Returns the next unread record's payload, or `None` if the ring is
    /// empty, frozen, or corrupt (invariant violation, counted and the ring
    /// frozen so no further reads are attempted).
    pub fn begin_read(&self, mode: SpinMode) -> Option<&[u8]> {
        if !self.meta.lock.acquire(mode) {
            return None;
        }
        if self.meta.is_frozen() {
            self.meta.lock.release();
            return None;
        }
        let read_pos = self.meta.read_pos.load(Ordering::Relaxed);
        let write_pos = self.meta.write_pos.load(Ordering::Acquire);
        if write_pos < read_pos {
            self.meta.num_reads_failed.fetch_add(1, Ordering::Relaxed);
            self.meta.freeze();
            self.meta.lock.release();
            return None;
        }
        if write_pos == read_pos {
            self.meta.lock.release();
            return None;
        }
        let cap = self.capacity() as u64;
        let offset = (read_pos % cap) as usize;
        // SAFETY: offset within [0, capacity) and the double mapping makes
        // the following `capacity` bytes valid regardless of wraparound.
        let header = unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(offset), LEN_PREFIX_SIZE) };
        let payload_len = u32::from_le_bytes(header.try_into().unwrap()) as u64;
        let entry_len = align_up_8(LEN_PREFIX_SIZE + payload_len as usize) as u64;
        if entry_len > write_pos - read_pos || entry_len > cap {
            self.meta.num_reads_failed.fetch_add(1, Ordering::Relaxed);
            self.meta.freeze();
            self.meta.lock.release();
            return None;
        }
        // SAFETY: see above; `entry_len <= capacity`.
        let slice = unsafe { std::slice::from_raw_parts(self.region.as_ptr().add(offset), entry_len as usize) };
        Some(&slice[LEN_PREFIX_SIZE..LEN_PREFIX_SIZE + payload_len as usize])
        // Lock intentionally held across the read; released in `end_read`.
    }

    /// Advances the read cursor past the record returned by
    /// [`Self::begin_read`] and releases its lock.
    pub fn end_read(&self, payload_len: usize) {
        let entry_len = align_up_8(LEN_PREFIX_SIZE + payload_len) as u64;
        self.meta.read_pos.fetch_add(entry_len, Ordering::Release);
        self.meta.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let ring = HeapRing::create(page_size::get()).unwrap();
        let payload = b"alloc record";
        {
            let buf = ring.begin_write(SpinMode::Try, payload.len()).unwrap();
            buf.copy_from_slice(payload);
        }
        ring.end_write(payload.len());

        let read = ring.begin_read(SpinMode::Try).unwrap().to_vec();
        assert_eq!(read, payload);
        ring.end_read(payload.len());
    }

    #[test]
    fn empty_ring_read_returns_none() {
        let ring = HeapRing::create(page_size::get()).unwrap();
        assert!(ring.begin_read(SpinMode::Try).is_none());
    }

    #[test]
    fn write_wraps_around_using_double_mapping() {
        let cap = page_size::get();
        let ring = HeapRing::create(cap).unwrap();
        let chunk = vec![0xAAu8; cap / 2 - LEN_PREFIX_SIZE];
        for _ in 0..3 {
            {
                let buf = ring.begin_write(SpinMode::Try, chunk.len()).unwrap();
                buf.copy_from_slice(&chunk);
            }
            ring.end_write(chunk.len());
            let read = ring.begin_read(SpinMode::Try).unwrap().to_vec();
            assert_eq!(read, chunk);
            ring.end_read(chunk.len());
        }
    }

    #[test]
    fn oversize_write_is_rejected_without_corrupting_state() {
        let cap = page_size::get();
        let ring = HeapRing::create(cap).unwrap();
        assert!(ring.begin_write(SpinMode::Try, cap).is_none());
        assert!(!ring.metadata().is_frozen());
    }

    #[test]
    fn odd_length_payload_is_padded_to_an_8_byte_boundary() {
        let ring = HeapRing::create(page_size::get()).unwrap();
        let payload = b"five!";
        {
            let buf = ring.begin_write(SpinMode::Try, payload.len()).unwrap();
            buf.copy_from_slice(payload);
        }
        ring.end_write(payload.len());
        // LEN_PREFIX_SIZE (4) + 5 = 9, padded up to 16.
        assert_eq!(ring.meta.write_pos.load(Ordering::Relaxed), 16);
        assert_eq!(ring.meta.read_pos.load(Ordering::Relaxed) % 8, 0);

        let read = ring.begin_read(SpinMode::Try).unwrap().to_vec();
        assert_eq!(read, payload);
        ring.end_read(payload.len());
        assert_eq!(ring.meta.read_pos.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn write_failing_when_full_counts_stat_without_freezing() {
        let cap = page_size::get();
        let ring = HeapRing::create(cap).unwrap();
        let payload = vec![0u8; cap - LEN_PREFIX_SIZE];
        {
            let buf = ring.begin_write(SpinMode::Try, payload.len()).unwrap();
            buf.copy_from_slice(&payload);
        }
        ring.end_write(payload.len());
        assert!(ring.begin_write(SpinMode::Try, 1).is_none());
        assert_eq!(ring.metadata().num_writes_failed(), 1);
        assert!(!ring.metadata().is_frozen());
    }
}
