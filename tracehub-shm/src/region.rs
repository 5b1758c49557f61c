// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Memfd-backed shared memory region, grounded on the `memfd_create` +
//! `ftruncate` + `mmap` sequence in
//! `libdd-library-config/src/process_context.rs::linux::MemMapping`,
//! ported onto this workspace's `memfd`/`nix` crates rather than `rustix`.

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use tracehub_common::error::ShmError;

/// An `mmap`ed region backed by a sealed memfd, shareable with another
/// process by passing the fd over `SCM_RIGHTS`.
pub struct ShmRegion {
    memfd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: `ShmRegion` owns its mapping exclusively and the mapped memory is
// not aliased by any other Rust reference; the memfd itself is `Send`.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates a new `len`-byte memfd-backed mapping. `len` must already be
    /// a multiple of the OS page size; callers (the SMB/ring-buffer layout
    /// code) are responsible for rounding up.
    pub fn create(name: &str, len: usize) -> Result<Self, ShmError> {
        if len % page_size::get() != 0 {
            return Err(ShmError::InvalidShmSize(len));
        }
        let memfd = memfd::MemfdOptions::default()
            .allow_sealing(true)
            .close_on_exec(true)
            .create(name)
            .map_err(|e| ShmError::Create(std::io::Error::other(e)))?;
        let fd = memfd.into_file();
        ftruncate(&fd, len as i64).map_err(|e| ShmError::Create(std::io::Error::from(e)))?;
        Self::map(fd.into(), len)
    }

    /// Wraps a memfd received from another process (e.g. over `SCM_RIGHTS`)
    /// as a mapping of `len` bytes.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Result<Self, ShmError> {
        Self::map(fd, len)
    }

    fn map(memfd: OwnedFd, len: usize) -> Result<Self, ShmError> {
        let len_nz = NonZeroUsize::new(len).ok_or(ShmError::InvalidShmSize(len))?;
        // SAFETY: `memfd` is a valid, open fd backing at least `len` bytes
        // (ftruncate'd by the caller); the mapping is not aliased since we
        // hold the only `ShmRegion` created from this fd/offset pair.
        let ptr = unsafe {
            mmap(
                None,
                len_nz,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                memfd.as_fd(),
                0,
            )
        }
        .map_err(|e| ShmError::Map(std::io::Error::from(e)))?;
        Ok(ShmRegion {
            memfd,
            ptr: ptr.cast(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` bytes for the region's lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` excludes concurrent Rust
        // aliasing (the other writer, if any, is a different process).
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Duplicates the backing fd, for passing to another process. The
    /// mapping itself is not shared by this call; the receiver must map it
    /// again with [`ShmRegion::from_fd`].
    pub fn try_clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.memfd.try_clone()
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.memfd.as_raw_fd()
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe exactly the mapping created in
        // `map`, not yet unmapped.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}
