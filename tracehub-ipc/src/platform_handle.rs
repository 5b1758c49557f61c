// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owned, type-tagged file descriptor, grounded on
//! `datadog-ipc/src/platform/unix/platform_handle.rs`. `T` is a marker for
//! what the fd actually is (a `UnixStream`, a `File` backing an SMB region,
//! …) so call sites don't need to remember by convention.

use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// An owned fd tagged with the type it's meant to be used as. Cloning a
/// `PlatformHandle` shares ownership (via `Arc`) rather than duplicating
/// the fd, matching the teacher's shared-ownership model for handles that
/// get queued for `SCM_RIGHTS` transfer while still being read locally.
#[derive(Clone)]
pub struct PlatformHandle<T> {
    inner: Arc<OwnedFd>,
    phantom: PhantomData<T>,
}

impl<T> PlatformHandle<T> {
    /// # Safety
    /// `fd` must be open and the caller must not retain any other owner of
    /// it; `PlatformHandle` takes exclusive logical ownership.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            inner: Arc::new(OwnedFd::from_raw_fd(fd)),
            phantom: PhantomData,
        }
    }

    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            inner: Arc::new(self.inner.try_clone()?),
            phantom: PhantomData,
        })
    }

    /// Unwraps into a plain owned fd. Duplicates the descriptor rather than
    /// failing if another clone of this handle is still alive, since a
    /// freshly-received fd is never actually shared in practice.
    pub fn into_owned_fd(self) -> std::io::Result<OwnedFd> {
        match Arc::try_unwrap(self.inner) {
            Ok(fd) => Ok(fd),
            Err(shared) => shared.try_clone(),
        }
    }
}

impl<T> AsRawFd for PlatformHandle<T> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl<T: IntoRawFd> From<T> for PlatformHandle<T> {
    fn from(src: T) -> Self {
        unsafe { PlatformHandle::from_raw_fd(src.into_raw_fd()) }
    }
}

impl<T> std::fmt::Debug for PlatformHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformHandle").field("fd", &self.as_raw_fd()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn from_owned_file_exposes_same_fd() {
        let file = tempfile::tempfile().unwrap();
        let raw = file.as_raw_fd();
        let handle: PlatformHandle<File> = file.into();
        assert_eq!(handle.as_raw_fd(), raw);
    }

    #[test]
    fn clone_shares_the_same_fd() {
        let file = tempfile::tempfile().unwrap();
        let handle: PlatformHandle<File> = file.into();
        let cloned = handle.clone();
        assert_eq!(handle.as_raw_fd(), cloned.as_raw_fd());
    }
}
