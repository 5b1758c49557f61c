// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered frame deserializer (§4.A): a length-prefixed framing layer that
//! a transport pushes arbitrary-sized byte chunks into. Frames are
//! `uint32 little-endian length` followed by `length` bytes of payload.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Frames above this size are treated as a transport-level ABI violation.
/// Chosen to comfortably hold a `CommitData` batch of SMB chunk refs
/// without bounding legitimate traffic.
pub const MAX_FRAME_LEN: u32 = 128 * 1024 * 1024;

const LEN_PREFIX_BYTES: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    OversizeFrame(u32),
}

/// One fully reassembled frame's payload, without the length prefix.
pub type Frame = Vec<u8>;

/// Reassembles frames out of a byte stream pushed in arbitrarily-sized
/// chunks via [`BufferedFrameDeserializer::begin_receive`] /
/// [`BufferedFrameDeserializer::end_receive`].
#[derive(Default)]
pub struct BufferedFrameDeserializer {
    buf: BytesMut,
}

impl BufferedFrameDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a writable region a transport's `read()` can fill, at least
    /// `min_capacity` bytes if `min_capacity` is given, otherwise a
    /// reasonable default growth increment.
    pub fn begin_receive(&mut self, min_capacity: usize) -> &mut [u8] {
        let want = min_capacity.max(4096);
        self.buf.reserve(want);
        let spare = self.buf.spare_capacity_mut();
        // SAFETY: the caller is required to only report as read
        // (`end_receive`) the prefix of this slice it actually wrote to,
        // and every byte up to that point came from the transport's own
        // read syscall, not from uninitialized memory being interpreted.
        unsafe { std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len()) }
    }

    /// Commits `rsize` bytes as having been written into the slice handed
    /// back by the last `begin_receive` call.
    pub fn end_receive(&mut self, rsize: usize) {
        // SAFETY: see begin_receive; rsize bytes were actually written by
        // the transport before this call.
        unsafe { self.buf.set_len(self.buf.len() + rsize) };
    }

    /// Pops one fully reassembled frame, if the buffer holds one. Returns
    /// `Err` (and the caller should close the transport) if the declared
    /// length exceeds [`MAX_FRAME_LEN`].
    pub fn pop_next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.buf[..LEN_PREFIX_BYTES].try_into().unwrap());
        if len > MAX_FRAME_LEN {
            return Err(FrameError::OversizeFrame(len));
        }
        let total = LEN_PREFIX_BYTES + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX_BYTES);
        let frame = self.buf.split_to(len as usize).to_vec();
        Ok(Some(frame))
    }
}

/// Prepends the length prefix for one outgoing frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX_BYTES + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
