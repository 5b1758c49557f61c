// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod arbiter;
pub mod heap_ring;
pub mod page;
pub mod region;
pub mod smb;

pub use arbiter::{
    ChunkRef, ChunkTakeError, CommittedChunk, FlushRequestId, OverflowPolicy, SharedMemoryArbiter, SharedMemoryReader,
    WriterId,
};
pub use heap_ring::{HeapRing, MetadataPage, SpinMode};
pub use page::{AbiViolation, ChunkHeaderView, ChunkState, CHUNK_HEADER_SIZE};
pub use region::ShmRegion;
pub use smb::{SharedMemoryBuffer, MAX_PAGE_SIZE};
