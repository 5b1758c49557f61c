// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `bincode`-encoded request/reply payloads for the producer and consumer
//! IPC surfaces (§4.K), framed by `tracehub-ipc`'s `InvokeMethod`/`Reply`
//! envelope. These types are this crate's own: §1 excludes the specifics
//! of protobuf encoding, and SPEC_FULL.md §E settles on `bincode`-over-
//! `serde` for the payload codec these frames carry.

use serde::{Deserialize, Serialize};
use tracehub_service::config::TraceConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterProducerRequest {
    pub name: String,
    pub shm_size_hint_kb: Option<u32>,
    pub page_size_hint_kb: Option<u32>,
    /// How many concurrent trace-writer slots this producer expects to use
    /// (§4.F: the bound the service validates `writer_id` against). Falls
    /// back to `K_MAX_TRACE_WRITERS_PER_PRODUCER` when absent.
    pub max_writer_id_hint: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterProducerReply {
    pub producer_id: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterDataSourceRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnregisterDataSourceRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkToMoveWire {
    pub buffer_id: u16,
    pub page_idx: usize,
    pub chunk_idx: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkToPatchWire {
    pub buffer_id: u16,
    pub writer_id: u16,
    pub chunk_id: u32,
    pub patches: Vec<(u32, Vec<u8>)>,
    pub has_more_patches: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitDataRequest {
    pub chunks_to_move: Vec<ChunkToMoveWire>,
    pub chunks_to_patch: Vec<ChunkToPatchWire>,
    /// A bare flush ack is a `CommitData` with no `chunks_to_move` but this
    /// set (§4.K.3).
    pub flush_request_id: Option<u64>,
}

/// A producer-bound instruction the service couldn't push directly since
/// the transport is request/response: delivered as the reply to the
/// producer's next `GetAsyncCommand` long-poll call (§4.K.1/§4.K.4/§4.K.5).
#[derive(Debug, Serialize, Deserialize)]
pub enum AsyncCommandWire {
    CreateDataSourceInstance {
        instance_id: u64,
        data_source_name: String,
        target_buffer: u16,
    },
    TeardownDataSourceInstance {
        instance_id: u64,
    },
    RequestFlush {
        flush_request_id: u64,
        instance_ids: Vec<u64>,
    },
    /// The SMB fd itself rides along as an out-of-band `MethodOutcome` fd,
    /// not inside this payload.
    DeliverSmb {
        page_size: usize,
        total_size: usize,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnableTracingRequest {
    pub config: TraceConfig,
    pub has_output_fd: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnableTracingReply {
    pub session_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DisableTracingRequest {
    pub session_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FreeBuffersRequest {
    pub session_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushRequest {
    pub session_id: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlushReply {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadBuffersRequest {
    pub session_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketWire {
    pub payload: Vec<u8>,
    pub trusted_uid: u32,
}

/// One batch in a `ReadBuffers` stream. The RPC layer's own `has_more`
/// (§4.J) already tells the client whether another reply is coming; this
/// mirrors it at the payload level too since a consumer decoding the
/// stream in isolation (e.g. the relay's downstream) still needs it
/// without unwrapping the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadBuffersReply {
    pub packets: Vec<PacketWire>,
    pub has_more: bool,
}
