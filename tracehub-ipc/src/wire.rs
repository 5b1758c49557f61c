// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The envelope types exchanged between [`crate::client::ProducerIpcClient`]
//! and [`crate::host::ProducerIpcHost`] (§4.I/§4.J). Payloads inside
//! `BindService`/`InvokeMethod`/`Reply` are opaque `bincode`-encoded bytes;
//! this module only frames the RPC-level envelope, not application data.

use serde::{Deserialize, Serialize};

pub type RequestId = u64;
pub type ServiceId = u32;
pub type MethodId = u32;

#[derive(Debug, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Declares the caller's peer identity on a non-UNIX transport. Per
    /// §4.B/§4.J, on `AF_UNIX` this is always ignored in favor of kernel
    /// credentials.
    SetPeerIdentity { uid: u32, pid: i32 },
    BindService {
        request_id: RequestId,
        service_name: String,
    },
    InvokeMethod {
        request_id: RequestId,
        service_id: ServiceId,
        method_id: MethodId,
        /// `bincode`-encoded method argument.
        args: Vec<u8>,
        /// If set, the host invokes the method but sends no reply.
        drop_reply: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ServerFrame {
    BindServiceReply {
        request_id: RequestId,
        result: Result<BindServiceOk, String>,
    },
    MethodReply {
        request_id: RequestId,
        /// `true` for a streaming method's non-final replies; the client
        /// keeps the callback registered until a reply with `has_more ==
        /// false` arrives.
        has_more: bool,
        result: Result<Vec<u8>, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindServiceOk {
    pub service_id: ServiceId,
    pub method_ids: Vec<(String, MethodId)>,
}
