// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! §8 scenario 5: a session with `write_into_file` set stops writing once
//! `max_file_size_bytes` would be exceeded, dropping whole packets rather
//! than truncating mid-packet.
//!
//! Goes through the real `enable_tracing` wire method to hand the output
//! fd to the service exactly as a consumer connection would; the drained
//! packets themselves are fed straight to the registry rather than routed
//! through a live producer's shared-memory buffer, since standing up a
//! full producer/SMB pipeline just to generate bytes would test the
//! producer pipeline, not the cap.

use std::io::{Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tracehub_ipc::{ClientId, PeerIdentity, ServiceMethod, ServiceRegistration};
use tracehub_runtime::TaskRunner;
use tracehub_service::config::{BufferConfig, BufferFillPolicy, LockdownMode, TraceConfig};
use tracehub_service::ids::TracingSessionId;
use tracehubd::consumer_port::build_registration;
use tracehubd::core_handle::ServiceHandle;
use tracehubd::file_drain::FileDrainRegistry;
use tracehubd::wire::{EnableTracingReply, EnableTracingRequest};

fn peer() -> PeerIdentity {
    PeerIdentity { uid: 1000, pid: 1 }
}

fn method(registration: &ServiceRegistration, name: &str) -> Arc<dyn ServiceMethod> {
    registration.methods.iter().find(|(n, _)| n == name).unwrap().1.clone()
}

#[tokio::test]
async fn packets_past_the_cap_are_dropped_whole_not_truncated() {
    let service = ServiceHandle::new(TaskRunner::spawn("test-file-drain-cap"));
    let file_drains = Arc::new(FileDrainRegistry::new());
    let registration = build_registration(service, std::time::Duration::from_secs(10), file_drains.clone());
    let enable_tracing = method(&registration, "enable_tracing");

    let config = TraceConfig {
        buffers: vec![BufferConfig { size_kb: 4, fill_policy: BufferFillPolicy::RingBuffer }],
        duration_ms: 0,
        enable_extra_guardrails: false,
        lockdown_mode: LockdownMode::Unchanged,
        write_into_file: true,
        file_write_period_ms: Some(100),
        max_file_size_bytes: 10,
        producers: vec![],
        data_sources: vec![],
    };
    let req = EnableTracingRequest { config, has_output_fd: true };
    let output = tempfile::tempfile().unwrap();
    let fd: OwnedFd = output.try_clone().unwrap().into();
    let args = bincode::serialize(&req).unwrap();
    let outcome = enable_tracing.invoke(ClientId(1), peer(), args, vec![fd]).await.unwrap();
    let reply: EnableTracingReply = bincode::deserialize(&outcome.payload).unwrap();
    let session_id = TracingSessionId(reply.session_id);
    assert!(file_drains.contains(session_id));

    // Three 4-byte packets: the first two fit under the 10-byte cap, the
    // third would push the total to 12 and must be dropped whole.
    let packets = vec![vec![1u8; 4], vec![2u8; 4], vec![3u8; 4]];
    let hit_cap = file_drains.write_packets(session_id, &packets, 10);
    assert!(hit_cap);

    let mut written = Vec::new();
    let mut output = output;
    output.seek(SeekFrom::Start(0)).unwrap();
    output.read_to_end(&mut written).unwrap();
    assert_eq!(written, [vec![1u8; 4], vec![2u8; 4]].concat());
    assert!(written.len() as u64 <= 10);
}
