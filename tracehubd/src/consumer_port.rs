// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The consumer-facing service (§4.K.1/§4.K.2/§4.K.5/§4.K.6):
//! `EnableTracing`, `DisableTracing`, `Flush`, `FreeBuffers`, and the
//! streaming `ReadBuffers`.
//!
//! `duration_ms` arms a one-shot delayed task that disables the session;
//! `write_into_file` registers the consumer-supplied fd in a
//! [`FileDrainRegistry`] and arms a self-rescheduling periodic task that
//! drains the session's buffers into it on `clamped_file_write_period_ms`,
//! same shape as `tracehub_ftrace::FtraceController`'s watch callbacks
//! re-arming themselves.

use crate::core_handle::ServiceHandle;
use crate::file_drain::FileDrainRegistry;
use crate::wire::{
    DisableTracingRequest, EnableTracingReply, EnableTracingRequest, FlushReply, FlushRequest, FreeBuffersRequest, PacketWire,
    ReadBuffersReply, ReadBuffersRequest,
};
use async_trait::async_trait;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracehub_ipc::host::MethodOutcome;
use tracehub_ipc::socket::PeerIdentity;
use tracehub_ipc::{ClientId, ServiceMethod, ServiceRegistration};
use tracehub_service::ids::{ConsumerId, TracingSessionId};

/// §4.K.6: soft cap on how much a single `ReadBuffers` reply batches before
/// yielding a reply and starting the next one.
const READ_BUFFERS_BATCH_CAP_BYTES: usize = 32 * 1024;

fn decode<T: serde::de::DeserializeOwned>(args: &[u8]) -> Result<T, String> {
    bincode::deserialize(args).map_err(|e| e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, String> {
    bincode::serialize(value).map_err(|e| e.to_string())
}

fn consumer_id(client: ClientId) -> ConsumerId {
    ConsumerId(client.0)
}

struct EnableTracingMethod {
    service: ServiceHandle,
    file_drains: Arc<FileDrainRegistry>,
}

#[async_trait]
impl ServiceMethod for EnableTracingMethod {
    async fn invoke(&self, client: ClientId, _identity: PeerIdentity, args: Vec<u8>, mut fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: EnableTracingRequest = decode(&args)?;
        let consumer = consumer_id(client);
        let config = req.config.clone();
        let has_output_fd = req.has_output_fd;
        let session_id = self
            .service
            .with_core(move |core| core.enable_tracing(consumer, req.config, has_output_fd))
            .await
            .map_err(|e| e.to_string())?;

        if config.write_into_file {
            if let Some(fd) = fds.pop() {
                self.file_drains.register(session_id, File::from(fd));
                arm_file_drain(self.service.clone(), self.file_drains.clone(), session_id, config.clamped_file_write_period_ms(), config.max_file_size_bytes);
            }
        }
        if config.duration_ms > 0 {
            let file_drains = self.file_drains.clone();
            self.service
                .post_delayed_with_core(Duration::from_millis(config.duration_ms), move |core| {
                    core.disable_tracing(session_id);
                    file_drains.remove(session_id);
                });
        }

        encode(&EnableTracingReply { session_id: session_id.0 }).map(Into::into)
    }
}

/// Drains `session_id`'s buffers into its registered file every `period_ms`,
/// re-arming itself each time until `max_file_size_bytes` is hit or the
/// session is removed from `file_drains` (by `DisableTracing`/`FreeBuffers`
/// or the `duration_ms` auto-disable above).
fn arm_file_drain(service: ServiceHandle, file_drains: Arc<FileDrainRegistry>, session_id: TracingSessionId, period_ms: u64, max_file_size_bytes: u64) {
    service.post_delayed_with_core(Duration::from_millis(period_ms), move |core| {
        if !file_drains.contains(session_id) {
            return;
        }
        let packets: Vec<Vec<u8>> = core.read_buffers(session_id).into_iter().map(|(payload, _trusted_uid)| payload).collect();
        let hit_cap = file_drains.write_packets(session_id, &packets, max_file_size_bytes);
        if hit_cap {
            core.disable_tracing(session_id);
            file_drains.remove(session_id);
            return;
        }
        arm_file_drain(service.clone(), file_drains.clone(), session_id, period_ms, max_file_size_bytes);
    });
}

struct DisableTracingMethod {
    service: ServiceHandle,
    file_drains: Arc<FileDrainRegistry>,
}

#[async_trait]
impl ServiceMethod for DisableTracingMethod {
    async fn invoke(&self, _client: ClientId, _identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: DisableTracingRequest = decode(&args)?;
        let session_id = TracingSessionId(req.session_id);
        self.service.with_core(move |core| core.disable_tracing(session_id)).await;
        self.file_drains.remove(session_id);
        Ok(Vec::new().into())
    }
}

struct FreeBuffersMethod {
    service: ServiceHandle,
    file_drains: Arc<FileDrainRegistry>,
}

#[async_trait]
impl ServiceMethod for FreeBuffersMethod {
    async fn invoke(&self, _client: ClientId, _identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: FreeBuffersRequest = decode(&args)?;
        let session_id = TracingSessionId(req.session_id);
        self.service.with_core(move |core| core.free_buffers(session_id)).await;
        self.file_drains.remove(session_id);
        Ok(Vec::new().into())
    }
}

/// A flush's outcome is decided either by every producer acking it
/// (`core.ack_flush_from_commit`/`core.begin_flush` completing the pending
/// set) or by the timeout firing first; whichever happens first wins and
/// the loser's check becomes a no-op (§4.K.5).
struct FlushMethod {
    service: ServiceHandle,
}

#[async_trait]
impl ServiceMethod for FlushMethod {
    async fn invoke(&self, _client: ClientId, _identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: FlushRequest = decode(&args)?;
        let session_id = TracingSessionId(req.session_id);

        let flush_request_id = self.service.with_core(move |core| core.begin_flush(session_id)).await;
        let Some(flush_request_id) = flush_request_id else {
            // No active data source instances to flush: vacuously successful.
            return encode(&FlushReply { success: true }).map(Into::into);
        };

        let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);
        loop {
            let still_pending = self
                .service
                .with_core(move |core| !core.check_flush_timeout(session_id, flush_request_id))
                .await;
            // `check_flush_timeout` both answers and evicts on timeout, so a
            // `false` here can mean either "already acked" or "just timed
            // out"; either way there's nothing left to wait on.
            if !still_pending {
                let success = Instant::now() < deadline;
                return encode(&FlushReply { success }).map(Into::into);
            }
            if Instant::now() >= deadline {
                self.service.with_core(move |core| core.check_flush_timeout(session_id, flush_request_id)).await;
                return encode(&FlushReply { success: false }).map(Into::into);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

struct ReadBuffersMethod {
    service: ServiceHandle,
    snapshot_interval: Duration,
}

#[async_trait]
impl ServiceMethod for ReadBuffersMethod {
    async fn invoke(&self, client: ClientId, identity: PeerIdentity, args: Vec<u8>, fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.invoke_streaming(client, identity, args, fds, tx).await;
        rx.recv().await.unwrap_or_else(|| Err("read_buffers produced no reply".to_string()))
    }

    async fn invoke_streaming(
        &self,
        _client: ClientId,
        _identity: PeerIdentity,
        args: Vec<u8>,
        _fds: Vec<OwnedFd>,
        replies: mpsc::UnboundedSender<Result<MethodOutcome, String>>,
    ) {
        let req: ReadBuffersRequest = match decode::<ReadBuffersRequest>(&args) {
            Ok(req) => req,
            Err(e) => {
                let _ = replies.send(Err(e));
                return;
            }
        };
        let session_id = TracingSessionId(req.session_id);

        let mut packets: Vec<PacketWire> = Vec::new();
        let emit_config = self.service.with_core(move |core| core.take_config_emission(session_id)).await;
        if emit_config {
            packets.push(PacketWire { payload: Vec::new(), trusted_uid: 0 });
        }
        let now = Instant::now();
        let interval = self.snapshot_interval;
        let emit_clock = self
            .service
            .with_core(move |core| core.take_clock_snapshot_due(session_id, now, interval))
            .await;
        if emit_clock {
            packets.push(PacketWire { payload: Vec::new(), trusted_uid: 0 });
        }
        let emit_stats = self
            .service
            .with_core(move |core| core.take_stats_snapshot_due(session_id, now, interval))
            .await;
        if emit_stats {
            packets.push(PacketWire { payload: Vec::new(), trusted_uid: 0 });
        }

        let drained = self.service.with_core(move |core| core.read_buffers(session_id)).await;

        let mut batch: Vec<PacketWire> = std::mem::take(&mut packets);
        let mut batch_bytes: usize = batch.iter().map(|p| p.payload.len()).sum();
        let mut remaining = drained.into_iter().peekable();

        if remaining.peek().is_none() && batch.is_empty() {
            let _ = replies.send(Ok(encode(&ReadBuffersReply { packets: Vec::new(), has_more: false }).map(Into::into).unwrap()));
            return;
        }

        while let Some((payload, trusted_uid)) = remaining.next() {
            batch_bytes += payload.len();
            batch.push(PacketWire { payload, trusted_uid });
            if batch_bytes >= READ_BUFFERS_BATCH_CAP_BYTES {
                let has_more = remaining.peek().is_some();
                let reply = ReadBuffersReply { packets: std::mem::take(&mut batch), has_more };
                batch_bytes = 0;
                let outcome = encode(&reply).map(Into::into);
                if replies.send(outcome).is_err() {
                    return;
                }
            }
        }
        if !batch.is_empty() {
            let reply = ReadBuffersReply { packets: batch, has_more: false };
            let _ = replies.send(encode(&reply).map(Into::into));
        }
    }
}

/// Builds the `"consumer"` service registration. Unlike the producer side,
/// a consumer connection carries no cross-call state of its own: its
/// `ConsumerId` is derived straight from its `ClientId`, so there's no
/// registry to clean up on disconnect (the service still frees its
/// session's buffers, but only when the consumer explicitly asks via
/// `FreeBuffers`, per §4.K.1 leaving teardown to the consumer's choice).
pub fn build_registration(service: ServiceHandle, snapshot_interval: Duration, file_drains: Arc<FileDrainRegistry>) -> ServiceRegistration {
    ServiceRegistration {
        name: "consumer".to_string(),
        methods: vec![
            (
                "enable_tracing".to_string(),
                Arc::new(EnableTracingMethod { service: service.clone(), file_drains: file_drains.clone() }) as Arc<dyn ServiceMethod>,
            ),
            (
                "disable_tracing".to_string(),
                Arc::new(DisableTracingMethod { service: service.clone(), file_drains: file_drains.clone() }),
            ),
            (
                "free_buffers".to_string(),
                Arc::new(FreeBuffersMethod { service: service.clone(), file_drains }),
            ),
            ("flush".to_string(), Arc::new(FlushMethod { service: service.clone() })),
            ("read_buffers".to_string(), Arc::new(ReadBuffersMethod { service, snapshot_interval })),
        ],
        on_client_disconnect: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracehub_runtime::TaskRunner;
    use tracehub_service::config::{BufferConfig, BufferFillPolicy, LockdownMode, TraceConfig};

    fn peer() -> PeerIdentity {
        PeerIdentity { uid: 1000, pid: 1 }
    }

    fn basic_config() -> TraceConfig {
        TraceConfig {
            buffers: vec![BufferConfig { size_kb: 4, fill_policy: BufferFillPolicy::RingBuffer }],
            duration_ms: 0,
            enable_extra_guardrails: false,
            lockdown_mode: LockdownMode::Unchanged,
            write_into_file: false,
            file_write_period_ms: None,
            max_file_size_bytes: 0,
            producers: vec![],
            data_sources: vec![],
        }
    }

    #[tokio::test]
    async fn enable_then_read_buffers_emits_the_config_packet_once() {
        let service = ServiceHandle::new(TaskRunner::spawn("test-consumer-port"));
        let file_drains = Arc::new(FileDrainRegistry::new());
        let enable = EnableTracingMethod { service: service.clone(), file_drains };
        let req = EnableTracingRequest { config: basic_config(), has_output_fd: false };
        let outcome = enable.invoke(ClientId(1), peer(), encode(&req).unwrap(), Vec::new()).await.unwrap();
        let reply: EnableTracingReply = decode(&outcome.payload).unwrap();

        let read = ReadBuffersMethod { service, snapshot_interval: Duration::from_secs(10) };
        let req = ReadBuffersRequest { session_id: reply.session_id };
        let outcome = read.invoke(ClientId(1), peer(), encode(&req).unwrap(), Vec::new()).await.unwrap();
        let first: ReadBuffersReply = decode(&outcome.payload).unwrap();
        assert_eq!(first.packets.len(), 2); // trace config + clock snapshot

        let outcome = read
            .invoke(ClientId(1), peer(), encode(&ReadBuffersRequest { session_id: reply.session_id }).unwrap(), Vec::new())
            .await
            .unwrap();
        let second: ReadBuffersReply = decode(&outcome.payload).unwrap();
        assert!(second.packets.is_empty());
    }

    #[tokio::test]
    async fn flush_with_no_instances_succeeds_immediately() {
        let service = ServiceHandle::new(TaskRunner::spawn("test-consumer-port-flush"));
        let file_drains = Arc::new(FileDrainRegistry::new());
        let enable = EnableTracingMethod { service: service.clone(), file_drains };
        let req = EnableTracingRequest { config: basic_config(), has_output_fd: false };
        let outcome = enable.invoke(ClientId(1), peer(), encode(&req).unwrap(), Vec::new()).await.unwrap();
        let reply: EnableTracingReply = decode(&outcome.payload).unwrap();

        let flush = FlushMethod { service };
        let req = FlushRequest { session_id: reply.session_id, timeout_ms: 1000 };
        let outcome = flush.invoke(ClientId(1), peer(), encode(&req).unwrap(), Vec::new()).await.unwrap();
        let flush_reply: FlushReply = decode(&outcome.payload).unwrap();
        assert!(flush_reply.success);
    }

    #[tokio::test]
    async fn duration_ms_auto_disables_the_session() {
        let service = ServiceHandle::new(TaskRunner::spawn("test-consumer-port-duration"));
        let file_drains = Arc::new(FileDrainRegistry::new());
        let enable = EnableTracingMethod { service: service.clone(), file_drains };
        let mut config = basic_config();
        config.duration_ms = 30;
        let req = EnableTracingRequest { config, has_output_fd: false };
        let outcome = enable.invoke(ClientId(1), peer(), encode(&req).unwrap(), Vec::new()).await.unwrap();
        let reply: EnableTracingReply = decode(&outcome.payload).unwrap();
        let session_id = TracingSessionId(reply.session_id);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let flush = FlushMethod { service };
        let req = FlushRequest { session_id: session_id.0, timeout_ms: 100 };
        let outcome = flush.invoke(ClientId(1), peer(), encode(&req).unwrap(), Vec::new()).await.unwrap();
        let flush_reply: FlushReply = decode(&outcome.payload).unwrap();
        assert!(flush_reply.success); // no instances left pending once disabled
    }

    #[tokio::test]
    async fn write_into_file_drains_packets_into_the_registered_fd() {
        let service = ServiceHandle::new(TaskRunner::spawn("test-consumer-port-file-drain"));
        let file_drains = Arc::new(FileDrainRegistry::new());
        let enable = EnableTracingMethod { service: service.clone(), file_drains: file_drains.clone() };
        let mut config = basic_config();
        config.write_into_file = true;
        config.file_write_period_ms = Some(100);
        config.max_file_size_bytes = 1024 * 1024;
        let req = EnableTracingRequest { config, has_output_fd: true };
        let output = tempfile::tempfile().unwrap();
        let fd: OwnedFd = output.into();
        let outcome = enable.invoke(ClientId(1), peer(), encode(&req).unwrap(), vec![fd]).await.unwrap();
        let reply: EnableTracingReply = decode(&outcome.payload).unwrap();

        assert!(file_drains.contains(TracingSessionId(reply.session_id)));
    }
}
