// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracing service core (§4.K): the single object that owns every
//! producer, tracing session, and central trace buffer. Every method here
//! is meant to run on the service's own `TaskRunner` thread (§4.C); nothing
//! in this module does its own locking because nothing here is meant to be
//! called from more than one thread.

use crate::config::{resolve_chunk_size_bytes, resolve_page_size_bytes, resolve_shm_size_bytes, TraceConfig};
use crate::ids::{BufferId, ConsumerId, DataSourceInstanceId, IdCounter, TracingSessionId, K_MAX_TRACE_BUFFER_ID};
use crate::producer::Producer;
use crate::session::{ActiveInstance, PendingFlush, TracingSession};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracehub_common::error::EnableTracingError;
use tracehub_common::ids::BitmapAllocator;
use tracehub_shm::{SharedMemoryBuffer, SharedMemoryReader};
use tracehub_tracebuf::{ChunkKey, TraceBuffer};

/// Service-wide counters for the stats packet `ReadBuffers` emits at most
/// once per interval (§4.K.6).
pub struct StatsSnapshot {
    pub producers: usize,
    pub sessions: usize,
    pub buffers: usize,
    pub buffer_stats: Vec<BufferStats>,
}

pub struct BufferStats {
    pub buffer_id: u16,
    pub chunks_overwritten: u64,
    pub patches_failed: u64,
}

/// One chunk the producer's commit-data RPC says is ready to be drained
/// out of its SMB and copied into a central buffer (§4.K.3).
pub struct ChunkToMove {
    pub buffer_id: BufferId,
    pub page_idx: usize,
    pub chunk_idx: usize,
}

/// An in-place byte patch for a chunk already copied into a central
/// buffer, identified the same way `TraceBuffer` indexes it (§4.K.3).
pub struct ChunkToPatch {
    pub buffer_id: BufferId,
    pub writer_id: u16,
    pub chunk_id: u32,
    pub patches: Vec<(u32, Vec<u8>)>,
    pub has_more_patches: bool,
}

pub struct TracingServiceCore {
    producers: HashMap<u16, Producer>,
    sessions: HashMap<TracingSessionId, TracingSession>,
    buffers: HashMap<BufferId, TraceBuffer>,
    buffer_ids: BitmapAllocator,
    session_ids: IdCounter,
    instance_ids: IdCounter,
    consumer_sessions: HashMap<ConsumerId, TracingSessionId>,
    lockdown_mode: bool,
}

impl Default for TracingServiceCore {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingServiceCore {
    pub fn new() -> Self {
        TracingServiceCore {
            producers: HashMap::new(),
            sessions: HashMap::new(),
            buffers: HashMap::new(),
            buffer_ids: BitmapAllocator::new(K_MAX_TRACE_BUFFER_ID),
            session_ids: IdCounter::new(),
            instance_ids: IdCounter::new(),
            consumer_sessions: HashMap::new(),
            lockdown_mode: false,
        }
    }

    pub fn add_producer(&mut self, producer_id: u16, producer: Producer) {
        self.producers.insert(producer_id, producer);
    }

    /// Drops a disconnected producer. Instances it was running are left in
    /// their sessions' bookkeeping (a disconnect is not a clean teardown);
    /// the session simply stops hearing from it.
    pub fn remove_producer(&mut self, producer_id: u16) {
        self.producers.remove(&producer_id);
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    /// Publishes a `(name, producer_id)` data-source descriptor (§3,
    /// `RegisterDataSource`). A no-op if `producer_id` isn't connected.
    pub fn register_data_source(&mut self, producer_id: u16, name: &str) {
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.register_data_source(name);
        }
    }

    /// Withdraws a previously published data-source descriptor. Idempotent,
    /// and a later `RegisterDataSource` for the same name succeeds (§8
    /// "round-trip and idempotence").
    pub fn unregister_data_source(&mut self, producer_id: u16, name: &str) {
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.data_sources.remove(name);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_lockdown(&self) -> bool {
        self.lockdown_mode
    }

    /// Starts a new tracing session for `consumer_id` (§4.K.1). Rejects and
    /// leaves all state unchanged if any precondition fails; on success,
    /// every buffer is allocated and every matching data source is
    /// instantiated before returning.
    pub fn enable_tracing(
        &mut self,
        consumer_id: ConsumerId,
        config: TraceConfig,
        has_output_fd: bool,
    ) -> Result<TracingSessionId, EnableTracingError> {
        if self.consumer_sessions.contains_key(&consumer_id) {
            return Err(EnableTracingError::ConsumerBusy);
        }
        if self.lockdown_mode && matches!(config.lockdown_mode, crate::config::LockdownMode::Unchanged) {
            return Err(EnableTracingError::LockdownViolation);
        }
        if config.buffers.len() > crate::config::K_MAX_BUFFERS_PER_CONSUMER {
            return Err(EnableTracingError::TooManyBuffers(config.buffers.len()));
        }
        if self.sessions.len() >= crate::config::K_MAX_CONCURRENT_TRACING_SESSIONS {
            return Err(EnableTracingError::TooManySessions);
        }
        if config.write_into_file && !has_output_fd {
            return Err(EnableTracingError::MissingFileDescriptor);
        }
        if config.enable_extra_guardrails {
            if config.duration_ms > crate::config::GUARDRAIL_MAX_DURATION_MS {
                return Err(EnableTracingError::DurationGuardrail(config.duration_ms));
            }
            if config.total_buffer_bytes() > crate::config::GUARDRAIL_MAX_TOTAL_BUFFER_BYTES {
                return Err(EnableTracingError::BufferSizeGuardrail(config.total_buffer_bytes()));
            }
        }

        let mut allocated = Vec::with_capacity(config.buffers.len());
        for _ in &config.buffers {
            match self.buffer_ids.allocate() {
                Some(raw) => allocated.push(BufferId(raw as u16)),
                None => {
                    for id in &allocated {
                        self.buffer_ids.free(id.0 as usize);
                    }
                    return Err(EnableTracingError::BufferIdsExhausted);
                }
            }
        }
        for (id, buffer_cfg) in allocated.iter().zip(&config.buffers) {
            let capacity = buffer_cfg.size_kb as usize * 1024;
            self.buffers.insert(*id, TraceBuffer::new(capacity, buffer_cfg.fill_policy.into()));
        }

        let session_id = TracingSessionId(self.session_ids.next());

        match config.lockdown_mode {
            crate::config::LockdownMode::Set => self.lockdown_mode = true,
            crate::config::LockdownMode::Clear => self.lockdown_mode = false,
            crate::config::LockdownMode::Unchanged => {}
        }

        let mut session = TracingSession::new(config, allocated);
        self.instantiate_data_sources(&mut session);
        self.sessions.insert(session_id, session);
        self.consumer_sessions.insert(consumer_id, session_id);
        Ok(session_id)
    }

    /// Matches every `DataSourceConfigEntry` against registered producers
    /// (§4.K.4): empty `producer_name_filter` matches any producer that
    /// advertises the data source by name, otherwise only producers whose
    /// name appears in the filter. Ensures the producer has an SMB before
    /// asking it to instantiate, since the first data source on a producer
    /// is usually what triggers SMB setup.
    fn instantiate_data_sources(&mut self, session: &mut TracingSession) {
        let entries = session.config.data_sources.clone();
        for entry in &entries {
            let Some(global_buffer) = session.global_buffer_id(entry.target_buffer) else {
                continue;
            };
            let matching_producers: Vec<u16> = self
                .producers
                .iter()
                .filter(|(_, p)| p.provides_data_source(&entry.name))
                .filter(|(_, p)| entry.producer_name_filter.is_empty() || entry.producer_name_filter.contains(&p.name))
                .map(|(id, _)| *id)
                .collect();
            for producer_id in matching_producers {
                self.ensure_producer_has_smb(producer_id, &session.config);
                let instance_id = DataSourceInstanceId(self.instance_ids.next());
                session.add_instance(
                    producer_id,
                    ActiveInstance { instance_id, data_source_name: entry.name.clone() },
                );
                if let Some(producer) = self.producers.get(&producer_id) {
                    producer.channel.create_data_source_instance(instance_id, &entry.name, global_buffer.0);
                }
            }
        }
    }

    /// Creates and hands a fresh SMB to `producer_id` if it doesn't already
    /// have one (§4.K.1: page size and total size are resolved from the
    /// producer's own config entry, falling back to its `Connect`-time
    /// hint, then to defaults).
    fn ensure_producer_has_smb(&mut self, producer_id: u16, config: &TraceConfig) {
        let Some(producer) = self.producers.get(&producer_id) else {
            return;
        };
        if producer.has_smb() {
            return;
        }
        let override_kb = config
            .producers
            .iter()
            .find(|p| p.producer_name == producer.name)
            .and_then(|p| p.shm_size_kb);
        let page_kb_hint = config
            .producers
            .iter()
            .find(|p| p.producer_name == producer.name)
            .and_then(|p| p.page_size_kb)
            .or(producer.smb_page_size_kb);

        let page_size = resolve_page_size_bytes(page_kb_hint);
        let total_size = resolve_shm_size_bytes(override_kb, producer.shm_size_kb_hint, page_size);
        let chunk_size = resolve_chunk_size_bytes(page_size);

        let Ok(smb) = SharedMemoryBuffer::create(&format!("tracehub-smb-{producer_id}"), total_size, page_size, chunk_size)
        else {
            tracing::warn!(producer_id, "failed to create SMB for producer");
            return;
        };
        let Ok(producer_fd) = smb.try_clone_fd() else {
            tracing::warn!(producer_id, "failed to duplicate SMB fd for producer handoff");
            return;
        };
        let reader = SharedMemoryReader::new(smb);
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.channel.deliver_smb(producer_fd, page_size, total_size);
            producer.smb = Some(Arc::new(reader));
        }
    }

    /// Tears down a session's data source instances and marks it disabled
    /// (§4.K.2). Idempotent: disabling an already-disabled session is a
    /// no-op. The session itself survives until `free_buffers`.
    pub fn disable_tracing(&mut self, session_id: TracingSessionId) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if session.disabled {
            return;
        }
        session.disabled = true;
        for (producer_id, instances) in session.instances.drain() {
            if let Some(producer) = self.producers.get(&producer_id) {
                for instance in instances {
                    producer.channel.teardown_data_source_instance(instance.instance_id);
                }
            }
        }
        self.consumer_sessions.retain(|_, sid| *sid != session_id);
    }

    /// Marks that the consumer has been told about this session's disable,
    /// per §4.K.2 ("notify the consumer exactly once"). Returns `true` the
    /// first time this is called for the session, `false` on every
    /// subsequent call.
    pub fn take_disabled_notification(&mut self, session_id: TracingSessionId) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if session.notified_disabled {
            return false;
        }
        session.notified_disabled = true;
        true
    }

    /// Frees a session's buffers back to the bitmap allocator and erases
    /// the session entirely (§4.K.7). Implicitly disables first if the
    /// consumer never called `DisableTracing`.
    pub fn free_buffers(&mut self, session_id: TracingSessionId) {
        self.disable_tracing(session_id);
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        for id in session.buffers_index {
            self.buffers.remove(&id);
            self.buffer_ids.free(id.0 as usize);
        }
    }

    /// Drains committed chunks out of a producer's SMB and copies them into
    /// whichever central buffer they're destined for (§4.K.3). A chunk
    /// whose target `BufferID` isn't owned by any live session is dropped
    /// silently, same as a chunk the service simply can't validate.
    pub fn commit_data(&mut self, producer_id: u16, chunks_to_move: &[ChunkToMove], chunks_to_patch: &[ChunkToPatch]) {
        let Some(producer) = self.producers.get(&producer_id) else {
            return;
        };
        let Some(reader) = producer.smb.clone() else {
            return;
        };
        let producer_uid = producer.uid;
        let max_writer_id = producer.max_writer_id;

        for chunk in chunks_to_move {
            let Ok(committed) = reader.take_committed_chunk(chunk.page_idx, chunk.chunk_idx, max_writer_id) else {
                continue;
            };
            let Some(buffer) = self.buffers.get_mut(&chunk.buffer_id) else {
                continue;
            };
            let key = ChunkKey { producer_id, writer_id: committed.writer_id, chunk_id: committed.chunk_id };
            let _ = buffer.copy_chunk(key, producer_uid, committed.packet_count, committed.flags, &committed.body);
        }

        for patch in chunks_to_patch {
            if let Some(buffer) = self.buffers.get_mut(&patch.buffer_id) {
                let key = ChunkKey { producer_id, writer_id: patch.writer_id, chunk_id: patch.chunk_id };
                buffer.try_patch_chunk_contents(key, &patch.patches, patch.has_more_patches);
            }
        }
    }

    /// Starts a flush of `session_id` (§4.K.5): mints a random
    /// `FlushRequestID` (collisions across restarts don't matter, since
    /// IDs only need to be unique among a session's currently in-flight
    /// flushes), records which producer owns which outstanding instance,
    /// and asks every producer with a live instance in this session to
    /// flush. Returns `None` if the session has no active instances to
    /// flush.
    pub fn begin_flush(&mut self, session_id: TracingSessionId) -> Option<u64> {
        let session = self.sessions.get_mut(&session_id)?;
        if session.instances.is_empty() {
            return None;
        }
        let flush_request_id: u64 = loop {
            let candidate = rand::random();
            if candidate != 0 && !session.pending_flushes.contains_key(&candidate) {
                break candidate;
            }
        };
        let mut waiting_producers = std::collections::HashSet::new();
        for (producer_id, instances) in &session.instances {
            waiting_producers.insert(*producer_id);
            if let Some(producer) = self.producers.get(producer_id) {
                let ids: Vec<DataSourceInstanceId> = instances.iter().map(|i| i.instance_id).collect();
                producer.channel.request_flush(flush_request_id, &ids);
            }
        }
        session.pending_flushes.insert(flush_request_id, PendingFlush { waiting_producers });
        Some(flush_request_id)
    }

    /// Acknowledges that `producer_id` has committed every chunk for
    /// `flush_request_id`. Returns `true` once every producer the flush was
    /// sent to has acknowledged (the caller should invoke the consumer's
    /// flush callback at that point).
    pub fn ack_flush(&mut self, session_id: TracingSessionId, flush_request_id: u64, producer_id: u16) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        let Some(pending) = session.pending_flushes.get_mut(&flush_request_id) else {
            return false;
        };
        pending.waiting_producers.remove(&producer_id);
        if pending.waiting_producers.is_empty() {
            session.pending_flushes.remove(&flush_request_id);
            true
        } else {
            false
        }
    }

    /// Routes a producer's flush acknowledgment delivered as part of
    /// `CommitData` (§4.K.3): for every session, for every pending flush
    /// whose request id is `<=` the one the producer just acked, removes
    /// `producer_id` from that flush's waiting set. A producer may ack with
    /// any equal-or-higher `FlushRequestID`, atomically clearing every
    /// older pending flush for that producer in that session (§4.K.5).
    /// Returns the `(session_id, flush_request_id)` pairs that completed,
    /// so the caller can fire each one's consumer callback.
    pub fn ack_flush_from_commit(&mut self, producer_id: u16, flush_request_id: u64) -> Vec<(TracingSessionId, u64)> {
        let mut completed = Vec::new();
        for (session_id, session) in self.sessions.iter_mut() {
            let due: Vec<u64> = session.pending_flushes.keys().copied().filter(|f| *f <= flush_request_id).collect();
            for f in due {
                let Some(pending) = session.pending_flushes.get_mut(&f) else {
                    continue;
                };
                pending.waiting_producers.remove(&producer_id);
                if pending.waiting_producers.is_empty() {
                    session.pending_flushes.remove(&f);
                    completed.push((*session_id, f));
                }
            }
        }
        completed
    }

    /// Times out a still-pending flush (§4.K.5): called by a delayed task
    /// the caller arms when it issues the flush. Returns `true` if the
    /// flush was in fact still pending (and has now been removed), `false`
    /// if it already completed on its own.
    pub fn check_flush_timeout(&mut self, session_id: TracingSessionId, flush_request_id: u64) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        session.pending_flushes.remove(&flush_request_id).is_some()
    }

    /// Drains every buffer in `session_id` in write order, reassembling
    /// fragmented packets (§4.K.6). Each yielded item is a fully assembled
    /// packet paired with the trusted uid of the producer that wrote it.
    /// This does not itself cap batch size or emit the once-per-session
    /// trace-config/clock-snapshot/stats packets; the IPC-facing caller
    /// layers that on top since it depends on wire framing this crate has
    /// no notion of.
    pub fn read_buffers(&self, session_id: TracingSessionId) -> Vec<(Vec<u8>, u32)> {
        let Some(session) = self.sessions.get(&session_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for buffer_id in &session.buffers_index {
            let Some(buffer) = self.buffers.get(buffer_id) else {
                continue;
            };
            let mut reader = buffer.begin_read();
            while let Some(packet) = reader.read_next_trace_packet() {
                out.push(packet);
            }
        }
        out
    }

    /// Reports whether a clock snapshot is due for this session (§4.K.6:
    /// "at most once per interval, default 10s"), and if so marks `now` as
    /// the last time one was taken.
    pub fn take_clock_snapshot_due(&mut self, session_id: TracingSessionId, now: Instant, interval: Duration) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        match session.last_clock_snapshot {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                session.last_clock_snapshot = Some(now);
                true
            }
        }
    }

    /// Same gating as [`TracingServiceCore::take_clock_snapshot_due`] for
    /// the stats packet.
    pub fn take_stats_snapshot_due(&mut self, session_id: TracingSessionId, now: Instant, interval: Duration) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        match session.last_stats_snapshot {
            Some(last) if now.duration_since(last) < interval => false,
            _ => {
                session.last_stats_snapshot = Some(now);
                true
            }
        }
    }

    /// Service-wide and per-buffer counters for a session's stats packet
    /// (§4.K.6). Per-buffer counters are limited to what [`TraceBuffer`]
    /// itself tracks; `bytes_written`/`chunks_written`/`write_wrap_count`/
    /// `readaheads_*`/`abi_violations` are outside this crate's module
    /// boundary (ABI validation lives in `tracehub-shm`, which `CommitData`
    /// already consults before a chunk ever reaches `copy_chunk`).
    pub fn stats_snapshot(&self, session_id: TracingSessionId) -> StatsSnapshot {
        let buffer_stats = self
            .sessions
            .get(&session_id)
            .map(|session| {
                session
                    .buffers_index
                    .iter()
                    .filter_map(|id| {
                        self.buffers.get(id).map(|buf| BufferStats {
                            buffer_id: id.0,
                            chunks_overwritten: buf.chunks_overwritten(),
                            patches_failed: buf.patches_failed(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        StatsSnapshot {
            producers: self.producers.len(),
            sessions: self.sessions.len(),
            buffers: self.buffers.len(),
            buffer_stats,
        }
    }

    /// Marks the trace-config packet as emitted for this session, so the
    /// caller knows whether it still owes one (§4.K.6: emitted lazily, at
    /// most once, on the first `ReadBuffers`).
    pub fn take_config_emission(&mut self, session_id: TracingSessionId) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if session.config_emitted {
            return false;
        }
        session.config_emitted = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, BufferFillPolicy, DataSourceConfigEntry, LockdownMode};
    use crate::producer::ProducerChannel;
    use std::os::fd::OwnedFd;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeChannel {
        created: Mutex<Vec<(u64, String, u16)>>,
        torn_down: Mutex<Vec<u64>>,
        flushes: Mutex<Vec<(u64, Vec<u64>)>>,
        smb_deliveries: AtomicU64,
    }

    impl ProducerChannel for FakeChannel {
        fn create_data_source_instance(&self, instance_id: DataSourceInstanceId, data_source_name: &str, target_buffer: u16) {
            self.created.lock().unwrap().push((instance_id.0, data_source_name.to_string(), target_buffer));
        }

        fn teardown_data_source_instance(&self, instance_id: DataSourceInstanceId) {
            self.torn_down.lock().unwrap().push(instance_id.0);
        }

        fn request_flush(&self, flush_request_id: u64, instance_ids: &[DataSourceInstanceId]) {
            self.flushes.lock().unwrap().push((flush_request_id, instance_ids.iter().map(|i| i.0).collect()));
        }

        fn deliver_smb(&self, _fd: OwnedFd, _page_size: usize, _total_size: usize) {
            self.smb_deliveries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn basic_config(buffer_kb: u32, data_source: &str) -> TraceConfig {
        TraceConfig {
            buffers: vec![BufferConfig { size_kb: buffer_kb, fill_policy: BufferFillPolicy::RingBuffer }],
            duration_ms: 1000,
            enable_extra_guardrails: false,
            lockdown_mode: LockdownMode::Unchanged,
            write_into_file: false,
            file_write_period_ms: None,
            max_file_size_bytes: 0,
            producers: vec![],
            data_sources: vec![DataSourceConfigEntry {
                name: data_source.to_string(),
                target_buffer: 0,
                producer_name_filter: vec![],
            }],
        }
    }

    #[test]
    fn enable_tracing_allocates_buffers_and_instantiates_matching_data_sources() {
        let mut core = TracingServiceCore::new();
        let channel = Arc::new(FakeChannel::default());
        let mut producer = Producer::new(1000, "test_producer", channel.clone());
        producer.register_data_source("my_data_source");
        core.add_producer(1, producer);

        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "my_data_source"), false).unwrap();
        assert_eq!(core.session_count(), 1);
        assert_eq!(channel.created.lock().unwrap().len(), 1);
        assert_eq!(channel.smb_deliveries.load(Ordering::SeqCst), 1);

        core.free_buffers(session_id);
        assert_eq!(core.session_count(), 0);
    }

    #[test]
    fn second_session_from_same_consumer_is_rejected() {
        let mut core = TracingServiceCore::new();
        core.enable_tracing(ConsumerId(1), basic_config(4, "none"), false).unwrap();
        let err = core.enable_tracing(ConsumerId(1), basic_config(4, "none"), false).unwrap_err();
        assert!(matches!(err, EnableTracingError::ConsumerBusy));
    }

    #[test]
    fn write_into_file_without_fd_is_rejected() {
        let mut core = TracingServiceCore::new();
        let mut cfg = basic_config(4, "none");
        cfg.write_into_file = true;
        let err = core.enable_tracing(ConsumerId(1), cfg, false).unwrap_err();
        assert!(matches!(err, EnableTracingError::MissingFileDescriptor));
    }

    #[test]
    fn guardrails_reject_oversized_duration_when_enabled() {
        let mut core = TracingServiceCore::new();
        let mut cfg = basic_config(4, "none");
        cfg.enable_extra_guardrails = true;
        cfg.duration_ms = crate::config::GUARDRAIL_MAX_DURATION_MS + 1;
        let err = core.enable_tracing(ConsumerId(1), cfg, false).unwrap_err();
        assert!(matches!(err, EnableTracingError::DurationGuardrail(_)));
    }

    #[test]
    fn disable_tracing_tears_down_instances_and_is_idempotent() {
        let mut core = TracingServiceCore::new();
        let channel = Arc::new(FakeChannel::default());
        let mut producer = Producer::new(1, "p", channel.clone());
        producer.register_data_source("ds");
        core.add_producer(1, producer);
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "ds"), false).unwrap();

        core.disable_tracing(session_id);
        assert_eq!(channel.torn_down.lock().unwrap().len(), 1);
        assert!(core.take_disabled_notification(session_id));
        assert!(!core.take_disabled_notification(session_id));

        core.disable_tracing(session_id);
        assert_eq!(channel.torn_down.lock().unwrap().len(), 1);
    }

    #[test]
    fn flush_completes_once_every_producer_acks() {
        let mut core = TracingServiceCore::new();
        let channel = Arc::new(FakeChannel::default());
        let mut producer = Producer::new(1, "p", channel.clone());
        producer.register_data_source("ds");
        core.add_producer(1, producer);
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "ds"), false).unwrap();

        let flush_request_id = core.begin_flush(session_id).unwrap();
        assert_eq!(channel.flushes.lock().unwrap().len(), 1);
        assert!(core.ack_flush(session_id, flush_request_id, 1));
        assert!(!core.ack_flush(session_id, flush_request_id, 1));
    }

    #[test]
    fn flush_timeout_clears_pending_entry_once() {
        let mut core = TracingServiceCore::new();
        let channel = Arc::new(FakeChannel::default());
        let mut producer = Producer::new(1, "p", channel);
        producer.register_data_source("ds");
        core.add_producer(1, producer);
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "ds"), false).unwrap();

        let flush_request_id = core.begin_flush(session_id).unwrap();
        assert!(core.check_flush_timeout(session_id, flush_request_id));
        assert!(!core.check_flush_timeout(session_id, flush_request_id));
    }

    #[test]
    fn read_buffers_returns_nothing_for_unknown_session() {
        let core = TracingServiceCore::new();
        assert!(core.read_buffers(TracingSessionId(999)).is_empty());
    }

    #[test]
    fn config_emission_happens_once() {
        let mut core = TracingServiceCore::new();
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "none"), false).unwrap();
        assert!(core.take_config_emission(session_id));
        assert!(!core.take_config_emission(session_id));
    }

    #[test]
    fn ack_flush_from_commit_clears_every_older_pending_flush_for_that_producer() {
        let mut core = TracingServiceCore::new();
        let channel = Arc::new(FakeChannel::default());
        let mut producer = Producer::new(1, "p", channel);
        producer.register_data_source("ds");
        core.add_producer(1, producer);
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "ds"), false).unwrap();

        let first = core.begin_flush(session_id).unwrap();
        core.disable_tracing(session_id);
        // Force a second, distinct pending flush id to simulate an
        // intervening flush without relying on `begin_flush`'s internal
        // randomness colliding with `first`.
        let second = if first == u64::MAX { first - 1 } else { first + 1 };

        let mut producers_waiting = std::collections::HashSet::new();
        producers_waiting.insert(1u16);
        core.sessions
            .get_mut(&session_id)
            .unwrap()
            .pending_flushes
            .insert(second, PendingFlush { waiting_producers: producers_waiting });

        let completed = core.ack_flush_from_commit(1, second);
        assert_eq!(completed.len(), 2);
        assert!(completed.contains(&(session_id, first)));
        assert!(completed.contains(&(session_id, second)));
    }

    #[test]
    fn clock_snapshot_is_due_once_per_interval() {
        let mut core = TracingServiceCore::new();
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "none"), false).unwrap();
        let t0 = Instant::now();
        let interval = Duration::from_secs(10);
        assert!(core.take_clock_snapshot_due(session_id, t0, interval));
        assert!(!core.take_clock_snapshot_due(session_id, t0 + Duration::from_secs(1), interval));
        assert!(core.take_clock_snapshot_due(session_id, t0 + Duration::from_secs(11), interval));
    }

    #[test]
    fn stats_snapshot_counts_producers_sessions_and_buffers() {
        let mut core = TracingServiceCore::new();
        core.add_producer(1, Producer::new(1000, "p", Arc::new(FakeChannel::default())));
        let session_id = core.enable_tracing(ConsumerId(1), basic_config(4, "none"), false).unwrap();
        let stats = core.stats_snapshot(session_id);
        assert_eq!(stats.producers, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.buffers, 1);
        assert_eq!(stats.buffer_stats.len(), 1);
    }

    #[test]
    fn register_then_unregister_then_register_data_source_round_trips() {
        let mut core = TracingServiceCore::new();
        let channel = Arc::new(FakeChannel::default());
        core.add_producer(1, Producer::new(1000, "p", channel));

        core.register_data_source(1, "ds");
        assert!(core.producers.get(&1).unwrap().provides_data_source("ds"));
        core.unregister_data_source(1, "ds");
        assert!(!core.producers.get(&1).unwrap().provides_data_source("ds"));
        core.register_data_source(1, "ds");
        assert!(core.producers.get(&1).unwrap().provides_data_source("ds"));
    }
}
