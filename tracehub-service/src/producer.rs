// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A connected producer client (§3 "Producer") and the channel the
//! service uses to talk to it asynchronously, on the producer's own task
//! runner (§4.K.1, §4.K.4, §4.K.5).

use crate::ids::DataSourceInstanceId;
use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tracehub_shm::SharedMemoryReader;

/// How the service reaches a specific connected producer. Implemented by
/// whatever wires this crate to `tracehub-ipc` (kept as a trait so the
/// service core has no IPC dependency and can be driven directly in
/// tests).
pub trait ProducerChannel: Send + Sync {
    fn create_data_source_instance(&self, instance_id: DataSourceInstanceId, data_source_name: &str, target_buffer: u16);
    fn teardown_data_source_instance(&self, instance_id: DataSourceInstanceId);
    fn request_flush(&self, flush_request_id: u64, instance_ids: &[DataSourceInstanceId]);
    /// Delivers a freshly created SMB's fd to the producer. Only called
    /// once per producer, the first time it needs one.
    fn deliver_smb(&self, fd: OwnedFd, page_size: usize, total_size: usize);
}

pub struct Producer {
    pub uid: u32,
    pub name: String,
    pub channel: Arc<dyn ProducerChannel>,
    pub smb_page_size_kb: Option<u32>,
    pub shm_size_kb_hint: Option<u32>,
    pub data_sources: HashSet<String>,
    /// The service's read-only-intent view of this producer's SMB, drained
    /// during `CommitData` handling. Never the producer-side
    /// `SharedMemoryArbiter`: the service only ever takes chunks out, it
    /// never acquires one for writing.
    pub smb: Option<Arc<SharedMemoryReader>>,
    /// The bound `CommitData` validates incoming `writer_id`s against
    /// (§4.F). Set from `RegisterProducer`'s hint, defaulting to
    /// `K_MAX_TRACE_WRITERS_PER_PRODUCER`; never `u16::MAX`, since that
    /// would make the out-of-range check unreachable.
    pub max_writer_id: u16,
}

impl Producer {
    pub fn new(uid: u32, name: impl Into<String>, channel: Arc<dyn ProducerChannel>) -> Self {
        Producer {
            uid,
            name: name.into(),
            channel,
            smb_page_size_kb: None,
            shm_size_kb_hint: None,
            data_sources: HashSet::new(),
            smb: None,
            max_writer_id: crate::config::K_MAX_TRACE_WRITERS_PER_PRODUCER,
        }
    }

    pub fn has_smb(&self) -> bool {
        self.smb.is_some()
    }

    pub fn register_data_source(&mut self, name: impl Into<String>) {
        self.data_sources.insert(name.into());
    }

    pub fn provides_data_source(&self, name: &str) -> bool {
        self.data_sources.contains(name)
    }
}
