// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A tracing session, owned by exactly one consumer for its lifetime
//! (§3 "Tracing session").

use crate::config::TraceConfig;
use crate::ids::{BufferId, DataSourceInstanceId};
use std::collections::HashMap;
use std::time::Instant;

/// One producer's active data-source instance within this session.
#[derive(Debug, Clone)]
pub struct ActiveInstance {
    pub instance_id: DataSourceInstanceId,
    pub data_source_name: String,
}

/// A pending `Flush` request awaiting acknowledgment from every producer
/// it was sent to (§4.K.5).
pub struct PendingFlush {
    pub waiting_producers: std::collections::HashSet<u16>,
}

pub struct TracingSession {
    pub config: TraceConfig,
    /// Session-relative buffer index -> global `BufferID`.
    pub buffers_index: Vec<BufferId>,
    /// `producer_id -> [active instance...]`.
    pub instances: HashMap<u16, Vec<ActiveInstance>>,
    pub pending_flushes: HashMap<u64, PendingFlush>,
    pub disabled: bool,
    pub config_emitted: bool,
    pub last_clock_snapshot: Option<Instant>,
    pub last_stats_snapshot: Option<Instant>,
    pub bytes_written_into_file: u64,
    pub notified_disabled: bool,
}

impl TracingSession {
    pub fn new(config: TraceConfig, buffers_index: Vec<BufferId>) -> Self {
        TracingSession {
            config,
            buffers_index,
            instances: HashMap::new(),
            pending_flushes: HashMap::new(),
            disabled: false,
            config_emitted: false,
            last_clock_snapshot: None,
            last_stats_snapshot: None,
            bytes_written_into_file: 0,
            notified_disabled: false,
        }
    }

    pub fn global_buffer_id(&self, session_relative_index: usize) -> Option<BufferId> {
        self.buffers_index.get(session_relative_index).copied()
    }

    pub fn add_instance(&mut self, producer_id: u16, instance: ActiveInstance) {
        self.instances.entry(producer_id).or_default().push(instance);
    }

    pub fn all_instance_ids(&self) -> HashMap<u16, Vec<DataSourceInstanceId>> {
        self.instances
            .iter()
            .map(|(producer_id, instances)| (*producer_id, instances.iter().map(|i| i.instance_id).collect()))
            .collect()
    }
}
