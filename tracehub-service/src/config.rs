// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The consumer-supplied trace configuration (§6 "Producer configuration
//! knobs") and the guardrail constants `EnableTracing` enforces (§4.K.1).

use serde::{Deserialize, Serialize};
use tracehub_tracebuf::FillPolicy;

pub const K_MAX_BUFFERS_PER_CONSUMER: usize = 128;
pub const K_MAX_CONCURRENT_TRACING_SESSIONS: usize = 5;
pub const GUARDRAIL_MAX_DURATION_MS: u64 = 24 * 60 * 60 * 1000;
pub const GUARDRAIL_MAX_TOTAL_BUFFER_BYTES: u64 = 32 * 1024 * 1024;

pub const K_OS_PAGE_SIZE: usize = 4096;
pub const K_MAX_SHM_PAGE_SIZE: usize = 1 << 20;
pub const K_MAX_SHM_SIZE: usize = 256 * 1024 * 1024;

pub const FILE_WRITE_PERIOD_MIN_MS: u64 = 100;
pub const FILE_WRITE_PERIOD_DEFAULT_MS: u64 = 5000;

/// Default bound on concurrent trace-writer slots per producer (§4.F:
/// `writer_id <= max_writer_id`), used unless `RegisterProducer` asks for
/// a smaller one.
pub const K_MAX_TRACE_WRITERS_PER_PRODUCER: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockdownMode {
    Unchanged,
    Set,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub size_kb: u32,
    pub fill_policy: BufferFillPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BufferFillPolicy {
    RingBuffer,
    Discard,
}

impl From<BufferFillPolicy> for FillPolicy {
    fn from(value: BufferFillPolicy) -> Self {
        match value {
            BufferFillPolicy::RingBuffer => FillPolicy::Ring,
            BufferFillPolicy::Discard => FillPolicy::Discard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfigEntry {
    pub producer_name: String,
    pub shm_size_kb: Option<u32>,
    pub page_size_kb: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfigEntry {
    pub name: String,
    /// Session-relative index into `buffers[]`.
    pub target_buffer: usize,
    pub producer_name_filter: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    pub buffers: Vec<BufferConfig>,
    pub duration_ms: u64,
    pub enable_extra_guardrails: bool,
    pub lockdown_mode: LockdownMode,
    pub write_into_file: bool,
    pub file_write_period_ms: Option<u64>,
    pub max_file_size_bytes: u64,
    pub producers: Vec<ProducerConfigEntry>,
    pub data_sources: Vec<DataSourceConfigEntry>,
}

impl TraceConfig {
    pub fn total_buffer_bytes(&self) -> u64 {
        self.buffers.iter().map(|b| b.size_kb as u64 * 1024).sum()
    }

    pub fn clamped_file_write_period_ms(&self) -> u64 {
        self.file_write_period_ms
            .unwrap_or(FILE_WRITE_PERIOD_DEFAULT_MS)
            .clamp(FILE_WRITE_PERIOD_MIN_MS, FILE_WRITE_PERIOD_DEFAULT_MS.max(FILE_WRITE_PERIOD_MIN_MS))
    }
}

/// Resolves the SMB page size for a producer from the config hint,
/// clamped to `[kOsPageSize, kMaxShmPageSize]` and rounded to a multiple
/// of the OS page size (§4.K.1).
pub fn resolve_page_size_bytes(page_size_kb_hint: Option<u32>) -> usize {
    let hint = page_size_kb_hint.map(|kb| kb as usize * 1024).unwrap_or(K_OS_PAGE_SIZE);
    let clamped = hint.clamp(K_OS_PAGE_SIZE, K_MAX_SHM_PAGE_SIZE);
    round_up_to_multiple(clamped, K_OS_PAGE_SIZE)
}

/// Resolves the SMB total size with precedence producer-config override →
/// producer hint from Connect → default, clamped to `[page_size,
/// kMaxShmSize]` and rounded to a multiple of `page_size` (§4.K.1).
pub fn resolve_shm_size_bytes(override_kb: Option<u32>, connect_hint_kb: Option<u32>, page_size: usize) -> usize {
    const DEFAULT_SHM_SIZE: usize = 4 * 1024 * 1024;
    let chosen = override_kb
        .or(connect_hint_kb)
        .map(|kb| kb as usize * 1024)
        .unwrap_or(DEFAULT_SHM_SIZE);
    let clamped = chosen.clamp(page_size, K_MAX_SHM_SIZE);
    round_up_to_multiple(clamped, page_size)
}

/// Resolves the chunk size for a page size. Fixed at a quarter of the page
/// so every page holds at least a handful of chunks; always `>
/// CHUNK_HEADER_SIZE` since `page_size` is already bounded below by
/// `kOsPageSize`.
pub fn resolve_chunk_size_bytes(page_size: usize) -> usize {
    page_size / 4
}

fn round_up_to_multiple(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped_and_rounded() {
        assert_eq!(resolve_page_size_bytes(None), K_OS_PAGE_SIZE);
        assert_eq!(resolve_page_size_bytes(Some(1)), K_OS_PAGE_SIZE);
        let huge = resolve_page_size_bytes(Some(100_000));
        assert_eq!(huge, K_MAX_SHM_PAGE_SIZE);
    }

    #[test]
    fn shm_size_precedence_prefers_override_over_hint() {
        let page = K_OS_PAGE_SIZE;
        let size = resolve_shm_size_bytes(Some(64), Some(256), page);
        assert_eq!(size, 64 * 1024);
    }

    #[test]
    fn file_write_period_clamped_to_default_range() {
        let mut cfg = TraceConfig {
            buffers: vec![],
            duration_ms: 0,
            enable_extra_guardrails: false,
            lockdown_mode: LockdownMode::Unchanged,
            write_into_file: false,
            file_write_period_ms: Some(10),
            max_file_size_bytes: 0,
            producers: vec![],
            data_sources: vec![],
        };
        assert_eq!(cfg.clamped_file_write_period_ms(), FILE_WRITE_PERIOD_MIN_MS);
        cfg.file_write_period_ms = None;
        assert_eq!(cfg.clamped_file_write_period_ms(), FILE_WRITE_PERIOD_DEFAULT_MS);
    }
}
