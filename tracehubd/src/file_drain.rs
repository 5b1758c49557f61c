// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-session `write_into_file` output (§4.K.1): holds the consumer-
//! supplied fd open for as long as the session drains into it, and writes
//! the packets `ReadBuffersMethod` would otherwise have streamed back over
//! IPC.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;
use tracehub_service::ids::TracingSessionId;

struct DrainedFile {
    file: File,
    bytes_written: u64,
}

/// Tracks every session currently draining into a file. A session with no
/// entry here either never asked for `write_into_file`, already hit its
/// `max_file_size_bytes`, or was disabled/freed.
#[derive(Default)]
pub struct FileDrainRegistry {
    files: Mutex<HashMap<u64, DrainedFile>>,
}

impl FileDrainRegistry {
    pub fn new() -> Self {
        FileDrainRegistry::default()
    }

    pub fn register(&self, session_id: TracingSessionId, file: File) {
        self.files.lock().unwrap().insert(session_id.0, DrainedFile { file, bytes_written: 0 });
    }

    pub fn contains(&self, session_id: TracingSessionId) -> bool {
        self.files.lock().unwrap().contains_key(&session_id.0)
    }

    pub fn remove(&self, session_id: TracingSessionId) {
        self.files.lock().unwrap().remove(&session_id.0);
    }

    /// Writes whole `packets` in order until the next one would push the
    /// session past `max_file_size_bytes`, then stops (never splits a
    /// packet mid-write). Returns `true` once the cap is hit or the write
    /// fails, meaning the caller should disable tracing and drop this
    /// session's entry. A no-op, returning `false`, if `session_id` isn't
    /// registered.
    pub fn write_packets(&self, session_id: TracingSessionId, packets: &[Vec<u8>], max_file_size_bytes: u64) -> bool {
        let mut files = self.files.lock().unwrap();
        let Some(entry) = files.get_mut(&session_id.0) else {
            return false;
        };
        for packet in packets {
            if entry.bytes_written + packet.len() as u64 > max_file_size_bytes {
                return true;
            }
            if entry.file.write_all(packet).is_err() {
                return true;
            }
            entry.bytes_written += packet.len() as u64;
        }
        false
    }
}
