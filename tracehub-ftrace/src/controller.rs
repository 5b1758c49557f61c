// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ties per-CPU `trace_pipe_raw` draining and the kmem-pressure trigger
//! together onto a single [`TaskRunner`] (§4.M). This crate never decodes
//! the binary ftrace record format; a drained page is handed to the sink
//! as opaque bytes, same as a producer's committed chunk is opaque to the
//! service core.

use crate::procfs::FtraceProcfs;
use nix::unistd::read;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracehub_runtime::TaskRunner;

const KMEM_DEBOUNCE: Duration = Duration::from_secs(60);
const KMEM_INSTANCE_NAME: &str = "mm_events";
const KMEM_TRIGGER_NAME: &str = "kmem_pressure";
const KMEM_EVENTS: &[(&str, &str)] =
    &[("vmscan", "mm_vmscan_kswapd_wake"), ("vmscan", "mm_vmscan_direct_reclaim_begin"), ("compaction", "mm_compaction_begin")];

/// Receives drained pages and fired triggers. Implemented by whatever wires
/// this controller to a producer connection; this crate has no IPC
/// dependency of its own.
pub trait FtraceSink: Send + Sync {
    fn on_page(&self, cpu: usize, bytes: &[u8]);
    fn on_trigger(&self, name: &str);
}

/// Debounces repeated firings of the same named trigger to at most one per
/// [`KMEM_DEBOUNCE`] window. Kept separate from [`FtraceController`] so it
/// can be unit-tested without any real or fake tracefs.
#[derive(Default)]
pub struct TriggerDebouncer {
    last_fired: HashMap<String, Instant>,
}

impl TriggerDebouncer {
    pub fn new() -> Self {
        TriggerDebouncer::default()
    }

    /// Returns `true` if `name` should fire now, and records that it did.
    pub fn should_fire(&mut self, name: &str, now: Instant) -> bool {
        match self.last_fired.get(name) {
            Some(last) if now.duration_since(*last) < KMEM_DEBOUNCE => false,
            _ => {
                self.last_fired.insert(name.to_string(), now);
                true
            }
        }
    }
}

struct CpuReader {
    fd: OwnedFd,
}

/// Owns every per-CPU `trace_pipe_raw` watch and the kmem-pressure instance
/// for one tracing session. Dropping it does not itself tear anything down;
/// call [`FtraceController::stop`] first (mirrors
/// [`tracehub_service::TracingServiceCore::disable_tracing`]'s explicit,
/// non-Drop-based teardown).
pub struct FtraceController {
    procfs: Arc<dyn FtraceProcfs>,
    runner: TaskRunner,
    sink: Arc<dyn FtraceSink>,
    page_size: usize,
    readers: Mutex<HashMap<usize, CpuReader>>,
    kmem_enabled: Mutex<bool>,
    kmem_debounce: Arc<Mutex<TriggerDebouncer>>,
}

impl FtraceController {
    pub fn new(procfs: Arc<dyn FtraceProcfs>, runner: TaskRunner, sink: Arc<dyn FtraceSink>) -> Self {
        FtraceController {
            procfs,
            runner,
            sink,
            page_size: page_size::get(),
            readers: Mutex::new(HashMap::new()),
            kmem_enabled: Mutex::new(false),
            kmem_debounce: Arc::new(Mutex::new(TriggerDebouncer::new())),
        }
    }

    /// Opens `per_cpu/cpu<N>/trace_pipe_raw` for every cpu in `cpus` and
    /// registers a readability watch that drains exactly one page per
    /// wakeup (§4.M: more than that would let one noisy CPU starve the
    /// others on the same runner thread).
    pub fn start(self: &Arc<Self>, cpus: &[usize]) -> std::io::Result<()> {
        for &cpu in cpus {
            let fd = self.procfs.open_trace_pipe_raw(cpu)?;
            let raw_fd = fd.as_raw_fd();
            self.readers.lock().unwrap().insert(cpu, CpuReader { fd });

            let this = Arc::clone(self);
            self.runner.add_file_descriptor_watch(raw_fd, move || this.drain_one_page(cpu));
        }
        Ok(())
    }

    fn drain_one_page(&self, cpu: usize) {
        let raw_fd = {
            let readers = self.readers.lock().unwrap();
            match readers.get(&cpu) {
                Some(reader) => reader.fd.as_raw_fd(),
                None => return,
            }
        };
        let mut buf = vec![0u8; self.page_size];
        match read(raw_fd, &mut buf) {
            Ok(0) => {}
            Ok(n) => {
                buf.truncate(n);
                self.sink.on_page(cpu, &buf);
                if *self.kmem_enabled.lock().unwrap() && cpu_is_kmem_instance(cpu) {
                    self.maybe_fire_kmem_trigger();
                }
            }
            Err(nix::errno::Errno::EAGAIN) => {}
            Err(e) => tracing::warn!(cpu, error = %e, "trace_pipe_raw read failed"),
        }
    }

    fn maybe_fire_kmem_trigger(&self) {
        let mut debouncer = self.kmem_debounce.lock().unwrap();
        if debouncer.should_fire(KMEM_TRIGGER_NAME, Instant::now()) {
            self.sink.on_trigger(KMEM_TRIGGER_NAME);
        }
    }

    /// Creates the `instances/mm_events` tracefs instance and enables the
    /// three tracepoints that signal reclaim/compaction pressure (§C.3).
    /// Any per-CPU wakeup on this instance's pipes is treated as a pressure
    /// signal and offered to the debouncer; this crate never decodes the
    /// event payload to tell the three triggers apart.
    pub fn enable_kmem_pressure_trigger(&self) -> std::io::Result<()> {
        self.procfs.create_instance(KMEM_INSTANCE_NAME)?;
        for (category, event) in KMEM_EVENTS {
            self.procfs.write_control(&format!("instances/{KMEM_INSTANCE_NAME}/events/{category}/{event}/enable"), "1")?;
        }
        self.procfs.write_control(&format!("instances/{KMEM_INSTANCE_NAME}/tracing_on"), "1")?;
        *self.kmem_enabled.lock().unwrap() = true;
        Ok(())
    }

    /// Disables tracing, clears every per-CPU trace pipe, and removes the fd
    /// watches. Leaves the `TaskRunner` itself running; the caller owns its
    /// lifetime.
    pub fn stop(&self) {
        let _ = self.procfs.write_control("tracing_on", "0");
        if *self.kmem_enabled.lock().unwrap() {
            let _ = self.procfs.write_control(&format!("instances/{KMEM_INSTANCE_NAME}/tracing_on"), "0");
            let _ = self.procfs.remove_instance(KMEM_INSTANCE_NAME);
            *self.kmem_enabled.lock().unwrap() = false;
        }
        let mut readers = self.readers.lock().unwrap();
        for (_, reader) in readers.drain() {
            self.runner.remove_file_descriptor_watch(reader.fd.as_raw_fd());
        }
    }
}

/// The kmem-pressure instance has its own per-CPU pipes under
/// `instances/mm_events/per_cpu/cpuN`; this controller tracks only one set
/// of cpu ids at a time, so in practice whichever `start` was called with
/// while `enable_kmem_pressure_trigger` is active is the kmem instance's
/// cpu set. A dedicated reader-to-instance map would be needed to mix a
/// plain trace session and a kmem-pressure session concurrently, which
/// §4.M does not call for.
fn cpu_is_kmem_instance(_cpu: usize) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        pages: Mutex<Vec<(usize, Vec<u8>)>>,
        triggers: Mutex<Vec<String>>,
    }

    impl FtraceSink for RecordingSink {
        fn on_page(&self, cpu: usize, bytes: &[u8]) {
            self.pages.lock().unwrap().push((cpu, bytes.to_vec()));
        }

        fn on_trigger(&self, name: &str) {
            self.triggers.lock().unwrap().push(name.to_string());
        }
    }

    #[test]
    fn debouncer_suppresses_repeat_firings_within_the_window() {
        let mut debouncer = TriggerDebouncer::new();
        let t0 = Instant::now();
        assert!(debouncer.should_fire("kmem_pressure", t0));
        assert!(!debouncer.should_fire("kmem_pressure", t0 + Duration::from_secs(1)));
        assert!(debouncer.should_fire("kmem_pressure", t0 + Duration::from_secs(61)));
    }

    #[test]
    fn debouncer_tracks_trigger_names_independently() {
        let mut debouncer = TriggerDebouncer::new();
        let t0 = Instant::now();
        assert!(debouncer.should_fire("a", t0));
        assert!(debouncer.should_fire("b", t0));
    }

    #[test]
    fn enable_kmem_pressure_trigger_writes_expected_control_files() {
        use crate::procfs::FakeFtraceProcfs;
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeFtraceProcfs::new(dir.path()));
        let runner = TaskRunner::spawn("test-ftrace");
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(FtraceController::new(fake, runner, sink));

        controller.enable_kmem_pressure_trigger().unwrap();

        for (category, event) in KMEM_EVENTS {
            let contents =
                std::fs::read_to_string(dir.path().join(format!("instances/mm_events/events/{category}/{event}/enable"))).unwrap();
            assert_eq!(contents, "1");
        }
        controller.stop();
        assert!(!dir.path().join("instances/mm_events").exists());
    }

    #[test]
    fn drain_one_page_forwards_bytes_to_sink() {
        use crate::procfs::FakeFtraceProcfs;
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeFtraceProcfs::new(dir.path()));
        let runner = TaskRunner::spawn("test-ftrace-drain");
        let sink = Arc::new(RecordingSink::default());
        let controller = Arc::new(FtraceController::new(fake.clone(), runner, sink.clone()));

        {
            let fd = fake.open_trace_pipe_raw(0).unwrap();
            let mut file = std::fs::File::from(fd);
            use std::io::Write;
            file.write_all(b"some-ftrace-bytes").unwrap();
        }
        controller.start(&[0]).unwrap();

        let waited = Arc::new(AtomicUsize::new(0));
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.pages.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            waited.fetch_add(1, Ordering::SeqCst);
        }
        let pages = sink.pages.lock().unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].0, 0);
        assert_eq!(&pages[0].1, b"some-ftrace-bytes");
    }
}
