// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps consumer-side process selectors to live processes (§4.O). A
//! [`ProcessSetSpec`] ("all processes", explicit pids, explicit cmdlines)
//! can be registered before or after the processes it names connect;
//! whichever order they arrive in, the delegate sees `matched` exactly
//! when a process's covering-set membership grows and `disconnected`
//! exactly when it empties out.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub cmdline: String,
}

#[derive(Debug, Clone)]
pub enum ProcessSetSpec {
    All,
    Pids(Vec<u32>),
    Cmdlines(Vec<String>),
}

impl ProcessSetSpec {
    fn matches(&self, process: &Process) -> bool {
        match self {
            ProcessSetSpec::All => true,
            ProcessSetSpec::Pids(pids) => pids.contains(&process.pid),
            ProcessSetSpec::Cmdlines(cmdlines) => cmdlines.iter().any(|c| c == &process.cmdline),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SetId(usize);

/// Notified whenever a process's covering-set membership changes.
pub trait MatchDelegate: Send + Sync {
    fn matched(&self, process: &Process, matching_sets: &[SetId]);
    fn disconnected(&self, pid: u32);
}

struct Inner {
    sets: Mutex<HashMap<SetId, ProcessSetSpec>>,
    processes: Mutex<HashMap<u32, (Process, HashSet<SetId>)>>,
    next_set_id: AtomicUsize,
    delegate: Arc<dyn MatchDelegate>,
}

impl Inner {
    fn covering_vec(covering: &HashSet<SetId>) -> Vec<SetId> {
        covering.iter().copied().collect()
    }

    fn disconnect_process(&self, pid: u32) {
        if self.processes.lock().unwrap().remove(&pid).is_some() {
            self.delegate.disconnected(pid);
        }
    }

    fn remove_set(&self, id: SetId) {
        self.sets.lock().unwrap().remove(&id);
        let mut processes = self.processes.lock().unwrap();
        let mut now_uncovered = Vec::new();
        for (pid, (_, covering)) in processes.iter_mut() {
            if covering.remove(&id) && covering.is_empty() {
                now_uncovered.push(*pid);
            }
        }
        for pid in &now_uncovered {
            processes.remove(pid);
        }
        drop(processes);
        for pid in now_uncovered {
            self.delegate.disconnected(pid);
        }
    }
}

/// The matcher's owning handle. Cheap to clone; every clone shares the same
/// underlying tables.
#[derive(Clone)]
pub struct ProcessMatcher {
    inner: Arc<Inner>,
}

impl ProcessMatcher {
    pub fn new(delegate: Arc<dyn MatchDelegate>) -> Self {
        ProcessMatcher {
            inner: Arc::new(Inner {
                sets: Mutex::new(HashMap::new()),
                processes: Mutex::new(HashMap::new()),
                next_set_id: AtomicUsize::new(0),
                delegate,
            }),
        }
    }

    /// Registers a process as connected. Fires `matched` immediately if any
    /// already-registered set covers it.
    pub fn connect_process(&self, process: Process) -> ProcessHandle {
        let pid = process.pid;
        let covering: HashSet<SetId> = {
            let sets = self.inner.sets.lock().unwrap();
            sets.iter().filter(|(_, spec)| spec.matches(&process)).map(|(id, _)| *id).collect()
        };
        self.inner.processes.lock().unwrap().insert(pid, (process.clone(), covering.clone()));
        if !covering.is_empty() {
            self.inner.delegate.matched(&process, &Inner::covering_vec(&covering));
        }
        ProcessHandle { inner: self.inner.clone(), pid }
    }

    /// Registers a selector. Fires `matched` for every already-connected
    /// process this selector newly covers.
    pub fn register_set(&self, spec: ProcessSetSpec) -> ProcessSetSpecHandle {
        let id = SetId(self.inner.next_set_id.fetch_add(1, Ordering::SeqCst));
        self.inner.sets.lock().unwrap().insert(id, spec.clone());

        let mut processes = self.inner.processes.lock().unwrap();
        let mut newly_matched = Vec::new();
        for (process, covering) in processes.values_mut() {
            if spec.matches(process) && covering.insert(id) {
                newly_matched.push((process.clone(), Inner::covering_vec(covering)));
            }
        }
        drop(processes);
        for (process, covering) in newly_matched {
            self.inner.delegate.matched(&process, &covering);
        }

        ProcessSetSpecHandle { inner: self.inner.clone(), id }
    }

    pub fn connected_pids(&self) -> Vec<u32> {
        self.inner.processes.lock().unwrap().keys().copied().collect()
    }
}

/// RAII handle for a connected process. Disconnecting (dropping this, or
/// the process's last covering set being removed) fires `disconnected`
/// exactly once.
pub struct ProcessHandle {
    inner: Arc<Inner>,
    pid: u32,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.inner.disconnect_process(self.pid);
    }
}

/// RAII handle for a registered selector. Dropping it removes the selector
/// and fires `disconnected` for any process that was only covered by this
/// one set.
pub struct ProcessSetSpecHandle {
    inner: Arc<Inner>,
    id: SetId,
}

impl Drop for ProcessSetSpecHandle {
    fn drop(&mut self) {
        self.inner.remove_set(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingDelegate {
        matched: StdMutex<Vec<(u32, Vec<SetId>)>>,
        disconnected: StdMutex<Vec<u32>>,
    }

    impl MatchDelegate for RecordingDelegate {
        fn matched(&self, process: &Process, matching_sets: &[SetId]) {
            self.matched.lock().unwrap().push((process.pid, matching_sets.to_vec()));
        }

        fn disconnected(&self, pid: u32) {
            self.disconnected.lock().unwrap().push(pid);
        }
    }

    #[test]
    fn connecting_a_process_after_registering_all_matches_immediately() {
        let delegate = Arc::new(RecordingDelegate::default());
        let matcher = ProcessMatcher::new(delegate.clone());
        let _set = matcher.register_set(ProcessSetSpec::All);

        let handle = matcher.connect_process(Process { pid: 42, cmdline: "foo".into() });
        assert_eq!(delegate.matched.lock().unwrap().len(), 1);
        assert_eq!(delegate.matched.lock().unwrap()[0].0, 42);
        drop(handle);
        assert_eq!(delegate.disconnected.lock().unwrap(), &[42]);
    }

    #[test]
    fn registering_a_set_after_connecting_matches_retroactively() {
        let delegate = Arc::new(RecordingDelegate::default());
        let matcher = ProcessMatcher::new(delegate.clone());
        let handle = matcher.connect_process(Process { pid: 7, cmdline: "bar".into() });
        assert!(delegate.matched.lock().unwrap().is_empty());

        let _set = matcher.register_set(ProcessSetSpec::Cmdlines(vec!["bar".into()]));
        assert_eq!(delegate.matched.lock().unwrap().len(), 1);
        drop(handle);
    }

    #[test]
    fn removing_the_last_covering_set_disconnects_without_dropping_the_process_handle() {
        let delegate = Arc::new(RecordingDelegate::default());
        let matcher = ProcessMatcher::new(delegate.clone());
        let set = matcher.register_set(ProcessSetSpec::Pids(vec![9]));
        let _handle = matcher.connect_process(Process { pid: 9, cmdline: "baz".into() });

        drop(set);
        assert_eq!(delegate.disconnected.lock().unwrap(), &[9]);
        assert!(matcher.connected_pids().is_empty());
    }

    #[test]
    fn a_process_covered_by_two_sets_only_disconnects_once_both_are_gone() {
        let delegate = Arc::new(RecordingDelegate::default());
        let matcher = ProcessMatcher::new(delegate.clone());
        let set_a = matcher.register_set(ProcessSetSpec::Pids(vec![9]));
        let set_b = matcher.register_set(ProcessSetSpec::All);
        let _handle = matcher.connect_process(Process { pid: 9, cmdline: "baz".into() });

        drop(set_a);
        assert!(delegate.disconnected.lock().unwrap().is_empty());
        drop(set_b);
        assert_eq!(delegate.disconnected.lock().unwrap(), &[9]);
    }
}
