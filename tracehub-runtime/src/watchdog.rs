// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide watchdog (§4.E): a fatal timer that aborts the process if
//! not disarmed or refreshed in time, and a memory ceiling with hysteresis
//! that logs and then aborts if the process keeps growing past it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const DEFAULT_FATAL_TIMER: Duration = Duration::from_secs(30);

struct State {
    generation: AtomicU64,
    armed: AtomicBool,
    memory_ceiling_bytes: AtomicU64,
    over_ceiling_polls: AtomicU64,
}

/// The process-wide watchdog singleton. Construction happens once per
/// process via [`Watchdog::instance`]; everything after that is handle
/// cloning.
#[derive(Clone)]
pub struct Watchdog {
    state: Arc<State>,
}

static INSTANCE: OnceLock<Watchdog> = OnceLock::new();

/// How many consecutive over-ceiling polls are tolerated before the
/// watchdog treats the condition as real rather than a transient spike.
const MEMORY_HYSTERESIS_POLLS: u64 = 3;

impl Watchdog {
    pub fn instance() -> Watchdog {
        INSTANCE
            .get_or_init(|| Watchdog {
                state: Arc::new(State {
                    generation: AtomicU64::new(0),
                    armed: AtomicBool::new(false),
                    memory_ceiling_bytes: AtomicU64::new(u64::MAX),
                    over_ceiling_polls: AtomicU64::new(0),
                }),
            })
            .clone()
    }

    /// Arms a fatal timer: if [`Watchdog::reset`] is not called again
    /// within `timeout`, the process aborts. Re-arming bumps a generation
    /// counter so a stale timer from a previous call can never fire after
    /// a later one replaced it.
    pub fn arm_fatal_timer(&self, timeout: Duration) {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.armed.store(true, Ordering::SeqCst);
        let state = self.state.clone();
        std::thread::spawn(move || {
            std::thread::sleep(timeout);
            if state.armed.load(Ordering::SeqCst)
                && state.generation.load(Ordering::SeqCst) == generation
            {
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "watchdog fatal timer expired, aborting");
                std::process::abort();
            }
        });
    }

    pub fn arm_default_fatal_timer(&self) {
        self.arm_fatal_timer(DEFAULT_FATAL_TIMER);
    }

    /// Disarms the current fatal timer. A subsequent [`Watchdog::arm_fatal_timer`]
    /// starts a fresh one.
    pub fn disarm(&self) {
        self.state.armed.store(false, Ordering::SeqCst);
    }

    /// Re-arms the current fatal timer for another `timeout`, superseding
    /// whatever timer is in flight.
    pub fn reset(&self, timeout: Duration) {
        self.arm_fatal_timer(timeout);
    }

    pub fn set_memory_ceiling(&self, bytes: u64) {
        self.state.memory_ceiling_bytes.store(bytes, Ordering::SeqCst);
        self.state.over_ceiling_polls.store(0, Ordering::SeqCst);
    }

    /// Reports the current resident set size. Returns `true` if the
    /// process should abort: the ceiling has to be exceeded on
    /// [`MEMORY_HYSTERESIS_POLLS`] consecutive calls before this trips, so
    /// a brief spike doesn't kill the process.
    pub fn poll_memory(&self, rss_bytes: u64) -> bool {
        let ceiling = self.state.memory_ceiling_bytes.load(Ordering::SeqCst);
        if rss_bytes <= ceiling {
            self.state.over_ceiling_polls.store(0, Ordering::SeqCst);
            return false;
        }
        let polls = self.state.over_ceiling_polls.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(rss_bytes, ceiling, polls, "process over memory ceiling");
        polls >= MEMORY_HYSTERESIS_POLLS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_ceiling_requires_consecutive_overages() {
        let watchdog = Watchdog {
            state: Arc::new(State {
                generation: AtomicU64::new(0),
                armed: AtomicBool::new(false),
                memory_ceiling_bytes: AtomicU64::new(100),
                over_ceiling_polls: AtomicU64::new(0),
            }),
        };
        assert!(!watchdog.poll_memory(150));
        assert!(!watchdog.poll_memory(150));
        assert!(watchdog.poll_memory(150));
    }

    #[test]
    fn dropping_below_ceiling_resets_hysteresis() {
        let watchdog = Watchdog {
            state: Arc::new(State {
                generation: AtomicU64::new(0),
                armed: AtomicBool::new(false),
                memory_ceiling_bytes: AtomicU64::new(100),
                over_ceiling_polls: AtomicU64::new(0),
            }),
        };
        assert!(!watchdog.poll_memory(150));
        assert!(!watchdog.poll_memory(50));
        assert!(!watchdog.poll_memory(150));
    }

    #[test]
    fn disarm_prevents_fatal_abort() {
        let watchdog = Watchdog {
            state: Arc::new(State {
                generation: AtomicU64::new(0),
                armed: AtomicBool::new(false),
                memory_ceiling_bytes: AtomicU64::new(u64::MAX),
                over_ceiling_polls: AtomicU64::new(0),
            }),
        };
        watchdog.arm_fatal_timer(Duration::from_millis(20));
        watchdog.disarm();
        std::thread::sleep(Duration::from_millis(60));
        // If the timer fired despite disarm(), the process would have
        // aborted by now and this assertion would never run.
        assert!(!watchdog.state.armed.load(Ordering::SeqCst));
    }
}
