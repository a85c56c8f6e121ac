use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::device::Device;
use crate::engine::EngineClass;
use crate::recovery::TimeoutDisposition;

#[derive(Debug, Default)]
struct WatchState {
    stop: bool,
    wake: bool,
}

/// Device-wide in-flight accounting feeding the background watchdog.
///
/// Every increment (at job run) is matched by exactly one decrement (at job
/// free); the watchdog only ticks while some engine class has in-flight
/// work.
#[derive(Debug)]
pub struct HangWatcher {
    inflight: [AtomicUsize; EngineClass::COUNT],
    state: Mutex<WatchState>,
    cond: Condvar,
}

impl HangWatcher {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Default::default(),
            state: Mutex::new(WatchState::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn inc(&self, engine: EngineClass) {
        let prev = self.inflight[engine.index()].fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            // Engine became active: wake the watchdog so it starts sampling.
            self.request_wake();
        }
    }

    pub(crate) fn dec(&self, engine: EngineClass) {
        let res = self.inflight[engine.index()].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |v| v.checked_sub(1),
        );
        if res.is_err() {
            error!(engine = engine.caps().name, "in-flight counter underflow");
        }
    }

    pub fn inflight(&self, engine: EngineClass) -> usize {
        self.inflight[engine.index()].load(Ordering::Acquire)
    }

    pub fn total_inflight(&self) -> usize {
        EngineClass::ALL.iter().map(|e| self.inflight(*e)).sum()
    }

    /// Ask the watchdog to take a look now rather than at the next tick.
    pub fn request_wake(&self) {
        let mut state = self.state.lock().unwrap();
        state.wake = true;
        self.cond.notify_all();
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stop = true;
        self.cond.notify_all();
    }

    /// Sleep until the next sampling point: a wake request, the periodic
    /// tick (only while work is in flight), or shutdown. Returns true on
    /// shutdown.
    fn wait_tick(&self, period: Duration) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.wake && !state.stop {
            state = if self.total_inflight() == 0 {
                self.cond.wait(state).unwrap()
            } else {
                self.cond.wait_timeout(state, period).unwrap().0
            };
        }
        state.wake = false;
        state.stop
    }
}

/// One watchdog pass: sample fence progress on every ring with in-flight
/// work and run the timeout path for any ring that made none within its
/// engine's hang timeout. Returns the number of stalled rings. Exposed so
/// tests can drive detection deterministically with a synthetic `now`.
pub fn scan(dev: &Device, now: Instant) -> usize {
    // A recovery in flight is about to wipe and requeue every pending list;
    // sampling stalls now would only pile re-entrant timeout calls on it.
    if dev.recovery_in_progress() {
        return 0;
    }
    let mut stalled = 0;
    for ring in dev.rings() {
        if ring.pending_len() == 0 {
            let mut progress = ring.progress.lock().unwrap();
            progress.seq = ring.last_signaled();
            progress.since = now;
            continue;
        }

        let current = ring.last_signaled();
        let hang_timeout = ring.engine().caps().hang_timeout;
        let stall = {
            let mut progress = ring.progress.lock().unwrap();
            if current != progress.seq {
                progress.seq = current;
                progress.since = now;
                false
            } else if now.duration_since(progress.since) >= hang_timeout {
                // Rearm so a still-stuck ring escalates on the next pass
                // instead of re-triggering immediately.
                progress.since = now;
                true
            } else {
                false
            }
        };

        if stall {
            stalled += 1;
            warn!(
                ring = ring.index(),
                engine = ring.engine().caps().name,
                "no fence progress within hang timeout"
            );
            if ring.timed_out(dev) == TimeoutDisposition::Unrecoverable {
                dev.mark_lost();
            }
        }
    }
    stalled
}

/// Background hang watcher thread. Dropping the handle stops and joins it.
pub struct Watchdog {
    dev: Arc<Device>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(dev: Arc<Device>, period: Duration) -> Watchdog {
        let worker = dev.clone();
        let handle = thread::Builder::new()
            .name("obsidian-watchdog".into())
            .spawn(move || loop {
                if worker.watcher.wait_tick(period) {
                    break;
                }
                scan(&worker, Instant::now());
            })
            .expect("failed to spawn watchdog thread");
        Watchdog {
            dev,
            handle: Some(handle),
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.dev.watcher.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
