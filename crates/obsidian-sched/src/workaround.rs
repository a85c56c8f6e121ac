use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;
use tracing::{debug, error};

use crate::device::DeviceHooks;

bitflags! {
    /// Hardware erratum workarounds a job may depend on. Each flag gates an
    /// independent device-wide hardware toggle.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct WorkaroundMask: u32 {
        const PERF_COUNTER = 1 << 0;
        const THREAD_TRACE = 1 << 1;
    }
}

/// One nameable workaround, for the hardware-toggle collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Workaround {
    PerfCounter,
    ThreadTrace,
}

const WORKAROUND_COUNT: usize = 2;

impl Workaround {
    fn index(self) -> usize {
        match self {
            Workaround::PerfCounter => 0,
            Workaround::ThreadTrace => 1,
        }
    }

    fn of_flag(flag: WorkaroundMask) -> Workaround {
        match flag {
            WorkaroundMask::PERF_COUNTER => Workaround::PerfCounter,
            WorkaroundMask::THREAD_TRACE => Workaround::ThreadTrace,
            _ => unreachable!("flags are iterated one at a time"),
        }
    }
}

/// Device-wide reference counts gating the workaround hardware toggles.
///
/// Both counters live under one mutex because a job may need to flip both
/// together, and the hardware write must be ordered with the count edge:
/// the toggle is ON iff its count is > 0, and the hardware is only touched
/// on the 0↔1 transitions.
#[derive(Debug, Default)]
pub struct WorkaroundRefCounter {
    counts: Mutex<[u32; WORKAROUND_COUNT]>,
}

/// Holding this guard keeps all workaround transitions quiesced (used for
/// the duration of a device reset).
pub struct WorkaroundPause<'a> {
    _counts: MutexGuard<'a, [u32; WORKAROUND_COUNT]>,
}

impl WorkaroundRefCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on every workaround in `mask`, toggling the hardware
    /// on for any counter making the 0→1 edge. Called at job run, before the
    /// job executes.
    pub fn acquire(&self, mask: WorkaroundMask, hooks: &dyn DeviceHooks) {
        let mut counts = self.counts.lock().unwrap();
        for flag in mask.iter() {
            let wa = Workaround::of_flag(flag);
            let count = &mut counts[wa.index()];
            *count += 1;
            if *count == 1 {
                debug!(workaround = ?wa, "enabling workaround");
                hooks.set_workaround(wa, true);
            }
        }
    }

    /// Drop a reference on every workaround in `mask`, toggling the hardware
    /// off on 1→0 edges. Called at job free, after the job finished.
    /// Releasing an already-zero counter is a reported, non-fatal logic
    /// fault.
    pub fn release(&self, mask: WorkaroundMask, hooks: &dyn DeviceHooks) {
        let mut counts = self.counts.lock().unwrap();
        for flag in mask.iter() {
            let wa = Workaround::of_flag(flag);
            let count = &mut counts[wa.index()];
            if *count == 0 {
                error!(workaround = ?wa, "unbalanced workaround release");
                continue;
            }
            *count -= 1;
            if *count == 0 {
                debug!(workaround = ?wa, "disabling workaround");
                hooks.set_workaround(wa, false);
            }
        }
    }

    pub fn count(&self, wa: Workaround) -> u32 {
        self.counts.lock().unwrap()[wa.index()]
    }

    /// Block all workaround transitions until the guard drops.
    pub fn pause(&self) -> WorkaroundPause<'_> {
        WorkaroundPause {
            _counts: self.counts.lock().unwrap(),
        }
    }
}
