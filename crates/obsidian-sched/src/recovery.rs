use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{error, info, warn};

use crate::device::Device;
use crate::error::ResetError;

/// What the timeout handler tells the watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutDisposition {
    /// Recovery ran (or was already in flight); scheduling continues.
    Nominal,
    /// The device cannot be brought back; the caller should mark it lost.
    Unrecoverable,
}

/// Serializes device resets: one mutex for the whole device, plus a
/// transient in-progress flag that suppresses re-entrant timeout handling.
#[derive(Debug, Default)]
pub(crate) struct RecoveryCoordinator {
    lock: Mutex<()>,
    in_progress: AtomicBool,
}

pub(crate) struct RecoveryGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    coord: &'a RecoveryCoordinator,
}

impl Drop for RecoveryGuard<'_> {
    fn drop(&mut self) {
        self.coord.in_progress.store(false, Ordering::Release);
    }
}

impl RecoveryCoordinator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim the device-wide reset. `None` means another recovery is in
    /// flight; the caller must not reset again.
    pub(crate) fn try_begin(&self) -> Option<RecoveryGuard<'_>> {
        let lock = self.lock.try_lock().ok()?;
        self.in_progress.store(true, Ordering::Release);
        Some(RecoveryGuard { _lock: lock, coord: self })
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

impl Device {
    pub fn recovery_in_progress(&self) -> bool {
        self.recovery.in_progress()
    }
}

/// The device-wide reset sequence, entered with the recovery mutex held.
///
/// Order matters: diagnostics first (pre-reset state), then the reset
/// primitive under paused workaround transitions, then the epoch bump
/// (exactly one per recovery, reset success or not), then the pending-job
/// requeue on every ring. The mutex is released on every path; a failed
/// reset surfaces its error upward but never wedges the coordinator.
pub(crate) fn run_reset(dev: &Device, guard: RecoveryGuard<'_>) -> Result<(), ResetError> {
    info!("gpu recovery started");
    dev.hooks().dump_state();

    if let Err(err) = dev.hooks().power_quiesce() {
        warn!(%err, "power quiesce failed, resetting anyway");
    }

    let result = {
        let _pause = dev.workarounds.pause();
        dev.hooks().reset()
    };
    let epoch = dev.bump_vram_lost_epoch();

    // Every pending job on every ring gets exactly one retry; the bumped
    // epoch makes their next run self-cancel instead of executing against
    // lost VRAM state.
    for ring in dev.rings() {
        ring.reset_requeue(epoch);
    }

    if let Err(err) = dev.hooks().power_resume() {
        warn!(%err, "power resume failed");
    }

    drop(guard);
    match &result {
        Ok(()) => info!(epoch, "gpu recovery complete"),
        Err(err) => error!(%err, epoch, "gpu reset primitive failed"),
    }
    result
}
