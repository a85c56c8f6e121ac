use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use obsidian_fence::Fence;
use tracing::{debug, warn};

use crate::engine::{EngineClass, QueueCoords};
use crate::error::{PowerError, ResetError};
use crate::recovery::RecoveryCoordinator;
use crate::ring::{Emitter, Ring};
use crate::watcher::HangWatcher;
use crate::workaround::{Workaround, WorkaroundRefCounter};

/// External collaborator capabilities consumed by the engine. Everything
/// behind this trait is out of scope for the core: register programming,
/// firmware, clocks.
pub trait DeviceHooks: Send + Sync {
    /// Device reset primitive. Opaque beyond success/failure; invalidates
    /// all prior GPU-side state.
    fn reset(&self) -> Result<(), ResetError>;

    /// Postmortem diagnostic dump. Fire-and-forget.
    fn dump_state(&self) {}

    /// Quiesce power-state transitions before a reset. Best-effort.
    fn power_quiesce(&self) -> Result<(), PowerError> {
        Ok(())
    }

    /// Resume power-state transitions after a reset. Best-effort.
    fn power_resume(&self) -> Result<(), PowerError> {
        Ok(())
    }

    /// Flip one workaround toggle in hardware. Only called on 0↔1 refcount
    /// edges, under the workaround mutex.
    fn set_workaround(&self, wa: Workaround, enable: bool);
}

/// A virtual address space a job's memory accesses are bound to. The job
/// holds only a weak reference; teardown of the space is not blocked by
/// queued work.
#[derive(Debug)]
pub struct AddressSpace {
    pub id: u64,
}

/// The submitting process. Jobs from an exiting owner are cancelled at run
/// instead of executed.
#[derive(Debug, Default)]
pub struct JobOwner {
    exiting: AtomicBool,
}

impl JobOwner {
    pub fn new() -> Arc<JobOwner> {
        Arc::new(JobOwner::default())
    }

    pub fn mark_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }
}

/// Outcome of a pool grab: a slot, or a fence to wait on before retrying.
#[derive(Debug)]
pub enum PoolGrab {
    Ready(u32),
    /// Pool is dry; wait for the earliest in-flight borrower to finish.
    /// A cooperative reschedule point, never a spin-wait.
    Busy(Fence),
}

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<u32>,
    /// Slot plus the finished fence of the borrowing job, in grant order.
    busy: Vec<(u32, Fence)>,
}

/// Fixed pool of hardware resource identifiers (VMIDs, TMZ queue slots)
/// lazily borrowed by jobs between prepare and free.
#[derive(Debug)]
pub struct SlotPool {
    name: &'static str,
    inner: Mutex<PoolInner>,
}

impl SlotPool {
    pub fn new(name: &'static str, capacity: u32) -> Self {
        Self {
            name,
            inner: Mutex::new(PoolInner {
                // Hand out low ids first.
                free: (0..capacity).rev().collect(),
                busy: Vec::new(),
            }),
        }
    }

    /// Borrow a slot, recording `borrower_done` as the point at which it
    /// comes back.
    pub fn acquire(&self, borrower_done: Fence) -> PoolGrab {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.free.pop() {
            inner.busy.push((slot, borrower_done));
            return PoolGrab::Ready(slot);
        }
        match inner.busy.first() {
            Some((_, fence)) => PoolGrab::Busy(fence.clone()),
            // A zero-capacity pool can never be satisfied; report it loudly
            // and hand back the borrower's own fence so the caller still has
            // a reschedule point.
            None => {
                warn!(pool = self.name, "grab from zero-capacity pool");
                PoolGrab::Busy(borrower_done)
            }
        }
    }

    pub fn release(&self, slot: u32) {
        let mut inner = self.inner.lock().unwrap();
        match inner.busy.iter().position(|(s, _)| *s == slot) {
            Some(i) => {
                inner.busy.remove(i);
                inner.free.push(slot);
            }
            None => warn!(pool = self.name, slot, "release of slot not in pool"),
        }
    }

    pub fn free_len(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn busy_len(&self) -> usize {
        self.inner.lock().unwrap().busy.len()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    pub vmid_slots: u32,
    pub tmz_slots: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        // 16 hardware VMIDs with id 0 reserved for the kernel context.
        Self {
            vmid_slots: 15,
            tmz_slots: 4,
        }
    }
}

/// Device-wide context threaded through every operation. All mutable state
/// shared outside per-job structures lives here, with its locking discipline
/// visible in the types: the workaround counters (one mutex), the VRAM-lost
/// epoch (atomic), and the recovery coordinator (one device-wide mutex).
pub struct Device {
    hooks: Arc<dyn DeviceHooks>,
    pub workarounds: WorkaroundRefCounter,
    pub vmids: SlotPool,
    pub tmz: SlotPool,
    pub(crate) watcher: HangWatcher,
    pub(crate) recovery: RecoveryCoordinator,
    vram_lost: AtomicU64,
    lost: AtomicBool,
    rings: Mutex<Vec<Arc<Ring>>>,
    next_job_id: AtomicU64,
}

impl Device {
    pub fn new(hooks: Arc<dyn DeviceHooks>, config: DeviceConfig) -> Arc<Device> {
        Arc::new(Device {
            hooks,
            workarounds: WorkaroundRefCounter::new(),
            vmids: SlotPool::new("vmid", config.vmid_slots),
            tmz: SlotPool::new("tmz", config.tmz_slots),
            watcher: HangWatcher::new(),
            recovery: RecoveryCoordinator::new(),
            vram_lost: AtomicU64::new(0),
            lost: AtomicBool::new(false),
            rings: Mutex::new(Vec::new()),
            next_job_id: AtomicU64::new(1),
        })
    }

    /// Create a ring and register it with the device. Rings live as long as
    /// the device; their scheduler is created with them.
    pub fn add_ring(
        self: &Arc<Self>,
        engine: EngineClass,
        coords: QueueCoords,
        emitter: Arc<dyn Emitter>,
    ) -> Arc<Ring> {
        let mut rings = self.rings.lock().unwrap();
        let ring = Ring::new(rings.len(), engine, coords, emitter);
        rings.push(ring.clone());
        debug!(ring = ring.index(), engine = engine.caps().name, "ring registered");
        ring
    }

    pub fn rings(&self) -> Vec<Arc<Ring>> {
        self.rings.lock().unwrap().clone()
    }

    pub fn hooks(&self) -> &Arc<dyn DeviceHooks> {
        &self.hooks
    }

    pub fn watcher(&self) -> &HangWatcher {
        &self.watcher
    }

    /// Current VRAM generation. Jobs capture this at allocation; a job whose
    /// captured epoch is behind the device self-cancels at run.
    pub fn vram_lost_epoch(&self) -> u64 {
        self.vram_lost.load(Ordering::Acquire)
    }

    /// Bumped exactly once per completed recovery, reset success or not.
    pub(crate) fn bump_vram_lost_epoch(&self) -> u64 {
        self.vram_lost.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True once the device was declared unrecoverable.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Declare the device unrecoverable and force-complete all queued and
    /// pending work with a "device gone" error.
    pub fn mark_lost(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!("device marked lost; aborting all rings");
        for ring in self.rings() {
            ring.abort(self);
        }
    }

    pub(crate) fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::Relaxed)
    }
}
