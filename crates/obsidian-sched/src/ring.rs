use std::sync::{Arc, Mutex};
use std::time::Instant;

use obsidian_fence::{Fence, FenceTimeline};
use tracing::debug;

use crate::device::Device;
use crate::engine::{EngineClass, QueueCoords};
use crate::error::EmitError;
use crate::job::IndirectBuffer;
use crate::sched::Scheduler;

/// Everything the packet emitter needs to encode one submission. The
/// sequence number is pre-assigned so the emitter can encode the fence
/// writeback packet.
#[derive(Debug)]
pub struct EmitCtx<'a> {
    pub engine: EngineClass,
    pub coords: QueueCoords,
    pub seq: u64,
    pub vmid: Option<u32>,
    pub tmz: bool,
    pub ibs: &'a [IndirectBuffer],
}

/// Ring packet emission collaborator. Encoding of GPU command packets is out
/// of scope for this engine; the emitter either accepts the submission (the
/// hardware fence at `ctx.seq` will eventually signal via
/// [`Ring::irq_advance`]) or rejects it synchronously.
pub trait Emitter: Send + Sync {
    fn emit(&self, ctx: &EmitCtx<'_>) -> Result<(), EmitError>;
}

#[derive(Debug)]
pub(crate) struct RingProgress {
    pub(crate) seq: u64,
    pub(crate) since: Instant,
}

/// A hardware queue: engine class plus queue coordinates, one fence
/// timeline, and exactly one scheduler, created and destroyed with the ring.
pub struct Ring {
    index: usize,
    pub(crate) engine: EngineClass,
    pub(crate) coords: QueueCoords,
    pub(crate) timeline: FenceTimeline,
    pub(crate) emitter: Arc<dyn Emitter>,
    pub(crate) sched: Mutex<Scheduler>,
    pub(crate) progress: Mutex<RingProgress>,
}

impl Ring {
    pub(crate) fn new(
        index: usize,
        engine: EngineClass,
        coords: QueueCoords,
        emitter: Arc<dyn Emitter>,
    ) -> Arc<Ring> {
        Arc::new(Ring {
            index,
            engine,
            coords,
            timeline: FenceTimeline::new(),
            emitter,
            sched: Mutex::new(Scheduler::new()),
            progress: Mutex::new(RingProgress {
                seq: 0,
                since: Instant::now(),
            }),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn engine(&self) -> EngineClass {
        self.engine
    }

    pub fn coords(&self) -> QueueCoords {
        self.coords
    }

    /// Highest completed sequence number observed from the hardware.
    pub fn last_signaled(&self) -> u64 {
        self.timeline.last_signaled()
    }

    /// Interrupt-context completion path: the hardware fence counter for
    /// this ring advanced to `counter`. Signals every hardware fence with a
    /// sequence ≤ counter in submission order, then retires completed
    /// pending jobs. Never blocks on anything but short internal locks.
    pub fn irq_advance(&self, dev: &Device, counter: u64) {
        debug!(ring = self.index, counter, "fence writeback");
        self.timeline.advance_to(counter);
        self.retire(dev);
    }

    /// Emit a job's IBs, returning the hardware fence tracking completion.
    /// Called with the scheduler lock held, which serializes per-ring
    /// sequence assignment.
    pub(crate) fn emit(
        &self,
        vmid: Option<u32>,
        tmz: bool,
        ibs: &[IndirectBuffer],
    ) -> Result<Fence, EmitError> {
        let seq = self.timeline.issued() + 1;
        let ctx = EmitCtx {
            engine: self.engine,
            coords: self.coords,
            seq,
            vmid,
            tmz,
            ibs,
        };
        self.emitter.emit(&ctx)?;
        let hw = self.timeline.issue();
        debug_assert_eq!(hw.seq(), seq);
        Ok(hw)
    }
}
