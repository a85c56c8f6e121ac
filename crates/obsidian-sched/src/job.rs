use std::sync::{Arc, Weak};

use bitflags::bitflags;
use obsidian_fence::{Fence, SubmitFence, SyncSet};

use crate::device::{AddressSpace, Device, JobOwner};
use crate::engine::EngineClass;
use crate::error::SubmitError;
use crate::sched::Priority;
use crate::workaround::WorkaroundMask;

bitflags! {
    /// Per-IB submission flags. The workaround bits mark that the commands
    /// in this IB depend on the corresponding hardware toggle being active
    /// while they execute.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IbFlags: u32 {
        const PERF_COUNTER_TRACE = 1 << 0;
        const THREAD_TRACE = 1 << 1;
        /// Preamble IB, re-emitted on context switch.
        const PREAMBLE = 1 << 2;
    }
}

/// One indirect buffer: a block of GPU command-stream words. The payload is
/// opaque to this engine (packet encoding is a collaborator concern); it is
/// owned by the job until executed and dropped right after emission.
#[derive(Clone, Debug, Default)]
pub struct IndirectBuffer {
    pub flags: IbFlags,
    pub words: Vec<u32>,
}

/// Job lifecycle states. A job is never reused after `Freed`; a timed-out
/// job may re-enter `Queued` exactly once (recovery requeue).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Unsubmitted,
    Queued,
    Executing,
    Freed,
}

/// A unit of GPU work: an IB list plus everything needed to order, place and
/// retire it.
#[derive(Debug)]
pub struct Job {
    pub(crate) id: u64,
    pub(crate) engine: EngineClass,
    pub(crate) state: JobState,
    pub(crate) priority: Priority,

    pub(crate) ibs: Vec<IndirectBuffer>,
    pub(crate) deps: SyncSet,
    pub(crate) vm: Option<Weak<AddressSpace>>,
    pub(crate) vmid: Option<u32>,
    pub(crate) secure: bool,
    pub(crate) tmz_slot: Option<u32>,

    /// The gang leader's scheduled fence. Never the job's own fence: a
    /// leader holding a handle to itself would be a reference cycle, so the
    /// coordinator simply never installs one.
    pub(crate) gang_leader: Option<Fence>,

    pub(crate) fence: SubmitFence,
    pub(crate) owner: Option<Arc<JobOwner>>,

    /// VRAM generation captured at allocation. If the device epoch advances
    /// past this, the job self-cancels at its next run.
    pub(crate) epoch: u64,

    /// Hardware fence from the most recent emission; replaced wholesale on
    /// a retry after recovery.
    pub(crate) hw_fence: Option<Fence>,

    /// Workarounds this job currently holds references on. Acquired at run,
    /// released at free.
    pub(crate) wa_active: WorkaroundMask,

    /// Whether run incremented the hang-watcher in-flight counter. Exactly
    /// one matching decrement happens at free.
    pub(crate) counted: bool,
}

impl Job {
    /// Allocate a job with room for `num_ibs` indirect buffers.
    pub fn alloc(
        device: &Device,
        engine: EngineClass,
        num_ibs: usize,
        vm: Option<&Arc<AddressSpace>>,
    ) -> Result<Box<Job>, SubmitError> {
        if num_ibs == 0 {
            return Err(SubmitError::InvalidArgument("job needs at least one IB"));
        }
        let mut ibs = Vec::new();
        ibs.try_reserve_exact(num_ibs)
            .map_err(|_| SubmitError::OutOfMemory)?;

        Ok(Box::new(Job {
            id: device.next_job_id(),
            engine,
            state: JobState::Unsubmitted,
            priority: Priority::Normal,
            ibs,
            deps: SyncSet::new(),
            vm: vm.map(Arc::downgrade),
            vmid: None,
            secure: false,
            tmz_slot: None,
            gang_leader: None,
            fence: SubmitFence::new(),
            owner: None,
            epoch: device.vram_lost_epoch(),
            hw_fence: None,
            wa_active: WorkaroundMask::empty(),
            counted: false,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine(&self) -> EngineClass {
        self.engine
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// The job's completion fence pair. Shared with the submitter.
    pub fn fence(&self) -> &SubmitFence {
        &self.fence
    }

    pub fn add_ib(&mut self, ib: IndirectBuffer) {
        self.ibs.push(ib);
    }

    pub fn add_dependency(&mut self, fence: Fence) {
        self.deps.add(fence);
    }

    /// Request a secure (TMZ) context for this job.
    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    /// Order this job behind `leader`'s scheduled fence. Panics if a leader
    /// was already set. A job that is its own gang leader takes no
    /// reference at all.
    pub fn set_gang_leader(&mut self, leader: &Job) {
        assert!(self.gang_leader.is_none(), "gang leader already set");
        if leader.id == self.id {
            return;
        }
        self.gang_leader = Some(leader.fence.scheduled.clone());
    }

    pub(crate) fn link_gang(&mut self, leader_scheduled: Fence) {
        assert!(self.gang_leader.is_none(), "gang leader already set");
        self.gang_leader = Some(leader_scheduled);
    }

    /// Desired workaround set, computed by scanning the IB list once.
    pub(crate) fn workaround_mask(&self) -> WorkaroundMask {
        let mut mask = WorkaroundMask::empty();
        for ib in &self.ibs {
            if ib.flags.contains(IbFlags::PERF_COUNTER_TRACE) {
                mask |= WorkaroundMask::PERF_COUNTER;
            }
            if ib.flags.contains(IbFlags::THREAD_TRACE) {
                mask |= WorkaroundMask::THREAD_TRACE;
            }
        }
        mask
    }

    /// Drop IB command payloads while keeping the metadata (flags) needed
    /// for free-time bookkeeping. Requeued jobs never re-emit: recovery has
    /// bumped the epoch, so their next run self-cancels.
    pub(crate) fn release_ib_payload(&mut self) {
        for ib in &mut self.ibs {
            ib.words = Vec::new();
        }
    }

    /// True when the owning process is tearing down (exiting owner or a
    /// dropped address space).
    pub(crate) fn owner_exiting(&self) -> bool {
        if self
            .owner
            .as_ref()
            .is_some_and(|owner| owner.is_exiting())
        {
            return true;
        }
        match &self.vm {
            Some(vm) => vm.upgrade().is_none(),
            None => false,
        }
    }
}
