use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use obsidian_fence::{Fence, FenceError, SubmitFence};
use tracing::{debug, error, trace, warn};

use crate::device::{Device, JobOwner, PoolGrab};
use crate::job::{Job, JobState};
use crate::recovery::{self, TimeoutDisposition};
use crate::ring::Ring;
use crate::workaround::WorkaroundMask;

/// How long a direct (queue-bypass) submission will block on a prepare
/// blocker before giving up. Direct submits are administrative bring-up
/// work; a device that cannot clear them in this window is gone.
const DIRECT_SUBMIT_WAIT: Duration = Duration::from_secs(10);

/// Consecutive timeouts a ring may take without retiring a single job before
/// the device is declared unrecoverable.
const MAX_RING_STRIKES: u32 = 3;

/// Scheduling priority of a submission entity. FIFO within a priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
    Kernel,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Kernel => 3,
        }
    }
}

/// A submission entity: the handle producers submit through. Entities with
/// a higher priority drain first.
#[derive(Clone, Copy, Debug)]
pub struct Entity {
    pub priority: Priority,
}

impl Entity {
    pub fn new(priority: Priority) -> Self {
        Self { priority }
    }
}

/// Per-ring scheduler state: not-yet-dispatched jobs per priority, plus the
/// pending list of dispatched-but-unconfirmed jobs in submission order.
/// A job is in exactly one of {queue, pending, done} at any time.
#[derive(Debug)]
pub(crate) struct Scheduler {
    pub(crate) queues: [VecDeque<Box<Job>>; Priority::COUNT],
    pub(crate) pending: VecDeque<Box<Job>>,
    /// Timeouts since the last retired job; cleared on any retirement.
    strikes: u32,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            queues: Default::default(),
            pending: VecDeque::new(),
            strikes: 0,
        }
    }

    fn highest_nonempty(&self) -> Option<usize> {
        (0..Priority::COUNT).rev().find(|&i| !self.queues[i].is_empty())
    }

    fn queued_len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }
}

/// Outcome of one pump pass over a ring's queues.
#[derive(Clone, Debug)]
pub enum PumpStatus {
    /// Nothing queued.
    Idle,
    /// At least one job was dispatched; queues are now empty.
    Progress,
    /// The head job is not ready; re-pump once this fence signals.
    /// A cooperative reschedule point, not a spin-wait.
    Waiting(Fence),
}

impl Ring {
    /// Queue a job for execution. Arms the completion fence pair: from this
    /// point both sub-fences are guaranteed to eventually reach a terminal
    /// state exactly once, whatever happens to the device.
    pub fn submit(
        &self,
        dev: &Device,
        mut job: Box<Job>,
        entity: &Entity,
        owner: &Arc<JobOwner>,
    ) -> SubmitFence {
        debug_assert_eq!(job.engine, self.engine, "job submitted to wrong ring");
        job.owner = Some(owner.clone());
        job.priority = entity.priority;
        let fence = job.fence.clone();

        // Early release: dependencies that already resolved are dropped now
        // rather than at first prepare.
        let _ = job.deps.first_unresolved();
        job.state = JobState::Queued;

        // The lost check shares the scheduler lock with abort's drain: a job
        // queued here is either drained by abort afterwards or rejected now.
        let mut sched = self.sched.lock().unwrap();
        if dev.is_lost() {
            drop(sched);
            job.fence.scheduled.signal_err(FenceError::DeviceGone);
            job.fence.finished.signal_err(FenceError::DeviceGone);
            release_job(dev, &mut job);
            return fence;
        }
        debug!(ring = self.index(), job = job.id, prio = ?entity.priority, "job queued");
        sched.queues[entity.priority.index()].push_back(job);
        fence
    }

    /// Synchronous queue bypass for administrative/bring-up IBs. Identical
    /// fence semantics to [`Ring::submit`]; blocks (bounded) on prepare
    /// blockers instead of rescheduling cooperatively.
    pub fn submit_direct(&self, dev: &Device, mut job: Box<Job>) -> SubmitFence {
        let fence = job.fence.clone();

        if dev.is_lost() {
            job.fence.scheduled.signal_err(FenceError::DeviceGone);
            job.fence.finished.signal_err(FenceError::DeviceGone);
            release_job(dev, &mut job);
            return fence;
        }

        job.state = JobState::Queued;
        loop {
            match self.prepare(dev, &mut job) {
                None => break,
                Some(blocker) => match blocker.wait_timeout(DIRECT_SUBMIT_WAIT) {
                    Ok(_) => continue,
                    Err(_) => {
                        warn!(ring = self.index(), job = job.id, "direct submit blocker timed out");
                        job.fence.scheduled.signal_err(FenceError::DeviceGone);
                        job.fence.finished.signal_err(FenceError::DeviceGone);
                        release_job(dev, &mut job);
                        return fence;
                    }
                },
            }
        }

        let mut sched = self.sched.lock().unwrap();
        // Re-check under the scheduler lock; abort drains under it.
        if dev.is_lost() {
            drop(sched);
            job.fence.scheduled.signal_err(FenceError::DeviceGone);
            job.fence.finished.signal_err(FenceError::DeviceGone);
            release_job(dev, &mut job);
            return fence;
        }
        self.run(dev, &mut job);
        if job.fence.finished.is_signaled() {
            drop(sched);
            release_job(dev, &mut job);
        } else {
            sched.pending.push_back(job);
        }
        fence
    }

    /// Drive queued jobs through prepare and run until the queues are empty
    /// or the head job has to wait. The dispatcher (or a test) calls this
    /// whenever a submission lands or a blocker fence signals.
    pub fn pump(&self, dev: &Device) -> PumpStatus {
        let mut progressed = false;
        loop {
            let mut sched = self.sched.lock().unwrap();
            let Some(pri) = sched.highest_nonempty() else {
                return if progressed {
                    PumpStatus::Progress
                } else {
                    PumpStatus::Idle
                };
            };

            let head = sched.queues[pri].front_mut().expect("nonempty queue");
            if let Some(blocker) = self.prepare(dev, head) {
                trace!(ring = self.index(), job = head.id, "head job waiting");
                return PumpStatus::Waiting(blocker);
            }

            let mut job = sched.queues[pri].pop_front().expect("nonempty queue");
            self.run(dev, &mut job);
            if job.fence.finished.is_signaled() {
                // Cancelled or failed at emit: never reached the hardware.
                drop(sched);
                release_job(dev, &mut job);
            } else {
                sched.pending.push_back(job);
            }
            progressed = true;
        }
    }

    /// Resolve everything a job needs before it may run. Returns the fence
    /// to wait on if it is not ready. The order is deliberate: data hazards
    /// clear before resource binding, resource binding clears before gang
    /// ordering.
    fn prepare(&self, dev: &Device, job: &mut Job) -> Option<Fence> {
        if let Some(dep) = job.deps.first_unresolved() {
            return Some(dep);
        }

        if job.vm.is_some() && job.vmid.is_none() && !job.owner_exiting() {
            match dev.vmids.acquire(job.fence.finished.clone()) {
                PoolGrab::Ready(slot) => job.vmid = Some(slot),
                PoolGrab::Busy(fence) => return Some(fence),
            }
        }

        if job.secure && self.engine.caps().supports_tmz && job.tmz_slot.is_none() {
            match dev.tmz.acquire(job.fence.finished.clone()) {
                PoolGrab::Ready(slot) => job.tmz_slot = Some(slot),
                PoolGrab::Busy(fence) => return Some(fence),
            }
        }

        if let Some(leader) = &job.gang_leader {
            if !leader.is_signaled() {
                return Some(leader.clone());
            }
        }

        None
    }

    /// Execute one prepared job. Never blocks and never leaves the finished
    /// fence unresolvable: cancellation and emitter failure error it on the
    /// spot, success ties it to the hardware fence retired by
    /// [`Ring::irq_advance`].
    fn run(&self, dev: &Device, job: &mut Job) {
        job.state = JobState::Executing;
        job.fence.scheduled.signal();

        let epoch = dev.vram_lost_epoch();
        if job.epoch < epoch {
            debug!(ring = self.index(), job = job.id, epoch, "job cancelled: vram lost");
            job.fence.finished.signal_err(FenceError::VramLost { epoch });
            return;
        }
        if job.owner_exiting() {
            debug!(ring = self.index(), job = job.id, "job cancelled: owner exiting");
            job.fence.finished.signal_err(FenceError::ProcessExiting);
            return;
        }

        // Enable transitions happen before execution; this job depends on
        // the workarounds being active while it runs. A retry already holds
        // its references.
        let want = job.workaround_mask();
        if !want.is_empty() && job.wa_active.is_empty() {
            dev.workarounds.acquire(want, dev.hooks().as_ref());
            job.wa_active = want;
        }

        match self.emit(job.vmid, job.secure, &job.ibs) {
            Ok(hw) => {
                // Replaces any stale fence from a prior attempt.
                job.hw_fence = Some(hw);
                if !job.counted {
                    dev.watcher.inc(self.engine);
                    job.counted = true;
                }
                job.release_ib_payload();
                debug!(ring = self.index(), job = job.id, seq = self.timeline.issued(), "job emitted");
            }
            Err(err) => {
                warn!(ring = self.index(), job = job.id, %err, "emit failed");
                job.fence
                    .finished
                    .signal_err(FenceError::Emit(err.to_string()));
            }
        }
    }

    /// Retire pending jobs whose hardware fence reached a terminal state,
    /// in submission order, propagating the outcome to their finished
    /// fences. Within one ring, finished fences therefore signal in
    /// submission order.
    pub(crate) fn retire(&self, dev: &Device) {
        let mut done = Vec::new();
        {
            let mut sched = self.sched.lock().unwrap();
            loop {
                let Some(front) = sched.pending.front() else { break };
                let Some(outcome) = front.hw_fence.as_ref().and_then(|hw| hw.status()) else {
                    break;
                };
                let job = sched.pending.pop_front().expect("nonempty pending");
                job.fence.finished.signal_result(outcome);
                done.push(job);
            }
            if !done.is_empty() {
                sched.strikes = 0;
            }
        }
        for mut job in done {
            debug!(ring = self.index(), job = job.id, "job retired");
            release_job(dev, &mut job);
        }
    }

    /// Watchdog-context timeout handling, serialized device-wide by the
    /// recovery mutex. A contended mutex means another reset is in flight:
    /// the job stays pending and will be requeued by that reset. A ring
    /// that keeps timing out without retiring a single job in between
    /// escalates instead of resetting forever.
    pub fn timed_out(&self, dev: &Device) -> TimeoutDisposition {
        {
            let mut sched = self.sched.lock().unwrap();
            let head_id = match sched.pending.front() {
                Some(head) => head.id,
                None => return TimeoutDisposition::Nominal,
            };
            sched.strikes += 1;
            if sched.strikes >= MAX_RING_STRIKES {
                error!(
                    ring = self.index(),
                    job = head_id,
                    strikes = sched.strikes,
                    "ring keeps hanging, giving up on device"
                );
                return TimeoutDisposition::Unrecoverable;
            }
            warn!(ring = self.index(), job = head_id, "job timed out");
        }

        let Some(guard) = dev.recovery.try_begin() else {
            trace!(ring = self.index(), "reset already in flight");
            return TimeoutDisposition::Nominal;
        };
        match recovery::run_reset(dev, guard) {
            Ok(()) => TimeoutDisposition::Nominal,
            Err(err) => {
                error!(ring = self.index(), %err, "reset primitive failed");
                TimeoutDisposition::Unrecoverable
            }
        }
    }

    /// Post-reset requeue: every pending job goes back to the front of its
    /// priority queue for exactly one retry. Their next run self-cancels
    /// against the bumped epoch. Stale hardware fences are error-completed
    /// so nothing waits on a counter that will never advance.
    pub(crate) fn reset_requeue(&self, epoch: u64) {
        let mut sched = self.sched.lock().unwrap();
        let mut pending: Vec<Box<Job>> = sched.pending.drain(..).collect();
        self.timeline.wipe(FenceError::VramLost { epoch });
        for job in pending.iter_mut() {
            job.hw_fence = None;
            job.state = JobState::Queued;
        }
        for job in pending.into_iter().rev() {
            let pri = job.priority.index();
            sched.queues[pri].push_front(job);
        }
    }

    /// Force-complete every job this ring still holds with a "device gone"
    /// error: queued jobs get both sub-fences forced, pending jobs only
    /// their finished fence (their scheduled fence signaled legitimately).
    pub fn abort(&self, dev: &Device) {
        let mut victims = Vec::new();
        {
            let mut sched = self.sched.lock().unwrap();
            for queue in sched.queues.iter_mut() {
                while let Some(job) = queue.pop_front() {
                    job.fence.scheduled.signal_err(FenceError::DeviceGone);
                    job.fence.finished.signal_err(FenceError::DeviceGone);
                    victims.push(job);
                }
            }
            while let Some(job) = sched.pending.pop_front() {
                job.fence.finished.signal_err(FenceError::DeviceGone);
                victims.push(job);
            }
        }
        if !victims.is_empty() {
            warn!(ring = self.index(), jobs = victims.len(), "aborting ring");
        }
        for mut job in victims {
            release_job(dev, &mut job);
        }
    }

    /// Number of not-yet-dispatched jobs.
    pub fn queued_len(&self) -> usize {
        self.sched.lock().unwrap().queued_len()
    }

    /// Number of dispatched, unconfirmed jobs.
    pub fn pending_len(&self) -> usize {
        self.sched.lock().unwrap().pending.len()
    }
}

/// Release scheduler bookkeeping for a job: dependency set, hang-watcher
/// count (iff run incremented it), deferred workaround disables, borrowed
/// VMID/TMZ slots, and the IB memory. Called exactly once per job; a second
/// call is rejected loudly.
pub(crate) fn release_job(dev: &Device, job: &mut Job) -> bool {
    if job.state == JobState::Freed {
        error!(job = job.id, "double free of job rejected");
        return false;
    }
    job.deps.clear();
    if job.counted {
        dev.watcher.dec(job.engine);
        job.counted = false;
    }
    if !job.wa_active.is_empty() {
        dev.workarounds.release(job.wa_active, dev.hooks().as_ref());
        job.wa_active = WorkaroundMask::empty();
    }
    if let Some(slot) = job.vmid.take() {
        dev.vmids.release(slot);
    }
    if let Some(slot) = job.tmz_slot.take() {
        dev.tmz.release(slot);
    }
    job.ibs = Vec::new();
    job.hw_fence = None;
    job.gang_leader = None;
    job.state = JobState::Freed;
    true
}
