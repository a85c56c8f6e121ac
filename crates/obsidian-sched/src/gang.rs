use std::sync::Arc;

use obsidian_fence::SubmitFence;
use tracing::debug;

use crate::device::{Device, JobOwner};
use crate::error::SubmitError;
use crate::job::Job;
use crate::ring::Ring;
use crate::sched::Entity;

/// A gang: jobs on different rings that must be resident on their engines
/// simultaneously. Every non-leader member is ordered behind the leader's
/// scheduled fence; the leader itself takes no fence. Submitting the leader
/// last keeps the ordering sound even if rings are pumped between the
/// individual submits.
///
/// A member on the leader's own ring is rejected at submit: queued ahead of
/// its leader it would park the ring head on a fence only that same ring can
/// signal.
#[derive(Default)]
pub struct GangSubmit {
    entries: Vec<(Arc<Ring>, Box<Job>)>,
    leader: Option<usize>,
}

impl GangSubmit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member job, returning its index within the gang.
    pub fn add(&mut self, ring: Arc<Ring>, job: Box<Job>) -> usize {
        self.entries.push((ring, job));
        self.entries.len() - 1
    }

    /// Add the leader job. Panics if a leader was already chosen.
    pub fn add_leader(&mut self, ring: Arc<Ring>, job: Box<Job>) -> usize {
        let index = self.add(ring, job);
        self.set_leader(index);
        index
    }

    /// Choose an existing member as the leader. Panics if a leader was
    /// already chosen or `index` is out of range.
    pub fn set_leader(&mut self, index: usize) {
        assert!(self.leader.is_none(), "gang leader already set");
        assert!(index < self.entries.len(), "gang leader index out of range");
        self.leader = Some(index);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Submit the whole gang. Fences are returned in the order members were
    /// added. Members go in first so they are queued (and blocked on the
    /// leader's scheduled fence) before the leader can possibly run.
    pub fn submit(
        mut self,
        dev: &Device,
        entity: &Entity,
        owner: &Arc<JobOwner>,
    ) -> Result<Vec<SubmitFence>, SubmitError> {
        let Some(leader_idx) = self.leader else {
            return Err(SubmitError::InvalidArgument("gang has no leader"));
        };
        for (i, (ring, _)) in self.entries.iter().enumerate() {
            if i != leader_idx && Arc::ptr_eq(ring, &self.entries[leader_idx].0) {
                return Err(SubmitError::InvalidArgument(
                    "gang member shares the leader's ring",
                ));
            }
        }

        let leader_scheduled = self.entries[leader_idx].1.fence().scheduled.clone();
        for (i, (_, job)) in self.entries.iter_mut().enumerate() {
            if i != leader_idx {
                job.link_gang(leader_scheduled.clone());
            }
        }

        debug!(members = self.entries.len(), leader = leader_idx, "gang submit");
        let mut fences: Vec<Option<SubmitFence>> = Vec::with_capacity(self.entries.len());
        fences.resize_with(self.entries.len(), || None);

        let (leader_ring, leader_job) = self.entries.remove(leader_idx);
        for (i, (ring, job)) in self.entries.into_iter().enumerate() {
            let slot = if i < leader_idx { i } else { i + 1 };
            fences[slot] = Some(ring.submit(dev, job, entity, owner));
        }
        fences[leader_idx] = Some(leader_ring.submit(dev, leader_job, entity, owner));

        Ok(fences.into_iter().map(|f| f.expect("all slots filled")).collect())
    }
}
