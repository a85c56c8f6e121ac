mod common;

use std::sync::Arc;

use common::{entity, rig, rig_with_config, tagged_job};
use obsidian_sched::{
    AddressSpace, DeviceConfig, EngineClass, Entity, FenceError, Job, JobOwner, Priority,
    PumpStatus,
};
use pretty_assertions::assert_eq;

#[test]
fn submit_pump_irq_round_trip() {
    let r = rig();
    let owner = JobOwner::new();
    let vm = Arc::new(AddressSpace { id: 1 });

    let mut job = Job::alloc(&r.dev, EngineClass::Gfx, 1, Some(&vm)).unwrap();
    job.add_ib(obsidian_sched::IndirectBuffer {
        flags: obsidian_sched::IbFlags::empty(),
        words: vec![0xa, 0, 0, 0],
    });

    let fence = r.ring.submit(&r.dev, job, &entity(), &owner);
    assert_eq!(r.ring.queued_len(), 1);
    assert!(!fence.scheduled.is_signaled());

    assert!(matches!(r.ring.pump(&r.dev), PumpStatus::Progress));
    assert!(fence.scheduled.is_signaled());
    assert!(!fence.finished.is_signaled());
    assert_eq!(r.ring.pending_len(), 1);
    assert_eq!(r.dev.watcher().inflight(EngineClass::Gfx), 1);
    assert_eq!(r.dev.vmids.busy_len(), 1);
    assert_eq!(r.emitter.emits(), vec![(1, 0xa)]);

    r.ring.irq_advance(&r.dev, 1);
    assert_eq!(fence.finished.status(), Some(Ok(())));
    assert_eq!(r.ring.pending_len(), 0);
    assert_eq!(r.dev.watcher().inflight(EngineClass::Gfx), 0);
    assert_eq!(r.dev.vmids.busy_len(), 0);
}

#[test]
fn finished_fences_signal_in_submission_order() {
    let r = rig();
    let owner = JobOwner::new();

    let f1 = r
        .ring
        .submit(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 1), &entity(), &owner);
    let f2 = r
        .ring
        .submit(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 2), &entity(), &owner);
    let f3 = r
        .ring
        .submit(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 3), &entity(), &owner);
    assert!(matches!(r.ring.pump(&r.dev), PumpStatus::Progress));
    assert_eq!(r.emitter.emits(), vec![(1, 1), (2, 2), (3, 3)]);

    r.ring.irq_advance(&r.dev, 2);
    assert_eq!(f1.finished.status(), Some(Ok(())));
    assert_eq!(f2.finished.status(), Some(Ok(())));
    assert!(!f3.finished.is_signaled());

    r.ring.irq_advance(&r.dev, 3);
    assert_eq!(f3.finished.status(), Some(Ok(())));
}

#[test]
fn higher_priority_queue_drains_first() {
    let r = rig();
    let owner = JobOwner::new();

    r.ring.submit(
        &r.dev,
        tagged_job(&r.dev, EngineClass::Gfx, 10),
        &Entity::new(Priority::Low),
        &owner,
    );
    r.ring.submit(
        &r.dev,
        tagged_job(&r.dev, EngineClass::Gfx, 20),
        &Entity::new(Priority::Kernel),
        &owner,
    );
    r.ring.submit(
        &r.dev,
        tagged_job(&r.dev, EngineClass::Gfx, 30),
        &Entity::new(Priority::Normal),
        &owner,
    );

    r.ring.pump(&r.dev);
    let tags: Vec<u32> = r.emitter.emits().iter().map(|(_, t)| *t).collect();
    assert_eq!(tags, vec![20, 30, 10]);
}

#[test]
fn direct_submit_runs_inline() {
    let r = rig();
    let fence = r
        .ring
        .submit_direct(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 0xd));

    assert!(fence.scheduled.is_signaled());
    assert_eq!(r.ring.queued_len(), 0);
    assert_eq!(r.ring.pending_len(), 1);

    r.ring.irq_advance(&r.dev, 1);
    assert_eq!(fence.finished.status(), Some(Ok(())));
}

#[test]
fn emit_failure_errors_the_finished_fence() {
    let r = rig();
    let owner = JobOwner::new();
    r.emitter.fail_next();

    let fence = r
        .ring
        .submit(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 0xe), &entity(), &owner);
    r.ring.pump(&r.dev);

    assert!(fence.scheduled.is_signaled());
    assert!(matches!(
        fence.finished.status(),
        Some(Err(FenceError::Emit(_)))
    ));
    assert_eq!(r.ring.pending_len(), 0);
    assert_eq!(r.dev.watcher().inflight(EngineClass::Gfx), 0);
}

#[test]
fn exiting_owner_is_cancelled_at_run() {
    let r = rig();
    let owner = JobOwner::new();

    let fence = r
        .ring
        .submit(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 0xc), &entity(), &owner);
    owner.mark_exiting();
    r.ring.pump(&r.dev);

    assert!(fence.scheduled.is_signaled());
    assert_eq!(
        fence.finished.status(),
        Some(Err(FenceError::ProcessExiting))
    );
    assert!(r.emitter.emits().is_empty());
}

#[test]
fn submit_on_lost_device_fails_both_fences() {
    let r = rig();
    let owner = JobOwner::new();
    r.dev.mark_lost();

    let fence = r
        .ring
        .submit(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 0xf), &entity(), &owner);
    assert_eq!(fence.scheduled.status(), Some(Err(FenceError::DeviceGone)));
    assert_eq!(fence.finished.status(), Some(Err(FenceError::DeviceGone)));
    assert_eq!(r.ring.queued_len(), 0);
}

#[test]
fn direct_submit_on_lost_device_fails_both_fences() {
    let r = rig();
    r.dev.mark_lost();

    let fence = r
        .ring
        .submit_direct(&r.dev, tagged_job(&r.dev, EngineClass::Gfx, 0x1d));
    assert_eq!(fence.scheduled.status(), Some(Err(FenceError::DeviceGone)));
    assert_eq!(fence.finished.status(), Some(Err(FenceError::DeviceGone)));
    assert_eq!(r.ring.pending_len(), 0);
    assert!(r.emitter.emits().is_empty());
}

#[test]
fn dry_vmid_pool_parks_the_head_job() {
    let r = rig_with_config(DeviceConfig {
        vmid_slots: 1,
        tmz_slots: 4,
    });
    let owner = JobOwner::new();
    let vm_a = Arc::new(AddressSpace { id: 1 });
    let vm_b = Arc::new(AddressSpace { id: 2 });

    let mut a = Job::alloc(&r.dev, EngineClass::Gfx, 1, Some(&vm_a)).unwrap();
    a.add_ib(obsidian_sched::IndirectBuffer {
        flags: obsidian_sched::IbFlags::empty(),
        words: vec![1],
    });
    let mut b = Job::alloc(&r.dev, EngineClass::Gfx, 1, Some(&vm_b)).unwrap();
    b.add_ib(obsidian_sched::IndirectBuffer {
        flags: obsidian_sched::IbFlags::empty(),
        words: vec![2],
    });

    let fa = r.ring.submit(&r.dev, a, &entity(), &owner);
    let fb = r.ring.submit(&r.dev, b, &entity(), &owner);

    // First job takes the only VMID; the second parks on its finished fence.
    match r.ring.pump(&r.dev) {
        PumpStatus::Waiting(blocker) => assert!(blocker.ptr_eq(&fa.finished)),
        other => panic!("expected Waiting, got {other:?}"),
    }
    assert_eq!(r.dev.vmids.free_len(), 0);

    r.ring.irq_advance(&r.dev, 1);
    assert_eq!(fa.finished.status(), Some(Ok(())));

    assert!(matches!(r.ring.pump(&r.dev), PumpStatus::Progress));
    r.ring.irq_advance(&r.dev, 2);
    assert_eq!(fb.finished.status(), Some(Ok(())));
    assert_eq!(r.dev.vmids.free_len(), 1);
}

#[test]
fn unresolved_dependency_parks_then_releases() {
    let r = rig();
    let owner = JobOwner::new();
    let dep = obsidian_sched::Fence::new(0);

    let mut job = tagged_job(&r.dev, EngineClass::Gfx, 0xb);
    job.add_dependency(dep.clone());
    let fence = r.ring.submit(&r.dev, job, &entity(), &owner);

    match r.ring.pump(&r.dev) {
        PumpStatus::Waiting(blocker) => assert!(blocker.ptr_eq(&dep)),
        other => panic!("expected Waiting, got {other:?}"),
    }

    dep.signal();
    assert!(matches!(r.ring.pump(&r.dev), PumpStatus::Progress));
    r.ring.irq_advance(&r.dev, 1);
    assert_eq!(fence.finished.status(), Some(Ok(())));
}

#[test]
fn errored_dependency_counts_as_resolved() {
    let r = rig();
    let owner = JobOwner::new();
    let dep = obsidian_sched::Fence::new(0);
    dep.signal_err(FenceError::DeviceGone);

    let mut job = tagged_job(&r.dev, EngineClass::Gfx, 0xb);
    job.add_dependency(dep);
    let fence = r.ring.submit(&r.dev, job, &entity(), &owner);

    assert!(matches!(r.ring.pump(&r.dev), PumpStatus::Progress));
    r.ring.irq_advance(&r.dev, 1);
    assert_eq!(fence.finished.status(), Some(Ok(())));
}

#[test]
fn pump_on_empty_ring_is_idle() {
    let r = rig();
    assert!(matches!(r.ring.pump(&r.dev), PumpStatus::Idle));
}
