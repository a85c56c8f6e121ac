#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use obsidian_sched::{
    Device, DeviceConfig, DeviceHooks, EmitCtx, EmitError, Emitter, EngineClass, Entity, IbFlags,
    IndirectBuffer, Job, Priority, QueueCoords, ResetError, Ring, Workaround,
};

/// Recording device hooks with optional injected reset failure.
#[derive(Default)]
pub struct TestHooks {
    toggles: Mutex<Vec<(Workaround, bool)>>,
    resets: AtomicU32,
    fail_reset: AtomicBool,
}

impl TestHooks {
    pub fn toggles(&self) -> Vec<(Workaround, bool)> {
        self.toggles.lock().unwrap().clone()
    }

    pub fn resets(&self) -> u32 {
        self.resets.load(Ordering::Relaxed)
    }

    pub fn fail_next_reset(&self) {
        self.fail_reset.store(true, Ordering::Relaxed);
    }
}

impl DeviceHooks for TestHooks {
    fn reset(&self) -> Result<(), ResetError> {
        self.resets.fetch_add(1, Ordering::Relaxed);
        if self.fail_reset.swap(false, Ordering::Relaxed) {
            return Err(ResetError("injected reset failure".into()));
        }
        Ok(())
    }

    fn set_workaround(&self, wa: Workaround, enable: bool) {
        self.toggles.lock().unwrap().push((wa, enable));
    }
}

/// Recording emitter: logs `(seq, tag)` per accepted submission, where the
/// tag is the first command word of the first IB. Can fail one emission on
/// demand.
#[derive(Default)]
pub struct TestEmitter {
    emits: Mutex<Vec<(u64, u32)>>,
    fail_next: AtomicBool,
}

impl TestEmitter {
    pub fn emits(&self) -> Vec<(u64, u32)> {
        self.emits.lock().unwrap().clone()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }
}

impl Emitter for TestEmitter {
    fn emit(&self, ctx: &EmitCtx<'_>) -> Result<(), EmitError> {
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(EmitError("injected emit failure".into()));
        }
        let tag = ctx
            .ibs
            .first()
            .and_then(|ib| ib.words.first())
            .copied()
            .unwrap_or(0);
        self.emits.lock().unwrap().push((ctx.seq, tag));
        Ok(())
    }
}

pub struct Rig {
    pub dev: Arc<Device>,
    pub ring: Arc<Ring>,
    pub hooks: Arc<TestHooks>,
    pub emitter: Arc<TestEmitter>,
}

pub fn rig() -> Rig {
    rig_with_config(DeviceConfig::default())
}

pub fn rig_with_config(config: DeviceConfig) -> Rig {
    let hooks = Arc::new(TestHooks::default());
    let emitter = Arc::new(TestEmitter::default());
    let dev = Device::new(hooks.clone(), config);
    let ring = dev.add_ring(
        EngineClass::Gfx,
        QueueCoords { pipe: 0, queue: 0 },
        emitter.clone(),
    );
    Rig {
        dev,
        ring,
        hooks,
        emitter,
    }
}

pub fn entity() -> Entity {
    Entity::new(Priority::Normal)
}

/// A one-IB job whose first command word identifies it in the emit log.
pub fn tagged_job(dev: &Device, engine: EngineClass, tag: u32) -> Box<Job> {
    flagged_job(dev, engine, tag, IbFlags::empty())
}

pub fn flagged_job(dev: &Device, engine: EngineClass, tag: u32, flags: IbFlags) -> Box<Job> {
    let mut job = Job::alloc(dev, engine, 1, None).unwrap();
    job.add_ib(IndirectBuffer {
        flags,
        words: vec![tag, 0xffff_1000, 0, 0],
    });
    job
}
