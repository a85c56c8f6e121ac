//! GPU command submission and recovery engine.
//!
//! Producers allocate [`Job`]s (lists of indirect buffers plus ordering and
//! placement metadata) and submit them to per-hardware-queue [`Ring`]s. The
//! engine resolves dependencies, binds VMID/TMZ slots, orders gang members
//! behind their leader, emits through a caller-supplied [`Emitter`], and
//! completes each job's [`SubmitFence`] exactly once. A background
//! [`Watchdog`] detects stalled rings and drives the single-flight device
//! reset, which requeues pending work for one epoch-cancelled retry.
//!
//! Hardware access is confined to two collaborator traits, [`DeviceHooks`]
//! and [`Emitter`]; everything else is pure bookkeeping and can be driven
//! deterministically from tests.

mod device;
mod engine;
mod error;
mod gang;
mod job;
mod recovery;
mod ring;
mod sched;
mod watcher;
mod workaround;

#[cfg(test)]
mod testutil;

pub use device::{
    AddressSpace, Device, DeviceConfig, DeviceHooks, JobOwner, PoolGrab, SlotPool,
};
pub use engine::{EngineCaps, EngineClass, QueueCoords};
pub use error::{EmitError, PowerError, ResetError, SubmitError};
pub use gang::GangSubmit;
pub use job::{IbFlags, IndirectBuffer, Job, JobState};
pub use recovery::TimeoutDisposition;
pub use ring::{EmitCtx, Emitter, Ring};
pub use sched::{Entity, Priority, PumpStatus};
pub use watcher::{scan, HangWatcher, Watchdog};
pub use workaround::{Workaround, WorkaroundMask, WorkaroundRefCounter};

pub use obsidian_fence::{Fence, FenceError, SubmitFence, SyncSet, WaitTimedOut};
