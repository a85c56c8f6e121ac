//! Fence primitives for the obsidian GPU submission engine.
//!
//! A fence is a single-writer/multi-reader marker for a future completion
//! point on a monotonically increasing timeline. Per-ring timelines hand out
//! sequence numbers and signal fences in order as the hardware completion
//! counter advances; standalone fence pairs (`SubmitFence`) track the
//! scheduled/finished milestones of one job.

mod fence;
mod sync;
mod timeline;

pub use fence::{Fence, FenceError, SubmitFence, WaitTimedOut};
pub use sync::SyncSet;
pub use timeline::FenceTimeline;
