use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

/// Terminal error state of a fence.
///
/// `VramLost` and `ProcessExiting` are deliberately distinct: the former
/// means a device reset invalidated the job's captured VRAM generation, the
/// latter that the owning process tore down before the job ran.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FenceError {
    /// The device was reset after this job captured its VRAM generation;
    /// all GPU-resident state the job depended on is gone.
    #[error("vram lost: job epoch is older than device epoch {epoch}")]
    VramLost { epoch: u64 },
    /// The owning process is exiting; the job was never executed.
    #[error("owning process is exiting")]
    ProcessExiting,
    /// The device is unrecoverable; queued and pending work was aborted.
    #[error("device gone")]
    DeviceGone,
    /// The ring's packet emitter rejected the submission.
    #[error("emit failed: {0}")]
    Emit(String),
}

/// Returned by [`Fence::wait_timeout`] when the deadline elapses first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("timed out waiting for fence")]
pub struct WaitTimedOut;

#[derive(Debug)]
struct FenceInner {
    seq: u64,
    state: Mutex<Option<Result<(), FenceError>>>,
    cond: Condvar,
}

/// A cloneable handle to one completion point.
///
/// Signaling is idempotent: the first `signal`/`signal_err` wins and later
/// attempts are no-ops. Signaling never blocks beyond the internal state
/// lock, so it is safe from interrupt-style completion paths.
#[derive(Clone, Debug)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn new(seq: u64) -> Self {
        Self {
            inner: Arc::new(FenceInner {
                seq,
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Sequence number on the owning timeline (0 for standalone fences).
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// Two handles are the same fence iff they share the same inner state.
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Signal successful completion. Returns `false` if the fence was
    /// already terminal.
    pub fn signal(&self) -> bool {
        self.terminate(Ok(()))
    }

    /// Signal completion with an error. Returns `false` if the fence was
    /// already terminal.
    pub fn signal_err(&self, err: FenceError) -> bool {
        self.terminate(Err(err))
    }

    /// Signal with the outcome of another completion (used to propagate a
    /// hardware fence's state onto a job's finished fence).
    pub fn signal_result(&self, result: Result<(), FenceError>) -> bool {
        self.terminate(result)
    }

    fn terminate(&self, result: Result<(), FenceError>) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.is_some() {
            return false;
        }
        *state = Some(result);
        self.inner.cond.notify_all();
        true
    }

    pub fn is_signaled(&self) -> bool {
        self.inner.state.lock().unwrap().is_some()
    }

    /// `None` while pending, `Some(outcome)` once terminal.
    pub fn status(&self) -> Option<Result<(), FenceError>> {
        self.inner.state.lock().unwrap().clone()
    }

    /// Block until the fence is terminal or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Result<(), FenceError>, WaitTimedOut> {
        let state = self.inner.state.lock().unwrap();
        let (state, wait) = self
            .inner
            .cond
            .wait_timeout_while(state, timeout, |s| s.is_none())
            .unwrap();
        match &*state {
            Some(outcome) => Ok(outcome.clone()),
            None => {
                debug_assert!(wait.timed_out());
                Err(WaitTimedOut)
            }
        }
    }
}

/// The completion fence pair jointly owned by a job and its submitter.
///
/// `scheduled` signals when the scheduler hands the job to the ring (gang
/// members order behind their leader's `scheduled`); `finished` signals when
/// the hardware completes the job, or carries the cancellation/emission
/// error. Both reach a terminal state exactly once for every submitted job.
#[derive(Clone, Debug)]
pub struct SubmitFence {
    pub scheduled: Fence,
    pub finished: Fence,
}

impl SubmitFence {
    pub fn new() -> Self {
        Self {
            scheduled: Fence::new(0),
            finished: Fence::new(0),
        }
    }

    /// True once both sub-fences are terminal.
    pub fn is_terminal(&self) -> bool {
        self.scheduled.is_signaled() && self.finished.is_signaled()
    }
}

impl Default for SubmitFence {
    fn default() -> Self {
        Self::new()
    }
}
