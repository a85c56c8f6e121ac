use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::fence::{Fence, FenceError};

/// Per-ring fence timeline: a sequence allocator plus the set of live
/// (issued, unsignaled) fences, kept in issue order.
///
/// Invariant: a fence at sequence N is signaled once the hardware completion
/// counter advances to ≥ N, and fences signal strictly in sequence order.
/// Sequence 0 is reserved as "nothing signaled yet".
#[derive(Debug, Default)]
pub struct FenceTimeline {
    next_seq: AtomicU64,
    last_signaled: AtomicU64,
    live: Mutex<VecDeque<Fence>>,
}

impl FenceTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number and issue a live fence for it.
    pub fn issue(&self) -> Fence {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let fence = Fence::new(seq);
        self.live.lock().unwrap().push_back(fence.clone());
        fence
    }

    /// Highest sequence number issued so far.
    pub fn issued(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed)
    }

    /// Highest sequence number observed as completed by the hardware.
    pub fn last_signaled(&self) -> u64 {
        self.last_signaled.load(Ordering::Acquire)
    }

    /// Completion-counter writeback: signal every live fence with
    /// `seq <= counter`, in order. Counters never move backwards; a stale
    /// counter is ignored. Never blocks (interrupt path).
    pub fn advance_to(&self, counter: u64) {
        let mut signaled = Vec::new();
        {
            let mut live = self.live.lock().unwrap();
            while let Some(front) = live.front() {
                if front.seq() > counter {
                    break;
                }
                signaled.push(live.pop_front().unwrap());
            }
            self.last_signaled.fetch_max(counter, Ordering::AcqRel);
        }
        for fence in signaled {
            fence.signal();
        }
    }

    /// Error-complete every live fence (device reset invalidated them all).
    /// The sequence space stays monotonic across resets.
    pub fn wipe(&self, err: FenceError) {
        let drained: Vec<Fence> = self.live.lock().unwrap().drain(..).collect();
        for fence in drained {
            fence.signal_err(err.clone());
        }
    }

    /// Number of issued-but-unsignaled fences.
    pub fn live_len(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}
