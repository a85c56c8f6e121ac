use crate::fence::Fence;

/// The set of fences a job must wait on before it is eligible to run.
///
/// Wait-only: the set holds handles it never signals. A fence that reached a
/// terminal state counts as resolved even if it carries an error; the
/// dependent job runs (or self-cancels) regardless of how its dependencies
/// ended.
#[derive(Debug, Default)]
pub struct SyncSet {
    fences: Vec<Fence>,
}

impl SyncSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency. Duplicate handles to the same fence are collapsed.
    pub fn add(&mut self, fence: Fence) {
        if self.fences.iter().any(|f| f.ptr_eq(&fence)) {
            return;
        }
        self.fences.push(fence);
    }

    /// First dependency that has not reached a terminal state, if any.
    /// Resolved fences are dropped as a side effect so repeated polls are
    /// cheap.
    pub fn first_unresolved(&mut self) -> Option<Fence> {
        self.fences.retain(|f| !f.is_signaled());
        self.fences.first().cloned()
    }

    pub fn len(&self) -> usize {
        self.fences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }

    pub fn clear(&mut self) {
        self.fences.clear();
    }
}
