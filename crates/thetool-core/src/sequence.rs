//! Run-wide report id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ReportId;

/// Monotonic report id allocator.
///
/// One instance is owned by the runner and shared (via `Arc`) with the main
/// session and every worker session, so ids never collide within a run.
#[derive(Debug)]
pub struct ReportSequence {
    next: AtomicU64,
}

impl Default for ReportSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportSequence {
    /// Create a sequence whose first id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> ReportId {
        ReportId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
