//! Frame fence and deferred disposal of swapped GPU objects
//!
//! A view replaced mid-frame may still be referenced by command buffers the
//! render thread recorded earlier. Replaced objects are parked here, stamped
//! with the newest frame that was begun, and released only after the fence
//! reports that frame as completed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Tracks begun and completed frame indices
///
/// Frames are numbered from 1. Frame 0 means "nothing begun yet".
#[derive(Debug, Default)]
pub struct FrameFence {
    begun: AtomicU64,
    completed: Arc<AtomicU64>,
}

impl FrameFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording a new frame and return its index
    pub fn begin_frame(&self) -> u64 {
        self.begun.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Newest frame that has been begun
    pub fn current_frame(&self) -> u64 {
        self.begun.load(Ordering::Acquire)
    }

    /// Mark `frame` (and everything before it) as finished on the GPU
    pub fn complete_frame(&self, frame: u64) {
        self.completed.fetch_max(frame, Ordering::AcqRel);
    }

    /// Newest frame known to be finished
    pub fn completed_frame(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Shared completion counter, for device callbacks that outlive a borrow
    pub fn completion_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.completed)
    }
}

struct PendingDisposal<R> {
    retire_after: u64,
    resource: R,
}

/// Queue of resources waiting for their frames to retire
pub struct DeferredDisposal<R> {
    pending: Mutex<VecDeque<PendingDisposal<R>>>,
}

impl<R> DeferredDisposal<R> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Park `resource` until every frame begun so far has completed
    pub fn defer(&self, resource: R, fence: &FrameFence) {
        let mut pending = self.pending.lock();
        // Stamped under the lock so the queue stays sorted by frame
        let retire_after = fence.current_frame();
        pending.push_back(PendingDisposal { retire_after, resource });
    }

    /// Remove and return every resource whose frames have all completed
    pub fn collect(&self, completed_frame: u64) -> Vec<R> {
        let mut pending = self.pending.lock();
        let mut retired = Vec::new();
        while pending
            .front()
            .is_some_and(|p| p.retire_after <= completed_frame)
        {
            if let Some(p) = pending.pop_front() {
                retired.push(p.resource);
            }
        }
        retired
    }

    /// Remove everything regardless of frame state (device teardown)
    pub fn drain_all(&self) -> Vec<R> {
        self.pending.lock().drain(..).map(|p| p.resource).collect()
    }

    /// Number of resources still waiting
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl<R> Default for DeferredDisposal<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fence_counts_frames() {
        let fence = FrameFence::new();
        assert_eq!(fence.current_frame(), 0);
        assert_eq!(fence.begin_frame(), 1);
        assert_eq!(fence.begin_frame(), 2);
        fence.complete_frame(2);
        fence.complete_frame(1); // late completion never moves backwards
        assert_eq!(fence.completed_frame(), 2);
    }

    #[test]
    fn test_resource_waits_for_capturing_frames() {
        let fence = FrameFence::new();
        let queue = DeferredDisposal::new();

        fence.begin_frame(); // frame 1 in flight
        fence.begin_frame(); // frame 2 in flight
        queue.defer("old_view", &fence);

        assert!(queue.collect(fence.completed_frame()).is_empty());
        fence.complete_frame(1);
        assert!(queue.collect(fence.completed_frame()).is_empty());
        fence.complete_frame(2);
        assert_eq!(queue.collect(fence.completed_frame()), vec!["old_view"]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_nothing_in_flight_retires_immediately() {
        let fence = FrameFence::new();
        let queue = DeferredDisposal::new();
        queue.defer(7u32, &fence);
        assert_eq!(queue.collect(fence.completed_frame()), vec![7]);
    }

    #[test]
    fn test_collect_is_ordered_and_partial() {
        let fence = FrameFence::new();
        let queue = DeferredDisposal::new();

        fence.begin_frame();
        queue.defer(1u32, &fence);
        fence.begin_frame();
        queue.defer(2u32, &fence);

        fence.complete_frame(1);
        assert_eq!(queue.collect(fence.completed_frame()), vec![1]);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.drain_all(), vec![2]);
    }
}
