// SPDX-License-Identifier: GPL-3.0-only

//! Per-buffer reference tracking

use crate::constants::FENCE_MERGE_NAME;
use crate::transport::{SurfaceId, SyncFence};

/// Tracks which outputs still reference one input buffer
///
/// The list of requested surfaces is the source of truth; the reference count
/// is kept in lockstep with its length.
#[derive(Debug)]
pub struct BufferTracker<B, F> {
    buffer: B,
    merged_fence: F,
    requested_surfaces: Vec<SurfaceId>,
    reference_count: usize,
    /// Set once the buffer has been acquired from the input queue
    acquired: bool,
}

impl<B, F: SyncFence> BufferTracker<B, F> {
    /// Create a tracker holding one reference per distinct surface id
    pub fn new(buffer: B, requested_surfaces: &[SurfaceId]) -> Self {
        let mut surfaces = Vec::with_capacity(requested_surfaces.len());
        for &id in requested_surfaces {
            if !surfaces.contains(&id) {
                surfaces.push(id);
            }
        }

        Self {
            buffer,
            merged_fence: F::no_fence(),
            reference_count: surfaces.len(),
            requested_surfaces: surfaces,
            acquired: false,
        }
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn merged_fence(&self) -> &F {
        &self.merged_fence
    }

    pub fn into_merged_fence(self) -> F {
        self.merged_fence
    }

    /// Surfaces that have not yet released the buffer, in request order
    pub fn requested_surfaces(&self) -> &[SurfaceId] {
        &self.requested_surfaces
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count
    }

    /// True if `surface_id` still holds a reference
    pub fn is_requested_by(&self, surface_id: SurfaceId) -> bool {
        self.requested_surfaces.contains(&surface_id)
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn mark_acquired(&mut self) {
        self.acquired = true;
    }

    /// Fold an output's release fence into the fence returned to the input
    pub fn merge_fence(&mut self, with: &F) {
        self.merged_fence = F::merge(FENCE_MERGE_NAME, &self.merged_fence, with);
    }

    /// Drop the reference held by `surface_id` and return the remaining count.
    ///
    /// Unknown or already-released surface ids leave the count unchanged.
    pub fn decrement_reference_count(&mut self, surface_id: SurfaceId) -> usize {
        let Some(pos) = self.requested_surfaces.iter().position(|&id| id == surface_id) else {
            return self.reference_count;
        };
        self.requested_surfaces.remove(pos);
        self.reference_count = self.reference_count.saturating_sub(1);

        debug_assert_eq!(self.reference_count, self.requested_surfaces.len());
        self.reference_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryBuffer, SyncPointFence};
    use crate::transport::{PixelFormat, SyncFence};

    fn buffer() -> MemoryBuffer {
        MemoryBuffer::new(7, 640, 480, PixelFormat::YCBCR_420_888)
    }

    #[test]
    fn test_initial_count_matches_requests() {
        let tracker: BufferTracker<_, SyncPointFence> = BufferTracker::new(buffer(), &[1, 2, 3]);
        assert_eq!(tracker.reference_count(), 3);
        assert_eq!(tracker.requested_surfaces(), &[1, 2, 3]);
        assert!(!tracker.merged_fence().is_valid());
        assert!(!tracker.is_acquired());
    }

    #[test]
    fn test_duplicate_requests_collapse() {
        let tracker: BufferTracker<_, SyncPointFence> = BufferTracker::new(buffer(), &[2, 1, 2]);
        assert_eq!(tracker.reference_count(), 2);
        assert_eq!(tracker.requested_surfaces(), &[2, 1]);
    }

    #[test]
    fn test_decrement_is_idempotent_per_surface() {
        let mut tracker: BufferTracker<_, SyncPointFence> = BufferTracker::new(buffer(), &[1, 2]);
        assert_eq!(tracker.decrement_reference_count(1), 1);
        assert_eq!(tracker.decrement_reference_count(1), 1);
        assert_eq!(tracker.decrement_reference_count(9), 1);
        assert!(!tracker.is_requested_by(1));
        assert!(tracker.is_requested_by(2));
        assert_eq!(tracker.decrement_reference_count(2), 0);
        assert_eq!(tracker.decrement_reference_count(2), 0);
    }

    #[test]
    fn test_fence_merge_accumulates() {
        let mut tracker: BufferTracker<_, SyncPointFence> = BufferTracker::new(buffer(), &[1, 2]);
        tracker.merge_fence(&SyncPointFence::from_point(10));
        tracker.merge_fence(&SyncPointFence::from_point(11));

        let fence = tracker.into_merged_fence();
        assert!(fence.is_valid());
        assert_eq!(fence.points(), vec![10, 11]);
    }
}
