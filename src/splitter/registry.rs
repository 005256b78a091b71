// SPDX-License-Identifier: GPL-3.0-only

//! Output surface registry

use crate::errors::{SplitterError, SplitterResult};
use crate::transport::{
    BufferId, GraphicBuffer, ProducerListener, Slot, SurfaceId, Transform, Transport,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One registered output surface
pub(crate) struct OutputEntry<T: Transport> {
    pub(crate) surface: Arc<T::Output>,
    /// Kept alive for as long as the output is registered
    _listener: Arc<dyn ProducerListener>,
    /// Min undequeued buffers reported by the consumer
    pub(crate) consumer_buffer_count: usize,
    pub(crate) transform: Option<Transform>,
    pub(crate) abandoned: bool,
    max_slots: usize,
    /// Buffers currently attached to the output, indexed by output slot
    slots: Vec<Option<T::Buffer>>,
}

impl<T: Transport> OutputEntry<T> {
    pub(crate) fn new(
        surface: Arc<T::Output>,
        listener: Arc<dyn ProducerListener>,
        consumer_buffer_count: usize,
        max_slots: usize,
    ) -> Self {
        Self {
            surface,
            _listener: listener,
            consumer_buffer_count,
            transform: None,
            abandoned: false,
            max_slots,
            slots: Vec::new(),
        }
    }

    /// Slot currently holding `buffer_id` on this output
    pub(crate) fn slot_of(&self, buffer_id: BufferId) -> Option<Slot> {
        self.slots
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| b.id() == buffer_id))
    }

    pub(crate) fn buffer_at(&self, slot: Slot) -> Option<&T::Buffer> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Record `buffer` as attached at `slot`.
    ///
    /// Returns the different buffer that previously occupied the slot, if any.
    /// Stale mappings of the same buffer in other slots are cleared.
    pub(crate) fn hold(
        &mut self,
        slot: Slot,
        buffer: T::Buffer,
    ) -> SplitterResult<Option<T::Buffer>> {
        if slot >= self.max_slots {
            return Err(SplitterError::InvalidSlot(slot));
        }

        let id = buffer.id();
        for (index, held) in self.slots.iter_mut().enumerate() {
            if index != slot && held.as_ref().is_some_and(|b| b.id() == id) {
                *held = None;
            }
        }

        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, None);
        }
        let previous = self.slots[slot].replace(buffer);
        Ok(previous.filter(|prev| prev.id() != id))
    }

    pub(crate) fn clear_slot(&mut self, slot: Slot) -> Option<T::Buffer> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// All attached buffers with their slots
    pub(crate) fn held(&self) -> impl Iterator<Item = (Slot, &T::Buffer)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, b)| b.as_ref().map(|b| (slot, b)))
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.slots.iter().filter(|b| b.is_some()).count()
    }
}

/// Live outputs keyed by surface id
pub(crate) struct OutputRegistry<T: Transport> {
    entries: BTreeMap<SurfaceId, OutputEntry<T>>,
}

impl<T: Transport> OutputRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn contains(&self, surface_id: SurfaceId) -> bool {
        self.entries.contains_key(&surface_id)
    }

    pub(crate) fn ids(&self) -> Vec<SurfaceId> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn get(&self, surface_id: SurfaceId) -> Option<&OutputEntry<T>> {
        self.entries.get(&surface_id)
    }

    pub(crate) fn get_mut(&mut self, surface_id: SurfaceId) -> Option<&mut OutputEntry<T>> {
        self.entries.get_mut(&surface_id)
    }

    pub(crate) fn surface(&self, surface_id: SurfaceId) -> Option<Arc<T::Output>> {
        self.entries.get(&surface_id).map(|e| Arc::clone(&e.surface))
    }

    /// Register an output; an id that is already live is rejected untouched
    pub(crate) fn insert(
        &mut self,
        surface_id: SurfaceId,
        entry: OutputEntry<T>,
    ) -> SplitterResult<()> {
        if self.entries.contains_key(&surface_id) {
            return Err(SplitterError::SurfaceTaken(surface_id));
        }
        self.entries.insert(surface_id, entry);
        Ok(())
    }

    pub(crate) fn remove(&mut self, surface_id: SurfaceId) -> Option<OutputEntry<T>> {
        self.entries.remove(&surface_id)
    }

    /// Surface id currently registered for `surface`, compared by identity
    pub(crate) fn find(&self, surface: &Arc<T::Output>) -> Option<SurfaceId> {
        self.entries
            .iter()
            .find(|(_, e)| Arc::ptr_eq(&e.surface, surface))
            .map(|(&id, _)| id)
    }

    /// True if `surface_id` is still registered to this exact `surface`
    pub(crate) fn is_same(&self, surface_id: SurfaceId, surface: &Arc<T::Output>) -> bool {
        self.entries
            .get(&surface_id)
            .is_some_and(|e| Arc::ptr_eq(&e.surface, surface))
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (SurfaceId, OutputEntry<T>)> {
        std::mem::take(&mut self.entries).into_iter()
    }

    #[cfg(test)]
    pub(crate) fn total_consumer_buffers(&self) -> usize {
        self.entries.values().map(|e| e.consumer_buffer_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PixelFormat;
    use crate::transport::memory::{MemoryBuffer, MemoryOutput, MemoryTransport, OutputOptions};

    struct NoopListener;

    impl ProducerListener for NoopListener {
        fn on_buffer_released(&self) {}
        fn on_remote_died(&self) {}
    }

    fn entry(surface: &Arc<MemoryOutput>) -> OutputEntry<MemoryTransport> {
        OutputEntry::new(Arc::clone(surface), Arc::new(NoopListener), 2, 4)
    }

    fn buffer(id: BufferId) -> MemoryBuffer {
        MemoryBuffer::new(id, 64, 64, PixelFormat::RGBA_8888)
    }

    #[test]
    fn test_duplicate_insert_keeps_existing() {
        let first = Arc::new(MemoryOutput::new("first", OutputOptions::default()));
        let second = Arc::new(MemoryOutput::new("second", OutputOptions::default()));
        let mut registry = OutputRegistry::<MemoryTransport>::new();

        registry.insert(1, entry(&first)).unwrap();
        let err = registry.insert(1, entry(&second)).unwrap_err();

        assert_eq!(err, SplitterError::SurfaceTaken(1));
        assert!(registry.is_same(1, &first));
        assert!(!registry.is_same(1, &second));
        assert_eq!(registry.find(&second), None);
    }

    #[test]
    fn test_find_by_identity() {
        let a = Arc::new(MemoryOutput::new("a", OutputOptions::default()));
        let b = Arc::new(MemoryOutput::new("b", OutputOptions::default()));
        let mut registry = OutputRegistry::<MemoryTransport>::new();
        registry.insert(3, entry(&a)).unwrap();
        registry.insert(5, entry(&b)).unwrap();

        assert_eq!(registry.find(&b), Some(5));
        assert_eq!(registry.ids(), vec![3, 5]);
        assert_eq!(registry.total_consumer_buffers(), 4);

        registry.remove(5);
        assert_eq!(registry.find(&b), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_hold_reports_replaced_buffer() {
        let surface = Arc::new(MemoryOutput::new("out", OutputOptions::default()));
        let mut e = entry(&surface);

        assert!(e.hold(0, buffer(10)).unwrap().is_none());
        let previous = e.hold(0, buffer(11)).unwrap();
        assert_eq!(previous.map(|b| b.id()), Some(10));
        assert_eq!(e.slot_of(11), Some(0));
        assert_eq!(e.slot_of(10), None);
    }

    #[test]
    fn test_hold_clears_stale_slot_of_same_buffer() {
        let surface = Arc::new(MemoryOutput::new("out", OutputOptions::default()));
        let mut e = entry(&surface);

        e.hold(0, buffer(10)).unwrap();
        assert!(e.hold(2, buffer(10)).unwrap().is_none());
        assert_eq!(e.slot_of(10), Some(2));
        assert_eq!(e.held_count(), 1);
    }

    #[test]
    fn test_hold_rejects_out_of_range_slot() {
        let surface = Arc::new(MemoryOutput::new("out", OutputOptions::default()));
        let mut e = entry(&surface);
        assert_eq!(
            e.hold(4, buffer(1)).unwrap_err(),
            SplitterError::InvalidSlot(4)
        );
        assert_eq!(e.held_count(), 0);
    }
}
