// SPDX-License-Identifier: GPL-3.0-only

//! Transport event handlers and the buffer return path

use super::{InputSlot, SplitterInner, SplitterState, StateGuard};
use crate::errors::{SplitterError, SplitterResult, TransportError};
use crate::transport::{
    BufferId, BufferItem, GraphicBuffer, InputConsumer, OutputSurface, QueueBufferInput, Slot,
    SurfaceId, SyncFence, Transform, Transport,
};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

impl<T: Transport> SplitterInner<T> {
    /// A buffer was queued into the input
    pub(crate) fn on_frame_available(&self) {
        let mut state = self.state.lock();
        let Some(consumer) = state.consumer.clone() else {
            debug!("Frame available on a disconnected splitter");
            return;
        };

        let mut item = match consumer.acquire_buffer() {
            Ok(item) => item,
            Err(e) => {
                error!(error = %e, "Acquiring buffer from input failed");
                self.store_frame_result(Err(SplitterError::transport("acquire_buffer")(e)));
                return;
            }
        };

        let buffer = match item.buffer.take() {
            Some(buffer) => {
                state.input_slots.insert(
                    item.slot,
                    InputSlot {
                        buffer: buffer.clone(),
                        frame_number: item.frame_number,
                    },
                );
                Some(buffer)
            }
            None if item.acquire_called => {
                state.input_slots.get_mut(&item.slot).map(|cached| {
                    cached.frame_number = item.frame_number;
                    cached.buffer.clone()
                })
            }
            None => None,
        };
        let Some(buffer) = buffer else {
            error!(slot = item.slot, "Acquired input item has no buffer");
            self.store_frame_result(Err(SplitterError::InvalidBuffer));
            self.release_untracked_locked(&mut state, &consumer, item.slot, item.frame_number);
            return;
        };

        let buffer_id = buffer.id();
        let Some(tracker) = state.buffers.get_mut(&buffer_id) else {
            error!(buffer_id, "Acquired buffer was never attached to outputs");
            self.store_frame_result(Err(SplitterError::BufferNotTracked(buffer_id)));
            self.release_untracked_locked(&mut state, &consumer, item.slot, item.frame_number);
            return;
        };
        tracker.mark_acquired();
        let requested = tracker.requested_surfaces().to_vec();
        state.acquired_input_buffers += 1;
        trace!(
            buffer_id,
            frame_number = item.frame_number,
            outputs = requested.len(),
            "Input buffer acquired"
        );

        if item.transform_to_display_inverse {
            item.transform |= Transform::INVERSE_DISPLAY;
        }

        let mut result = Ok(());
        for surface_id in requested {
            if !state.outputs.contains(surface_id) {
                debug!(surface_id, buffer_id, "Output went away before the frame arrived");
                self.decrement_ref_count_locked(&mut state, buffer_id, surface_id);
                continue;
            }
            if let Err(e) = self.output_buffer_locked(&mut state, &item, &buffer, surface_id) {
                debug!(surface_id, buffer_id, error = %e, "Output did not take the frame");
                result = Err(e);
            }
        }

        // Every output released its reference before the frame arrived
        if state
            .buffers
            .get(&buffer_id)
            .is_some_and(|t| t.reference_count() == 0)
        {
            self.return_buffer_to_input_locked(&mut state, buffer_id);
        }

        self.store_frame_result(result);
    }

    /// Queue an acquired buffer into one output
    fn output_buffer_locked(
        &self,
        state: &mut StateGuard<'_, T>,
        item: &BufferItem<T::Buffer, T::Fence>,
        buffer: &T::Buffer,
        surface_id: SurfaceId,
    ) -> SplitterResult<()> {
        let buffer_id = buffer.id();
        let Some(entry) = state.outputs.get(surface_id) else {
            return Err(SplitterError::UnknownSurface(surface_id));
        };
        let surface = Arc::clone(&entry.surface);
        let transform = entry.transform.unwrap_or(item.transform);

        let Some(slot) = entry.slot_of(buffer_id) else {
            error!(surface_id, buffer_id, "Buffer has no slot on output");
            self.decrement_ref_count_locked(state, buffer_id, surface_id);
            return Err(SplitterError::BufferNotAttached {
                buffer_id,
                surface_id,
            });
        };

        if let Err(e) = surface.set_hdr_metadata(buffer, state.stream.dynamic_range_profile) {
            warn!(surface_id, error = %e, "Failed to forward HDR metadata");
        }

        let input = QueueBufferInput {
            timestamp: item.timestamp,
            is_auto_timestamp: item.is_auto_timestamp,
            dataspace: item.dataspace,
            crop: item.crop,
            scaling_mode: item.scaling_mode,
            transform,
            fence: item.fence.clone(),
        };

        let result = MutexGuard::unlocked(state, || surface.queue_buffer(slot, input));

        if !state.outputs.is_same(surface_id, &surface) {
            // Removal already dropped this output's reference
            debug!(surface_id, buffer_id, "Output removed while queueing");
            return result
                .map(|_| ())
                .map_err(SplitterError::transport("queue_buffer"));
        }

        match result {
            Ok(output) => {
                trace!(surface_id, buffer_id, slot, "Buffer queued to output");
                if output.buffer_replaced {
                    self.on_buffer_replaced_locked(state, &surface, surface_id);
                }
                Ok(())
            }
            Err(e) => {
                if e.is_abandoned() {
                    debug!(surface_id, "Output abandoned while queueing");
                    mark_abandoned(state, surface_id);
                } else {
                    error!(surface_id, buffer_id, error = %e, "Queueing buffer to output failed");
                }
                self.decrement_ref_count_locked(state, buffer_id, surface_id);
                Err(SplitterError::transport("queue_buffer")(e))
            }
        }
    }

    /// The output dropped a pending buffer in favor of the one just queued.
    /// No release callback follows for it, so reclaim it here.
    fn on_buffer_replaced_locked(
        &self,
        state: &mut StateGuard<'_, T>,
        surface: &Arc<T::Output>,
        surface_id: SurfaceId,
    ) {
        let request = state.stream.dequeue_request();
        match surface.dequeue_buffer(&request) {
            Ok((slot, fence)) => self.return_output_buffer_locked(state, fence, surface_id, slot),
            Err(e) => handle_dequeue_error(state, surface_id, e),
        }
    }

    /// An output's consumer released a slot
    pub(crate) fn on_buffer_released_by_output(&self, surface: &Arc<T::Output>) {
        let request = self.state.lock().stream.dequeue_request();
        let result = surface.dequeue_buffer(&request);

        let mut state = self.state.lock();
        let Some(surface_id) = state.outputs.find(surface) else {
            trace!("Release from an output that is no longer registered");
            return;
        };
        match result {
            Ok((slot, fence)) => {
                self.return_output_buffer_locked(&mut state, fence, surface_id, slot)
            }
            Err(e) => handle_dequeue_error(&mut state, surface_id, e),
        }
    }

    /// An output's consumer died
    pub(crate) fn on_output_died(&self, surface: &Arc<T::Output>) {
        let mut state = self.state.lock();
        if let Some(surface_id) = state.outputs.find(surface) {
            mark_abandoned(&mut state, surface_id);
        }
    }

    /// Account for a slot dequeued back from an output
    fn return_output_buffer_locked(
        &self,
        state: &mut StateGuard<'_, T>,
        fence: T::Fence,
        surface_id: SurfaceId,
        slot: Slot,
    ) {
        let Some(entry) = state.outputs.get(surface_id) else {
            return;
        };
        let Some(buffer_id) = entry.buffer_at(slot).map(GraphicBuffer::id) else {
            warn!(surface_id, slot, "No buffer held at dequeued slot");
            return;
        };
        let surface = Arc::clone(&entry.surface);

        let Some(tracker) = state.buffers.get_mut(&buffer_id) else {
            debug!(buffer_id, surface_id, "Dequeued buffer is no longer tracked");
            return;
        };
        if !tracker.is_requested_by(surface_id) {
            debug!(buffer_id, surface_id, "Output already released this buffer");
            return;
        }
        if fence.is_valid() {
            tracker.merge_fence(&fence);
        }

        if state.detached_buffers.contains(&buffer_id) {
            match surface.detach_buffer(slot) {
                Ok(()) => {
                    if let Some(entry) = state.outputs.get_mut(surface_id) {
                        entry.clear_slot(slot);
                    }
                }
                Err(e) => error!(buffer_id, surface_id, slot, error = %e, "Detaching buffer from output failed"),
            }
        }

        self.decrement_ref_count_locked(state, buffer_id, surface_id);
    }

    /// Drop `surface_id`'s reference to a buffer and hand the buffer back to
    /// the input once nothing references it
    pub(crate) fn decrement_ref_count_locked(
        &self,
        state: &mut StateGuard<'_, T>,
        buffer_id: BufferId,
        surface_id: SurfaceId,
    ) {
        let Some(tracker) = state.buffers.get_mut(&buffer_id) else {
            return;
        };
        if tracker.decrement_reference_count(surface_id) > 0 {
            return;
        }
        if !tracker.is_acquired() {
            // Returned as soon as the frame arrives
            trace!(buffer_id, "Buffer released before it was acquired");
            return;
        }
        self.return_buffer_to_input_locked(state, buffer_id);
    }

    fn return_buffer_to_input_locked(&self, state: &mut StateGuard<'_, T>, buffer_id: BufferId) {
        // Untracked before unlocking so a concurrent re-attach starts clean
        let Some(tracker) = state.buffers.remove(&buffer_id) else {
            return;
        };
        let detach = state.detached_buffers.remove(&buffer_id);

        let slot = state
            .input_slots
            .iter()
            .find(|(_, s)| s.buffer.id() == tracker.buffer().id())
            .map(|(&slot, s)| (slot, s.frame_number));
        let Some((slot, frame_number)) = slot else {
            error!(buffer_id, "Buffer missing from input slots");
            release_acquired_count(state);
            return;
        };
        if detach {
            state.input_slots.remove(&slot);
        }

        let Some(consumer) = state.consumer.clone() else {
            debug!(buffer_id, "Input gone before buffer could be returned");
            return;
        };

        let fence = tracker.into_merged_fence();
        let result = MutexGuard::unlocked(state, || {
            if detach {
                consumer.detach_buffer(slot)
            } else {
                consumer.release_buffer(slot, frame_number, fence)
            }
        });

        match result {
            Ok(()) => trace!(buffer_id, slot, detach, "Buffer returned to input"),
            Err(e) => {
                error!(buffer_id, slot, detach, error = %e, "Returning buffer to input failed");
            }
        }
        release_acquired_count(state);
    }

    /// Give an acquired item that cannot be routed straight back to the input
    fn release_untracked_locked(
        &self,
        state: &mut StateGuard<'_, T>,
        consumer: &Arc<T::Consumer>,
        slot: Slot,
        frame_number: u64,
    ) {
        let result = MutexGuard::unlocked(state, || {
            consumer.release_buffer(slot, frame_number, T::Fence::no_fence())
        });
        if let Err(e) = result {
            error!(slot, error = %e, "Releasing untracked input buffer failed");
        }
    }
}

/// The splitter no longer holds one of its acquired input buffers
fn release_acquired_count<T: Transport>(state: &mut SplitterState<T>) {
    if state.acquired_input_buffers == 0 {
        warn!("Acquired input buffer count already zero");
    } else {
        state.acquired_input_buffers -= 1;
    }
}

fn mark_abandoned<T: Transport>(state: &mut SplitterState<T>, surface_id: SurfaceId) {
    if let Some(entry) = state.outputs.get_mut(surface_id)
        && !entry.abandoned
    {
        entry.abandoned = true;
        info!(surface_id, "Output consumer abandoned");
    }
}

fn handle_dequeue_error<T: Transport>(
    state: &mut SplitterState<T>,
    surface_id: SurfaceId,
    e: TransportError,
) {
    match e {
        TransportError::Abandoned => {
            debug!(surface_id, "Output abandoned while dequeueing");
            mark_abandoned(state, surface_id);
        }
        e if e.is_exhausted() => {
            warn!(surface_id, error = %e, "Output has no buffer to dequeue");
        }
        other => {
            error!(surface_id, error = %other, "Dequeue from output failed");
        }
    }
}
