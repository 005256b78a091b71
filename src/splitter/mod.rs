// SPDX-License-Identifier: GPL-3.0-only

//! Camera stream splitter
//!
//! Fans every buffer produced into a single input queue out to several output
//! surfaces without copying. Before the camera fills a buffer the caller
//! attaches it to the outputs that want the frame; once the frame is queued
//! into the input, the splitter queues the same buffer into each of those
//! outputs and returns it to the input only after every one of them has
//! released it.
//!
//! # Locking
//!
//! All splitter state sits behind one mutex. Output attach, queue and dequeue,
//! and input release/detach may block or call back into the splitter, so they
//! run with the mutex released. Anything read before such a call is
//! re-validated afterwards: the output must still be registered under the same
//! surface id with the same identity.

mod handlers;
mod listeners;
mod registry;
mod tracker;

pub use tracker::BufferTracker;

use crate::config::{SplitterConfig, StreamConfig};
use crate::constants::{CONSUMER_NAME_PREFIX, INPUT_HEADROOM_BUFFERS};
use crate::errors::{SplitterError, SplitterResult};
use crate::transport::{
    BufferId, GraphicBuffer, InputConsumer, InputProducer, InputQueueParams, OutputSurface,
    ProducerApi, ProducerListener, Slot, SurfaceId, Transform, Transport,
};
use listeners::{InputListener, OutputListener};
use parking_lot::{Mutex, MutexGuard};
use registry::{OutputEntry, OutputRegistry};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Decides from an output's consumer usage bits whether it must stay
/// non-blocking (no dequeue timeout)
pub type AsyncConsumerPredicate = Arc<dyn Fn(u64) -> bool + Send + Sync>;

type StateGuard<'a, T> = MutexGuard<'a, SplitterState<T>>;

static CONSUMER_COUNTER: AtomicU32 = AtomicU32::new(0);

fn unique_consumer_name() -> String {
    let n = CONSUMER_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{CONSUMER_NAME_PREFIX}-{n}")
}

/// Buffer last seen in an input queue slot
struct InputSlot<B> {
    buffer: B,
    frame_number: u64,
}

pub(crate) struct SplitterState<T: Transport> {
    consumer: Option<Arc<T::Consumer>>,
    /// Kept alive for as long as the input is connected
    _input_listener: Option<Arc<InputListener<T>>>,
    consumer_name: String,
    stream: StreamConfig,
    outputs: OutputRegistry<T>,
    buffers: HashMap<BufferId, BufferTracker<T::Buffer, T::Fence>>,
    input_slots: HashMap<Slot, InputSlot<T::Buffer>>,
    /// Buffers to detach instead of release on their way back
    detached_buffers: HashSet<BufferId>,
    max_consumer_buffers: usize,
    acquired_input_buffers: usize,
    use_hal_buf_manager: bool,
    async_consumer: AsyncConsumerPredicate,
}

impl<T: Transport> SplitterState<T> {
    fn new(config: &SplitterConfig) -> Self {
        let mask_config = config.clone();
        Self {
            consumer: None,
            _input_listener: None,
            consumer_name: String::new(),
            stream: StreamConfig::default(),
            outputs: OutputRegistry::new(),
            buffers: HashMap::new(),
            input_slots: HashMap::new(),
            detached_buffers: HashSet::new(),
            max_consumer_buffers: 0,
            acquired_input_buffers: 0,
            use_hal_buf_manager: config.use_hal_buffer_manager,
            async_consumer: Arc::new(move |usage| mask_config.is_async_consumer(usage)),
        }
    }
}

pub(crate) struct SplitterInner<T: Transport> {
    self_ref: Weak<Self>,
    transport: Arc<T>,
    config: SplitterConfig,
    state: Mutex<SplitterState<T>>,
    frame_result: Mutex<SplitterResult<()>>,
}

/// Snapshot of the splitter's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitterStats {
    pub connected: bool,
    pub consumer_name: String,
    pub output_ids: Vec<SurfaceId>,
    pub tracked_buffers: usize,
    pub acquired_input_buffers: usize,
    pub max_consumer_buffers: usize,
    pub pending_forced_detaches: usize,
}

/// Splits one camera stream into several output surfaces
///
/// Dropping the splitter disconnects it.
pub struct StreamSplitter<T: Transport> {
    inner: Arc<SplitterInner<T>>,
}

impl<T: Transport> StreamSplitter<T> {
    pub fn new(transport: Arc<T>, config: SplitterConfig) -> Self {
        let inner = Arc::new_cyclic(|self_ref| SplitterInner {
            self_ref: self_ref.clone(),
            transport,
            state: Mutex::new(SplitterState::new(&config)),
            config,
            frame_result: Mutex::new(Ok(())),
        });
        Self { inner }
    }

    /// Register the initial outputs and create the input queue.
    ///
    /// Returns the producer end the camera queues buffers into. On failure
    /// the splitter is left disconnected.
    pub fn connect(
        &self,
        outputs: impl IntoIterator<Item = (SurfaceId, Arc<T::Output>)>,
        stream: StreamConfig,
    ) -> SplitterResult<T::Producer> {
        self.inner.connect(outputs.into_iter().collect(), stream)
    }

    /// Tear down every output and the input. Safe to call repeatedly.
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        self.inner.disconnect_locked(&mut state);
    }

    pub fn add_output(&self, surface_id: SurfaceId, surface: Arc<T::Output>) -> SplitterResult<()> {
        self.inner.add_output(surface_id, surface)
    }

    pub fn remove_output(&self, surface_id: SurfaceId) -> SplitterResult<()> {
        self.inner.remove_output(surface_id)
    }

    /// Override the transform applied to every buffer queued to `surface_id`
    pub fn set_transform(&self, surface_id: SurfaceId, transform: Transform) -> SplitterResult<()> {
        let mut state = self.inner.state.lock();
        let entry = state
            .outputs
            .get_mut(surface_id)
            .ok_or(SplitterError::UnknownSurface(surface_id))?;
        entry.transform = Some(transform);
        debug!(surface_id, transform = transform.0, "Output transform set");
        Ok(())
    }

    /// Select the dequeue timeout for outputs added from now on
    pub fn set_hal_buffer_manager(&self, enabled: bool) {
        self.inner.state.lock().use_hal_buf_manager = enabled;
    }

    /// Replace the usage-bit test that exempts outputs from dequeue timeouts
    pub fn set_async_consumer_predicate(&self, predicate: AsyncConsumerPredicate) {
        self.inner.state.lock().async_consumer = predicate;
    }

    /// Attach `buffer` to every live output in `surface_ids` ahead of the
    /// camera filling it
    pub fn attach_buffer_to_outputs(
        &self,
        buffer: &T::Buffer,
        surface_ids: &[SurfaceId],
    ) -> SplitterResult<()> {
        self.inner.attach_buffer_to_outputs(buffer, surface_ids)
    }

    /// The buffer's owner gave it up; stop tracking it
    pub fn notify_buffer_released(&self, buffer: &T::Buffer) {
        let buffer_id = buffer.id();
        let mut state = self.inner.state.lock();
        if state.buffers.remove(&buffer_id).is_some() {
            debug!(buffer_id, "Buffer released by its owner");
        }
    }

    /// Outcome of the most recent frame-available handling
    pub fn on_frame_available_result(&self) -> SplitterResult<()> {
        self.inner.frame_result.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().consumer.is_some()
    }

    pub fn stats(&self) -> SplitterStats {
        let state = self.inner.state.lock();
        SplitterStats {
            connected: state.consumer.is_some(),
            consumer_name: state.consumer_name.clone(),
            output_ids: state.outputs.ids(),
            tracked_buffers: state.buffers.len(),
            acquired_input_buffers: state.acquired_input_buffers,
            max_consumer_buffers: state.max_consumer_buffers,
            pending_forced_detaches: state.detached_buffers.len(),
        }
    }

    /// Outputs still holding a reference to the buffer, if it is tracked
    pub fn reference_count(&self, buffer_id: BufferId) -> Option<usize> {
        let state = self.inner.state.lock();
        state.buffers.get(&buffer_id).map(BufferTracker::reference_count)
    }

    /// Whether the consumer of a live output has gone away
    pub fn is_output_abandoned(&self, surface_id: SurfaceId) -> Option<bool> {
        let state = self.inner.state.lock();
        state.outputs.get(surface_id).map(|e| e.abandoned)
    }

    /// Slot `buffer_id` occupies on a live output
    pub fn output_slot(&self, surface_id: SurfaceId, buffer_id: BufferId) -> Option<Slot> {
        let state = self.inner.state.lock();
        state.outputs.get(surface_id).and_then(|e| e.slot_of(buffer_id))
    }
}

impl<T: Transport> Drop for StreamSplitter<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<T: Transport> SplitterInner<T> {
    fn connect(
        &self,
        outputs: Vec<(SurfaceId, Arc<T::Output>)>,
        stream: StreamConfig,
    ) -> SplitterResult<T::Producer> {
        let mut state = self.state.lock();
        if !state.outputs.is_empty() || state.consumer.is_some() {
            error!("Stream splitter already connected");
            return Err(SplitterError::AlreadyConnected);
        }
        if !state.buffers.is_empty() {
            let pending = state.buffers.len();
            error!(pending, "Stream splitter still has pending buffers");
            return Err(SplitterError::PendingBuffers(pending));
        }

        state.stream = stream;
        state.consumer_name = unique_consumer_name();

        for (surface_id, surface) in outputs {
            if let Err(e) = self.add_output_locked(&mut state, surface_id, surface) {
                error!(surface_id, error = %e, "Failed to add output");
                self.disconnect_locked(&mut state);
                return Err(e);
            }
        }

        state.max_consumer_buffers += INPUT_HEADROOM_BUFFERS;

        match self.create_input_locked(&mut state) {
            Ok(producer) => {
                info!(
                    consumer = %state.consumer_name,
                    stream = %state.stream,
                    outputs = state.outputs.len(),
                    max_acquired = state.max_consumer_buffers,
                    "Stream splitter connected"
                );
                Ok(producer)
            }
            Err(e) => {
                error!(error = %e, "Failed to create splitter input");
                self.disconnect_locked(&mut state);
                Err(e)
            }
        }
    }

    fn create_input_locked(&self, state: &mut SplitterState<T>) -> SplitterResult<T::Producer> {
        let params = InputQueueParams {
            consumer_name: state.consumer_name.clone(),
            consumer_usage: state.stream.consumer_usage,
            max_acquired_buffers: state.max_consumer_buffers,
        };
        let (consumer, producer) = self
            .transport
            .create_input_queue(&params)
            .map_err(SplitterError::transport("create_input_queue"))?;

        producer
            .set_async_mode(true)
            .map_err(SplitterError::transport("set_async_mode"))?;

        let listener = Arc::new(InputListener::new(self.self_ref.clone()));
        consumer
            .connect(listener.clone())
            .map_err(SplitterError::transport("consumer_connect"))?;

        state.consumer = Some(Arc::new(consumer));
        state._input_listener = Some(listener);
        state.acquired_input_buffers = 0;
        Ok(producer)
    }

    pub(crate) fn disconnect_locked(&self, state: &mut SplitterState<T>) {
        let was_connected = state.consumer.is_some() || !state.outputs.is_empty();

        for (surface_id, entry) in state.outputs.drain() {
            if let Err(e) = entry.surface.disconnect(ProducerApi::Camera) {
                warn!(surface_id, error = %e, "Failed to disconnect output");
            }
        }

        state.input_slots.clear();
        state.detached_buffers.clear();

        if let Some(consumer) = state.consumer.take() {
            consumer.disconnect();
        }
        state._input_listener = None;

        if !state.buffers.is_empty() {
            warn!(
                tracked = state.buffers.len(),
                "Buffers still tracked at disconnect"
            );
            state.buffers.clear();
        }

        state.stream.max_hal_buffers = 0;
        state.max_consumer_buffers = 0;
        state.acquired_input_buffers = 0;

        if was_connected {
            info!(consumer = %state.consumer_name, "Stream splitter disconnected");
        }
    }

    fn add_output(&self, surface_id: SurfaceId, surface: Arc<T::Output>) -> SplitterResult<()> {
        let mut state = self.state.lock();
        if state.consumer.is_none() {
            return Err(SplitterError::NotConnected);
        }
        self.add_output_locked(&mut state, surface_id, surface)?;
        self.apply_input_budget_locked(&state)
    }

    fn add_output_locked(
        &self,
        state: &mut SplitterState<T>,
        surface_id: SurfaceId,
        surface: Arc<T::Output>,
    ) -> SplitterResult<()> {
        if state.outputs.contains(surface_id) {
            error!(surface_id, "Surface id already taken");
            return Err(SplitterError::SurfaceTaken(surface_id));
        }

        let stream = state.stream;
        surface
            .set_buffers_dimensions(stream.width, stream.height)
            .map_err(SplitterError::transport("set_buffers_dimensions"))?;
        surface
            .set_buffers_format(stream.format)
            .map_err(SplitterError::transport("set_buffers_format"))?;

        let listener: Arc<dyn ProducerListener> = Arc::new(OutputListener::<T>::new(
            self.self_ref.clone(),
            Arc::downgrade(&surface),
        ));
        surface
            .connect(ProducerApi::Camera, Arc::clone(&listener))
            .map_err(SplitterError::transport("connect"))?;

        let (consumer_buffers, max_slots) = match self.configure_output(state, &surface) {
            Ok(counts) => counts,
            Err(e) => {
                if let Err(de) = surface.disconnect(ProducerApi::Camera) {
                    warn!(surface_id, error = %de, "Failed to disconnect rejected output");
                }
                return Err(e);
            }
        };

        state.outputs.insert(
            surface_id,
            OutputEntry::new(surface, listener, consumer_buffers, max_slots),
        )?;

        if consumer_buffers > stream.max_hal_buffers {
            warn!(
                surface_id,
                consumer_buffers,
                max_hal_buffers = stream.max_hal_buffers,
                "Output consumer needs more buffers than the HAL provides"
            );
        }
        state.max_consumer_buffers += consumer_buffers;

        debug!(surface_id, consumer_buffers, "Output added");
        Ok(())
    }

    /// Size the output's queue and set its blocking behavior.
    ///
    /// Returns the consumer's buffer requirement and the slot count.
    fn configure_output(
        &self,
        state: &SplitterState<T>,
        surface: &T::Output,
    ) -> SplitterResult<(usize, usize)> {
        let consumer_buffers = surface
            .min_undequeued_buffers()
            .map_err(SplitterError::transport("min_undequeued_buffers"))?;

        let max_slots = surface.max_buffer_slots();
        surface
            .set_buffer_count(max_slots)
            .map_err(SplitterError::transport("set_buffer_count"))?;

        let usage = surface.consumer_usage().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to query output consumer usage");
            0
        });
        if !(state.async_consumer)(usage) {
            let timeout = self.config.dequeue_timeout(state.use_hal_buf_manager);
            surface
                .set_dequeue_timeout(timeout)
                .map_err(SplitterError::transport("set_dequeue_timeout"))?;
        }

        surface
            .allow_allocation(false)
            .map_err(SplitterError::transport("allow_allocation"))?;

        Ok((consumer_buffers, max_slots))
    }

    /// Push the acquired-buffer limit to the input unless it is already over it
    fn apply_input_budget_locked(&self, state: &SplitterState<T>) -> SplitterResult<()> {
        let Some(consumer) = state.consumer.as_ref() else {
            return Ok(());
        };
        if state.max_consumer_buffers <= state.acquired_input_buffers {
            debug!(
                max = state.max_consumer_buffers,
                acquired = state.acquired_input_buffers,
                "Input over budget, keeping acquired limit"
            );
            return Ok(());
        }
        consumer
            .set_max_acquired_buffer_count(state.max_consumer_buffers)
            .map_err(SplitterError::transport("set_max_acquired_buffer_count"))
    }

    fn remove_output(&self, surface_id: SurfaceId) -> SplitterResult<()> {
        let mut state = self.state.lock();
        if state.consumer.is_none() {
            return Err(SplitterError::NotConnected);
        }
        self.remove_output_locked(&mut state, surface_id)?;
        self.apply_input_budget_locked(&state)
    }

    fn remove_output_locked(
        &self,
        state: &mut StateGuard<'_, T>,
        surface_id: SurfaceId,
    ) -> SplitterResult<()> {
        let Some(mut entry) = state.outputs.remove(surface_id) else {
            error!(surface_id, "No output with this surface id");
            return Err(SplitterError::UnknownSurface(surface_id));
        };

        let held: Vec<(Slot, BufferId)> = entry.held().map(|(slot, b)| (slot, b.id())).collect();
        let mut pending = Vec::with_capacity(held.len());
        for (slot, buffer_id) in held {
            pending.push(buffer_id);
            match entry.surface.detach_buffer(slot) {
                Ok(()) => {
                    entry.clear_slot(slot);
                }
                Err(e) => {
                    // A buffer this output already released returns through the
                    // normal release path and stays attachable to the input
                    let outstanding = state
                        .buffers
                        .get(&buffer_id)
                        .is_some_and(|t| t.is_requested_by(surface_id));
                    if outstanding {
                        debug!(
                            surface_id,
                            buffer_id,
                            error = %e,
                            "Buffer still in use by removed output, detaching from input later"
                        );
                        state.detached_buffers.insert(buffer_id);
                    }
                }
            }
        }

        state.max_consumer_buffers = state
            .max_consumer_buffers
            .saturating_sub(entry.consumer_buffer_count);

        for buffer_id in pending {
            self.decrement_ref_count_locked(state, buffer_id, surface_id);
        }

        if let Err(e) = entry.surface.disconnect(ProducerApi::Camera) {
            error!(surface_id, error = %e, "Failed to disconnect removed output");
        }
        debug!(surface_id, "Output removed");
        Ok(())
    }

    fn attach_buffer_to_outputs(
        &self,
        buffer: &T::Buffer,
        surface_ids: &[SurfaceId],
    ) -> SplitterResult<()> {
        let mut state = self.state.lock();
        if state.consumer.is_none() {
            return Err(SplitterError::NotConnected);
        }

        let buffer_id = buffer.id();
        if state.buffers.contains_key(&buffer_id) {
            warn!(buffer_id, "Buffer attached again while still tracked");
        }

        let tracker = BufferTracker::new(buffer.clone(), surface_ids);
        let targets = tracker.requested_surfaces().to_vec();
        let mut attached: Vec<(SurfaceId, Arc<T::Output>, Slot)> = Vec::new();
        let mut replaced: Vec<(SurfaceId, BufferId)> = Vec::new();

        for surface_id in targets {
            let Some(surface) = state.outputs.surface(surface_id) else {
                // The reference is dropped once the frame is acquired
                debug!(surface_id, buffer_id, "Output not live, skipping attach");
                continue;
            };

            let result = MutexGuard::unlocked(&mut state, || surface.attach_buffer(buffer));
            let slot = match result {
                Ok(slot) => slot,
                Err(e) => {
                    error!(surface_id, buffer_id, error = %e, "Attaching buffer to output failed");
                    self.rollback_attach_locked(&mut state, &attached);
                    return Err(SplitterError::transport("attach_buffer")(e));
                }
            };

            let Some(entry) = state
                .outputs
                .get_mut(surface_id)
                .filter(|e| Arc::ptr_eq(&e.surface, &surface))
            else {
                debug!(surface_id, buffer_id, "Output removed during attach");
                state.detached_buffers.insert(buffer_id);
                continue;
            };

            match entry.hold(slot, buffer.clone()) {
                Ok(Some(previous)) => replaced.push((surface_id, previous.id())),
                Ok(None) => {}
                Err(e) => {
                    error!(surface_id, buffer_id, slot, "Output returned an invalid slot");
                    attached.push((surface_id, surface, slot));
                    self.rollback_attach_locked(&mut state, &attached);
                    return Err(e);
                }
            }
            attached.push((surface_id, surface, slot));
        }

        state.buffers.insert(buffer_id, tracker);

        for (surface_id, previous_id) in replaced {
            debug!(surface_id, previous_id, buffer_id, "Attach replaced a held buffer");
            self.decrement_ref_count_locked(&mut state, previous_id, surface_id);
        }
        Ok(())
    }

    /// Undo the attaches made by a failed `attach_buffer_to_outputs`
    fn rollback_attach_locked(
        &self,
        state: &mut SplitterState<T>,
        attached: &[(SurfaceId, Arc<T::Output>, Slot)],
    ) {
        for (surface_id, surface, slot) in attached {
            if let Err(e) = surface.detach_buffer(*slot) {
                warn!(surface_id, slot, error = %e, "Failed to roll back attach");
            }
            if state.outputs.is_same(*surface_id, surface)
                && let Some(entry) = state.outputs.get_mut(*surface_id)
            {
                entry.clear_slot(*slot);
            }
        }
    }

    fn store_frame_result(&self, result: SplitterResult<()>) {
        *self.frame_result.lock() = result;
    }
}
