// SPDX-License-Identifier: GPL-3.0-only

//! In-process loopback transport
//!
//! Buffers are plain descriptors, fences are sets of sync points, and both the
//! input queue and the output surfaces are small slot machines behind a mutex.
//! Listeners are always invoked after the internal lock has been dropped.
//!
//! Output surfaces expose the consumer side as well (`acquire`/`release`) so
//! tests and the simulator can play the part of a display or encoder.

use super::{
    BufferId, BufferItem, Dataspace, DequeueRequest, FrameAvailableListener, GraphicBuffer,
    InputConsumer, InputProducer, InputQueueParams, OutputSurface, PixelFormat, ProducerApi,
    ProducerListener, QueueBufferInput, QueueBufferOutput, Rect, ScalingMode, Slot, SyncFence,
    Transform, Transport,
};
use crate::constants::MAX_BUFFER_SLOTS;
use crate::errors::TransportError;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// A buffer descriptor; no pixel storage is allocated
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl MemoryBuffer {
    pub fn new(id: BufferId, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            id,
            width,
            height,
            format,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }
}

impl GraphicBuffer for MemoryBuffer {
    fn id(&self) -> BufferId {
        self.id
    }
}

/// A fence made of the sync points it waits on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPointFence {
    points: BTreeSet<u64>,
}

impl SyncPointFence {
    pub fn from_point(point: u64) -> Self {
        Self {
            points: BTreeSet::from([point]),
        }
    }

    /// Sync points in ascending order
    pub fn points(&self) -> Vec<u64> {
        self.points.iter().copied().collect()
    }
}

impl SyncFence for SyncPointFence {
    fn no_fence() -> Self {
        Self::default()
    }

    fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    fn merge(_name: &str, first: &Self, second: &Self) -> Self {
        Self {
            points: first.points.union(&second.points).copied().collect(),
        }
    }
}

/// Loopback transport; buffer ids are unique per transport instance
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next_buffer_id: Arc<AtomicU64>,
    fail_input_creation: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `create_input_queue` fail
    pub fn set_fail_input_creation(&self, fail: bool) {
        self.fail_input_creation.store(fail, Ordering::SeqCst);
    }

    /// A fresh buffer with a unique id
    pub fn allocate_buffer(&self, width: u32, height: u32, format: PixelFormat) -> MemoryBuffer {
        let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed) + 1;
        MemoryBuffer::new(id, width, height, format)
    }
}

impl Transport for MemoryTransport {
    type Buffer = MemoryBuffer;
    type Fence = SyncPointFence;
    type Consumer = MemoryInputConsumer;
    type Producer = MemoryInputProducer;
    type Output = MemoryOutput;

    fn create_input_queue(
        &self,
        params: &InputQueueParams,
    ) -> Result<(MemoryInputConsumer, MemoryInputProducer), TransportError> {
        if self.fail_input_creation.load(Ordering::SeqCst) {
            return Err(TransportError::NoMemory);
        }
        if params.max_acquired_buffers == 0 {
            return Err(TransportError::BadValue);
        }

        let queue = Arc::new(Mutex::new(InputQueue {
            name: params.consumer_name.clone(),
            consumer_usage: params.consumer_usage,
            max_acquired: params.max_acquired_buffers,
            slots: Vec::new(),
            queued: VecDeque::new(),
            acquired: 0,
            next_frame_number: 1,
            listener: None,
            abandoned: false,
            async_mode: false,
            released: Vec::new(),
            detached: Vec::new(),
            return_failure: None,
        }));
        trace!(name = %params.consumer_name, "Input queue created");

        Ok((
            MemoryInputConsumer {
                queue: Arc::clone(&queue),
            },
            MemoryInputProducer {
                queue,
                next_buffer_id: Arc::clone(&self.next_buffer_id),
            },
        ))
    }
}

/// Per-frame metadata supplied by the producer
#[derive(Debug, Clone, Default)]
pub struct FrameInfo {
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    pub dataspace: Dataspace,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    pub transform_to_display_inverse: bool,
    pub fence: SyncPointFence,
}

impl FrameInfo {
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Dequeued,
    Queued,
    Acquired,
}

struct InputSlotEntry {
    buffer: Option<MemoryBuffer>,
    state: SlotState,
    /// The consumer has been handed this slot's buffer
    seen: bool,
    frame_number: u64,
    frame: FrameInfo,
    release_fence: SyncPointFence,
}

struct InputQueue {
    name: String,
    consumer_usage: u64,
    max_acquired: usize,
    slots: Vec<InputSlotEntry>,
    queued: VecDeque<Slot>,
    acquired: usize,
    next_frame_number: u64,
    listener: Option<Arc<dyn FrameAvailableListener>>,
    abandoned: bool,
    async_mode: bool,
    released: Vec<(BufferId, SyncPointFence)>,
    detached: Vec<BufferId>,
    /// Error returned by consumer-side release and detach
    return_failure: Option<TransportError>,
}

impl InputQueue {
    fn slot_of(&self, buffer_id: BufferId, state: SlotState) -> Option<Slot> {
        self.slots
            .iter()
            .position(|s| s.state == state && s.buffer.as_ref().is_some_and(|b| b.id == buffer_id))
    }
}

/// Producer end of a loopback input queue
pub struct MemoryInputProducer {
    queue: Arc<Mutex<InputQueue>>,
    next_buffer_id: Arc<AtomicU64>,
}

impl MemoryInputProducer {
    /// Take a free buffer, allocating one if no free slot holds a buffer.
    ///
    /// Returns the buffer with the release fence of its previous use.
    pub fn dequeue_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(MemoryBuffer, SyncPointFence), TransportError> {
        let mut queue = self.queue.lock();
        if queue.abandoned {
            return Err(TransportError::Abandoned);
        }

        let reusable = queue.slots.iter().position(|s| {
            s.state == SlotState::Free
                && s.buffer
                    .as_ref()
                    .is_some_and(|b| b.width == width && b.height == height && b.format == format)
        });
        let slot = match reusable {
            Some(slot) => slot,
            None => {
                let empty = queue
                    .slots
                    .iter()
                    .position(|s| s.state == SlotState::Free && s.buffer.is_none());
                let slot = match empty {
                    Some(slot) => slot,
                    None if queue.slots.len() < MAX_BUFFER_SLOTS => {
                        queue.slots.push(InputSlotEntry {
                            buffer: None,
                            state: SlotState::Free,
                            seen: false,
                            frame_number: 0,
                            frame: FrameInfo::default(),
                            release_fence: SyncPointFence::default(),
                        });
                        queue.slots.len() - 1
                    }
                    None => return Err(TransportError::WouldBlock),
                };
                let id = self.next_buffer_id.fetch_add(1, Ordering::Relaxed) + 1;
                let entry = &mut queue.slots[slot];
                entry.buffer = Some(MemoryBuffer::new(id, width, height, format));
                entry.seen = false;
                slot
            }
        };

        let entry = &mut queue.slots[slot];
        entry.state = SlotState::Dequeued;
        let fence = std::mem::take(&mut entry.release_fence);
        let buffer = entry.buffer.clone().ok_or(TransportError::BadValue)?;
        trace!(slot, buffer_id = buffer.id, "Input buffer dequeued");
        Ok((buffer, fence))
    }

    /// Queue a dequeued buffer and notify the consumer. Returns the frame number.
    pub fn queue_buffer(&self, buffer: &MemoryBuffer, frame: FrameInfo) -> Result<u64, TransportError> {
        let (frame_number, listener) = {
            let mut queue = self.queue.lock();
            if queue.abandoned {
                return Err(TransportError::Abandoned);
            }
            let slot = queue
                .slot_of(buffer.id, SlotState::Dequeued)
                .ok_or(TransportError::BadValue)?;
            let frame_number = queue.next_frame_number;
            queue.next_frame_number += 1;

            let entry = &mut queue.slots[slot];
            entry.state = SlotState::Queued;
            entry.frame_number = frame_number;
            entry.frame = frame;
            queue.queued.push_back(slot);
            (frame_number, queue.listener.clone())
        };

        if let Some(listener) = listener {
            listener.on_frame_available();
        }
        Ok(frame_number)
    }

    /// Return a dequeued buffer without queueing it
    pub fn cancel_buffer(&self, buffer: &MemoryBuffer) -> Result<(), TransportError> {
        let mut queue = self.queue.lock();
        let slot = queue
            .slot_of(buffer.id, SlotState::Dequeued)
            .ok_or(TransportError::BadValue)?;
        queue.slots[slot].state = SlotState::Free;
        Ok(())
    }

    pub fn consumer_name(&self) -> String {
        self.queue.lock().name.clone()
    }

    pub fn consumer_usage(&self) -> u64 {
        self.queue.lock().consumer_usage
    }

    pub fn is_async(&self) -> bool {
        self.queue.lock().async_mode
    }

    pub fn is_abandoned(&self) -> bool {
        self.queue.lock().abandoned
    }

    pub fn max_acquired_buffers(&self) -> usize {
        self.queue.lock().max_acquired
    }

    pub fn acquired_buffers(&self) -> usize {
        self.queue.lock().acquired
    }

    /// Buffers released back by the consumer, with their release fences
    pub fn released(&self) -> Vec<(BufferId, SyncPointFence)> {
        self.queue.lock().released.clone()
    }

    /// Buffers the consumer detached from the queue
    pub fn detached(&self) -> Vec<BufferId> {
        self.queue.lock().detached.clone()
    }

    /// Make the consumer's release and detach calls fail with `error`
    pub fn fail_consumer_returns(&self, error: Option<TransportError>) {
        self.queue.lock().return_failure = error;
    }
}

impl InputProducer for MemoryInputProducer {
    fn set_async_mode(&self, enabled: bool) -> Result<(), TransportError> {
        self.queue.lock().async_mode = enabled;
        Ok(())
    }
}

/// Consumer end of a loopback input queue
pub struct MemoryInputConsumer {
    queue: Arc<Mutex<InputQueue>>,
}

impl InputConsumer<MemoryBuffer, SyncPointFence> for MemoryInputConsumer {
    fn connect(&self, listener: Arc<dyn FrameAvailableListener>) -> Result<(), TransportError> {
        let mut queue = self.queue.lock();
        if queue.abandoned {
            return Err(TransportError::Abandoned);
        }
        queue.listener = Some(listener);
        Ok(())
    }

    fn disconnect(&self) {
        let mut queue = self.queue.lock();
        queue.abandoned = true;
        queue.listener = None;
        queue.queued.clear();
        trace!(name = %queue.name, "Input queue abandoned");
    }

    fn acquire_buffer(&self) -> Result<BufferItem<MemoryBuffer, SyncPointFence>, TransportError> {
        let mut queue = self.queue.lock();
        if queue.abandoned {
            return Err(TransportError::Abandoned);
        }
        if queue.queued.is_empty() {
            return Err(TransportError::WouldBlock);
        }
        if queue.acquired >= queue.max_acquired {
            return Err(TransportError::InvalidOperation);
        }
        let slot = queue.queued.pop_front().ok_or(TransportError::WouldBlock)?;
        queue.acquired += 1;

        let entry = &mut queue.slots[slot];
        entry.state = SlotState::Acquired;
        let acquire_called = entry.seen;
        let buffer = if acquire_called {
            None
        } else {
            entry.seen = true;
            entry.buffer.clone()
        };
        let frame = &entry.frame;

        Ok(BufferItem {
            slot,
            buffer,
            acquire_called,
            fence: frame.fence.clone(),
            frame_number: entry.frame_number,
            timestamp: frame.timestamp,
            is_auto_timestamp: frame.is_auto_timestamp,
            dataspace: frame.dataspace,
            crop: frame.crop,
            scaling_mode: frame.scaling_mode,
            transform: frame.transform,
            transform_to_display_inverse: frame.transform_to_display_inverse,
        })
    }

    fn release_buffer(
        &self,
        slot: Slot,
        frame_number: u64,
        release_fence: SyncPointFence,
    ) -> Result<(), TransportError> {
        let mut queue = self.queue.lock();
        if let Some(e) = queue.return_failure {
            return Err(e);
        }
        let entry = queue.slots.get_mut(slot).ok_or(TransportError::BadValue)?;
        if entry.state != SlotState::Acquired || entry.frame_number != frame_number {
            return Err(TransportError::BadValue);
        }
        entry.state = SlotState::Free;
        entry.release_fence = release_fence.clone();
        let buffer_id = entry.buffer.as_ref().map(|b| b.id).ok_or(TransportError::BadValue)?;

        queue.acquired = queue.acquired.saturating_sub(1);
        queue.released.push((buffer_id, release_fence));
        Ok(())
    }

    fn detach_buffer(&self, slot: Slot) -> Result<(), TransportError> {
        let mut queue = self.queue.lock();
        if let Some(e) = queue.return_failure {
            return Err(e);
        }
        let entry = queue.slots.get_mut(slot).ok_or(TransportError::BadValue)?;
        if entry.state != SlotState::Acquired {
            return Err(TransportError::BadValue);
        }
        let buffer = entry.buffer.take().ok_or(TransportError::BadValue)?;
        entry.state = SlotState::Free;
        entry.seen = false;

        queue.acquired = queue.acquired.saturating_sub(1);
        queue.detached.push(buffer.id);
        Ok(())
    }

    fn set_max_acquired_buffer_count(&self, count: usize) -> Result<(), TransportError> {
        if count == 0 {
            return Err(TransportError::BadValue);
        }
        self.queue.lock().max_acquired = count;
        Ok(())
    }
}

/// Consumer-side options of a loopback output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    pub min_undequeued_buffers: usize,
    pub consumer_usage: u64,
    /// Queueing over a pending frame replaces it
    pub async_mode: bool,
    pub max_buffer_slots: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            min_undequeued_buffers: 1,
            consumer_usage: 0,
            async_mode: false,
            max_buffer_slots: MAX_BUFFER_SLOTS,
        }
    }
}

/// Output operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Connect,
    MinUndequeued,
    SetBufferCount,
    SetDequeueTimeout,
    Attach,
    Queue,
    Dequeue,
    Detach,
    Disconnect,
}

/// A frame taken by the output's consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub slot: Slot,
    pub buffer_id: BufferId,
    pub timestamp: i64,
    pub transform: Transform,
    pub crop: Rect,
    pub fence: SyncPointFence,
}

/// Hook run inside a producer-side output call, without the output's lock held
pub type OutputHook = Arc<dyn Fn(Slot) + Send + Sync>;

struct OutputSlot {
    buffer: Option<MemoryBuffer>,
    state: SlotState,
    frame: Option<QueueBufferInput<SyncPointFence>>,
    release_fence: SyncPointFence,
}

impl OutputSlot {
    fn empty() -> Self {
        Self {
            buffer: None,
            state: SlotState::Free,
            frame: None,
            release_fence: SyncPointFence::default(),
        }
    }
}

struct OutputState {
    options: OutputOptions,
    slots: Vec<OutputSlot>,
    buffer_count: usize,
    queued: VecDeque<Slot>,
    /// Slots released by the consumer and not yet dequeued, oldest first
    released: VecDeque<Slot>,
    listener: Option<Arc<dyn ProducerListener>>,
    api: Option<ProducerApi>,
    abandoned: bool,
    dimensions: (u32, u32),
    format: PixelFormat,
    dequeue_timeout: Option<Duration>,
    allocation_allowed: bool,
    failures: HashMap<FailPoint, TransportError>,
    history: Vec<ReceivedFrame>,
    last_hdr_profile: Option<i64>,
    queue_hook: Option<OutputHook>,
}

impl OutputState {
    fn check(&self, point: FailPoint) -> Result<(), TransportError> {
        match self.failures.get(&point) {
            Some(&e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_alive(&self) -> Result<(), TransportError> {
        if self.abandoned {
            return Err(TransportError::Abandoned);
        }
        if self.api.is_none() {
            return Err(TransportError::InvalidOperation);
        }
        Ok(())
    }

    fn ensure_slot(&mut self, slot: Slot) {
        while self.slots.len() <= slot {
            self.slots.push(OutputSlot::empty());
        }
    }

    /// Slot an attach of `buffer_id` lands in
    fn attach_target(&self, buffer_id: BufferId) -> Option<Slot> {
        let dequeued_same = self.slots.iter().position(|s| {
            s.state == SlotState::Dequeued && s.buffer.as_ref().is_some_and(|b| b.id == buffer_id)
        });
        let free_empty = || {
            self.slots.iter().enumerate().position(|(i, s)| {
                s.state == SlotState::Free && s.buffer.is_none() && !self.released.contains(&i)
            })
        };
        let fresh = || (self.slots.len() < self.buffer_count).then_some(self.slots.len());
        let any_dequeued = || {
            self.slots
                .iter()
                .position(|s| s.state == SlotState::Dequeued)
        };
        dequeued_same
            .or_else(free_empty)
            .or_else(fresh)
            .or_else(any_dequeued)
    }
}

/// Loopback output surface with an in-process consumer
pub struct MemoryOutput {
    name: String,
    state: Mutex<OutputState>,
    frame_ready: Condvar,
}

impl MemoryOutput {
    pub fn new(name: &str, options: OutputOptions) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(OutputState {
                options,
                slots: Vec::new(),
                buffer_count: options.max_buffer_slots,
                queued: VecDeque::new(),
                released: VecDeque::new(),
                listener: None,
                api: None,
                abandoned: false,
                dimensions: (0, 0),
                format: PixelFormat::default(),
                dequeue_timeout: None,
                allocation_allowed: true,
                failures: HashMap::new(),
                history: Vec::new(),
                last_hdr_profile: None,
                queue_hook: None,
            }),
            frame_ready: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make `point` fail with `error` until cleared
    pub fn inject_failure(&self, point: FailPoint, error: TransportError) {
        self.state.lock().failures.insert(point, error);
    }

    pub fn clear_failure(&self, point: FailPoint) {
        self.state.lock().failures.remove(&point);
    }

    /// Run `hook` at the start of every `queue_buffer`
    pub fn set_queue_hook(&self, hook: Option<OutputHook>) {
        self.state.lock().queue_hook = hook;
    }

    /// Take the oldest queued frame
    pub fn acquire(&self) -> Option<ReceivedFrame> {
        let mut state = self.state.lock();
        Self::acquire_locked(&mut state)
    }

    /// Wait up to `timeout` for a queued frame
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<ReceivedFrame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = Self::acquire_locked(&mut state) {
                return Some(frame);
            }
            if state.abandoned || self.frame_ready.wait_until(&mut state, deadline).timed_out() {
                return Self::acquire_locked(&mut state);
            }
        }
    }

    fn acquire_locked(state: &mut OutputState) -> Option<ReceivedFrame> {
        let slot = state.queued.pop_front()?;
        let entry = &mut state.slots[slot];
        entry.state = SlotState::Acquired;
        let frame = entry.frame.take()?;
        let buffer_id = entry.buffer.as_ref().map(|b| b.id)?;

        let received = ReceivedFrame {
            slot,
            buffer_id,
            timestamp: frame.timestamp,
            transform: frame.transform,
            crop: frame.crop,
            fence: frame.fence,
        };
        state.history.push(received.clone());
        Some(received)
    }

    /// Hand an acquired slot back to the producer side
    pub fn release(&self, slot: Slot, release_fence: SyncPointFence) -> Result<(), TransportError> {
        let listener = {
            let mut state = self.state.lock();
            let entry = state.slots.get_mut(slot).ok_or(TransportError::BadValue)?;
            if entry.state != SlotState::Acquired {
                return Err(TransportError::BadValue);
            }
            entry.state = SlotState::Free;
            entry.release_fence = release_fence;
            state.released.push_back(slot);
            state.listener.clone()
        };

        trace!(output = %self.name, slot, "Output slot released");
        if let Some(listener) = listener {
            listener.on_buffer_released();
        }
        Ok(())
    }

    /// The consumer goes away
    pub fn abandon(&self) {
        let listener = {
            let mut state = self.state.lock();
            state.abandoned = true;
            state.listener.clone()
        };
        self.frame_ready.notify_all();
        if let Some(listener) = listener {
            listener.on_remote_died();
        }
    }

    /// Every frame acquired by the consumer so far
    pub fn history(&self) -> Vec<ReceivedFrame> {
        self.state.lock().history.clone()
    }

    pub fn pending_frames(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().api.is_some()
    }

    pub fn dequeue_timeout(&self) -> Option<Duration> {
        self.state.lock().dequeue_timeout
    }

    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffer_count
    }

    pub fn allocation_allowed(&self) -> bool {
        self.state.lock().allocation_allowed
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.state.lock().dimensions
    }

    pub fn format(&self) -> PixelFormat {
        self.state.lock().format
    }

    pub fn last_hdr_profile(&self) -> Option<i64> {
        self.state.lock().last_hdr_profile
    }

    /// Buffer ids currently held by the queue, by slot
    pub fn attached_buffers(&self) -> Vec<(Slot, BufferId)> {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, s)| s.buffer.as_ref().map(|b| (slot, b.id)))
            .collect()
    }
}

impl OutputSurface<MemoryBuffer, SyncPointFence> for MemoryOutput {
    fn set_buffers_dimensions(&self, width: u32, height: u32) -> Result<(), TransportError> {
        self.state.lock().dimensions = (width, height);
        Ok(())
    }

    fn set_buffers_format(&self, format: PixelFormat) -> Result<(), TransportError> {
        self.state.lock().format = format;
        Ok(())
    }

    fn connect(
        &self,
        api: ProducerApi,
        listener: Arc<dyn ProducerListener>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check(FailPoint::Connect)?;
        if state.abandoned {
            return Err(TransportError::Abandoned);
        }
        if state.api.is_some() {
            return Err(TransportError::BadValue);
        }
        state.api = Some(api);
        state.listener = Some(listener);
        trace!(output = %self.name, ?api, "Output connected");
        Ok(())
    }

    fn disconnect(&self, api: ProducerApi) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check(FailPoint::Disconnect)?;
        if state.api != Some(api) {
            return Err(TransportError::BadValue);
        }
        state.api = None;
        state.listener = None;
        state.slots.clear();
        state.queued.clear();
        state.released.clear();
        trace!(output = %self.name, "Output disconnected");
        Ok(())
    }

    fn min_undequeued_buffers(&self) -> Result<usize, TransportError> {
        let state = self.state.lock();
        state.check(FailPoint::MinUndequeued)?;
        Ok(state.options.min_undequeued_buffers)
    }

    fn max_buffer_slots(&self) -> usize {
        self.state.lock().options.max_buffer_slots
    }

    fn set_buffer_count(&self, count: usize) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check(FailPoint::SetBufferCount)?;
        if count == 0 || count > state.options.max_buffer_slots {
            return Err(TransportError::BadValue);
        }
        state.buffer_count = count;
        Ok(())
    }

    fn consumer_usage(&self) -> Result<u64, TransportError> {
        Ok(self.state.lock().options.consumer_usage)
    }

    fn set_dequeue_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check(FailPoint::SetDequeueTimeout)?;
        state.dequeue_timeout = Some(timeout);
        Ok(())
    }

    fn allow_allocation(&self, allow: bool) -> Result<(), TransportError> {
        self.state.lock().allocation_allowed = allow;
        Ok(())
    }

    fn attach_buffer(&self, buffer: &MemoryBuffer) -> Result<Slot, TransportError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        state.check(FailPoint::Attach)?;

        let slot = state
            .attach_target(buffer.id)
            .ok_or(TransportError::WouldBlock)?;
        state.ensure_slot(slot);
        let entry = &mut state.slots[slot];
        entry.buffer = Some(buffer.clone());
        entry.state = SlotState::Dequeued;
        entry.frame = None;
        trace!(output = %self.name, slot, buffer_id = buffer.id, "Buffer attached");
        Ok(slot)
    }

    fn queue_buffer(
        &self,
        slot: Slot,
        input: QueueBufferInput<SyncPointFence>,
    ) -> Result<QueueBufferOutput, TransportError> {
        let hook = self.state.lock().queue_hook.clone();
        if let Some(hook) = hook {
            hook(slot);
        }

        let mut state = self.state.lock();
        state.check_alive()?;
        state.check(FailPoint::Queue)?;

        let entry = state.slots.get_mut(slot).ok_or(TransportError::BadValue)?;
        if entry.state != SlotState::Dequeued || entry.buffer.is_none() {
            return Err(TransportError::BadValue);
        }
        entry.state = SlotState::Queued;
        entry.frame = Some(input);

        let mut output = QueueBufferOutput::default();
        if state.options.async_mode
            && let Some(pending) = state.queued.pop_front()
        {
            // The consumer never saw the pending frame; its slot is free again
            let replaced = &mut state.slots[pending];
            replaced.state = SlotState::Free;
            replaced.frame = None;
            state.released.push_back(pending);
            output.buffer_replaced = true;
        }
        state.queued.push_back(slot);
        drop(state);

        self.frame_ready.notify_all();
        Ok(output)
    }

    fn dequeue_buffer(
        &self,
        request: &DequeueRequest,
    ) -> Result<(Slot, SyncPointFence), TransportError> {
        let mut state = self.state.lock();
        state.check_alive()?;
        state.check(FailPoint::Dequeue)?;

        let slot = state.released.pop_front().ok_or(TransportError::WouldBlock)?;
        let entry = &mut state.slots[slot];
        entry.state = SlotState::Dequeued;
        let fence = std::mem::take(&mut entry.release_fence);
        trace!(
            output = %self.name,
            slot,
            width = request.width,
            height = request.height,
            "Output slot dequeued"
        );
        Ok((slot, fence))
    }

    fn detach_buffer(&self, slot: Slot) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check(FailPoint::Detach)?;
        if state.abandoned {
            return Err(TransportError::Abandoned);
        }
        let entry = state.slots.get_mut(slot).ok_or(TransportError::BadValue)?;
        if entry.state != SlotState::Dequeued {
            return Err(TransportError::BadValue);
        }
        entry.buffer = None;
        entry.state = SlotState::Free;
        Ok(())
    }

    fn set_hdr_metadata(
        &self,
        _buffer: &MemoryBuffer,
        dynamic_range_profile: i64,
    ) -> Result<(), TransportError> {
        self.state.lock().last_hdr_profile = Some(dynamic_range_profile);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryInputProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInputProducer")
            .field("consumer", &self.queue.lock().name)
            .finish()
    }
}

impl std::fmt::Debug for MemoryInputConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryInputConsumer")
            .field("name", &self.queue.lock().name)
            .finish()
    }
}

impl std::fmt::Debug for MemoryOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryOutput").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopListener;

    impl ProducerListener for NoopListener {
        fn on_buffer_released(&self) {}
        fn on_remote_died(&self) {}
    }

    fn connected_output(options: OutputOptions) -> MemoryOutput {
        let output = MemoryOutput::new("test", options);
        output
            .connect(ProducerApi::Camera, Arc::new(NoopListener))
            .unwrap();
        output
    }

    fn queue_input(fence: SyncPointFence) -> QueueBufferInput<SyncPointFence> {
        QueueBufferInput {
            timestamp: 1,
            is_auto_timestamp: false,
            dataspace: Dataspace::UNKNOWN,
            crop: Rect::default(),
            scaling_mode: ScalingMode::Freeze,
            transform: Transform::NONE,
            fence,
        }
    }

    #[test]
    fn test_fence_merge_is_union() {
        let a = SyncPointFence::from_point(3);
        let b = SyncPointFence::from_point(1);
        let merged = SyncPointFence::merge("test", &a, &b);
        assert_eq!(merged.points(), vec![1, 3]);
        assert!(!SyncPointFence::no_fence().is_valid());
    }

    #[test]
    fn test_output_release_then_dequeue_returns_fence() {
        let output = connected_output(OutputOptions::default());
        let buffer = MemoryBuffer::new(1, 16, 16, PixelFormat::RGBA_8888);
        let slot = output.attach_buffer(&buffer).unwrap();
        output
            .queue_buffer(slot, queue_input(SyncPointFence::no_fence()))
            .unwrap();

        let frame = output.acquire().unwrap();
        assert_eq!(frame.buffer_id, 1);
        output.release(frame.slot, SyncPointFence::from_point(9)).unwrap();

        let request = DequeueRequest {
            width: 16,
            height: 16,
            format: PixelFormat::RGBA_8888,
            usage: 0,
        };
        let (dequeued, fence) = output.dequeue_buffer(&request).unwrap();
        assert_eq!(dequeued, slot);
        assert_eq!(fence.points(), vec![9]);
        assert_eq!(
            output.dequeue_buffer(&request).unwrap_err(),
            TransportError::WouldBlock
        );
    }

    #[test]
    fn test_async_output_replaces_pending_frame() {
        let output = connected_output(OutputOptions {
            async_mode: true,
            ..OutputOptions::default()
        });
        let first = MemoryBuffer::new(1, 16, 16, PixelFormat::RGBA_8888);
        let second = MemoryBuffer::new(2, 16, 16, PixelFormat::RGBA_8888);

        let s1 = output.attach_buffer(&first).unwrap();
        let s2 = output.attach_buffer(&second).unwrap();
        assert_ne!(s1, s2);

        let out = output.queue_buffer(s1, queue_input(SyncPointFence::no_fence())).unwrap();
        assert!(!out.buffer_replaced);
        let out = output.queue_buffer(s2, queue_input(SyncPointFence::no_fence())).unwrap();
        assert!(out.buffer_replaced);
        assert_eq!(output.pending_frames(), 1);
        assert_eq!(output.acquire().map(|f| f.buffer_id), Some(2));
    }

    #[test]
    fn test_attach_reuses_dequeued_slot_of_same_buffer() {
        let output = connected_output(OutputOptions::default());
        let buffer = MemoryBuffer::new(5, 16, 16, PixelFormat::RGBA_8888);
        let slot = output.attach_buffer(&buffer).unwrap();
        assert_eq!(output.attach_buffer(&buffer).unwrap(), slot);
    }

    #[test]
    fn test_injected_failure() {
        let output = connected_output(OutputOptions::default());
        output.inject_failure(FailPoint::Attach, TransportError::NoMemory);
        let buffer = MemoryBuffer::new(5, 16, 16, PixelFormat::RGBA_8888);
        assert_eq!(
            output.attach_buffer(&buffer).unwrap_err(),
            TransportError::NoMemory
        );
        output.clear_failure(FailPoint::Attach);
        assert!(output.attach_buffer(&buffer).is_ok());
    }

    #[test]
    fn test_input_acquire_hands_buffer_once_per_slot() {
        let transport = MemoryTransport::new();
        let params = InputQueueParams {
            consumer_name: "test".into(),
            consumer_usage: 0,
            max_acquired_buffers: 2,
        };
        let (consumer, producer) = transport.create_input_queue(&params).unwrap();

        let (buffer, _) = producer.dequeue_buffer(16, 16, PixelFormat::RGBA_8888).unwrap();
        producer.queue_buffer(&buffer, FrameInfo::at(10)).unwrap();
        let item = consumer.acquire_buffer().unwrap();
        assert_eq!(item.buffer.as_ref().map(|b| b.id()), Some(buffer.id()));
        assert!(!item.acquire_called);
        consumer
            .release_buffer(item.slot, item.frame_number, SyncPointFence::from_point(4))
            .unwrap();

        let (again, fence) = producer.dequeue_buffer(16, 16, PixelFormat::RGBA_8888).unwrap();
        assert_eq!(again.id(), buffer.id());
        assert_eq!(fence.points(), vec![4]);
        producer.queue_buffer(&again, FrameInfo::at(20)).unwrap();
        let item = consumer.acquire_buffer().unwrap();
        assert!(item.buffer.is_none());
        assert!(item.acquire_called);
        assert_eq!(item.timestamp, 20);
    }

    #[test]
    fn test_input_acquire_limit() {
        let transport = MemoryTransport::new();
        let params = InputQueueParams {
            consumer_name: "test".into(),
            consumer_usage: 0,
            max_acquired_buffers: 1,
        };
        let (consumer, producer) = transport.create_input_queue(&params).unwrap();
        for ts in 0..2 {
            let (buffer, _) = producer.dequeue_buffer(16, 16, PixelFormat::RGBA_8888).unwrap();
            producer.queue_buffer(&buffer, FrameInfo::at(ts)).unwrap();
        }
        assert!(consumer.acquire_buffer().is_ok());
        assert_eq!(
            consumer.acquire_buffer().unwrap_err(),
            TransportError::InvalidOperation
        );
    }
}
