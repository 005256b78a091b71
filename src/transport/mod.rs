// SPDX-License-Identifier: GPL-3.0-only

//! Buffer-queue transport abstraction
//!
//! The splitter never talks to a concrete graphics stack. Everything it needs
//! from the platform is expressed by the traits in this module:
//!
//! ```text
//!   camera ──queue──▶ InputProducer ┐
//!                                   │ input queue
//!   splitter ◀─acquire/release── InputConsumer
//!      │
//!      ├──attach/queue──▶ OutputSurface ──▶ consumer (display, encoder, ...)
//!      ◀──dequeue/detach── OutputSurface ◀── release
//! ```
//!
//! Notifications flow back through [`FrameAvailableListener`] (input side) and
//! [`ProducerListener`] (output side). Implementations must not invoke a
//! listener while holding a lock the splitter may wait on.

pub mod memory;
pub mod types;

pub use types::*;

use crate::constants::MAX_BUFFER_SLOTS;
use crate::errors::TransportError;
use std::sync::Arc;
use std::time::Duration;

/// A graphics buffer handle
pub trait GraphicBuffer: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Stable, unique identifier of the underlying buffer
    fn id(&self) -> BufferId;
}

/// A mergeable synchronization fence
pub trait SyncFence: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// The "no fence" sentinel
    fn no_fence() -> Self;

    /// False for the sentinel
    fn is_valid(&self) -> bool;

    /// A fence that signals once both inputs have signalled
    fn merge(name: &str, first: &Self, second: &Self) -> Self;
}

/// Input-side notification sink
pub trait FrameAvailableListener: Send + Sync {
    /// A new buffer was queued into the input
    fn on_frame_available(&self);

    /// A queued buffer replaced a pending one in the input
    fn on_frame_replaced(&self) {
        self.on_frame_available();
    }
}

/// Output-side notification sink
pub trait ProducerListener: Send + Sync {
    /// The consumer released a slot back to the producer side
    fn on_buffer_released(&self);

    /// The remote consumer died
    fn on_remote_died(&self);
}

/// Consumer end of the splitter's input queue
pub trait InputConsumer<B, F>: Send + Sync {
    /// Register the frame-available listener
    fn connect(&self, listener: Arc<dyn FrameAvailableListener>) -> Result<(), TransportError>;

    /// Disconnect and abandon the queue
    fn disconnect(&self);

    fn acquire_buffer(&self) -> Result<BufferItem<B, F>, TransportError>;

    /// Return an acquired buffer to the producer with a release fence
    fn release_buffer(
        &self,
        slot: Slot,
        frame_number: u64,
        release_fence: F,
    ) -> Result<(), TransportError>;

    /// Remove an acquired buffer from the queue entirely
    fn detach_buffer(&self, slot: Slot) -> Result<(), TransportError>;

    fn set_max_acquired_buffer_count(&self, count: usize) -> Result<(), TransportError>;
}

/// Producer end of the splitter's input queue, handed to the camera
pub trait InputProducer: Send + Sync {
    /// Non-blocking producer mode
    fn set_async_mode(&self, enabled: bool) -> Result<(), TransportError>;
}

/// A consumer surface the splitter produces into
pub trait OutputSurface<B, F>: Send + Sync {
    fn set_buffers_dimensions(&self, width: u32, height: u32) -> Result<(), TransportError>;

    fn set_buffers_format(&self, format: PixelFormat) -> Result<(), TransportError>;

    fn connect(
        &self,
        api: ProducerApi,
        listener: Arc<dyn ProducerListener>,
    ) -> Result<(), TransportError>;

    fn disconnect(&self, api: ProducerApi) -> Result<(), TransportError>;

    /// Buffers the consumer keeps acquired at steady state
    fn min_undequeued_buffers(&self) -> Result<usize, TransportError>;

    /// Largest slot count the queue supports
    fn max_buffer_slots(&self) -> usize {
        MAX_BUFFER_SLOTS
    }

    fn set_buffer_count(&self, count: usize) -> Result<(), TransportError>;

    fn consumer_usage(&self) -> Result<u64, TransportError>;

    fn set_dequeue_timeout(&self, timeout: Duration) -> Result<(), TransportError>;

    fn allow_allocation(&self, allow: bool) -> Result<(), TransportError>;

    /// Hand ownership of an existing buffer to the queue. May block.
    fn attach_buffer(&self, buffer: &B) -> Result<Slot, TransportError>;

    /// May block on a slow consumer.
    fn queue_buffer(
        &self,
        slot: Slot,
        input: QueueBufferInput<F>,
    ) -> Result<QueueBufferOutput, TransportError>;

    /// Take back the next slot released by the consumer. May block.
    fn dequeue_buffer(&self, request: &DequeueRequest) -> Result<(Slot, F), TransportError>;

    fn detach_buffer(&self, slot: Slot) -> Result<(), TransportError>;

    /// Forward HDR static/dynamic metadata of `buffer` for the given profile
    fn set_hdr_metadata(
        &self,
        _buffer: &B,
        _dynamic_range_profile: i64,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A concrete buffer-queue stack
pub trait Transport: Send + Sync + 'static {
    type Buffer: GraphicBuffer;
    type Fence: SyncFence;
    type Consumer: InputConsumer<Self::Buffer, Self::Fence> + 'static;
    type Producer: InputProducer + 'static;
    type Output: OutputSurface<Self::Buffer, Self::Fence> + 'static;

    /// Create the input queue, returning both of its ends
    fn create_input_queue(
        &self,
        params: &InputQueueParams,
    ) -> Result<(Self::Consumer, Self::Producer), TransportError>;
}
