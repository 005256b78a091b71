// SPDX-License-Identifier: GPL-3.0-only

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use camera_splitter::transport::memory::{
    FrameInfo, MemoryBuffer, MemoryInputProducer, MemoryOutput, MemoryTransport, OutputOptions,
    ReceivedFrame, SyncPointFence,
};
use camera_splitter::transport::{PixelFormat, SurfaceId};
use camera_splitter::{SplitterConfig, StreamConfig, StreamSplitter};
use std::sync::Arc;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;
pub const FORMAT: PixelFormat = PixelFormat::YCBCR_420_888;

pub fn stream() -> StreamConfig {
    StreamConfig {
        max_hal_buffers: 8,
        ..StreamConfig::new(WIDTH, HEIGHT, FORMAT)
    }
}

pub fn output(name: &str, options: OutputOptions) -> Arc<MemoryOutput> {
    Arc::new(MemoryOutput::new(name, options))
}

/// A connected splitter over the loopback transport
pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub splitter: Arc<StreamSplitter<MemoryTransport>>,
    pub producer: MemoryInputProducer,
    pub outputs: Vec<Arc<MemoryOutput>>,
}

impl Harness {
    pub fn new(outputs: usize) -> Self {
        Self::with_options(vec![OutputOptions::default(); outputs])
    }

    pub fn with_options(options: Vec<OutputOptions>) -> Self {
        Self::with_stream(options, stream())
    }

    pub fn with_stream(options: Vec<OutputOptions>, stream: StreamConfig) -> Self {
        let transport = Arc::new(MemoryTransport::new());
        let splitter = Arc::new(StreamSplitter::new(
            Arc::clone(&transport),
            SplitterConfig::default(),
        ));
        let outputs: Vec<Arc<MemoryOutput>> = options
            .into_iter()
            .enumerate()
            .map(|(i, o)| output(&format!("output-{i}"), o))
            .collect();
        let producer = splitter
            .connect(
                outputs.iter().cloned().enumerate(),
                stream,
            )
            .expect("connect");
        Self {
            transport,
            splitter,
            producer,
            outputs,
        }
    }

    pub fn output(&self, surface_id: SurfaceId) -> &Arc<MemoryOutput> {
        &self.outputs[surface_id]
    }

    pub fn dequeue(&self) -> MemoryBuffer {
        self.producer
            .dequeue_buffer(WIDTH, HEIGHT, FORMAT)
            .expect("dequeue input buffer")
            .0
    }

    /// Dequeue, attach to `surface_ids` and queue one frame
    pub fn send_frame(&self, surface_ids: &[SurfaceId], info: FrameInfo) -> MemoryBuffer {
        let buffer = self.dequeue();
        self.splitter
            .attach_buffer_to_outputs(&buffer, surface_ids)
            .expect("attach");
        self.producer.queue_buffer(&buffer, info).expect("queue");
        buffer
    }

    pub fn consume(&self, surface_id: SurfaceId) -> ReceivedFrame {
        self.output(surface_id).acquire().expect("frame pending")
    }

    pub fn release(&self, surface_id: SurfaceId, frame: &ReceivedFrame, point: u64) {
        self.output(surface_id)
            .release(frame.slot, SyncPointFence::from_point(point))
            .expect("release");
    }

    /// Buffers returned to the input by release or detach
    pub fn returns(&self) -> usize {
        self.producer.released().len() + self.producer.detached().len()
    }
}
