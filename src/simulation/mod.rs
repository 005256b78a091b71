// SPDX-License-Identifier: GPL-3.0-only

//! Loopback simulation of a split camera stream
//!
//! A producer thread plays the camera: it dequeues input buffers, attaches
//! them to the outputs and queues them. Each output is drained by its own
//! consumer loop with a configurable per-frame delay. The run ends after the
//! requested number of frames, or earlier if the stop flag is raised.

pub mod frame_loop;

use crate::config::{SplitterConfig, StreamConfig};
use crate::constants::usage;
use crate::errors::{SplitterError, TransportError};
use crate::splitter::{SplitterStats, StreamSplitter};
use crate::transport::memory::{
    FrameInfo, MemoryInputProducer, MemoryOutput, MemoryTransport, OutputOptions, SyncPointFence,
};
use crate::transport::{GraphicBuffer, PixelFormat, SurfaceId};
use frame_loop::{LoopAction, LoopController};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

const ACQUIRE_POLL: Duration = Duration::from_millis(20);
const BACKPRESSURE_POLL: Duration = Duration::from_millis(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that abort a simulation run
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Splitter(#[from] SplitterError),
    #[error("input queue: {0}")]
    Input(#[from] TransportError),
    #[error("simulation needs at least one output")]
    NoOutputs,
}

/// Shape of a simulation run
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub frames: u64,
    pub outputs: usize,
    pub width: u32,
    pub height: u32,
    pub frame_interval: Duration,
    /// Per-output consumer delay; the last entry repeats for extra outputs
    pub consumer_delays: Vec<Duration>,
    /// Outputs whose consumer replaces pending frames
    pub async_outputs: Vec<SurfaceId>,
    /// Remove this output once the given number of frames was produced
    pub remove_output: Option<(SurfaceId, u64)>,
    pub max_hal_buffers: usize,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            frames: 120,
            outputs: 2,
            width: 1920,
            height: 1080,
            frame_interval: Duration::from_millis(5),
            consumer_delays: vec![Duration::from_millis(2)],
            async_outputs: Vec::new(),
            remove_output: None,
            max_hal_buffers: 8,
        }
    }
}

impl SimulationOptions {
    fn consumer_delay(&self, surface_id: SurfaceId) -> Duration {
        self.consumer_delays
            .get(surface_id)
            .or(self.consumer_delays.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub frames_produced: u64,
    pub frames_dropped: u64,
    pub frame_errors: u64,
    /// Frames each output's consumer acquired
    pub frames_received: BTreeMap<SurfaceId, usize>,
    pub buffers_released_to_input: usize,
    pub buffers_detached_from_input: usize,
    pub stopped_early: bool,
    pub stats: SplitterStats,
}

/// Run a simulation until `frames` were produced or `stop` is raised
pub fn run(
    options: &SimulationOptions,
    config: SplitterConfig,
    stop: Arc<AtomicBool>,
) -> Result<SimulationReport, SimulationError> {
    if options.outputs == 0 {
        return Err(SimulationError::NoOutputs);
    }

    let transport = Arc::new(MemoryTransport::new());
    let splitter = StreamSplitter::new(Arc::clone(&transport), config);

    let outputs: Vec<(SurfaceId, Arc<MemoryOutput>)> = (0..options.outputs)
        .map(|surface_id| {
            let is_async = options.async_outputs.contains(&surface_id);
            let output_options = OutputOptions {
                consumer_usage: if is_async {
                    usage::HW_COMPOSER
                } else {
                    usage::VIDEO_ENCODER
                },
                async_mode: is_async,
                ..OutputOptions::default()
            };
            let name = format!("output-{surface_id}");
            (surface_id, Arc::new(MemoryOutput::new(&name, output_options)))
        })
        .collect();

    let stream = StreamConfig {
        consumer_usage: usage::CAMERA_WRITE,
        max_hal_buffers: options.max_hal_buffers,
        ..StreamConfig::new(options.width, options.height, PixelFormat::YCBCR_420_888)
    };
    let producer = splitter.connect(outputs.iter().cloned(), stream)?;

    let fence_counter = Arc::new(AtomicU64::new(0));
    let mut consumers: Vec<LoopController> = outputs
        .iter()
        .map(|(surface_id, output)| {
            spawn_consumer(
                Arc::clone(output),
                options.consumer_delay(*surface_id),
                Arc::clone(&fence_counter),
            )
        })
        .collect();

    let surface_ids: Vec<SurfaceId> = outputs.iter().map(|(id, _)| *id).collect();
    let mut produced = 0u64;
    let mut dropped = 0u64;
    let mut frame_errors = 0u64;
    let mut stopped_early = false;
    let started = Instant::now();

    info!(
        frames = options.frames,
        outputs = options.outputs,
        "Simulation started"
    );

    for frame in 0..options.frames {
        if stop.load(Ordering::SeqCst) {
            stopped_early = true;
            break;
        }

        if let Some((surface_id, after)) = options.remove_output
            && frame == after
        {
            match splitter.remove_output(surface_id) {
                Ok(()) => info!(surface_id, frame, "Output removed mid-stream"),
                Err(e) => warn!(surface_id, error = %e, "Mid-stream removal failed"),
            }
        }

        if !wait_for_capacity(&splitter, options.max_hal_buffers, &stop) {
            stopped_early = true;
            break;
        }

        match produce_frame(&splitter, &producer, options, &surface_ids, frame) {
            Ok(()) => produced += 1,
            Err(e) => {
                debug!(frame, error = %e, "Frame dropped");
                dropped += 1;
            }
        }
        if splitter.on_frame_available_result().is_err() {
            frame_errors += 1;
        }

        thread::sleep(options.frame_interval);
    }

    let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
    while splitter.stats().tracked_buffers > 0 && Instant::now() < drain_deadline {
        if stop.load(Ordering::SeqCst) {
            stopped_early = true;
            break;
        }
        thread::sleep(BACKPRESSURE_POLL);
    }

    for consumer in &mut consumers {
        consumer.stop();
    }

    let stats = splitter.stats();
    let frames_received = outputs
        .iter()
        .map(|(id, output)| (*id, output.history().len()))
        .collect();
    let report = SimulationReport {
        frames_produced: produced,
        frames_dropped: dropped,
        frame_errors,
        frames_received,
        buffers_released_to_input: producer.released().len(),
        buffers_detached_from_input: producer.detached().len(),
        stopped_early,
        stats,
    };

    splitter.disconnect();
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        produced, dropped, "Simulation finished"
    );
    Ok(report)
}

/// Consumer side of one output: acquire, hold for `delay`, release
fn spawn_consumer(
    output: Arc<MemoryOutput>,
    delay: Duration,
    fence_counter: Arc<AtomicU64>,
) -> LoopController {
    let name = format!("{}-consumer", output.name());
    LoopController::start(&name, move || {
        let Some(frame) = output.acquire_timeout(ACQUIRE_POLL) else {
            return LoopAction::Continue;
        };
        thread::sleep(delay);

        let point = fence_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = output.release(frame.slot, SyncPointFence::from_point(point)) {
            // The output was disconnected while the consumer held the frame
            debug!(output = %output.name(), slot = frame.slot, error = %e, "Release rejected");
        }
        LoopAction::Continue
    })
}

/// Hold the producer back while the HAL (or the input) has no spare buffer.
///
/// Returns false if the stop flag was raised while waiting.
fn wait_for_capacity(
    splitter: &StreamSplitter<MemoryTransport>,
    max_hal_buffers: usize,
    stop: &AtomicBool,
) -> bool {
    loop {
        let stats = splitter.stats();
        let limit = max_hal_buffers.min(stats.max_consumer_buffers).max(1);
        if stats.tracked_buffers < limit && stats.acquired_input_buffers < limit {
            return true;
        }
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(BACKPRESSURE_POLL);
    }
}

fn produce_frame(
    splitter: &StreamSplitter<MemoryTransport>,
    producer: &MemoryInputProducer,
    options: &SimulationOptions,
    surface_ids: &[SurfaceId],
    frame: u64,
) -> Result<(), SimulationError> {
    let (buffer, _release_fence) =
        producer.dequeue_buffer(options.width, options.height, PixelFormat::YCBCR_420_888)?;

    if let Err(e) = splitter.attach_buffer_to_outputs(&buffer, surface_ids) {
        warn!(buffer_id = buffer.id(), error = %e, "Attach failed, dropping frame");
        producer.cancel_buffer(&buffer)?;
        return Err(e.into());
    }

    let timestamp = (frame as i64) * options.frame_interval.as_nanos() as i64;
    producer.queue_buffer(&buffer, FrameInfo::at(timestamp))?;
    Ok(())
}
