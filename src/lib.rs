// SPDX-License-Identifier: GPL-3.0-only

//! Camera Splitter - zero-copy fan-out of a camera buffer stream
//!
//! One camera stream is delivered into an input buffer queue; the splitter
//! hands every buffer to several output surfaces (display, encoder, ...)
//! and gives it back to the camera once all of them are done with it.
//!
//! # Architecture
//!
//! - [`splitter`]: the splitter itself, with its per-buffer reference tracking
//! - [`transport`]: traits for the buffer-queue stack, plus an in-memory
//!   loopback implementation
//! - [`config`]: splitter tunables and stream description
//! - [`simulation`]: a loopback run of producer and consumers, used by the CLI
//!
//! # Example
//!
//! ```ignore
//! let splitter = StreamSplitter::new(transport, SplitterConfig::default());
//! let producer = splitter.connect([(0, display), (1, encoder)], stream)?;
//! splitter.attach_buffer_to_outputs(&buffer, &[0, 1])?;
//! // queue `buffer` through `producer`; the outputs receive it
//! ```

pub mod config;
pub mod constants;
pub mod errors;
pub mod simulation;
pub mod splitter;
pub mod transport;

pub use config::{SplitterConfig, StreamConfig};
pub use errors::{ConfigError, SplitterError, SplitterResult, TransportError};
pub use splitter::{AsyncConsumerPredicate, BufferTracker, SplitterStats, StreamSplitter};
