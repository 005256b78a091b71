// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the stream splitter

use crate::transport::{BufferId, Slot, SurfaceId};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using SplitterError
pub type SplitterResult<T> = Result<T, SplitterError>;

/// Failure reported by the buffer-queue transport
///
/// Transports that surface raw integer status codes can map them with
/// [`TransportError::from_status`], so the splitter's decision tables only
/// ever match on these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote consumer (or producer) is gone
    #[error("buffer queue abandoned")]
    Abandoned,
    /// The call would block (no free slot, nothing queued)
    #[error("operation would block")]
    WouldBlock,
    /// No buffers or memory available
    #[error("no free buffers")]
    NoMemory,
    /// A configured dequeue/attach timeout expired
    #[error("timed out")]
    TimedOut,
    /// Invalid argument or slot state
    #[error("bad value")]
    BadValue,
    /// Operation not allowed in the current queue state
    #[error("invalid operation")]
    InvalidOperation,
    /// Any other transport status code
    #[error("transport status {0}")]
    Other(i32),
}

impl TransportError {
    /// Map a negative errno-style status code to a tagged error.
    ///
    /// Returns `None` for success (`0`) and positive values.
    pub fn from_status(status: i32) -> Option<Self> {
        match status {
            s if s >= 0 => None,
            // NO_INIT and DEAD_OBJECT both mean the other side went away
            -19 | -32 => Some(Self::Abandoned),
            -11 => Some(Self::WouldBlock),
            -12 => Some(Self::NoMemory),
            -110 => Some(Self::TimedOut),
            -22 => Some(Self::BadValue),
            -38 => Some(Self::InvalidOperation),
            other => Some(Self::Other(other)),
        }
    }

    /// True if the remote end of the queue has been abandoned
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned)
    }

    /// True for resource exhaustion or would-block conditions
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::NoMemory | Self::WouldBlock | Self::TimedOut)
    }
}

/// Errors returned by splitter operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SplitterError {
    /// `connect` called while outputs or an input consumer are present
    #[error("splitter already connected")]
    AlreadyConnected,
    /// `connect` called while buffers from a previous session are in flight
    #[error("splitter still tracks {0} pending buffers")]
    PendingBuffers(usize),
    /// Operation requires a connected splitter
    #[error("splitter not connected")]
    NotConnected,
    /// The surface id is already mapped to a live output
    #[error("surface id {0} already taken")]
    SurfaceTaken(SurfaceId),
    /// No live output registered under this surface id
    #[error("no output surface with id {0}")]
    UnknownSurface(SurfaceId),
    /// The buffer has no tracker (never attached, or already returned)
    #[error("buffer {0} is not tracked")]
    BufferNotTracked(BufferId),
    /// The buffer is not attached to the given output
    #[error("buffer {buffer_id} is not attached to surface {surface_id}")]
    BufferNotAttached {
        buffer_id: BufferId,
        surface_id: SurfaceId,
    },
    /// The input queue handed out an item without a resolvable buffer
    #[error("acquired input item has no buffer")]
    InvalidBuffer,
    /// The transport returned a slot outside the supported range
    #[error("slot {0} out of range")]
    InvalidSlot(Slot),
    /// A transport call failed
    #[error("{op} failed: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: TransportError,
    },
}

impl SplitterError {
    /// Wrap a transport failure with the name of the failing operation
    pub fn transport(op: &'static str) -> impl FnOnce(TransportError) -> Self {
        move |source| Self::Transport { op, source }
    }

    /// The underlying transport error, if any
    pub fn transport_error(&self) -> Option<TransportError> {
        match self {
            Self::Transport { source, .. } => Some(*source),
            _ => None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The configuration is not valid JSON for the expected schema
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(TransportError::from_status(0), None);
        assert_eq!(TransportError::from_status(-19), Some(TransportError::Abandoned));
        assert_eq!(TransportError::from_status(-32), Some(TransportError::Abandoned));
        assert_eq!(TransportError::from_status(-11), Some(TransportError::WouldBlock));
        assert_eq!(TransportError::from_status(-12), Some(TransportError::NoMemory));
        assert_eq!(TransportError::from_status(-5), Some(TransportError::Other(-5)));
    }

    #[test]
    fn test_classification() {
        assert!(TransportError::Abandoned.is_abandoned());
        assert!(!TransportError::WouldBlock.is_abandoned());
        assert!(TransportError::WouldBlock.is_exhausted());
        assert!(TransportError::NoMemory.is_exhausted());
        assert!(!TransportError::BadValue.is_exhausted());
    }

    #[test]
    fn test_transport_wrapping() {
        let err = SplitterError::transport("queue_buffer")(TransportError::Abandoned);
        assert_eq!(err.transport_error(), Some(TransportError::Abandoned));
        assert_eq!(err.to_string(), "queue_buffer failed: buffer queue abandoned");
        assert_eq!(SplitterError::NotConnected.transport_error(), None);
    }
}
