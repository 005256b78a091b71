// SPDX-License-Identifier: GPL-3.0-only

//! Value types exchanged with the buffer-queue transport

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Stable identifier of a graphics buffer
pub type BufferId = u64;

/// Caller-assigned identifier of an output surface
pub type SurfaceId = usize;

/// Index of a buffer slot inside a buffer queue
pub type Slot = usize;

/// Pixel format of the stream buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PixelFormat(pub i32);

impl PixelFormat {
    pub const RGBA_8888: Self = Self(0x1);
    pub const BLOB: Self = Self(0x21);
    /// Format chosen by the allocator
    pub const IMPLEMENTATION_DEFINED: Self = Self(0x22);
    pub const YCBCR_420_888: Self = Self(0x23);
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Color space description attached to each queued buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataspace(pub i32);

impl Dataspace {
    pub const UNKNOWN: Self = Self(0);
}

/// Buffer transform flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transform(pub u32);

impl Transform {
    pub const NONE: Self = Self(0);
    pub const FLIP_H: Self = Self(0x01);
    pub const FLIP_V: Self = Self(0x02);
    pub const ROT_90: Self = Self(0x04);
    pub const ROT_180: Self = Self(0x03);
    pub const ROT_270: Self = Self(0x07);
    /// Apply the inverse of the display's transform
    pub const INVERSE_DISPLAY: Self = Self(0x08);

    /// True if every bit of `other` is set in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Transform {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Transform {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// How the consumer scales a buffer that does not match its window size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScalingMode {
    /// Keep the last frame until a buffer of matching size arrives
    #[default]
    Freeze,
    ScaleToWindow,
    ScaleCrop,
    NoScaleCrop,
}

/// Crop rectangle (`right`/`bottom` exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.right <= self.left || self.bottom <= self.top
    }
}

/// Producer role used when connecting to an output surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerApi {
    Camera,
    Cpu,
    Media,
    Gpu,
}

/// A buffer acquired from the input queue
#[derive(Debug)]
pub struct BufferItem<B, F> {
    /// Input queue slot the buffer lives in
    pub slot: Slot,
    /// The buffer, if the consumer has not seen it in this slot before
    pub buffer: Option<B>,
    /// True if this slot has been acquired before (buffer omitted)
    pub acquire_called: bool,
    /// Acquire fence signalled when the producer finished writing
    pub fence: F,
    pub frame_number: u64,
    /// Timestamp in nanoseconds
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    pub dataspace: Dataspace,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    pub transform_to_display_inverse: bool,
}

/// Parameters for queueing a buffer into an output
#[derive(Debug, Clone)]
pub struct QueueBufferInput<F> {
    pub timestamp: i64,
    pub is_auto_timestamp: bool,
    pub dataspace: Dataspace,
    pub crop: Rect,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    pub fence: F,
}

/// Result of queueing a buffer into an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueBufferOutput {
    /// The queued buffer replaced a pending one (async mode); no release
    /// callback will be delivered for the replaced buffer
    pub buffer_replaced: bool,
}

/// Parameters for dequeueing a released slot from an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeueRequest {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: u64,
}

/// Parameters for creating the splitter's input queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputQueueParams {
    pub consumer_name: String,
    pub consumer_usage: u64,
    pub max_acquired_buffers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_bits() {
        let mut t = Transform::ROT_90;
        t |= Transform::INVERSE_DISPLAY;
        assert!(t.contains(Transform::ROT_90));
        assert!(t.contains(Transform::INVERSE_DISPLAY));
        assert!(!t.contains(Transform::FLIP_V));
        assert_eq!(Transform::FLIP_H | Transform::FLIP_V, Transform::ROT_180);
    }

    #[test]
    fn test_rect_empty() {
        assert!(Rect::default().is_empty());
        assert!(!Rect::new(0, 0, 640, 480).is_empty());
        assert!(Rect::new(10, 0, 5, 480).is_empty());
    }
}
