// SPDX-License-Identifier: GPL-3.0-only

//! Splitter-wide constants

use std::time::Duration;

/// Number of buffer slots a single buffer queue can address
pub const MAX_BUFFER_SLOTS: usize = 64;

/// Extra acquirable input buffers beyond the sum of consumer requirements.
///
/// Keeps one dequeue possible on the input even when every other buffer has
/// been detached from the input and attached to the outputs.
pub const INPUT_HEADROOM_BUFFERS: usize = 1;

/// Dequeue/attach timeout for outputs in normal operation
pub const NORMAL_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Dequeue/attach timeout for outputs when the HAL buffer manager is active
pub const HAL_BUF_MANAGER_DEQUEUE_TIMEOUT: Duration = Duration::from_millis(1);

/// Prefix for the generated input consumer names
pub const CONSUMER_NAME_PREFIX: &str = "StreamSplitter";

/// Name used when merging release fences
pub const FENCE_MERGE_NAME: &str = "StreamSplitter";

/// Consumer usage bits
pub mod usage {
    /// Buffer is sampled as a GPU texture
    pub const HW_TEXTURE: u64 = 0x0000_0100;
    /// Buffer is scanned out by the hardware composer
    pub const HW_COMPOSER: u64 = 0x0000_0800;
    /// Buffer is read by a video encoder
    pub const VIDEO_ENCODER: u64 = 0x0001_0000;
    /// Buffer is written by the camera
    pub const CAMERA_WRITE: u64 = 0x0002_0000;
    /// Buffer is read by the CPU often
    pub const CPU_READ_OFTEN: u64 = 0x0000_0003;

    /// Consumers that must stay in true non-blocking mode (no dequeue timeout)
    pub const DEFAULT_ASYNC_CONSUMER_MASK: u64 = HW_COMPOSER | HW_TEXTURE;
}

/// Application information utilities
pub mod app_info {
    /// Get the application version from build-time environment
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}
