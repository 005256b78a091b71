// SPDX-License-Identifier: GPL-3.0-only

//! Splitter and stream configuration

use crate::constants::{HAL_BUF_MANAGER_DEQUEUE_TIMEOUT, NORMAL_DEQUEUE_TIMEOUT, usage};
use crate::errors::ConfigError;
use crate::transport::{DequeueRequest, PixelFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables of the splitter itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    /// Output dequeue/attach timeout in normal operation (milliseconds)
    pub normal_dequeue_timeout_ms: u64,
    /// Output dequeue/attach timeout with the HAL buffer manager (microseconds)
    pub hal_buf_manager_dequeue_timeout_us: u64,
    /// Whether the HAL buffer manager is active
    pub use_hal_buffer_manager: bool,
    /// Consumer usage bits that exempt an output from dequeue timeouts
    pub async_consumer_usage_mask: u64,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            normal_dequeue_timeout_ms: NORMAL_DEQUEUE_TIMEOUT.as_millis() as u64,
            hal_buf_manager_dequeue_timeout_us: HAL_BUF_MANAGER_DEQUEUE_TIMEOUT.as_micros() as u64,
            use_hal_buffer_manager: false,
            async_consumer_usage_mask: usage::DEFAULT_ASYNC_CONSUMER_MASK,
        }
    }
}

impl SplitterConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn normal_dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.normal_dequeue_timeout_ms)
    }

    pub fn hal_buf_manager_dequeue_timeout(&self) -> Duration {
        Duration::from_micros(self.hal_buf_manager_dequeue_timeout_us)
    }

    /// Timeout applied to newly added outputs
    pub fn dequeue_timeout(&self, use_hal_buffer_manager: bool) -> Duration {
        if use_hal_buffer_manager {
            self.hal_buf_manager_dequeue_timeout()
        } else {
            self.normal_dequeue_timeout()
        }
    }

    /// True if a consumer with these usage bits must stay non-blocking
    pub fn is_async_consumer(&self, consumer_usage: u64) -> bool {
        consumer_usage & self.async_consumer_usage_mask != 0
    }
}

/// Geometry and usage of the stream being split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Usage bits of the splitter's input consumer
    pub consumer_usage: u64,
    /// Usage bits the splitter declares when dequeueing from outputs
    pub producer_usage: u64,
    /// Buffers the camera HAL may have in flight
    pub max_hal_buffers: usize,
    /// Dynamic range profile used for HDR metadata propagation
    pub dynamic_range_profile: i64,
}

impl StreamConfig {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            ..Self::default()
        }
    }

    pub(crate) fn dequeue_request(&self) -> DequeueRequest {
        DequeueRequest {
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.producer_usage,
        }
    }
}

impl std::fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{} format {}", self.width, self.height, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = SplitterConfig::default();
        assert_eq!(config.normal_dequeue_timeout(), NORMAL_DEQUEUE_TIMEOUT);
        assert_eq!(
            config.hal_buf_manager_dequeue_timeout(),
            HAL_BUF_MANAGER_DEQUEUE_TIMEOUT
        );
        assert_eq!(config.dequeue_timeout(true), HAL_BUF_MANAGER_DEQUEUE_TIMEOUT);
        assert_eq!(config.dequeue_timeout(false), NORMAL_DEQUEUE_TIMEOUT);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SplitterConfig::from_json(r#"{"use_hal_buffer_manager": true}"#).unwrap();
        assert!(config.use_hal_buffer_manager);
        assert_eq!(config.normal_dequeue_timeout_ms, 1000);
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = SplitterConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_async_consumer_mask() {
        let config = SplitterConfig::default();
        assert!(config.is_async_consumer(usage::HW_COMPOSER));
        assert!(config.is_async_consumer(usage::HW_TEXTURE | usage::CPU_READ_OFTEN));
        assert!(!config.is_async_consumer(usage::VIDEO_ENCODER));
    }
}
