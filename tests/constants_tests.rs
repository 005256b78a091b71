// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use camera_splitter::SplitterConfig;
use camera_splitter::constants::{self, usage};

#[test]
fn test_default_config_uses_constants() {
    let config = SplitterConfig::default();
    assert_eq!(config.normal_dequeue_timeout(), constants::NORMAL_DEQUEUE_TIMEOUT);
    assert_eq!(
        config.hal_buf_manager_dequeue_timeout(),
        constants::HAL_BUF_MANAGER_DEQUEUE_TIMEOUT
    );
    assert_eq!(config.async_consumer_usage_mask, usage::DEFAULT_ASYNC_CONSUMER_MASK);
}

#[test]
fn test_input_keeps_headroom() {
    assert!(constants::INPUT_HEADROOM_BUFFERS >= 1);
    assert!(constants::MAX_BUFFER_SLOTS > constants::INPUT_HEADROOM_BUFFERS);
}

#[test]
fn test_version_not_empty() {
    assert!(!constants::app_info::version().is_empty());
}
