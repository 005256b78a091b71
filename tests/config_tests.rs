// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration loading

use camera_splitter::transport::PixelFormat;
use camera_splitter::{ConfigError, SplitterConfig, StreamConfig};
use std::path::PathBuf;
use std::time::Duration;

fn temp_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "camera-splitter-{}-{name}.json",
        std::process::id()
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn test_load_config_file() {
    let path = temp_config(
        "load",
        r#"{"normal_dequeue_timeout_ms": 250, "use_hal_buffer_manager": true}"#,
    );
    let config = SplitterConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.normal_dequeue_timeout(), Duration::from_millis(250));
    assert!(config.use_hal_buffer_manager);
    // Unset fields keep their defaults
    assert_eq!(
        config.async_consumer_usage_mask,
        SplitterConfig::default().async_consumer_usage_mask
    );
}

#[test]
fn test_missing_file_reports_path() {
    let path = std::env::temp_dir().join("camera-splitter-does-not-exist.json");
    let err = SplitterConfig::load(&path).unwrap_err();
    match err {
        ConfigError::Io { path: reported, .. } => assert_eq!(reported, path),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_config_survives_json() {
    let config = SplitterConfig {
        hal_buf_manager_dequeue_timeout_us: 500,
        async_consumer_usage_mask: 0,
        ..SplitterConfig::default()
    };
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(SplitterConfig::from_json(&json).unwrap(), config);
    assert!(!config.is_async_consumer(u64::MAX));
}

#[test]
fn test_stream_config_defaults() {
    let stream = StreamConfig::new(1280, 720, PixelFormat::YCBCR_420_888);
    assert_eq!(stream.width, 1280);
    assert_eq!(stream.height, 720);
    assert_eq!(stream.max_hal_buffers, 0);
    assert_eq!(stream.consumer_usage, 0);

    let parsed: StreamConfig = serde_json::from_str(r#"{"width": 320, "height": 240}"#).unwrap();
    assert_eq!(parsed.format, PixelFormat::default());
    assert_eq!(parsed.dynamic_range_profile, 0);
}
