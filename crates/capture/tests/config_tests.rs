//! Integration tests for configuration loading
//!
//! Tests cover:
//! - Loading full and partial TOML files
//! - Rejecting invalid values
//! - Save and reload
//! - Explicit paths that do not exist

use capture::CaptureConfig;
use capture::usb::DeviceTransport;
use protocol::HeaderByteOrder;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"
log_format = "json"

[activation]
poll_attempts = 20
poll_interval_ms = 250

[stream]
transfer_size = 16384
queue_depth = 8
poll_timeout_ms = 50
read_buffer_size = 131072
max_frame_size = 1048576
byte_order = "big"
framing = "streaming"

[session]
start_attempts = 2
backoff_ms = 10

[transport]
mode = "mux_managed"
"#;

const INVALID_LEVEL_CONFIG: &str = r#"
[general]
log_level = "loud"
"#;

const OVERSIZED_FRAME_CONFIG: &str = r#"
[stream]
max_frame_size = 4294967295
"#;

fn write_config(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

mod loading {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "capture.toml", FULL_CONFIG);

        let config = CaptureConfig::load(Some(path)).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.stream.byte_order, HeaderByteOrder::Big);
        assert_eq!(config.transport.mode, DeviceTransport::MuxManaged);

        let settings = config.session_settings();
        assert_eq!(settings.activation.max_attempts, 20);
        assert_eq!(settings.activation.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.stream.transfer_size, 16384);
        assert_eq!(settings.stream.queue_depth, 8);
        assert_eq!(settings.reader.read_buffer_size, 131072);
        assert_eq!(settings.reader.max_frame_size, 1048576);

        let policy = config.retry_policy();
        assert_eq!(policy.attempts, 2);
        assert_eq!(policy.backoff, Duration::from_millis(10));
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "empty.toml", "");

        let config = CaptureConfig::load(Some(path)).unwrap();
        assert_eq!(config, CaptureConfig::default());
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.toml");

        assert!(CaptureConfig::load(Some(missing.clone())).is_err());
        assert!(CaptureConfig::load_or_default(Some(missing)).is_err());
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_invalid_log_level_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "capture.toml", INVALID_LEVEL_CONFIG);

        let err = CaptureConfig::load(Some(path)).unwrap_err();
        assert!(format!("{:#}", err).contains("log level"));
    }

    #[test]
    fn test_oversized_frame_limit_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "capture.toml", OVERSIZED_FRAME_CONFIG);

        assert!(CaptureConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "capture.toml", "[stream\nqueue_depth = ");

        let err = CaptureConfig::load(Some(path)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}

mod persistence {
    use super::*;

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("capture.toml");

        let mut config = CaptureConfig::default();
        config.activation.poll_attempts = 3;
        config.stream.byte_order = HeaderByteOrder::Auto;
        config.save(&path).unwrap();

        let reloaded = CaptureConfig::load(Some(path)).unwrap();
        assert_eq!(reloaded, config);
    }
}
