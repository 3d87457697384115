//! Capture configuration management

use crate::logging::LogFormat;
use crate::reader::{DEFAULT_READ_BUFFER_SIZE, FramingStrategy, ReaderSettings};
use crate::session::{RetryPolicy, SessionSettings};
use crate::usb::activation::ActivationSettings;
use crate::usb::negotiator::DeviceTransport;
use crate::usb::stream::StreamSettings;
use anyhow::{Context, Result, anyhow};
use protocol::{HeaderByteOrder, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// System-wide configuration location
const SYSTEM_CONFIG_PATH: &str = "/etc/ios-screen-usb/capture.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub general: GeneralSettings,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

/// Renumeration polling after the enable request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 10,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bytes per bulk transfer
    pub transfer_size: usize,
    /// Bulk transfers queued ahead of the reader
    pub queue_depth: usize,
    /// Per-transfer timeout in milliseconds
    pub poll_timeout_ms: u64,
    /// Bytes requested per reader read
    pub read_buffer_size: usize,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// Frame header byte order (little, big, auto)
    pub byte_order: HeaderByteOrder,
    /// Frame recovery strategy (streaming, exact)
    pub framing: FramingStrategy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transfer_size: 4096,
            queue_depth: 5,
            poll_timeout_ms: 100,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            byte_order: HeaderByteOrder::Little,
            framing: FramingStrategy::Streaming,
        }
    }
}

/// Whole-session start retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub start_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_attempts: 4,
            backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Who selects the screen mirroring configuration (direct_usb, mux_managed)
    pub mode: DeviceTransport,
}

impl CaptureConfig {
    /// Load configuration from the specified path, or the first standard
    /// location that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => expand_path(&p),
            None => Self::candidates()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found"))?,
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: CaptureConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load `path` if given, else a standard location, else the defaults
    ///
    /// A file that exists but is invalid is always an error.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Self> {
        if path.is_some() {
            return Self::load(path);
        }

        match Self::candidates().into_iter().find(|p| p.exists()) {
            Some(found) => Self::load(Some(found)),
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let path = expand_path(path);
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ios-screen-usb").join("capture.toml")
        } else {
            PathBuf::from(".config/ios-screen-usb/capture.toml")
        }
    }

    fn candidates() -> Vec<PathBuf> {
        vec![Self::default_path(), PathBuf::from(SYSTEM_CONFIG_PATH)]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.general.log_level,
                valid_levels.join(", ")
            ));
        }

        let sizes = [
            ("activation.poll_attempts", self.activation.poll_attempts as u64),
            ("stream.transfer_size", self.stream.transfer_size as u64),
            ("stream.queue_depth", self.stream.queue_depth as u64),
            ("stream.poll_timeout_ms", self.stream.poll_timeout_ms),
            ("stream.read_buffer_size", self.stream.read_buffer_size as u64),
            ("stream.max_frame_size", self.stream.max_frame_size as u64),
            ("session.start_attempts", self.session.start_attempts as u64),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(anyhow!("Invalid {}: must be greater than 0", name));
            }
        }

        if self.stream.max_frame_size > MAX_FRAME_SIZE {
            return Err(anyhow!(
                "Invalid stream.max_frame_size {}: limit is {} bytes",
                self.stream.max_frame_size,
                MAX_FRAME_SIZE
            ));
        }

        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            activation: ActivationSettings {
                max_attempts: self.activation.poll_attempts,
                poll_interval: Duration::from_millis(self.activation.poll_interval_ms),
            },
            transport: self.transport.mode,
            stream: StreamSettings {
                transfer_size: self.stream.transfer_size,
                queue_depth: self.stream.queue_depth,
                poll_timeout: Duration::from_millis(self.stream.poll_timeout_ms),
            },
            reader: ReaderSettings {
                strategy: self.stream.framing,
                byte_order: self.stream.byte_order,
                read_buffer_size: self.stream.read_buffer_size,
                max_frame_size: self.stream.max_frame_size,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.session.start_attempts,
            backoff: Duration::from_millis(self.session.backoff_ms),
        }
    }
}

/// Expand a leading `~` in `path`
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}
