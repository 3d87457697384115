//! Capture error types

use crate::session::SessionState;
use crate::usb::descriptor::EndpointDirection;
use protocol::ProtocolError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device with udid '{serial}' not found")]
    DeviceNotFound { serial: String },

    #[error("no iOS devices are connected to this host")]
    NoDevicesConnected,

    #[error("could not activate screen mirroring config for {serial} after {attempts} attempts")]
    ActivationTimeout { serial: String, attempts: u32 },

    #[error("device {serial} is not exposing the screen mirroring configuration")]
    NotActivated { serial: String },

    #[error("{direction} bulk endpoint not found on interface {interface}")]
    EndpointUnavailable {
        direction: EndpointDirection,
        interface: u8,
    },

    #[error("stream corruption: {0}")]
    StreamCorruption(#[source] ProtocolError),

    #[error("transient USB error during {operation}: {source}")]
    TransientUsb {
        operation: &'static str,
        #[source]
        source: rusb::Error,
    },

    #[error("USB error during {operation}: {source}")]
    FatalUsb {
        operation: &'static str,
        #[source]
        source: rusb::Error,
    },

    #[error("session is {state:?}, expected {expected:?}")]
    InvalidState {
        state: SessionState,
        expected: SessionState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Build a USB error, classifying it as transient or fatal
    pub fn usb(operation: &'static str, source: rusb::Error) -> Self {
        if is_transient(source) {
            CaptureError::TransientUsb { operation, source }
        } else {
            CaptureError::FatalUsb { operation, source }
        }
    }

    /// Whether retrying the whole session start may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::TransientUsb { .. } | CaptureError::ActivationTimeout { .. }
        )
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::DeviceNotFound { .. } => "DeviceNotFound",
            CaptureError::NoDevicesConnected => "NoDevicesConnected",
            CaptureError::ActivationTimeout { .. } => "ActivationTimeout",
            CaptureError::NotActivated { .. } => "NotActivated",
            CaptureError::EndpointUnavailable { .. } => "EndpointUnavailable",
            CaptureError::StreamCorruption(_) => "StreamCorruption",
            CaptureError::TransientUsb { .. } => "TransientUsbError",
            CaptureError::FatalUsb { .. } => "FatalUsbError",
            CaptureError::InvalidState { .. } => "InvalidState",
            CaptureError::Io(_) => "IoError",
        }
    }

    /// Operator-facing diagnostic
    pub fn diagnostic(&self) -> Diagnostic {
        Diagnostic {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<ProtocolError> for CaptureError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => CaptureError::Io(e),
            other => CaptureError::StreamCorruption(other),
        }
    }
}

/// Whether a libusb error can clear once the device settles after renumeration
pub fn is_transient(err: rusb::Error) -> bool {
    matches!(
        err,
        rusb::Error::Busy
            | rusb::Error::Timeout
            | rusb::Error::Io
            | rusb::Error::Pipe
            | rusb::Error::Interrupted
            | rusb::Error::Overflow
    )
}

/// Structured failure report (kind + message)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: String,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, CaptureError>;
