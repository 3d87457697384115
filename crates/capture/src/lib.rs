//! Screen mirroring capture from iOS devices over USB
//!
//! An iOS device hides its screen mirroring interface behind a vendor control
//! request. This crate finds the device, activates that configuration, claims
//! the diagnostic interface and streams length-prefixed frames from its bulk
//! IN endpoint to a pluggable [`FrameConsumer`].
//!
//! All USB work is blocking and runs on dedicated threads:
//! - `bulk-in-pump` keeps bulk transfers queued on the IN endpoint
//! - `bulk-reader` reassembles frames and feeds the consumer
//!
//! The binary drives a [`SessionCoordinator`] from the Tokio runtime and stops
//! it on Ctrl+C or when the reader ends.

pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod reader;
pub mod session;
pub mod testing;
pub mod usb;

pub use config::CaptureConfig;
pub use consumer::{ChannelConsumer, ConsumerGate, FrameConsumer, FrameDump};
pub use error::{CaptureError, Diagnostic, Result};
pub use logging::{LogFormat, setup_logging};
pub use reader::{BulkFrameReader, FramingStrategy, ReaderExit, ReaderSettings};
pub use session::{
    RetryPolicy, SessionCoordinator, SessionSettings, SessionState, TeardownReport, TeardownStep,
    start_with_retry,
};
