//! USB subsystem
//!
//! Everything that talks to the device:
//! - Device enumeration and classification
//! - Screen mirroring configuration activation
//! - Interface negotiation and bulk streams
//!
//! All operations here are blocking and run on dedicated threads, never on the
//! Tokio runtime.

pub mod activation;
pub mod backend;
pub mod catalog;
pub mod descriptor;
pub mod negotiator;
pub mod stream;
pub mod transfers;

// Re-export public types
pub use activation::{ActivationController, ActivationSettings};
pub use backend::{DeviceConnection, RusbBackend, UsbBackend};
pub use catalog::{Connection, DeviceCatalog, HandleArena};
pub use descriptor::{
    ActivationState, DeviceIdentity, DeviceList, DeviceSummary, UsbDeviceDescriptor,
};
pub use negotiator::{DeviceTransport, InterfaceNegotiator, NegotiatedSession};
pub use stream::{BulkOut, BulkStream, StreamCloser, StreamSettings};
