//! Device catalog
//!
//! Enumerates attached iOS devices and selects one by serial. Every opened
//! device that is not selected is closed straight away, so no handle lingers
//! that could starve a later exclusive claim.

use crate::error::{CaptureError, Result};
use crate::usb::backend::{DeviceConnection, UsbBackend};
use crate::usb::descriptor::{APPLE_VENDOR_ID, DeviceIdentity, UsbDeviceDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Shared handle to an opened device
pub type Connection = Arc<dyn DeviceConnection>;

/// Enumerates and classifies attached devices
#[derive(Clone)]
pub struct DeviceCatalog {
    backend: Arc<dyn UsbBackend>,
}

impl DeviceCatalog {
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self { backend }
    }

    /// Open every attached Apple device and keep those accepted by `predicate`
    ///
    /// Rejected devices are closed before this returns.
    pub fn enumerate<P>(&self, predicate: P) -> Result<Vec<Connection>>
    where
        P: Fn(&UsbDeviceDescriptor) -> bool,
    {
        let opened = self
            .backend
            .open_devices(&|vendor_id, _| vendor_id == APPLE_VENDOR_ID)
            .map_err(|e| CaptureError::usb("enumerate devices", e))?;

        let mut accepted = Vec::new();
        for conn in opened {
            if predicate(conn.descriptor()) {
                debug!("Accepted {}", conn.descriptor());
                accepted.push(Connection::from(conn));
            } else {
                debug!("Closing rejected device {}", conn.descriptor());
                drop(conn);
            }
        }

        Ok(accepted)
    }

    /// Descriptor snapshots of every attached iOS device
    pub fn list(&self) -> Result<Vec<UsbDeviceDescriptor>> {
        let devices = self.enumerate(UsbDeviceDescriptor::is_ios_candidate)?;
        debug!("Found {} iOS devices", devices.len());
        Ok(devices.iter().map(|d| d.descriptor().clone()).collect())
    }

    /// Select a device by serial, or the first one when `serial` is empty
    pub fn select_by_serial(&self, serial: &str) -> Result<Connection> {
        let mut devices = self.enumerate(UsbDeviceDescriptor::is_ios_candidate)?;

        if devices.is_empty() {
            return Err(CaptureError::NoDevicesConnected);
        }

        if serial.is_empty() {
            let first = devices.swap_remove(0);
            info!("No udid specified, using '{}'", first.descriptor().serial);
            return Ok(first);
        }

        match devices.iter().position(|d| d.descriptor().serial == serial) {
            Some(index) => Ok(devices.swap_remove(index)),
            None => Err(CaptureError::DeviceNotFound {
                serial: serial.to_string(),
            }),
        }
    }
}

/// Handles from the latest enumeration, keyed by serial
///
/// Renumeration invalidates handles, so the arena is rebuilt from scratch on
/// every poll and a handle is only handed out if its full identity matches.
#[derive(Default)]
pub struct HandleArena {
    handles: HashMap<String, Connection>,
}

impl HandleArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every held handle with a fresh enumeration
    pub fn refresh(&mut self, connections: Vec<Connection>) {
        self.handles.clear();
        for conn in connections {
            let serial = conn.descriptor().serial.clone();
            self.handles.entry(serial).or_insert(conn);
        }
    }

    /// Take the handle for `identity`, discarding it on mismatch
    pub fn take(&mut self, identity: &DeviceIdentity) -> Option<Connection> {
        let conn = self.handles.remove(&identity.serial)?;
        if conn.descriptor().matches(identity) {
            Some(conn)
        } else {
            debug!(
                "Discarding handle for serial {}: identity changed to {}",
                identity.serial,
                conn.descriptor().identity()
            );
            None
        }
    }

    pub fn clear(&mut self) {
        self.handles.clear();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
