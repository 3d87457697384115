//! Screen mirroring configuration activation
//!
//! Sending the enable request makes the device drop off the bus and come back
//! with an extra configuration carrying the diagnostic interface. Every handle
//! opened before that point is stale, so polling always re-enumerates.

use crate::error::{CaptureError, Result};
use crate::usb::backend::DeviceConnection;
use crate::usb::catalog::{Connection, DeviceCatalog, HandleArena};
use crate::usb::descriptor::{ActivationState, DeviceIdentity};
use crate::usb::transfers::{DISABLE_DIAGNOSTIC_CONFIG, ENABLE_DIAGNOSTIC_CONFIG, send_control};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Polling parameters for the renumeration wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationSettings {
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Drives the hidden configuration enable/disable handshake
pub struct ActivationController {
    catalog: DeviceCatalog,
    settings: ActivationSettings,
    arena: HandleArena,
}

impl ActivationController {
    pub fn new(catalog: DeviceCatalog, settings: ActivationSettings) -> Self {
        Self {
            catalog,
            settings,
            arena: HandleArena::new(),
        }
    }

    pub fn settings(&self) -> ActivationSettings {
        self.settings
    }

    /// Ask the device to expose the screen mirroring configuration
    ///
    /// The device usually disconnects before acknowledging, so failures are
    /// only logged.
    pub fn send_activation_request(conn: &dyn DeviceConnection) {
        let serial = &conn.descriptor().serial;
        match send_control(conn, ENABLE_DIAGNOSTIC_CONFIG) {
            Ok(rc) => debug!("Enabling screen mirroring config for {} RC: {}", serial, rc),
            Err(e) => warn!(
                "Enable request for {} failed ({}), the device usually switches anyway",
                serial, e
            ),
        }
    }

    /// Ask the device to hide the screen mirroring configuration again
    ///
    /// Failures are logged; callers may ignore the result.
    pub fn send_deactivation_request(
        conn: &dyn DeviceConnection,
    ) -> std::result::Result<usize, rusb::Error> {
        let serial = &conn.descriptor().serial;
        let result = send_control(conn, DISABLE_DIAGNOSTIC_CONFIG);
        match &result {
            Ok(rc) => debug!("Disabling screen mirroring config for {} RC: {}", serial, rc),
            Err(e) => warn!("Disable request for {} failed: {}", serial, e),
        }
        result
    }

    /// Re-enumerate until `identity` reappears with the diagnostic configuration
    ///
    /// Performs exactly `max_attempts` enumerations, sleeping the poll
    /// interval before each one.
    pub fn poll_until_active(&mut self, identity: &DeviceIdentity) -> Result<Connection> {
        let max_attempts = self.settings.max_attempts;

        for attempt in 1..=max_attempts {
            thread::sleep(self.settings.poll_interval);
            debug!(
                "Checking for active screen mirroring config for {} ({}/{})",
                identity.serial, attempt, max_attempts
            );

            match self.catalog.enumerate(|d| d.serial == identity.serial) {
                Ok(connections) => self.arena.refresh(connections),
                Err(e) => {
                    // Enumeration commonly fails while the device is off the bus
                    debug!("Enumeration failed during renumeration: {}", e);
                    self.arena.clear();
                    continue;
                }
            }

            let found = self.arena.take(identity);
            self.arena.clear();

            match found {
                Some(conn) if conn.descriptor().activation_state() == ActivationState::QTActive => {
                    info!(
                        "Screen mirroring config for {} active after {} polls",
                        identity.serial, attempt
                    );
                    return Ok(conn);
                }
                Some(conn) => debug!(
                    "{} still reports {:?}",
                    identity.serial,
                    conn.descriptor().activation_state()
                ),
                None => debug!("{} not attached yet", identity.serial),
            }
        }

        warn!("Failed activating screen mirroring config for {}", identity.serial);
        Err(CaptureError::ActivationTimeout {
            serial: identity.serial.clone(),
            attempts: max_attempts,
        })
    }

    /// Make sure `conn`'s device is exposing the screen mirroring configuration
    ///
    /// Returns a handle valid for the active configuration, which is a fresh
    /// one whenever the device had to renumerate.
    pub fn activate(&mut self, conn: Connection) -> Result<Connection> {
        if conn.descriptor().activation_state() == ActivationState::QTActive {
            debug!(
                "Skipping {} because it already has an active screen mirroring config",
                conn.descriptor().serial
            );
            return Ok(conn);
        }

        let identity = conn.descriptor().identity();
        info!("Activating screen mirroring config for {}", identity);
        Self::send_activation_request(conn.as_ref());
        drop(conn);

        self.poll_until_active(&identity)
    }

    /// Hide the screen mirroring configuration if it is exposed
    ///
    /// Returns whether a request was sent.
    pub fn deactivate(&self, conn: &dyn DeviceConnection) -> bool {
        if conn.descriptor().activation_state() != ActivationState::QTActive {
            debug!(
                "{} has no screen mirroring config to disable",
                conn.descriptor().serial
            );
            return false;
        }
        let _ = Self::send_deactivation_request(conn);
        true
    }
}
