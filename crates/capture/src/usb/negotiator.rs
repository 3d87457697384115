//! Diagnostic interface negotiation
//!
//! Turns a device exposing the screen mirroring configuration into a
//! [`NegotiatedSession`]: configuration selected, interface claimed, bulk
//! endpoints resolved and the IN stream running.

use crate::error::{CaptureError, Result};
use crate::usb::catalog::Connection;
use crate::usb::descriptor::{EndpointDirection, InterfaceRole};
use crate::usb::stream::{BulkOut, BulkStream, StreamCloser, StreamSettings, open_bulk_stream};
use crate::usb::transfers::{clear_halt_request, send_control};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Who selects the screen mirroring configuration after renumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTransport {
    /// A host mux daemon switches configuration; only verify it happened
    MuxManaged,
    /// Select the configuration ourselves
    #[default]
    DirectUsb,
}

/// Resolves and claims the diagnostic interface
#[derive(Debug, Clone, Copy)]
pub struct InterfaceNegotiator {
    transport: DeviceTransport,
    stream: StreamSettings,
}

impl InterfaceNegotiator {
    pub fn new(transport: DeviceTransport, stream: StreamSettings) -> Self {
        Self { transport, stream }
    }

    /// Negotiate the streaming session on `conn`
    ///
    /// Anything acquired before a failure is released again before returning.
    pub fn negotiate(&self, conn: Connection) -> Result<NegotiatedSession> {
        let desc = conn.descriptor();
        let not_activated = || CaptureError::NotActivated {
            serial: desc.serial.clone(),
        };

        let config_number = desc.diagnostic_config().ok_or_else(not_activated)?;
        let iface = desc
            .config(config_number)
            .and_then(|c| c.find_interface(InterfaceRole::Diagnostic))
            .ok_or_else(not_activated)?;
        let interface = iface.number;
        debug!("Found screen mirroring interface {} in config {}", interface, config_number);

        let setting = iface.default_setting().ok_or(CaptureError::EndpointUnavailable {
            direction: EndpointDirection::In,
            interface,
        })?;
        let in_endpoint = setting.bulk_endpoint(EndpointDirection::In).ok_or(
            CaptureError::EndpointUnavailable {
                direction: EndpointDirection::In,
                interface,
            },
        )?;
        let out_endpoint = setting.bulk_endpoint(EndpointDirection::Out).ok_or(
            CaptureError::EndpointUnavailable {
                direction: EndpointDirection::Out,
                interface,
            },
        )?;
        debug!("Inbound bulk: {:#04x}, outbound bulk: {:#04x}", in_endpoint, out_endpoint);

        let mut session = NegotiatedSession {
            conn: conn.clone(),
            config: config_number,
            previous_config: None,
            interface,
            claimed: false,
            kernel_driver_detached: false,
            in_endpoint,
            out_endpoint,
            stream: None,
            closer: None,
        };

        if let Err(e) = self.acquire(&mut session) {
            session.release_interface_quietly();
            session.close_configuration_quietly();
            return Err(e);
        }

        info!(
            "Device '{}' USB connection ready",
            session.conn.descriptor().serial
        );
        Ok(session)
    }

    fn acquire(&self, session: &mut NegotiatedSession) -> Result<()> {
        let conn = session.conn.clone();

        let active = conn
            .active_configuration()
            .map_err(|e| CaptureError::usb("read active configuration", e))?;
        debug!("Config is active: {}, screen mirroring config is: {}", active, session.config);

        if active != session.config {
            match self.transport {
                DeviceTransport::MuxManaged => {
                    debug!("Waiting for the mux daemon to select config {}", session.config);
                    return Err(CaptureError::TransientUsb {
                        operation: "select configuration",
                        source: rusb::Error::Busy,
                    });
                }
                DeviceTransport::DirectUsb => {
                    conn.set_active_configuration(session.config)
                        .map_err(|e| CaptureError::usb("select configuration", e))?;
                    session.previous_config = Some(active);
                    info!("Selected config {} (was {})", session.config, active);
                }
            }
        }

        for endpoint in [session.in_endpoint, session.out_endpoint] {
            match send_control(conn.as_ref(), clear_halt_request(endpoint)) {
                Ok(rc) => debug!("Clear feature on {:#04x} RC: {}", endpoint, rc),
                Err(e) => debug!("Clear feature on {:#04x} failed: {}", endpoint, e),
            }
        }

        match conn.kernel_driver_active(session.interface) {
            Ok(true) => {
                conn.detach_kernel_driver(session.interface)
                    .map_err(|e| CaptureError::usb("detach kernel driver", e))?;
                session.kernel_driver_detached = true;
                debug!("Detached kernel driver from interface {}", session.interface);
            }
            Ok(false) => {}
            Err(e) => debug!("Kernel driver query not available: {}", e),
        }

        conn.claim_interface(session.interface)
            .map_err(|e| CaptureError::usb("claim interface", e))?;
        session.claimed = true;
        debug!("Claimed interface {}", session.interface);

        let (stream, closer) = open_bulk_stream(conn, session.in_endpoint, self.stream)?;
        session.stream = Some(stream);
        session.closer = Some(closer);
        Ok(())
    }
}

/// Claimed diagnostic interface with its running IN stream
///
/// Resources are released in reverse acquisition order by the teardown
/// methods, each of which is idempotent.
pub struct NegotiatedSession {
    conn: Connection,
    config: u8,
    previous_config: Option<u8>,
    interface: u8,
    claimed: bool,
    kernel_driver_detached: bool,
    in_endpoint: u8,
    out_endpoint: u8,
    stream: Option<BulkStream>,
    closer: Option<StreamCloser>,
}

impl NegotiatedSession {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> u8 {
        self.config
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    pub fn in_endpoint(&self) -> u8 {
        self.in_endpoint
    }

    pub fn out_endpoint(&self) -> u8 {
        self.out_endpoint
    }

    /// Hand the IN stream to its reader; only the first call returns it
    pub fn take_stream(&mut self) -> Option<BulkStream> {
        self.stream.take()
    }

    /// Writer for the OUT endpoint
    pub fn bulk_out(&self) -> BulkOut {
        BulkOut::new(self.conn.clone(), self.out_endpoint)
    }

    /// Stop the IN stream
    pub fn close_stream(&mut self) -> Result<()> {
        self.stream = None;
        match self.closer.take() {
            Some(mut closer) => closer.close(),
            None => Ok(()),
        }
    }

    /// Release the interface and hand it back to the kernel driver
    pub fn release_interface(&mut self) -> Result<()> {
        let mut result = Ok(());

        if self.claimed {
            self.claimed = false;
            info!("Releasing interface {}", self.interface);
            if let Err(e) = self.conn.release_interface(self.interface) {
                result = Err(CaptureError::usb("release interface", e));
            }
        }

        if self.kernel_driver_detached {
            self.kernel_driver_detached = false;
            if let Err(e) = self.conn.attach_kernel_driver(self.interface) {
                warn!("Failed reattaching kernel driver to interface {}: {}", self.interface, e);
            }
        }

        result
    }

    /// Give up the screen mirroring configuration
    ///
    /// Restores the configuration that was active before negotiation if this
    /// session switched it.
    pub fn close_configuration(&mut self) -> Result<()> {
        match self.previous_config.take() {
            Some(previous) => {
                info!("Restoring config {}", previous);
                self.conn
                    .set_active_configuration(previous)
                    .map_err(|e| CaptureError::usb("restore configuration", e))
            }
            None => {
                debug!("Closing config {}", self.config);
                Ok(())
            }
        }
    }

    fn release_interface_quietly(&mut self) {
        if let Err(e) = self.release_interface() {
            warn!("Error releasing interface after failed negotiation: {}", e);
        }
    }

    fn close_configuration_quietly(&mut self) {
        if let Err(e) = self.close_configuration() {
            warn!("Error closing config after failed negotiation: {}", e);
        }
    }
}

impl std::fmt::Debug for NegotiatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedSession")
            .field("serial", &self.conn.descriptor().serial)
            .field("config", &self.config)
            .field("interface", &self.interface)
            .field("in_endpoint", &self.in_endpoint)
            .field("out_endpoint", &self.out_endpoint)
            .field("claimed", &self.claimed)
            .finish()
    }
}

impl Drop for NegotiatedSession {
    fn drop(&mut self) {
        if let Err(e) = self.close_stream() {
            warn!("Error closing bulk stream on drop: {}", e);
        }
        self.release_interface_quietly();
        self.close_configuration_quietly();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeUsbBackend, UsbEvent, mux_only_device, qt_active_device, qt_device_with_endpoints,
    };
    use crate::usb::catalog::DeviceCatalog;
    use std::sync::Arc;
    use std::time::Duration;

    fn negotiator(transport: DeviceTransport) -> InterfaceNegotiator {
        InterfaceNegotiator::new(
            transport,
            StreamSettings {
                poll_timeout: Duration::from_millis(5),
                ..StreamSettings::default()
            },
        )
    }

    fn open(backend: &FakeUsbBackend) -> Connection {
        DeviceCatalog::new(Arc::new(backend.clone()))
            .select_by_serial("")
            .unwrap()
    }

    #[test]
    fn test_negotiate_resolves_endpoints() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        let mut session = negotiator(DeviceTransport::DirectUsb)
            .negotiate(open(&backend))
            .unwrap();

        assert_eq!(session.in_endpoint(), 0x86);
        assert_eq!(session.out_endpoint(), 0x05);
        assert_eq!(session.interface(), 2);
        assert!(session.take_stream().is_some());
        assert!(session.take_stream().is_none());

        let events = backend.events();
        let halt_in = UsbEvent::Control {
            serial: "AAA".to_string(),
            request: clear_halt_request(0x86),
        };
        let halt_out = UsbEvent::Control {
            serial: "AAA".to_string(),
            request: clear_halt_request(0x05),
        };
        let claim = UsbEvent::Claim {
            serial: "AAA".to_string(),
            interface: 2,
        };
        let pos = |e: &UsbEvent| events.iter().position(|x| x == e).unwrap();
        assert!(pos(&halt_in) < pos(&claim));
        assert!(pos(&halt_out) < pos(&claim));
    }

    #[test]
    fn test_negotiate_rejects_mux_only() {
        let backend = FakeUsbBackend::new(vec![mux_only_device("AAA")]);
        let err = negotiator(DeviceTransport::DirectUsb)
            .negotiate(open(&backend))
            .unwrap_err();
        assert!(matches!(err, CaptureError::NotActivated { .. }));
    }

    #[test]
    fn test_missing_out_endpoint() {
        let backend = FakeUsbBackend::new(vec![qt_device_with_endpoints("AAA", &[0x86])]);
        let err = negotiator(DeviceTransport::DirectUsb)
            .negotiate(open(&backend))
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::EndpointUnavailable {
                direction: EndpointDirection::Out,
                interface: 2
            }
        ));
        assert!(!backend.events().iter().any(|e| matches!(e, UsbEvent::Claim { .. })));
    }

    #[test]
    fn test_direct_usb_selects_and_restores_config() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        backend.set_active_config("AAA", 4);

        let mut session = negotiator(DeviceTransport::DirectUsb)
            .negotiate(open(&backend))
            .unwrap();
        assert_eq!(backend.active_config("AAA"), Some(5));

        session.close_stream().unwrap();
        session.release_interface().unwrap();
        session.close_configuration().unwrap();
        assert_eq!(backend.active_config("AAA"), Some(4));
    }

    #[test]
    fn test_mux_managed_waits_for_daemon() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        backend.set_active_config("AAA", 4);

        let err = negotiator(DeviceTransport::MuxManaged)
            .negotiate(open(&backend))
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.active_config("AAA"), Some(4));
    }

    #[test]
    fn test_claim_failure_reattaches_driver() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        backend.set_kernel_driver_active("AAA", true);
        backend.fail_claim(rusb::Error::Busy);

        let err = negotiator(DeviceTransport::DirectUsb)
            .negotiate(open(&backend))
            .unwrap_err();
        assert!(err.is_retryable());

        let events = backend.events();
        assert!(events.contains(&UsbEvent::DetachKernelDriver {
            serial: "AAA".to_string(),
            interface: 2
        }));
        assert!(events.contains(&UsbEvent::AttachKernelDriver {
            serial: "AAA".to_string(),
            interface: 2
        }));
        assert!(!events.iter().any(|e| matches!(e, UsbEvent::Release { .. })));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let backend = FakeUsbBackend::new(vec![qt_active_device("AAA")]);
        let mut session = negotiator(DeviceTransport::DirectUsb)
            .negotiate(open(&backend))
            .unwrap();

        session.release_interface().unwrap();
        session.release_interface().unwrap();
        drop(session);

        let releases = backend
            .events()
            .into_iter()
            .filter(|e| matches!(e, UsbEvent::Release { .. }))
            .count();
        assert_eq!(releases, 1);
    }
}
