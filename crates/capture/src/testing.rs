//! Test utilities for the capture pipeline
//!
//! Provides a scripted [`UsbBackend`], canned iOS device descriptors and a
//! frame-collecting consumer, so catalog, activation and session behaviour can
//! be exercised without hardware.
//!
//! # Example
//!
//! ```
//! use capture::testing::{FakeUsbBackend, mux_only_device, qt_active_device};
//! use capture::usb::DeviceCatalog;
//! use std::sync::Arc;
//!
//! // Device renumerates into the screen mirroring config on the second scan
//! let backend = FakeUsbBackend::scripted(vec![
//!     vec![mux_only_device("00008030")],
//!     vec![qt_active_device("00008030")],
//! ]);
//! let catalog = DeviceCatalog::new(Arc::new(backend.clone()));
//!
//! let first = catalog.list().unwrap();
//! let second = catalog.list().unwrap();
//! assert!(!first[0].summary().screen_mirroring_enabled);
//! assert!(second[0].summary().screen_mirroring_enabled);
//! ```

use crate::consumer::FrameConsumer;
use crate::usb::backend::{DeviceConnection, UsbBackend};
use crate::usb::descriptor::{
    APPLE_VENDOR_ID, AltSettingDescriptor, ConfigDescriptor, DIAGNOSTIC_SUBCLASS,
    EndpointDescriptor, EndpointKind, InterfaceDescriptor, MUX_SUBCLASS, UsbDeviceDescriptor,
    VENDOR_SPECIFIC_CLASS,
};
use crate::usb::transfers::ControlRequest;
use protocol::ProtocolFrame;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Product ID used by the canned devices
pub const FAKE_PRODUCT_ID: u16 = 0x12a8;

/// Longest a fake bulk read blocks when nothing is queued
const IDLE_READ_LIMIT: Duration = Duration::from_millis(5);

/// Host-visible USB operation recorded by [`FakeUsbBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbEvent {
    Enumerate,
    Open { serial: String },
    Close { serial: String },
    Control { serial: String, request: ControlRequest },
    SetConfiguration { serial: String, config: u8 },
    DetachKernelDriver { serial: String, interface: u8 },
    AttachKernelDriver { serial: String, interface: u8 },
    Claim { serial: String, interface: u8 },
    Release { serial: String, interface: u8 },
    BulkWrite { serial: String, endpoint: u8, len: usize },
}

#[derive(Default)]
struct FakeState {
    /// Device sets for upcoming enumerations; the last one repeats
    script: VecDeque<Vec<UsbDeviceDescriptor>>,
    enumerations: usize,
    enumeration_failures: VecDeque<rusb::Error>,
    events: Vec<UsbEvent>,
    open_handles: usize,
    initial_configs: HashMap<String, u8>,
    active_configs: HashMap<String, u8>,
    kernel_drivers: HashMap<String, bool>,
    claim_attempts: usize,
    claim_failures: VecDeque<rusb::Error>,
    release_failures: VecDeque<rusb::Error>,
    control_failures: VecDeque<rusb::Error>,
    bulk_in: VecDeque<Result<Vec<u8>, rusb::Error>>,
    bulk_out_failures: VecDeque<rusb::Error>,
}

/// Scripted in-memory USB backend
///
/// Clones share state, so a test keeps one clone for inspection and hands
/// another to the code under test.
#[derive(Clone, Default)]
pub struct FakeUsbBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeUsbBackend {
    /// Backend whose device set never changes
    pub fn new(devices: Vec<UsbDeviceDescriptor>) -> Self {
        Self::scripted(vec![devices])
    }

    /// Backend returning one device set per enumeration
    pub fn scripted(sets: Vec<Vec<UsbDeviceDescriptor>>) -> Self {
        let backend = Self::default();
        backend.lock().script = sets.into();
        backend
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` enumerations with `err`
    pub fn fail_next_enumerations(&self, count: usize, err: rusb::Error) {
        let mut state = self.lock();
        for _ in 0..count {
            state.enumeration_failures.push_back(err);
        }
    }

    /// Fail the next interface claim
    pub fn fail_claim(&self, err: rusb::Error) {
        self.lock().claim_failures.push_back(err);
    }

    /// Fail the next interface release
    pub fn fail_release(&self, err: rusb::Error) {
        self.lock().release_failures.push_back(err);
    }

    /// Fail the next control transfer
    pub fn fail_control(&self, err: rusb::Error) {
        self.lock().control_failures.push_back(err);
    }

    /// Fail the next bulk write
    pub fn fail_bulk_out(&self, err: rusb::Error) {
        self.lock().bulk_out_failures.push_back(err);
    }

    /// Queue one completed bulk IN transfer
    pub fn push_bulk_in(&self, chunk: Vec<u8>) {
        self.lock().bulk_in.push_back(Ok(chunk));
    }

    /// Queue a failed bulk IN transfer
    pub fn fail_bulk_in(&self, err: rusb::Error) {
        self.lock().bulk_in.push_back(Err(err));
    }

    /// Configuration reported as active when `serial` is next opened
    pub fn set_active_config(&self, serial: &str, config: u8) {
        let mut state = self.lock();
        state.initial_configs.insert(serial.to_string(), config);
        state.active_configs.insert(serial.to_string(), config);
    }

    /// Configuration last reported or selected for `serial`
    pub fn active_config(&self, serial: &str) -> Option<u8> {
        self.lock().active_configs.get(serial).copied()
    }

    pub fn set_kernel_driver_active(&self, serial: &str, active: bool) {
        self.lock().kernel_drivers.insert(serial.to_string(), active);
    }

    pub fn events(&self) -> Vec<UsbEvent> {
        self.lock().events.clone()
    }

    /// Forget recorded events; counters are kept
    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    /// Control requests sent so far, in order
    pub fn control_requests(&self) -> Vec<ControlRequest> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                UsbEvent::Control { request, .. } => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// Enumerations attempted, including failed ones
    pub fn enumerations(&self) -> usize {
        self.lock().enumerations
    }

    /// Connections currently open
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    /// Interface claims attempted, including failed ones
    pub fn claim_attempts(&self) -> usize {
        self.lock().claim_attempts
    }
}

impl UsbBackend for FakeUsbBackend {
    fn open_devices(
        &self,
        prefilter: &dyn Fn(u16, u16) -> bool,
    ) -> Result<Vec<Box<dyn DeviceConnection>>, rusb::Error> {
        let mut state = self.lock();
        state.enumerations += 1;
        state.events.push(UsbEvent::Enumerate);

        if let Some(err) = state.enumeration_failures.pop_front() {
            return Err(err);
        }

        let devices = if state.script.len() > 1 {
            state.script.pop_front().unwrap_or_default()
        } else {
            state.script.front().cloned().unwrap_or_default()
        };

        let mut opened: Vec<Box<dyn DeviceConnection>> = Vec::new();
        for descriptor in devices {
            if !prefilter(descriptor.vendor_id, descriptor.product_id) {
                continue;
            }

            let serial = descriptor.serial.clone();
            let active = state
                .initial_configs
                .get(&serial)
                .copied()
                .or_else(|| descriptor.diagnostic_config())
                .or_else(|| descriptor.mux_config())
                .or_else(|| descriptor.configs.first().map(|c| c.number))
                .unwrap_or(1);
            state.active_configs.insert(serial.clone(), active);
            state.open_handles += 1;
            state.events.push(UsbEvent::Open {
                serial: serial.clone(),
            });

            opened.push(Box::new(FakeConnection {
                backend: self.clone(),
                descriptor,
            }));
        }

        Ok(opened)
    }
}

/// Connection handed out by [`FakeUsbBackend`]
pub struct FakeConnection {
    backend: FakeUsbBackend,
    descriptor: UsbDeviceDescriptor,
}

impl FakeConnection {
    fn serial(&self) -> String {
        self.descriptor.serial.clone()
    }

    fn record(&self, event: UsbEvent) {
        self.backend.lock().events.push(event);
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        let mut state = self.backend.lock();
        state.open_handles = state.open_handles.saturating_sub(1);
        state.events.push(UsbEvent::Close {
            serial: self.descriptor.serial.clone(),
        });
    }
}

impl DeviceConnection for FakeConnection {
    fn descriptor(&self) -> &UsbDeviceDescriptor {
        &self.descriptor
    }

    fn active_configuration(&self) -> Result<u8, rusb::Error> {
        self.backend
            .lock()
            .active_configs
            .get(&self.descriptor.serial)
            .copied()
            .ok_or(rusb::Error::NoDevice)
    }

    fn set_active_configuration(&self, config: u8) -> Result<(), rusb::Error> {
        if self.descriptor.config(config).is_none() {
            return Err(rusb::Error::NotFound);
        }
        let mut state = self.backend.lock();
        state.active_configs.insert(self.serial(), config);
        state.events.push(UsbEvent::SetConfiguration {
            serial: self.serial(),
            config,
        });
        Ok(())
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.backend.lock();
        state.events.push(UsbEvent::Control {
            serial: self.serial(),
            request: ControlRequest {
                request_type,
                request,
                value,
                index,
            },
        });
        match state.control_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(data.len()),
        }
    }

    fn kernel_driver_active(&self, _interface: u8) -> Result<bool, rusb::Error> {
        Ok(self
            .backend
            .lock()
            .kernel_drivers
            .get(&self.descriptor.serial)
            .copied()
            .unwrap_or(false))
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        let mut state = self.backend.lock();
        state.kernel_drivers.insert(self.serial(), false);
        state.events.push(UsbEvent::DetachKernelDriver {
            serial: self.serial(),
            interface,
        });
        Ok(())
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        let mut state = self.backend.lock();
        state.kernel_drivers.insert(self.serial(), true);
        state.events.push(UsbEvent::AttachKernelDriver {
            serial: self.serial(),
            interface,
        });
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        let mut state = self.backend.lock();
        state.claim_attempts += 1;
        if let Some(err) = state.claim_failures.pop_front() {
            return Err(err);
        }
        state.events.push(UsbEvent::Claim {
            serial: self.serial(),
            interface,
        });
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        let mut state = self.backend.lock();
        state.events.push(UsbEvent::Release {
            serial: self.serial(),
            interface,
        });
        match state.release_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn read_bulk(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let next = self.backend.lock().bulk_in.pop_front();
        match next {
            Some(Ok(mut chunk)) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    let rest = chunk.split_off(n);
                    self.backend.lock().bulk_in.push_front(Ok(rest));
                }
                Ok(n)
            }
            Some(Err(err)) => Err(err),
            None => {
                thread::sleep(timeout.min(IDLE_READ_LIMIT));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, rusb::Error> {
        let mut state = self.backend.lock();
        if let Some(err) = state.bulk_out_failures.pop_front() {
            return Err(err);
        }
        state.events.push(UsbEvent::BulkWrite {
            serial: self.serial(),
            endpoint,
            len: data.len(),
        });
        Ok(data.len())
    }
}

fn bulk(address: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        kind: EndpointKind::Bulk,
        max_packet_size: 512,
    }
}

fn vendor_interface(number: u8, subclass: u8, endpoints: &[u8]) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alt_settings: vec![AltSettingDescriptor {
            setting: 0,
            class: VENDOR_SPECIFIC_CLASS,
            subclass,
            protocol: 0,
            endpoints: endpoints.iter().copied().map(bulk).collect(),
        }],
    }
}

fn ptp_interface() -> InterfaceDescriptor {
    InterfaceDescriptor {
        number: 0,
        alt_settings: vec![AltSettingDescriptor {
            setting: 0,
            class: 0x06,
            subclass: 0x01,
            protocol: 0x01,
            endpoints: vec![bulk(0x81), bulk(0x02)],
        }],
    }
}

fn mux_config() -> ConfigDescriptor {
    ConfigDescriptor {
        number: 4,
        interfaces: vec![ptp_interface(), vendor_interface(1, MUX_SUBCLASS, &[0x04, 0x85])],
    }
}

fn iphone(serial: &str, configs: Vec<ConfigDescriptor>) -> UsbDeviceDescriptor {
    UsbDeviceDescriptor {
        serial: serial.to_string(),
        product: "iPhone".to_string(),
        vendor_id: APPLE_VENDOR_ID,
        product_id: FAKE_PRODUCT_ID,
        bus: 1,
        address: 7,
        port_numbers: vec![1, 2],
        configs,
    }
}

/// iOS device in normal operation: usbmux configuration only
pub fn mux_only_device(serial: &str) -> UsbDeviceDescriptor {
    iphone(serial, vec![mux_config()])
}

/// iOS device exposing the screen mirroring configuration 5 (IN 0x86, OUT 0x05)
pub fn qt_active_device(serial: &str) -> UsbDeviceDescriptor {
    qt_device_with_endpoints(serial, &[0x86, 0x05])
}

/// Like [`qt_active_device`] with custom diagnostic bulk endpoints
pub fn qt_device_with_endpoints(serial: &str, endpoints: &[u8]) -> UsbDeviceDescriptor {
    let diagnostic = ConfigDescriptor {
        number: 5,
        interfaces: vec![
            ptp_interface(),
            vendor_interface(1, MUX_SUBCLASS, &[0x04, 0x85]),
            vendor_interface(2, DIAGNOSTIC_SUBCLASS, endpoints),
        ],
    };
    iphone(serial, vec![mux_config(), diagnostic])
}

/// A non-Apple device
pub fn non_ios_device(serial: &str) -> UsbDeviceDescriptor {
    UsbDeviceDescriptor {
        serial: serial.to_string(),
        product: "Printer".to_string(),
        vendor_id: 0x04f9,
        product_id: 0x0042,
        bus: 1,
        address: 3,
        port_numbers: vec![3],
        configs: vec![ConfigDescriptor {
            number: 1,
            interfaces: vec![InterfaceDescriptor {
                number: 0,
                alt_settings: vec![AltSettingDescriptor {
                    setting: 0,
                    class: 0x07,
                    subclass: 0x01,
                    protocol: 0x02,
                    endpoints: vec![bulk(0x01), bulk(0x82)],
                }],
            }],
        }],
    }
}

#[derive(Default)]
struct Collected {
    payloads: Vec<Vec<u8>>,
    closes: usize,
}

/// Consumer recording every frame it is handed
pub struct CollectingConsumer {
    collected: Arc<Mutex<Collected>>,
}

impl CollectingConsumer {
    /// Create a consumer and the handle used to inspect what it received
    pub fn new() -> (Self, CollectedFrames) {
        let collected = Arc::new(Mutex::new(Collected::default()));
        (
            Self {
                collected: collected.clone(),
            },
            CollectedFrames { collected },
        )
    }
}

impl FrameConsumer for CollectingConsumer {
    fn consume(&mut self, frame: ProtocolFrame) -> anyhow::Result<()> {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .payloads
            .push(frame.payload().to_vec());
        Ok(())
    }

    fn close_session(&mut self) {
        self.collected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closes += 1;
    }
}

/// Inspection handle for a [`CollectingConsumer`]
#[derive(Clone)]
pub struct CollectedFrames {
    collected: Arc<Mutex<Collected>>,
}

impl CollectedFrames {
    fn lock(&self) -> MutexGuard<'_, Collected> {
        self.collected.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.lock().payloads.clone()
    }

    /// Number of close-session notifications received
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Wait until at least `count` frames arrived
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.lock().payloads.len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.lock().payloads.len() >= count
    }
}
