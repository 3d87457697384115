//! Host USB backend
//!
//! [`UsbBackend`] and [`DeviceConnection`] are the seam between the capture
//! pipeline and libusb. The production implementation wraps `rusb`; tests
//! substitute a scripted backend from [`crate::testing`].

use crate::usb::descriptor::{
    AltSettingDescriptor, ConfigDescriptor, EndpointDescriptor, EndpointKind, InterfaceDescriptor,
    UsbDeviceDescriptor, sanitize_serial,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for string descriptor reads during enumeration
const STRING_TIMEOUT: Duration = Duration::from_secs(1);

/// Source of attached USB devices
pub trait UsbBackend: Send + Sync {
    /// Open every attached device whose vendor/product IDs pass `prefilter`
    ///
    /// Devices rejected by the prefilter are never opened. Devices that fail to
    /// open are skipped; an error is returned only if the device list itself
    /// cannot be read.
    fn open_devices(
        &self,
        prefilter: &dyn Fn(u16, u16) -> bool,
    ) -> Result<Vec<Box<dyn DeviceConnection>>, rusb::Error>;
}

/// An opened device
///
/// Dropping the connection closes the underlying handle.
pub trait DeviceConnection: Send + Sync {
    /// Descriptor snapshot taken when the device was opened
    fn descriptor(&self) -> &UsbDeviceDescriptor;

    fn active_configuration(&self) -> Result<u8, rusb::Error>;

    fn set_active_configuration(&self, config: u8) -> Result<(), rusb::Error>;

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error>;

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error>;

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error>;

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error>;

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> Result<usize, rusb::Error>;

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, rusb::Error>;
}

/// libusb backend
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        debug!("Opened libusb context");
        Ok(Self { context })
    }
}

impl UsbBackend for RusbBackend {
    fn open_devices(
        &self,
        prefilter: &dyn Fn(u16, u16) -> bool,
    ) -> Result<Vec<Box<dyn DeviceConnection>>, rusb::Error> {
        let devices = self.context.devices()?;
        let mut opened: Vec<Box<dyn DeviceConnection>> = Vec::new();

        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device bus={} addr={}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if !prefilter(desc.vendor_id(), desc.product_id()) {
                continue;
            }

            match RusbConnection::open(device) {
                Ok(conn) => opened.push(Box::new(conn)),
                Err(e) => warn!(
                    "Failed to open device {:04x}:{:04x}: {}",
                    desc.vendor_id(),
                    desc.product_id(),
                    e
                ),
            }
        }

        debug!("Opened {} devices", opened.len());
        Ok(opened)
    }
}

/// Opened libusb device with its descriptor tree
///
/// Mutating handle operations take the write lock; transfers share the read
/// lock so the bulk pump and the control path can run side by side.
pub struct RusbConnection {
    handle: RwLock<DeviceHandle<Context>>,
    descriptor: UsbDeviceDescriptor,
}

impl RusbConnection {
    fn open(device: Device<Context>) -> Result<Self, rusb::Error> {
        let desc = device.device_descriptor()?;
        let handle = device.open()?;

        let serial = desc
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .or_else(|| read_string_with_language(&handle, |lang| {
                handle.read_serial_number_string(lang, &desc, STRING_TIMEOUT)
            }))
            .map(|s| sanitize_serial(&s))
            .unwrap_or_default();

        let product = desc
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
            .unwrap_or_default();

        let mut configs = Vec::with_capacity(desc.num_configurations() as usize);
        for index in 0..desc.num_configurations() {
            match device.config_descriptor(index) {
                Ok(config) => configs.push(map_config(&config)),
                Err(e) => debug!("Could not read config descriptor {}: {}", index, e),
            }
        }

        let descriptor = UsbDeviceDescriptor {
            serial,
            product,
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            bus: device.bus_number(),
            address: device.address(),
            port_numbers: device.port_numbers().unwrap_or_default(),
            configs,
        };

        debug!("Opened {}", descriptor);

        Ok(Self {
            handle: RwLock::new(handle),
            descriptor,
        })
    }

    fn with_handle<T>(
        &self,
        f: impl FnOnce(&DeviceHandle<Context>) -> Result<T, rusb::Error>,
    ) -> Result<T, rusb::Error> {
        let handle = self.handle.read().map_err(|_| rusb::Error::Other)?;
        f(&handle)
    }

    fn with_handle_mut<T>(
        &self,
        f: impl FnOnce(&mut DeviceHandle<Context>) -> Result<T, rusb::Error>,
    ) -> Result<T, rusb::Error> {
        let mut handle = self.handle.write().map_err(|_| rusb::Error::Other)?;
        f(&mut handle)
    }
}

impl DeviceConnection for RusbConnection {
    fn descriptor(&self) -> &UsbDeviceDescriptor {
        &self.descriptor
    }

    fn active_configuration(&self) -> Result<u8, rusb::Error> {
        self.with_handle(|h| h.active_configuration())
    }

    fn set_active_configuration(&self, config: u8) -> Result<(), rusb::Error> {
        self.with_handle_mut(|h| h.set_active_configuration(config))
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.with_handle(|h| h.write_control(request_type, request, value, index, data, timeout))
    }

    fn kernel_driver_active(&self, interface: u8) -> Result<bool, rusb::Error> {
        self.with_handle(|h| h.kernel_driver_active(interface))
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        self.with_handle_mut(|h| h.detach_kernel_driver(interface))
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), rusb::Error> {
        self.with_handle_mut(|h| h.attach_kernel_driver(interface))
    }

    fn claim_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        self.with_handle_mut(|h| h.claim_interface(interface))
    }

    fn release_interface(&self, interface: u8) -> Result<(), rusb::Error> {
        self.with_handle_mut(|h| h.release_interface(interface))
    }

    fn read_bulk(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.with_handle(|h| h.read_bulk(endpoint, buf, timeout))
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, rusb::Error> {
        self.with_handle(|h| h.write_bulk(endpoint, data, timeout))
    }
}

/// Read a string descriptor using the device's first supported language
fn read_string_with_language(
    handle: &DeviceHandle<Context>,
    read: impl FnOnce(rusb::Language) -> Result<String, rusb::Error>,
) -> Option<String> {
    let languages = handle.read_languages(STRING_TIMEOUT).ok()?;
    let lang = *languages.first()?;
    read(lang).ok()
}

fn map_config(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    let interfaces = config
        .interfaces()
        .map(|iface| InterfaceDescriptor {
            number: iface.number(),
            alt_settings: iface
                .descriptors()
                .map(|alt| AltSettingDescriptor {
                    setting: alt.setting_number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                    endpoints: alt
                        .endpoint_descriptors()
                        .map(|ep| EndpointDescriptor {
                            address: ep.address(),
                            kind: map_transfer_type(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect(),
                })
                .collect(),
        })
        .collect();

    ConfigDescriptor {
        number: config.number(),
        interfaces,
    }
}

fn map_transfer_type(kind: rusb::TransferType) -> EndpointKind {
    match kind {
        rusb::TransferType::Control => EndpointKind::Control,
        rusb::TransferType::Isochronous => EndpointKind::Isochronous,
        rusb::TransferType::Bulk => EndpointKind::Bulk,
        rusb::TransferType::Interrupt => EndpointKind::Interrupt,
    }
}
