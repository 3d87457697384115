//! USB descriptor snapshots and iOS configuration classification
//!
//! A [`UsbDeviceDescriptor`] is captured once per enumeration and never
//! mutated. Re-enumerating a device produces a fresh snapshot; nothing here
//! holds a live handle.

use serde::Serialize;
use std::fmt;

/// Apple Inc. USB vendor ID
pub const APPLE_VENDOR_ID: u16 = 0x05ac;

/// Vendor-specific interface class
pub const VENDOR_SPECIFIC_CLASS: u8 = 0xff;

/// Interface subclass used by the usbmux configuration
pub const MUX_SUBCLASS: u8 = 0xfe;

/// Interface subclass used by the hidden screen mirroring configuration
pub const DIAGNOSTIC_SUBCLASS: u8 = 0x2a;

/// Role of a vendor-specific interface, derived from its subclass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceRole {
    /// usbmux interface, present in normal operation
    MuxManaged,
    /// Screen mirroring interface with the bulk stream endpoints
    Diagnostic,
}

impl InterfaceRole {
    /// Classify an interface by class and subclass code
    pub fn classify(class: u8, subclass: u8) -> Option<Self> {
        if class != VENDOR_SPECIFIC_CLASS {
            return None;
        }
        match subclass {
            MUX_SUBCLASS => Some(InterfaceRole::MuxManaged),
            DIAGNOSTIC_SUBCLASS => Some(InterfaceRole::Diagnostic),
            _ => None,
        }
    }
}

/// Activation state of a device, derived purely from its descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivationState {
    /// Only the usbmux configuration is exposed
    MuxOnly,
    /// The screen mirroring configuration is exposed
    QTActive,
    /// Neither configuration was found
    Unknown,
}

/// Endpoint transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl fmt::Display for EndpointDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointDirection::In => write!(f, "inbound"),
            EndpointDirection::Out => write!(f, "outbound"),
        }
    }
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    /// Direction from bit 7 of the address
    pub fn direction(&self) -> EndpointDirection {
        if self.address & 0x80 != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }
}

/// Alternate setting snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSettingDescriptor {
    pub setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

impl AltSettingDescriptor {
    /// First bulk endpoint in the given direction
    pub fn bulk_endpoint(&self, direction: EndpointDirection) -> Option<u8> {
        self.endpoints
            .iter()
            .find(|ep| ep.kind == EndpointKind::Bulk && ep.direction() == direction)
            .map(|ep| ep.address)
    }
}

/// Interface snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_settings: Vec<AltSettingDescriptor>,
}

impl InterfaceDescriptor {
    /// The default (setting 0) alternate setting
    pub fn default_setting(&self) -> Option<&AltSettingDescriptor> {
        self.alt_settings
            .iter()
            .find(|alt| alt.setting == 0)
            .or_else(|| self.alt_settings.first())
    }

    /// Role of this interface, judged on its default alternate setting
    pub fn role(&self) -> Option<InterfaceRole> {
        self.default_setting()
            .and_then(|alt| InterfaceRole::classify(alt.class, alt.subclass))
    }
}

/// Configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// bConfigurationValue
    pub number: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigDescriptor {
    /// First interface with the given role
    pub fn find_interface(&self, role: InterfaceRole) -> Option<&InterfaceDescriptor> {
        self.interfaces.iter().find(|iface| iface.role() == Some(role))
    }

    pub fn has_role(&self, role: InterfaceRole) -> bool {
        self.find_interface(role).is_some()
    }
}

/// Stable device identity across renumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub serial: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:04x}:{:04x})",
            self.serial, self.vendor_id, self.product_id
        )
    }
}

/// Snapshot of an attached USB device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceDescriptor {
    pub serial: String,
    pub product: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub port_numbers: Vec<u8>,
    pub configs: Vec<ConfigDescriptor>,
}

impl UsbDeviceDescriptor {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            serial: self.serial.clone(),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
        }
    }

    /// Whether this snapshot belongs to `identity`
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.serial == identity.serial
            && self.vendor_id == identity.vendor_id
            && self.product_id == identity.product_id
    }

    /// Configuration exposing usbmux without screen mirroring
    pub fn mux_config(&self) -> Option<u8> {
        self.configs
            .iter()
            .filter(|c| {
                c.has_role(InterfaceRole::MuxManaged) && !c.has_role(InterfaceRole::Diagnostic)
            })
            .map(|c| c.number)
            .last()
    }

    /// Configuration exposing the screen mirroring interface
    pub fn diagnostic_config(&self) -> Option<u8> {
        self.configs
            .iter()
            .filter(|c| c.has_role(InterfaceRole::Diagnostic))
            .map(|c| c.number)
            .last()
    }

    pub fn config(&self, number: u8) -> Option<&ConfigDescriptor> {
        self.configs.iter().find(|c| c.number == number)
    }

    pub fn activation_state(&self) -> ActivationState {
        if self.diagnostic_config().is_some() {
            ActivationState::QTActive
        } else if self.mux_config().is_some() {
            ActivationState::MuxOnly
        } else {
            ActivationState::Unknown
        }
    }

    /// Whether this looks like an iOS device at all
    pub fn is_ios_candidate(&self) -> bool {
        self.activation_state() != ActivationState::Unknown
    }

    /// Human-readable bus location
    pub fn location(&self) -> String {
        let ports = self
            .port_numbers
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(".");
        format!(
            "Bus {:03} Device {:03} Port {} ID {:04x}:{:04x}",
            self.bus,
            self.address,
            if ports.is_empty() { "-" } else { ports.as_str() },
            self.vendor_id,
            self.product_id
        )
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            device_name: self.product.clone(),
            usb_device_info: self.location(),
            udid: self.serial.clone(),
            screen_mirroring_enabled: self.activation_state() == ActivationState::QTActive,
        }
    }
}

impl fmt::Display for UsbDeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' {} serial: {}, state: {:?}",
            self.product,
            self.location(),
            self.serial,
            self.activation_state()
        )
    }
}

/// JSON-ready device listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    #[serde(rename = "deviceName")]
    pub device_name: String,
    pub usb_device_info: String,
    pub udid: String,
    pub screen_mirroring_enabled: bool,
}

/// Output of the `devices` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceList {
    pub devices: Vec<DeviceSummary>,
}

impl DeviceList {
    pub fn new(descriptors: &[UsbDeviceDescriptor]) -> Self {
        Self {
            devices: descriptors.iter().map(UsbDeviceDescriptor::summary).collect(),
        }
    }
}

/// Strip ASCII control characters and DEL from a string descriptor
pub fn sanitize_serial(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_ascii_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(address: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            kind: EndpointKind::Bulk,
            max_packet_size: 512,
        }
    }

    fn vendor_interface(number: u8, subclass: u8, endpoints: Vec<EndpointDescriptor>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            number,
            alt_settings: vec![AltSettingDescriptor {
                setting: 0,
                class: VENDOR_SPECIFIC_CLASS,
                subclass,
                protocol: 0,
                endpoints,
            }],
        }
    }

    fn device(configs: Vec<ConfigDescriptor>) -> UsbDeviceDescriptor {
        UsbDeviceDescriptor {
            serial: "00008030-001A2B3C4D5E6F70".to_string(),
            product: "iPhone".to_string(),
            vendor_id: APPLE_VENDOR_ID,
            product_id: 0x12a8,
            bus: 1,
            address: 7,
            port_numbers: vec![1, 3],
            configs,
        }
    }

    #[test]
    fn test_classify_interface() {
        assert_eq!(
            InterfaceRole::classify(0xff, 0xfe),
            Some(InterfaceRole::MuxManaged)
        );
        assert_eq!(
            InterfaceRole::classify(0xff, 0x2a),
            Some(InterfaceRole::Diagnostic)
        );
        // Subclass tag only counts on vendor-specific interfaces
        assert_eq!(InterfaceRole::classify(0x06, 0x2a), None);
        assert_eq!(InterfaceRole::classify(0xff, 0x01), None);
    }

    #[test]
    fn test_mux_only_state() {
        let dev = device(vec![ConfigDescriptor {
            number: 4,
            interfaces: vec![vendor_interface(1, MUX_SUBCLASS, vec![bulk(0x04), bulk(0x85)])],
        }]);
        assert_eq!(dev.activation_state(), ActivationState::MuxOnly);
        assert_eq!(dev.mux_config(), Some(4));
        assert_eq!(dev.diagnostic_config(), None);
    }

    #[test]
    fn test_qt_active_state() {
        let dev = device(vec![
            ConfigDescriptor {
                number: 4,
                interfaces: vec![vendor_interface(1, MUX_SUBCLASS, vec![])],
            },
            ConfigDescriptor {
                number: 5,
                interfaces: vec![
                    vendor_interface(1, MUX_SUBCLASS, vec![]),
                    vendor_interface(2, DIAGNOSTIC_SUBCLASS, vec![bulk(0x86), bulk(0x05)]),
                ],
            },
        ]);
        assert_eq!(dev.activation_state(), ActivationState::QTActive);
        assert_eq!(dev.mux_config(), Some(4));
        assert_eq!(dev.diagnostic_config(), Some(5));

        let iface = dev
            .config(5)
            .and_then(|c| c.find_interface(InterfaceRole::Diagnostic))
            .unwrap();
        let alt = iface.default_setting().unwrap();
        assert_eq!(alt.bulk_endpoint(EndpointDirection::In), Some(0x86));
        assert_eq!(alt.bulk_endpoint(EndpointDirection::Out), Some(0x05));
    }

    #[test]
    fn test_unknown_state() {
        let dev = device(vec![ConfigDescriptor {
            number: 1,
            interfaces: vec![InterfaceDescriptor {
                number: 0,
                alt_settings: vec![AltSettingDescriptor {
                    setting: 0,
                    class: 0x08,
                    subclass: 0x06,
                    protocol: 0x50,
                    endpoints: vec![],
                }],
            }],
        }]);
        assert_eq!(dev.activation_state(), ActivationState::Unknown);
        assert!(!dev.is_ios_candidate());
    }

    #[test]
    fn test_first_diagnostic_interface_wins() {
        let config = ConfigDescriptor {
            number: 5,
            interfaces: vec![
                vendor_interface(2, DIAGNOSTIC_SUBCLASS, vec![bulk(0x86)]),
                vendor_interface(3, DIAGNOSTIC_SUBCLASS, vec![bulk(0x87)]),
            ],
        };
        assert_eq!(
            config.find_interface(InterfaceRole::Diagnostic).map(|i| i.number),
            Some(2)
        );
    }

    #[test]
    fn test_identity_matching() {
        let dev = device(vec![]);
        let mut identity = dev.identity();
        assert!(dev.matches(&identity));

        identity.product_id = 0x12ab;
        assert!(!dev.matches(&identity));
    }

    #[test]
    fn test_sanitize_serial() {
        assert_eq!(sanitize_serial("abc\u{0}\u{7f}def\n"), "abcdef");
        assert_eq!(sanitize_serial("00008030-001A"), "00008030-001A");
    }

    #[test]
    fn test_summary_json() {
        let dev = device(vec![]);
        let json = serde_json::to_value(dev.summary()).unwrap();
        assert_eq!(json["deviceName"], "iPhone");
        assert_eq!(json["udid"], "00008030-001A2B3C4D5E6F70");
        assert_eq!(json["screen_mirroring_enabled"], false);
        assert!(json["usb_device_info"].as_str().unwrap().contains("Port 1.3"));
    }

    #[test]
    fn test_device_list_json() {
        let json = serde_json::to_value(DeviceList::new(&[device(vec![])])).unwrap();
        assert_eq!(json["devices"].as_array().unwrap().len(), 1);
        assert_eq!(json["devices"][0]["udid"], "00008030-001A2B3C4D5E6F70");

        let empty = serde_json::to_string(&DeviceList::new(&[])).unwrap();
        assert_eq!(empty, r#"{"devices":[]}"#);
    }

    #[test]
    fn test_endpoint_direction() {
        assert_eq!(bulk(0x86).direction(), EndpointDirection::In);
        assert_eq!(bulk(0x05).direction(), EndpointDirection::Out);
    }
}
