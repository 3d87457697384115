//! Control requests
//!
//! Bit-exact vendor and standard control transfers used to switch the hidden
//! screen mirroring configuration and to clear endpoint halts.

use crate::usb::backend::DeviceConnection;
use std::time::Duration;
use tracing::debug;

/// Timeout for control transfers
///
/// The device drops off the bus while acknowledging the activation request,
/// so this is kept short.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// A host-to-device control request without a data stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Vendor request exposing the screen mirroring configuration
pub const ENABLE_DIAGNOSTIC_CONFIG: ControlRequest = ControlRequest {
    request_type: 0x40,
    request: 0x52,
    value: 0x02,
    index: 0x00,
};

/// Vendor request hiding the screen mirroring configuration again
pub const DISABLE_DIAGNOSTIC_CONFIG: ControlRequest = ControlRequest {
    request_type: 0x40,
    request: 0x52,
    value: 0x00,
    index: 0x00,
};

/// Standard CLEAR_FEATURE(ENDPOINT_HALT) aimed at `endpoint`
pub fn clear_halt_request(endpoint: u8) -> ControlRequest {
    ControlRequest {
        request_type: 0x02,
        request: 0x01,
        value: 0x00,
        index: endpoint as u16,
    }
}

/// Send a control request with an empty data stage
pub fn send_control(
    conn: &dyn DeviceConnection,
    req: ControlRequest,
) -> Result<usize, rusb::Error> {
    debug!(
        "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}",
        req.request_type, req.request, req.value, req.index
    );

    let result = conn.write_control(
        req.request_type,
        req.request,
        req.value,
        req.index,
        &[],
        CONTROL_TIMEOUT,
    );

    match &result {
        Ok(rc) => debug!("Control transfer RC: {}", rc),
        Err(e) => debug!("Control transfer failed: {}", e),
    }
    result
}
