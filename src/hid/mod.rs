// SPDX-License-Identifier: GPL-3.0-only
//! USB HID access to the Apple Studio Display
//!
//! The brightness is controlled via a 7-byte HID feature report:
//!
//! ```text
//! Byte 0:     Report ID (0x01)
//! Bytes 1-4:  Brightness value in nits (little-endian u32)
//! Bytes 5-6:  Reserved, written as zero
//! ```
//!
//! The report value is a device-native nits value, not a percentage; the
//! conversion lives in [`crate::brightness`].

mod display;
mod hidapi;
mod manager;

pub use display::{is_device_gone, Display};
pub use manager::{DisplayManager, Enumerator, Opener};
pub use self::hidapi::HidBackend;

use anyhow::Result;

/// USB vendor ID for Apple.
pub const APPLE_VENDOR_ID: u16 = 0x05ac;

/// USB product ID for the Apple Studio Display.
pub const STUDIO_DISPLAY_PRODUCT_ID: u16 = 0x1114;

/// USB interface number that accepts brightness feature reports.
pub const BRIGHTNESS_INTERFACE: i32 = 0x07;

/// HID report ID for brightness control.
pub const REPORT_ID: u8 = 0x01;

/// Total size of the brightness feature report in bytes.
pub const REPORT_SIZE: usize = 7;

/// Information about a candidate display on the bus.
///
/// `serial` is the stable identity and the key in every map; enumeration
/// skips devices with an empty serial since those are in a transitional
/// connect/disconnect state and cannot be reliably re-found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: String,
    pub manufacturer: String,
    pub product: String,
    pub interface: i32,
}

/// Feature-report transport for one opened device.
///
/// Implemented by the hidapi backend and by mock devices in tests. The handle
/// is closed by dropping it.
pub trait FeatureDevice: Send {
    /// Reads a feature report into `buf`; `buf[0]` carries the report ID.
    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Writes the feature report in `data`; `data[0]` carries the report ID.
    fn send_feature_report(&mut self, data: &[u8]) -> Result<()>;
}
