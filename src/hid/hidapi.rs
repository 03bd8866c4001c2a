// SPDX-License-Identifier: GPL-3.0-only
//! hidapi-backed enumerator and opener
//!
//! A single `HidApi` instance is shared for the lifetime of the process and
//! re-scanned before every enumeration or open. Both capabilities are handed
//! to the [`DisplayManager`](super::DisplayManager) as plain closures.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use hidapi::{HidApi, HidDevice};

use crate::error::Error;

use super::{
    DeviceInfo, Enumerator, FeatureDevice, Opener, APPLE_VENDOR_ID, BRIGHTNESS_INTERFACE,
    STUDIO_DISPLAY_PRODUCT_ID,
};

/// Shared hidapi handle producing the manager's enumerator and opener.
pub struct HidBackend {
    api: Mutex<HidApi>,
}

impl HidBackend {
    pub fn new() -> Result<Self> {
        let api = HidApi::new().context("failed to initialize HID API")?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }

    /// Lists all Studio Display brightness interfaces currently on the bus.
    ///
    /// Devices with an empty serial number are skipped; they are in a
    /// transitional connect/disconnect state and cannot be reliably re-found.
    pub fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let mut api = self.api.lock().unwrap();
        api.refresh_devices()
            .context("failed to enumerate HID devices")?;

        let displays: Vec<DeviceInfo> = api
            .device_list()
            .filter(|device| is_brightness_interface(device))
            .filter_map(|device| {
                if device.serial_number().unwrap_or("").is_empty() {
                    debug!(path = ?device.path(), "skipping display with empty serial");
                    return None;
                }
                Some(to_device_info(device))
            })
            .collect();

        for info in &displays {
            debug!(
                vendor_id = %format!("{:#06x}", info.vendor_id),
                product_id = %format!("{:#06x}", info.product_id),
                interface = info.interface,
                serial = %info.serial,
                manufacturer = %info.manufacturer,
                path = %info.path,
                "found Studio Display brightness interface"
            );
        }

        Ok(displays)
    }

    /// Opens the brightness interface of the display with the given serial.
    pub fn open(&self, serial: &str) -> Result<Box<dyn FeatureDevice>> {
        let mut api = self.api.lock().unwrap();
        api.refresh_devices()
            .context("failed to enumerate HID devices")?;

        let target = api
            .device_list()
            .find(|device| {
                is_brightness_interface(device) && device.serial_number() == Some(serial)
            })
            .ok_or_else(|| Error::DisplayNotFound(serial.to_string()))?;

        let device = api
            .open_path(target.path())
            .with_context(|| format!("failed to open display {serial}"))?;

        Ok(Box::new(HidapiDevice { device }))
    }

    /// Enumerator closure for the display manager.
    pub fn enumerator(self: Arc<Self>) -> Enumerator {
        Box::new(move || self.enumerate())
    }

    /// Opener closure for the display manager.
    pub fn opener(self: Arc<Self>) -> Opener {
        Box::new(move |serial| self.open(serial))
    }
}

fn is_brightness_interface(device: &hidapi::DeviceInfo) -> bool {
    device.vendor_id() == APPLE_VENDOR_ID
        && device.product_id() == STUDIO_DISPLAY_PRODUCT_ID
        && device.interface_number() == BRIGHTNESS_INTERFACE
}

fn to_device_info(device: &hidapi::DeviceInfo) -> DeviceInfo {
    DeviceInfo {
        path: device.path().to_string_lossy().into_owned(),
        vendor_id: device.vendor_id(),
        product_id: device.product_id(),
        serial: device.serial_number().unwrap_or_default().to_string(),
        manufacturer: device.manufacturer_string().unwrap_or_default().to_string(),
        product: device.product_string().unwrap_or_default().to_string(),
        interface: device.interface_number(),
    }
}

struct HidapiDevice {
    device: HidDevice,
}

impl FeatureDevice for HidapiDevice {
    fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.device.get_feature_report(buf)?)
    }

    fn send_feature_report(&mut self, data: &[u8]) -> Result<()> {
        Ok(self.device.send_feature_report(data)?)
    }
}
