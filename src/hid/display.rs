// SPDX-License-Identifier: GPL-3.0-only
//! Per-display handle with thread-safe brightness access

use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::brightness;
use crate::error::Error;

use super::{DeviceInfo, FeatureDevice, REPORT_ID, REPORT_SIZE};

/// An opened Apple Studio Display.
///
/// All brightness operations serialize through the internal mutex. Once
/// closed, every operation fails with [`Error::DisplayClosed`] and the handle
/// is never reopened in place; a re-appearing device yields a fresh instance.
pub struct Display {
    info: DeviceInfo,
    device: Mutex<Option<Box<dyn FeatureDevice>>>,
}

impl Display {
    pub fn new(info: DeviceInfo, device: Box<dyn FeatureDevice>) -> Self {
        Self {
            info,
            device: Mutex::new(Some(device)),
        }
    }

    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    pub fn product_name(&self) -> &str {
        &self.info.product
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Reads the current brightness as a percentage (0-100).
    pub fn get_brightness(&self) -> Result<u8> {
        let mut guard = self.device.lock().unwrap();
        let device = guard.as_mut().ok_or(Error::DisplayClosed)?;

        let mut data = [0u8; REPORT_SIZE];
        data[0] = REPORT_ID;
        device
            .get_feature_report(&mut data)
            .context("failed to get feature report")?;

        let nits = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let percent = brightness::nits_to_percent(nits);
        debug!(serial = %self.serial(), brightness = percent, nits, "read brightness");
        Ok(percent)
    }

    /// Sets the brightness to the given percentage (0-100, clamped).
    pub fn set_brightness(&self, percent: u8) -> Result<()> {
        let mut guard = self.device.lock().unwrap();
        let device = guard.as_mut().ok_or(Error::DisplayClosed)?;

        let nits = brightness::percent_to_nits(percent);
        let mut data = [0u8; REPORT_SIZE];
        data[0] = REPORT_ID;
        data[1..5].copy_from_slice(&nits.to_le_bytes());

        device
            .send_feature_report(&data)
            .context("failed to send feature report")?;

        debug!(
            serial = %self.serial(),
            product = %self.product_name(),
            brightness = percent.min(100),
            nits,
            "set brightness"
        );
        Ok(())
    }

    /// Closes the underlying HID handle. Idempotent; later brightness calls
    /// fail with [`Error::DisplayClosed`] without touching the transport.
    pub fn close(&self) {
        self.device.lock().unwrap().take();
    }
}

impl std::fmt::Debug for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Display")
            .field("serial", &self.info.serial)
            .field("product", &self.info.product)
            .finish()
    }
}

/// Checks whether an error indicates that the HID device is no longer there.
///
/// This typically happens when the USB device is physically disconnected:
/// ENODEV (handle removed), ENOENT (device node gone from /dev), EIO (I/O
/// failure mid-disconnect). Structured OS errors in the cause chain are
/// checked first; a case-insensitive message match covers transports that
/// wrap the OS error opaquely.
pub fn is_device_gone(err: &anyhow::Error) -> bool {
    const GONE_ERRNOS: [i32; 3] = [libc::ENODEV, libc::ENOENT, libc::EIO];
    const GONE_PATTERNS: [&str; 4] = [
        "no such device",
        "no such file or directory",
        "device not configured",
        "bad file descriptor",
    ];

    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if io_err
                .raw_os_error()
                .is_some_and(|code| GONE_ERRNOS.contains(&code))
            {
                return true;
            }
        }
    }

    let message = format!("{err:#}").to_lowercase();
    GONE_PATTERNS.iter().any(|p| message.contains(p))
}
