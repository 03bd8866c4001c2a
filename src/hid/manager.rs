// SPDX-License-Identifier: GPL-3.0-only
//! Display manager
//!
//! Owns the live `serial -> Display` mapping and reconciles it against the
//! injected enumerator on every refresh. The enumerator and opener are
//! function values so tests can run without hardware.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use crate::error::Error;

use super::{DeviceInfo, Display, FeatureDevice};

/// Produces the current set of candidate displays, or fails as a whole.
pub type Enumerator = Box<dyn Fn() -> Result<Vec<DeviceInfo>> + Send + Sync>;

/// Opens the device with the given serial.
pub type Opener = Box<dyn Fn(&str) -> Result<Box<dyn FeatureDevice>> + Send + Sync>;

/// Handles the lifecycle of all connected Apple Studio Displays.
///
/// Reads (list, get, count) take the lock shared; refresh and close take it
/// exclusively, so a lookup never observes a half-applied refresh.
pub struct DisplayManager {
    displays: RwLock<HashMap<String, Arc<Display>>>,
    enumerator: Enumerator,
    opener: Opener,
}

impl DisplayManager {
    pub fn new(enumerator: Enumerator, opener: Opener) -> Self {
        Self {
            displays: RwLock::new(HashMap::new()),
            enumerator,
            opener,
        }
    }

    /// Returns information about all connected displays.
    pub fn list(&self) -> Vec<DeviceInfo> {
        let displays = self.displays.read().unwrap();
        displays.values().map(|d| d.info().clone()).collect()
    }

    /// Returns a display by serial number.
    pub fn get(&self, serial: &str) -> Result<Arc<Display>> {
        let displays = self.displays.read().unwrap();
        displays
            .get(serial)
            .cloned()
            .ok_or_else(|| Error::DisplayNotFound(serial.to_string()).into())
    }

    /// Re-enumerates connected displays and updates the internal state,
    /// opening new displays and closing disconnected ones.
    ///
    /// An enumeration failure leaves the live map untouched. A failure to
    /// open one new display is logged and skipped so that a single
    /// misbehaving device does not starve the others.
    pub fn refresh(&self) -> Result<()> {
        let mut displays = self.displays.write().unwrap();

        let devices = (self.enumerator)().context("failed to enumerate displays")?;
        let mut current: HashMap<String, DeviceInfo> = HashMap::with_capacity(devices.len());
        for info in devices {
            current.insert(info.serial.clone(), info);
        }

        // Close disconnected displays before opening new ones so that a
        // serial briefly duplicated by an enumerator glitch never holds two
        // open handles.
        displays.retain(|serial, display| {
            if current.contains_key(serial) {
                return true;
            }
            info!(%serial, "display disconnected");
            display.close();
            false
        });

        for (serial, info) in &current {
            if displays.contains_key(serial) {
                continue;
            }
            match (self.opener)(serial) {
                Ok(device) => {
                    info!(%serial, product = %info.product, "display connected");
                    displays.insert(serial.clone(), Arc::new(Display::new(info.clone(), device)));
                }
                Err(err) => {
                    error!(%serial, error = %format!("{err:#}"), "failed to open display");
                }
            }
        }

        Ok(())
    }

    /// Closes all open displays and empties the map.
    pub fn close(&self) {
        let mut displays = self.displays.write().unwrap();
        for (serial, display) in displays.drain() {
            debug!(%serial, "closing display");
            display.close();
        }
    }

    /// Returns the number of connected displays.
    pub fn count(&self) -> usize {
        self.displays.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn info(serial: &str, product: &str) -> DeviceInfo {
        DeviceInfo {
            path: format!("/dev/hidraw-{serial}"),
            vendor_id: crate::hid::APPLE_VENDOR_ID,
            product_id: crate::hid::STUDIO_DISPLAY_PRODUCT_ID,
            serial: serial.into(),
            manufacturer: "Apple Inc.".into(),
            product: product.into(),
            interface: crate::hid::BRIGHTNESS_INTERFACE,
        }
    }

    struct NopDevice;

    impl FeatureDevice for NopDevice {
        fn get_feature_report(&mut self, buf: &mut [u8]) -> Result<usize> {
            Ok(buf.len())
        }

        fn send_feature_report(&mut self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn nop_opener() -> (Opener, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        let opener: Opener = Box::new(move |_serial| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NopDevice) as Box<dyn FeatureDevice>)
        });
        (opener, opens)
    }

    /// Enumerator whose output can be swapped mid-test.
    fn scripted_enumerator(initial: Vec<DeviceInfo>) -> (Enumerator, Arc<Mutex<Vec<DeviceInfo>>>) {
        let devices = Arc::new(Mutex::new(initial));
        let shared = devices.clone();
        let enumerator: Enumerator = Box::new(move || Ok(shared.lock().unwrap().clone()));
        (enumerator, devices)
    }

    #[test]
    fn test_list_empty() {
        let (enumerator, _) = scripted_enumerator(vec![]);
        let (opener, _) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);
        assert!(manager.list().is_empty());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn test_get_not_found() {
        let (enumerator, _) = scripted_enumerator(vec![]);
        let (opener, _) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        let err = manager.get("MISSING").unwrap_err();
        assert_eq!(
            err.downcast_ref::<Error>(),
            Some(&Error::DisplayNotFound("MISSING".into()))
        );
    }

    #[test]
    fn test_refresh_adds_new_displays() {
        let (enumerator, _) = scripted_enumerator(vec![
            info("ABC123", "Display 1"),
            info("DEF456", "Display 2"),
        ]);
        let (opener, opens) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();

        assert_eq!(manager.count(), 2);
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get("ABC123").unwrap().product_name(), "Display 1");
    }

    #[test]
    fn test_refresh_removes_disconnected_displays() {
        let (enumerator, devices) = scripted_enumerator(vec![info("ABC123", "Display 1")]);
        let (opener, _) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();
        assert_eq!(manager.count(), 1);
        let display = manager.get("ABC123").unwrap();

        devices.lock().unwrap().clear();
        manager.refresh().unwrap();

        assert_eq!(manager.count(), 0);
        assert!(manager.get("ABC123").is_err());
        // The removed display was closed on the way out.
        let err = display.get_brightness().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::DisplayClosed));
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let (enumerator, _) = scripted_enumerator(vec![info("ABC123", "Display 1")]);
        let (opener, opens) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();
        manager.refresh().unwrap();

        assert_eq!(manager.count(), 1);
        // The existing display is kept; no second open for the same serial.
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refresh_enumeration_error_leaves_map_untouched() {
        let fail = Arc::new(Mutex::new(false));
        let fail_flag = fail.clone();
        let enumerator: Enumerator = Box::new(move || {
            if *fail_flag.lock().unwrap() {
                anyhow::bail!("hid_enumerate failed");
            }
            Ok(vec![info("ABC123", "Display 1")])
        });
        let (opener, _) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();
        assert_eq!(manager.count(), 1);

        *fail.lock().unwrap() = true;
        let err = manager.refresh().unwrap_err();
        assert!(err.to_string().contains("failed to enumerate displays"));
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_refresh_tolerates_opener_failure() {
        let (enumerator, _) = scripted_enumerator(vec![
            info("GOOD", "Display 1"),
            info("BAD", "Display 2"),
        ]);
        let opener: Opener = Box::new(|serial| {
            if serial == "BAD" {
                anyhow::bail!("failed to open display");
            }
            Ok(Box::new(NopDevice) as Box<dyn FeatureDevice>)
        });
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();

        assert_eq!(manager.count(), 1);
        assert!(manager.get("GOOD").is_ok());
        assert!(manager.get("BAD").is_err());
    }

    #[test]
    fn test_refresh_swaps_displays() {
        let (enumerator, devices) = scripted_enumerator(vec![info("ABC", "Display 1")]);
        let (opener, _) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();
        *devices.lock().unwrap() = vec![info("DEF", "Display 2")];
        manager.refresh().unwrap();

        assert_eq!(manager.count(), 1);
        assert!(manager.get("ABC").is_err());
        assert!(manager.get("DEF").is_ok());
    }

    #[test]
    fn test_close_releases_everything() {
        let (enumerator, _) = scripted_enumerator(vec![
            info("ABC123", "Display 1"),
            info("DEF456", "Display 2"),
        ]);
        let (opener, _) = nop_opener();
        let manager = DisplayManager::new(enumerator, opener);

        manager.refresh().unwrap();
        let display = manager.get("ABC123").unwrap();
        manager.close();

        assert_eq!(manager.count(), 0);
        assert!(manager.list().is_empty());
        let err = display.get_brightness().unwrap_err();
        assert_eq!(err.downcast_ref::<Error>(), Some(&Error::DisplayClosed));
    }
}
