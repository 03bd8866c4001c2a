// SPDX-License-Identifier: GPL-3.0-only
//! Coordination between hot-plug events, device-error recovery and the bus
//!
//! All three handlers follow the same shape: take the shared refresh lock,
//! snapshot the manager, refresh (with settle delay and retries as the
//! situation requires), diff the snapshots and emit DisplayAdded /
//! DisplayRemoved signals. The lock guarantees the signal stream reflects a
//! sequence of atomic transitions even when a hot-plug burst, an overflow
//! recovery and a mid-call device error land at the same time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::hid::{DeviceInfo, DisplayManager};
use crate::hotplug::{Event, EventHandler, RecoveryHandler};
use crate::service::{DeviceErrorHandler, Server};

/// Settle delay before refreshing after a hot-plug add; USB devices need
/// time to enumerate all interfaces before HID is accessible. Removes skip
/// the delay since the device is already gone.
const ADD_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Settle delay before an overflow recovery refresh; displays behind USB-C
/// docks can take several seconds for their HID interfaces to come up.
const RECOVERY_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Maximum refresh retries after a hot-plug event.
const HOTPLUG_MAX_RETRIES: u32 = 3;

/// Maximum refresh retries during overflow recovery; with the settle delay
/// the worst case is roughly 2s + 1+2+4+8+16s of backoff.
const RECOVERY_MAX_RETRIES: u32 = 5;

/// Cap on the exponential backoff between refresh attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(16);

/// Changes detected between two display snapshots.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DisplayChanges {
    pub added: Vec<DeviceInfo>,
    pub removed: Vec<String>,
}

/// Wires the display manager, the hot-plug monitor and the D-Bus server
/// together. The three handlers it builds serialize on a shared lock so
/// their snapshot/refresh/emit cycles never interleave.
pub struct Coordinator {
    manager: Arc<DisplayManager>,
    server: Arc<Server>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Coordinator {
    pub fn new(manager: Arc<DisplayManager>, server: Arc<Server>) -> Self {
        Self {
            manager,
            server,
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Handler for hot-plug events from the udev monitor.
    pub fn hotplug_handler(&self) -> EventHandler {
        let manager = self.manager.clone();
        let server = self.server.clone();
        let refresh_lock = self.refresh_lock.clone();

        Arc::new(move |event| {
            let manager = manager.clone();
            let server = server.clone();
            let refresh_lock = refresh_lock.clone();

            Box::pin(async move {
                let _guard = refresh_lock.lock().await;

                let old_displays = snapshot(&manager);

                if event == Event::Add {
                    tokio::time::sleep(ADD_SETTLE_DELAY).await;
                }

                let (found, err) = refresh_with_retry(&manager, HOTPLUG_MAX_RETRIES).await;
                if let Some(err) = err {
                    error!(
                        error = %format!("{err:#}"),
                        "failed to refresh displays after hot-plug event (all retries exhausted)"
                    );
                    return;
                }

                // Don't emit spurious DisplayRemoved when we simply could not
                // find displays yet; if old was non-empty the device genuinely
                // departed and the diff below reports it.
                if !found && old_displays.is_empty() {
                    debug!("no displays found after hot-plug event, nothing to update");
                    return;
                }

                let new_displays = snapshot(&manager);
                let changes = diff(&old_displays, &new_displays);
                emit_changes(&server, &changes).await;
            })
        })
    }

    /// Handler for device errors detected during brightness operations.
    ///
    /// A stale handle means disconnect events were missed (system suspend is
    /// the usual culprit), so one plain refresh cleans up dead displays and
    /// picks up whatever is connected now.
    pub fn device_error_handler(&self) -> DeviceErrorHandler {
        let manager = self.manager.clone();
        let server = self.server.clone();
        let refresh_lock = self.refresh_lock.clone();

        Arc::new(move |serial, error| {
            let manager = manager.clone();
            let server = server.clone();
            let refresh_lock = refresh_lock.clone();

            Box::pin(async move {
                let _guard = refresh_lock.lock().await;

                info!(%serial, %error, "device error recovery: refreshing displays");

                let old_displays = snapshot(&manager);

                let refresher = manager.clone();
                let result = tokio::task::spawn_blocking(move || refresher.refresh()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(error = %format!("{err:#}"), "device error recovery: refresh failed");
                        return;
                    }
                    Err(err) => {
                        error!(error = %err, "device error recovery: refresh task failed");
                        return;
                    }
                }

                let new_displays = snapshot(&manager);
                let changes = diff(&old_displays, &new_displays);
                emit_changes(&server, &changes).await;

                info!(
                    before = old_displays.len(),
                    after = new_displays.len(),
                    "device error recovery completed"
                );
            })
        })
    }

    /// Handler for netlink buffer overflow recovery; events were dropped and
    /// the device view may be arbitrarily stale.
    pub fn recovery_handler(&self) -> RecoveryHandler {
        let manager = self.manager.clone();
        let server = self.server.clone();
        let refresh_lock = self.refresh_lock.clone();

        Arc::new(move || {
            let manager = manager.clone();
            let server = server.clone();
            let refresh_lock = refresh_lock.clone();

            Box::pin(async move {
                let _guard = refresh_lock.lock().await;

                info!("performing recovery refresh after netlink buffer overflow");

                let old_displays = snapshot(&manager);

                tokio::time::sleep(RECOVERY_SETTLE_DELAY).await;

                let (found, err) = refresh_with_retry(&manager, RECOVERY_MAX_RETRIES).await;
                if let Some(err) = err {
                    error!(
                        error = %format!("{err:#}"),
                        "recovery refresh failed (all retries exhausted)"
                    );
                    return;
                }

                if !found && old_displays.is_empty() {
                    info!("recovery refresh completed, no displays found");
                    return;
                }

                let new_displays = snapshot(&manager);
                let changes = diff(&old_displays, &new_displays);

                for added in &changes.added {
                    info!(serial = %added.serial, "display found during recovery");
                }
                for removed in &changes.removed {
                    info!(serial = %removed, "display lost during recovery");
                }

                emit_changes(&server, &changes).await;

                info!(displays = new_displays.len(), "recovery refresh completed");
            })
        })
    }
}

/// Snapshot of the manager's current displays keyed by serial.
fn snapshot(manager: &DisplayManager) -> HashMap<String, DeviceInfo> {
    manager
        .list()
        .into_iter()
        .map(|info| (info.serial.clone(), info))
        .collect()
}

/// Compares two snapshots: `added` carries the new DeviceInfo for serials
/// only in `new`, `removed` the serials only in `old`.
fn diff(
    old: &HashMap<String, DeviceInfo>,
    new: &HashMap<String, DeviceInfo>,
) -> DisplayChanges {
    let mut changes = DisplayChanges::default();

    for (serial, info) in new {
        if !old.contains_key(serial) {
            changes.added.push(info.clone());
        }
    }
    for serial in old.keys() {
        if !new.contains_key(serial) {
            changes.removed.push(serial.clone());
        }
    }

    changes
}

/// Emits signals for a transition, added first, then removed.
async fn emit_changes(server: &Server, changes: &DisplayChanges) {
    for info in &changes.added {
        server.emit_display_added(&info.serial, &info.product).await;
    }
    for serial in &changes.removed {
        server.emit_display_removed(serial).await;
    }
}

/// Refreshes with exponential backoff, distinguishing "refresh succeeded"
/// from "displays found": displays behind a USB-C dock may enumerate seconds
/// after the parent device is advertised, so a successful but empty refresh
/// is a transient, not an error.
///
/// Returns `(found, last_error)`; `last_error` is `None` when the final
/// refresh itself succeeded.
async fn refresh_with_retry(
    manager: &Arc<DisplayManager>,
    max_retries: u32,
) -> (bool, Option<anyhow::Error>) {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let backoff = backoff_delay(attempt);
            debug!(attempt, ?backoff, "retrying display refresh");
            tokio::time::sleep(backoff).await;
        }

        let refresher = manager.clone();
        let result = tokio::task::spawn_blocking(move || refresher.refresh()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(
                    error = %format!("{err:#}"),
                    attempt = attempt + 1,
                    max_attempts = max_retries + 1,
                    "display refresh failed"
                );
                last_err = Some(err);
                continue;
            }
            Err(err) => {
                warn!(error = %err, "display refresh task failed");
                last_err = Some(anyhow::anyhow!("refresh task join error: {err}"));
                continue;
            }
        }

        if manager.count() > 0 {
            if attempt > 0 {
                info!(attempts = attempt + 1, "display refresh succeeded after retry");
            }
            return (true, None);
        }

        // Refresh succeeded but found nothing: the HID interface may not be
        // ready yet. That is not an error, so clear any previous one.
        debug!(
            attempt = attempt + 1,
            max_attempts = max_retries + 1,
            "refresh succeeded but no displays found"
        );
        last_err = None;
    }

    (false, last_err)
}

/// Backoff before retry `attempt` (1-based): 1s, 2s, 4s, 8s, 16s, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(u32::BITS - 1);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::hid::{Enumerator, FeatureDevice, Opener};
    use crate::service::Server;

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
        fn get_feature_report(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
            Ok(buf.len())
        }

        fn send_feature_report(&mut self, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Manager whose enumerator output can be swapped mid-test.
    fn scripted_manager(
        initial: Vec<DeviceInfo>,
    ) -> (Arc<DisplayManager>, Arc<Mutex<Vec<DeviceInfo>>>) {
        let devices = Arc::new(Mutex::new(initial));
        let shared = devices.clone();
        let enumerator: Enumerator = Box::new(move || Ok(shared.lock().unwrap().clone()));
        let opener: Opener =
            Box::new(|_serial| Ok(Box::new(NopDevice) as Box<dyn FeatureDevice>));
        (
            Arc::new(DisplayManager::new(enumerator, opener)),
            devices,
        )
    }

    fn coordinator_with(manager: Arc<DisplayManager>) -> Coordinator {
        let server = Arc::new(Server::new(manager.clone()));
        Coordinator::new(manager, server)
    }

    fn snapshot_of(entries: &[(&str, &str)]) -> HashMap<String, DeviceInfo> {
        entries
            .iter()
            .map(|(serial, product)| (serial.to_string(), info(serial, product)))
            .collect()
    }

    #[test]
    fn test_diff_no_changes() {
        let old = snapshot_of(&[("ABC", "Display 1")]);
        let new = snapshot_of(&[("ABC", "Display 1")]);
        assert_eq!(diff(&old, &new), DisplayChanges::default());
    }

    #[test]
    fn test_diff_added() {
        let old = snapshot_of(&[]);
        let new = snapshot_of(&[("ABC", "Display 1")]);

        let changes = diff(&old, &new);
        assert_eq!(changes.added, vec![info("ABC", "Display 1")]);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_diff_removed() {
        let old = snapshot_of(&[("ABC", "Display 1")]);
        let new = snapshot_of(&[]);

        let changes = diff(&old, &new);
        assert!(changes.added.is_empty());
        assert_eq!(changes.removed, vec!["ABC".to_string()]);
    }

    #[test]
    fn test_diff_swap() {
        let old = snapshot_of(&[("ABC", "Display 1")]);
        let new = snapshot_of(&[("DEF", "Display 2")]);

        let changes = diff(&old, &new);
        assert_eq!(changes.added, vec![info("DEF", "Display 2")]);
        assert_eq!(changes.removed, vec!["ABC".to_string()]);
    }

    #[test]
    fn test_diff_law_applying_changes_reproduces_new() {
        let old = snapshot_of(&[("A", "1"), ("B", "2")]);
        let new = snapshot_of(&[("B", "2"), ("C", "3"), ("D", "4")]);

        let changes = diff(&old, &new);

        let mut reconstructed = old.clone();
        for serial in &changes.removed {
            reconstructed.remove(serial);
        }
        for added in &changes.added {
            reconstructed.insert(added.serial.clone(), added.clone());
        }
        assert_eq!(reconstructed, new);
    }

    #[test]
    fn test_snapshot_keys_by_serial() {
        let (manager, _) = scripted_manager(vec![
            info("ABC", "Display 1"),
            info("DEF", "Display 2"),
        ]);
        manager.refresh().unwrap();

        let snap = snapshot(&manager);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["ABC"].product, "Display 1");
        assert_eq!(snap["DEF"].product, "Display 2");
    }

    #[test]
    fn test_backoff_delay_schedule() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        // Capped from here on.
        assert_eq!(backoff_delay(6), Duration::from_secs(16));
        assert_eq!(backoff_delay(60), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn test_refresh_with_retry_found_on_first_attempt() {
        let (manager, _) = scripted_manager(vec![info("ABC", "Display 1")]);

        let (found, err) = refresh_with_retry(&manager, 3).await;
        assert!(found);
        assert!(err.is_none());
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_with_retry_empty_is_not_an_error() {
        let (manager, _) = scripted_manager(vec![]);

        let (found, err) = refresh_with_retry(&manager, 0).await;
        assert!(!found);
        assert!(err.is_none());
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_with_retry_retries_until_displays_appear() {
        let (manager, devices) = scripted_manager(vec![]);

        // Device shows up while the retry loop is backing off.
        let filler = devices.clone();
        let filler_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            *filler.lock().unwrap() = vec![info("ABC", "Display 1")];
        });

        let (found, err) = refresh_with_retry(&manager, 3).await;
        filler_task.await.unwrap();

        assert!(found);
        assert!(err.is_none());
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_with_retry_reports_last_error() {
        let enumerator: Enumerator = Box::new(|| anyhow::bail!("hid_enumerate failed"));
        let opener: Opener =
            Box::new(|_serial| Ok(Box::new(NopDevice) as Box<dyn FeatureDevice>));
        let manager = Arc::new(DisplayManager::new(enumerator, opener));

        let (found, err) = refresh_with_retry(&manager, 2).await;
        assert!(!found);
        assert!(err.unwrap().to_string().contains("failed to enumerate displays"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotplug_add_refreshes_and_updates_manager() {
        let (manager, devices) = scripted_manager(vec![]);
        let coordinator = coordinator_with(manager.clone());
        let handler = coordinator.hotplug_handler();

        *devices.lock().unwrap() = vec![info("ABC", "Display 1")];
        handler(Event::Add).await;

        assert_eq!(manager.count(), 1);
        assert!(manager.get("ABC").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotplug_remove_refreshes_and_updates_manager() {
        let (manager, devices) = scripted_manager(vec![info("ABC", "Display 1")]);
        manager.refresh().unwrap();
        let coordinator = coordinator_with(manager.clone());
        let handler = coordinator.hotplug_handler();

        devices.lock().unwrap().clear();
        handler(Event::Remove).await;

        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotplug_transient_empty_refresh_leaves_state_alone() {
        // Add event but the HID interface never becomes ready: the handler
        // exhausts its retries and returns without touching anything.
        let (manager, _) = scripted_manager(vec![]);
        let coordinator = coordinator_with(manager.clone());
        let handler = coordinator.hotplug_handler();

        handler(Event::Add).await;

        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_handler_cleans_up_stale_display() {
        let (manager, devices) = scripted_manager(vec![info("ABC", "Display 1")]);
        manager.refresh().unwrap();
        let coordinator = coordinator_with(manager.clone());
        let handler = coordinator.device_error_handler();

        devices.lock().unwrap().clear();
        handler("ABC".into(), "no such device".into()).await;

        assert_eq!(manager.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_handler_picks_up_new_displays() {
        let (manager, devices) = scripted_manager(vec![]);
        let coordinator = coordinator_with(manager.clone());
        let handler = coordinator.recovery_handler();

        *devices.lock().unwrap() = vec![
            info("ABC", "Display 1"),
            info("DEF", "Display 2"),
        ];
        handler().await;

        assert_eq!(manager.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_serialize_on_the_refresh_lock() {
        let (manager, devices) = scripted_manager(vec![]);
        let coordinator = coordinator_with(manager.clone());
        let hotplug = coordinator.hotplug_handler();
        let recovery = coordinator.recovery_handler();

        *devices.lock().unwrap() = vec![info("ABC", "Display 1")];

        // Both handlers sleep while holding the lock; running them
        // concurrently must still complete without deadlock and leave the
        // manager consistent.
        let first = tokio::spawn(hotplug(Event::Add));
        let second = tokio::spawn(recovery());
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(manager.count(), 1);
    }
}
