// SPDX-License-Identifier: GPL-3.0-only
//! uevent classification and remove debouncing

use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use super::Event;

/// USB vendor ID for Apple in udev PRODUCT format (no leading zero).
pub const APPLE_VENDOR_ID: &str = "5ac";

/// USB product ID for the Apple Studio Display in udev PRODUCT format.
pub const STUDIO_DISPLAY_PRODUCT_ID: &str = "1114";

/// Window within which duplicate removes for the same PRODUCT are dropped.
const REMOVE_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Age at which stale debounce entries are purged.
const DEBOUNCE_ENTRY_TTL: Duration = Duration::from_secs(60);

/// Anchored matcher for the kernel PRODUCT string "vendor/product/bcdDevice".
///
/// The kernel emits the vendor ID without a leading zero but other layers may
/// re-add it, so `5ac` and `05ac` are both accepted, case-insensitively. Both
/// ends are anchored and the trailing segment excludes '/' so that a longer
/// product ID sharing the prefix (e.g. "5ac/11149/...") does not match.
static PRODUCT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        "(?i)^0?{APPLE_VENDOR_ID}/{STUDIO_DISPLAY_PRODUCT_ID}/[^/]+$"
    ))
    .unwrap()
});

/// Classifies a uevent into a semantic hot-plug event, if it concerns the
/// Studio Display.
///
/// Add events are accepted for the parent `usb_device` only; the kernel also
/// advertises every child `usb_interface` and those must not produce
/// duplicate events. Remove events are accepted without a DEVTYPE because the
/// attribute may already be stripped by the time the remove propagates; the
/// resulting per-interface remove burst is collapsed by [`RemoveDebouncer`].
pub fn classify_uevent(
    event_type: udev::EventType,
    subsystem: Option<&str>,
    devtype: Option<&str>,
    product: Option<&str>,
) -> Option<Event> {
    if subsystem != Some("usb") {
        return None;
    }
    if !product.is_some_and(|p| PRODUCT_PATTERN.is_match(p)) {
        return None;
    }
    match event_type {
        udev::EventType::Add => (devtype == Some("usb_device")).then_some(Event::Add),
        udev::EventType::Remove => Some(Event::Remove),
        _ => None,
    }
}

/// Collapses the burst of remove events the kernel emits when a display
/// disconnects (one for the parent device plus one per interface).
///
/// Keyed by the full PRODUCT string; entries older than a minute are purged
/// opportunistically to bound memory.
pub struct RemoveDebouncer {
    last_remove: HashMap<String, Instant>,
}

impl RemoveDebouncer {
    pub fn new() -> Self {
        Self {
            last_remove: HashMap::new(),
        }
    }

    /// Returns whether a remove for `product` observed at `now` should be
    /// delivered, recording it if so.
    pub fn should_deliver(&mut self, product: &str, now: Instant) -> bool {
        if let Some(&last) = self.last_remove.get(product) {
            if now.saturating_duration_since(last) < REMOVE_DEBOUNCE_WINDOW {
                return false;
            }
        }
        self.last_remove.insert(product.to_string(), now);
        self.purge(now);
        true
    }

    fn purge(&mut self, now: Instant) {
        self.last_remove
            .retain(|_, &mut last| now.saturating_duration_since(last) < DEBOUNCE_ENTRY_TTL);
    }
}

/// Checks whether an I/O error is a netlink receive-buffer overflow.
///
/// ENOBUFS means the kernel dropped uevents and our view of the device set
/// may be stale. The errno is checked first; the message match covers layers
/// that wrap the OS error opaquely.
pub fn is_buffer_overflow_error(err: &std::io::Error) -> bool {
    if err.raw_os_error() == Some(libc::ENOBUFS) {
        return true;
    }
    err.to_string()
        .to_lowercase()
        .contains("no buffer space available")
}
