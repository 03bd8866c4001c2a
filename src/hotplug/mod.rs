/// Hot-plug detection for Apple Studio Displays via netlink/udev events.
///
/// The monitor subscribes to the udev multicast group, filters the uevent
/// stream down to add/remove events for the target device, debounces the
/// per-interface remove bursts and hands semantic events to a registered
/// handler. A netlink receive-buffer overflow triggers a detached recovery
/// callback instead of killing the consumer.
mod filter;
mod monitor;

pub use filter::{classify_uevent, is_buffer_overflow_error, RemoveDebouncer};
pub use monitor::HotplugMonitor;

use futures::future::BoxFuture;
use std::sync::Arc;

/// A device hot-plug event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The display was connected.
    Add,
    /// The display was disconnected.
    Remove,
}

/// Called for each accepted hot-plug event; invocations are serialized.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called from a detached task when the monitor recovers from an error
/// condition (netlink buffer overflow) and the device view may be stale.
pub type RecoveryHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
