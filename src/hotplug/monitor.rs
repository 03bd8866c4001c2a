// SPDX-License-Identifier: GPL-3.0-only
//! Netlink hot-plug monitor
//!
//! The udev socket is consumed on a dedicated blocking thread because
//! `MonitorSocket` is not `Send`; it uses `libc::poll()` to wait for events
//! with a short timeout so the quit flag is noticed promptly. Filtered and
//! debounced events cross into the async world over a channel and are handed
//! to the registered handler one at a time.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::error::Error;

use super::filter::{classify_uevent, is_buffer_overflow_error, RemoveDebouncer};
use super::{Event, EventHandler, RecoveryHandler};

/// Receive buffer target for the netlink socket. USB hot-plug generates many
/// netlink messages rapidly; 2 MiB prevents ENOBUFS drop storms in typical
/// scenarios.
const NETLINK_BUFFER_SIZE: libc::c_int = 2 * 1024 * 1024;

/// Poll timeout; bounds how long stopping the monitor can take.
const POLL_TIMEOUT_MS: libc::c_int = 500;

const EVENT_CHANNEL_CAPACITY: usize = 64;

enum MonitorMessage {
    Event(Event),
    Overflow,
}

#[derive(Default)]
struct MonitorState {
    quit: Option<Arc<AtomicBool>>,
    stopped: bool,
}

/// Watches for Apple Studio Display connect/disconnect events.
pub struct HotplugMonitor {
    handler: EventHandler,
    recovery_handler: Arc<RwLock<Option<RecoveryHandler>>>,
    state: Mutex<MonitorState>,
}

impl HotplugMonitor {
    pub fn new(handler: EventHandler) -> Self {
        Self {
            handler,
            recovery_handler: Arc::new(RwLock::new(None)),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Sets the handler called when the monitor recovers from a netlink
    /// buffer overflow. It should trigger a display refresh to make up for
    /// potentially missed events.
    pub fn set_recovery_handler(&self, handler: RecoveryHandler) {
        *self.recovery_handler.write().unwrap() = Some(handler);
    }

    /// Begins monitoring for device events.
    ///
    /// Non-blocking; events are processed in the background. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.quit.is_some() && !state.stopped {
            return Err(Error::MonitorAlreadyStarted.into());
        }

        let quit = Arc::new(AtomicBool::new(false));
        let thread_quit = quit.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        std::thread::Builder::new()
            .name("hotplug-monitor".into())
            .spawn(move || {
                let socket = match open_monitor_socket() {
                    Ok(socket) => socket,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                consume_events(socket, event_tx, thread_quit);
            })
            .context("failed to spawn monitor thread")?;

        ready_rx
            .recv()
            .context("monitor thread exited before connecting")??;

        tokio::spawn(dispatch_events(
            event_rx,
            self.handler.clone(),
            self.recovery_handler.clone(),
        ));

        state.quit = Some(quit);
        state.stopped = false;
        info!("udev monitor started");
        Ok(())
    }

    /// Stops the monitor. Idempotent; a no-op if never started.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(quit) = state.quit.clone() else {
            return;
        };
        if state.stopped {
            return;
        }
        state.stopped = true;
        quit.store(true, Ordering::Relaxed);
        info!("udev monitor stopped");
    }
}

fn open_monitor_socket() -> Result<udev::MonitorSocket> {
    let socket = udev::MonitorBuilder::new()
        .context("failed to create udev monitor")?
        .match_subsystem("usb")
        .context("failed to add usb subsystem filter")?
        .listen()
        .context("failed to connect to netlink")?;

    configure_receive_buffer(socket.as_raw_fd());
    Ok(socket)
}

/// Raises the socket receive buffer to [`NETLINK_BUFFER_SIZE`].
///
/// Tries SO_RCVBUFFORCE first, which bypasses the rmem_max limit but requires
/// CAP_NET_ADMIN, then falls back to SO_RCVBUF, which the kernel caps at
/// rmem_max. Failure of both is survivable; the default buffer may still be
/// large enough.
fn configure_receive_buffer(fd: std::os::fd::RawFd) {
    let size = NETLINK_BUFFER_SIZE;
    for option in [libc::SO_RCVBUFFORCE, libc::SO_RCVBUF] {
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                std::ptr::addr_of!(size).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            debug!(size, "netlink socket buffer size configured");
            return;
        }
    }
    warn!(
        size,
        error = %std::io::Error::last_os_error(),
        "failed to set netlink buffer size"
    );
}

/// Blocking consumer loop; runs until the quit flag is set or poll fails.
fn consume_events(
    socket: udev::MonitorSocket,
    tx: mpsc::Sender<MonitorMessage>,
    quit: Arc<AtomicBool>,
) {
    let fd = socket.as_raw_fd();
    let mut debouncer = RemoveDebouncer::new();

    while !quit.load(Ordering::Relaxed) {
        let mut poll_fd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut poll_fd, 1, POLL_TIMEOUT_MS) };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "poll error on netlink socket");
            return;
        }
        if rc == 0 {
            continue;
        }

        let mut received = false;
        for event in socket.iter() {
            received = true;
            process_uevent(&event, &mut debouncer, &tx);
        }

        // The socket was readable but yielded nothing: the receive failed.
        // ENOBUFS means the kernel dropped uevents, so our device view may be
        // stale and a recovery refresh is needed.
        if !received {
            let err = std::io::Error::last_os_error();
            if is_buffer_overflow_error(&err) {
                warn!("netlink buffer overflow detected, triggering recovery refresh");
                if tx.blocking_send(MonitorMessage::Overflow).is_err() {
                    return;
                }
            }
        }
    }

    debug!("hotplug monitor thread exiting");
}

fn process_uevent(
    event: &udev::Event,
    debouncer: &mut RemoveDebouncer,
    tx: &mpsc::Sender<MonitorMessage>,
) {
    let subsystem = event.subsystem().and_then(|s| s.to_str().map(str::to_owned));
    let devtype = event.devtype().and_then(|s| s.to_str().map(str::to_owned));
    let product = event
        .property_value("PRODUCT")
        .and_then(|s| s.to_str().map(str::to_owned));

    let Some(kind) = classify_uevent(
        event.event_type(),
        subsystem.as_deref(),
        devtype.as_deref(),
        product.as_deref(),
    ) else {
        return;
    };

    let product = product.unwrap_or_default();
    debug!(
        action = ?event.event_type(),
        syspath = ?event.syspath(),
        %product,
        "USB device event"
    );

    match kind {
        Event::Add => info!(%product, "Apple Studio Display connected"),
        Event::Remove => {
            if !debouncer.should_deliver(&product, Instant::now()) {
                debug!(%product, "duplicate remove event suppressed");
                return;
            }
            info!(%product, "Apple Studio Display disconnected");
        }
    }

    if tx.blocking_send(MonitorMessage::Event(kind)).is_err() {
        debug!("hotplug event channel closed, dropping event");
    }
}

/// Async side: invokes the event handler serially and spawns the recovery
/// handler detached so the consumer keeps draining the socket.
async fn dispatch_events(
    mut rx: mpsc::Receiver<MonitorMessage>,
    handler: EventHandler,
    recovery_handler: Arc<RwLock<Option<RecoveryHandler>>>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            MonitorMessage::Event(event) => handler(event).await,
            MonitorMessage::Overflow => {
                let recovery = recovery_handler.read().unwrap().clone();
                if let Some(recovery) = recovery {
                    tokio::spawn(recovery());
                }
            }
        }
    }
    debug!("hotplug event dispatcher stopped");
}
