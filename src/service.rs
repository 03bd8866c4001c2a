// SPDX-License-Identifier: GPL-3.0-only
//! D-Bus service for Apple Studio Display brightness control
//!
//! Exposes the display manager on the session bus. Brightness-mutating
//! methods are gated by a token bucket (burst 5, refill 20/s) and every
//! transport error is inspected for the device-gone condition so a stale
//! handle triggers an asynchronous recovery refresh while the caller still
//! sees the original failure.
//!
//! Increase/Decrease are non-atomic read-modify-write: two concurrent calls
//! may read the same baseline and the second write wins. Acceptable for the
//! intended human-scale hotkey usage.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use zbus::fdo::{RequestNameFlags, RequestNameReply};
use zbus::object_server::SignalEmitter;
use zbus::{interface, Connection};

use crate::error::Error;
use crate::hid::{is_device_gone, DisplayManager};

/// Well-known D-Bus service name.
pub const SERVICE_NAME: &str = "io.github.shini4i.AsdBrightness";

/// D-Bus object path.
pub const OBJECT_PATH: &str = "/io/github/shini4i/AsdBrightness";

/// Maximum number of brightness changes per second.
const RATE_LIMIT_PER_SECOND: f64 = 20.0;

/// Maximum burst size for brightness changes.
const RATE_LIMIT_BURST: f64 = 5.0;

/// Called from a detached task when a brightness operation failed because the
/// device is gone. Receives the serial and the rendered error.
pub type DeviceErrorHandler = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Token bucket gating the brightness-mutating methods.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            tokens: RATE_LIMIT_BURST,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * RATE_LIMIT_PER_SECOND).min(RATE_LIMIT_BURST);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// The brightness service.
///
/// The manager and displays are individually thread-safe; the connection and
/// device-error-handler fields each sit behind their own read-mostly lock so
/// signal emission and error dispatch never contend with method handling.
pub struct Server {
    manager: Arc<DisplayManager>,
    conn: RwLock<Option<Connection>>,
    device_error_handler: RwLock<Option<DeviceErrorHandler>>,
    limiter: Mutex<TokenBucket>,
}

impl Server {
    pub fn new(manager: Arc<DisplayManager>) -> Self {
        Self {
            manager,
            conn: RwLock::new(None),
            device_error_handler: RwLock::new(None),
            limiter: Mutex::new(TokenBucket::new()),
        }
    }

    /// Connects to the session bus, exports the service object and claims the
    /// well-known name (do-not-queue: fails if the name is already owned).
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let conn = Connection::session()
            .await
            .context("failed to connect to session bus")?;

        conn.object_server()
            .at(
                OBJECT_PATH,
                BrightnessInterface {
                    server: self.clone(),
                },
            )
            .await
            .context("failed to export service object")?;

        let reply = conn
            .request_name_with_flags(SERVICE_NAME, RequestNameFlags::DoNotQueue.into())
            .await
            .context("failed to request name")?;
        if reply != RequestNameReply::PrimaryOwner {
            anyhow::bail!("name {SERVICE_NAME} already taken");
        }

        *self.conn.write().unwrap() = Some(conn);
        info!(service = SERVICE_NAME, "D-Bus service started");
        Ok(())
    }

    /// Disconnects from the session bus. Signal emission becomes a no-op.
    pub async fn stop(&self) {
        let conn = self.conn.write().unwrap().take();
        if let Some(conn) = conn {
            conn.graceful_shutdown().await;
            debug!("D-Bus connection closed");
        }
    }

    /// Sets the callback invoked when a device-gone error is detected during
    /// a brightness operation.
    pub fn set_device_error_handler(&self, handler: DeviceErrorHandler) {
        *self.device_error_handler.write().unwrap() = Some(handler);
    }

    /// Checks the error for the device-gone condition and, if it matches,
    /// runs the registered handler on a detached task so the D-Bus reply is
    /// not delayed. Returns whether recovery was triggered.
    fn handle_device_error(&self, serial: &str, err: &anyhow::Error) -> bool {
        if !is_device_gone(err) {
            return false;
        }

        warn!(
            serial,
            error = %format!("{err:#}"),
            "device error detected, triggering recovery"
        );

        let handler = self.device_error_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            tokio::spawn(handler(serial.to_string(), format!("{err:#}")));
        }
        true
    }

    /// Returns (serial, product name) for every connected display.
    pub fn list_displays(&self) -> Vec<(String, String)> {
        let displays = self.manager.list();
        debug!(count = displays.len(), "listed displays");
        displays
            .into_iter()
            .map(|info| (info.serial, info.product))
            .collect()
    }

    /// Returns the brightness of a display as a percentage (0-100).
    pub async fn get_brightness(&self, serial: &str) -> Result<u32> {
        if serial.is_empty() {
            return Err(Error::EmptySerial.into());
        }

        let display = self.manager.get(serial).inspect_err(|err| {
            error!(serial, error = %err, "failed to get display");
        })?;

        let result = run_blocking(move || display.get_brightness()).await;
        match result {
            Ok(percent) => {
                debug!(serial, brightness = percent, "got brightness");
                Ok(u32::from(percent))
            }
            Err(err) => {
                self.handle_device_error(serial, &err);
                error!(serial, error = %format!("{err:#}"), "failed to get brightness");
                Err(err)
            }
        }
    }

    /// Sets the brightness of a display to a percentage; values above 100 are
    /// clamped.
    pub async fn set_brightness(&self, serial: &str, brightness: u32) -> Result<()> {
        if !self.limiter.lock().unwrap().allow() {
            warn!("rate limit exceeded for SetBrightness");
            return Err(Error::RateLimitExceeded.into());
        }

        if serial.is_empty() {
            return Err(Error::EmptySerial.into());
        }

        let display = self.manager.get(serial).inspect_err(|err| {
            error!(serial, error = %err, "failed to get display");
        })?;

        let brightness = brightness.min(100);
        let percent = brightness as u8;
        if let Err(err) = run_blocking(move || display.set_brightness(percent)).await {
            self.handle_device_error(serial, &err);
            error!(serial, error = %format!("{err:#}"), "failed to set brightness");
            return Err(err);
        }

        debug!(serial, brightness, "set brightness");
        self.emit_brightness_changed(serial, brightness).await;
        Ok(())
    }

    /// Increases the brightness by `step` (1-100), saturating at 100.
    pub async fn increase_brightness(&self, serial: &str, step: u32) -> Result<()> {
        if !self.limiter.lock().unwrap().allow() {
            warn!("rate limit exceeded for IncreaseBrightness");
            return Err(Error::RateLimitExceeded.into());
        }

        if serial.is_empty() {
            return Err(Error::EmptySerial.into());
        }
        if step == 0 || step > 100 {
            return Err(Error::InvalidStep.into());
        }

        let display = self.manager.get(serial)?;

        let reader = display.clone();
        let current = match run_blocking(move || reader.get_brightness()).await {
            Ok(percent) => percent,
            Err(err) => {
                self.handle_device_error(serial, &err);
                return Err(err);
            }
        };

        let new_brightness = (u32::from(current) + step).min(100);
        let percent = new_brightness as u8;
        if let Err(err) = run_blocking(move || display.set_brightness(percent)).await {
            self.handle_device_error(serial, &err);
            return Err(err);
        }

        debug!(serial, step, new = new_brightness, "increased brightness");
        self.emit_brightness_changed(serial, new_brightness).await;
        Ok(())
    }

    /// Decreases the brightness by `step` (1-100), saturating at 0.
    pub async fn decrease_brightness(&self, serial: &str, step: u32) -> Result<()> {
        if !self.limiter.lock().unwrap().allow() {
            warn!("rate limit exceeded for DecreaseBrightness");
            return Err(Error::RateLimitExceeded.into());
        }

        if serial.is_empty() {
            return Err(Error::EmptySerial.into());
        }
        if step == 0 || step > 100 {
            return Err(Error::InvalidStep.into());
        }

        let display = self.manager.get(serial)?;

        let reader = display.clone();
        let current = match run_blocking(move || reader.get_brightness()).await {
            Ok(percent) => percent,
            Err(err) => {
                self.handle_device_error(serial, &err);
                return Err(err);
            }
        };

        let new_brightness = u32::from(current).saturating_sub(step);
        let percent = new_brightness as u8;
        if let Err(err) = run_blocking(move || display.set_brightness(percent)).await {
            self.handle_device_error(serial, &err);
            return Err(err);
        }

        debug!(serial, step, new = new_brightness, "decreased brightness");
        self.emit_brightness_changed(serial, new_brightness).await;
        Ok(())
    }

    /// Sets the brightness of all displays, best-effort: per-display failures
    /// are logged and the remaining displays are still updated.
    pub async fn set_all_brightness(&self, brightness: u32) -> Result<()> {
        if !self.limiter.lock().unwrap().allow() {
            warn!("rate limit exceeded for SetAllBrightness");
            return Err(Error::RateLimitExceeded.into());
        }

        let brightness = brightness.min(100);
        let percent = brightness as u8;
        let displays = self.manager.list();
        let count = displays.len();

        for info in displays {
            let display = match self.manager.get(&info.serial) {
                Ok(display) => display,
                Err(err) => {
                    error!(serial = %info.serial, error = %err, "failed to get display");
                    continue;
                }
            };

            if let Err(err) = run_blocking(move || display.set_brightness(percent)).await {
                self.handle_device_error(&info.serial, &err);
                error!(
                    serial = %info.serial,
                    error = %format!("{err:#}"),
                    "failed to set brightness"
                );
                continue;
            }

            self.emit_brightness_changed(&info.serial, brightness).await;
        }

        debug!(brightness, count, "set all brightness");
        Ok(())
    }

    /// Emits the DisplayAdded signal.
    pub async fn emit_display_added(&self, serial: &str, product_name: &str) {
        if let Some(emitter) = self.signal_emitter() {
            if let Err(err) =
                BrightnessInterface::display_added(&emitter, serial, product_name).await
            {
                error!(error = %err, "failed to emit DisplayAdded signal");
            }
        }
        info!(serial, product = product_name, "display added");
    }

    /// Emits the DisplayRemoved signal.
    pub async fn emit_display_removed(&self, serial: &str) {
        if let Some(emitter) = self.signal_emitter() {
            if let Err(err) = BrightnessInterface::display_removed(&emitter, serial).await {
                error!(error = %err, "failed to emit DisplayRemoved signal");
            }
        }
        info!(serial, "display removed");
    }

    async fn emit_brightness_changed(&self, serial: &str, brightness: u32) {
        let Some(emitter) = self.signal_emitter() else {
            return;
        };
        if let Err(err) =
            BrightnessInterface::brightness_changed(&emitter, serial, brightness).await
        {
            error!(error = %err, "failed to emit BrightnessChanged signal");
        }
    }

    /// Emission is a no-op while the connection is nil (startup or stopped).
    fn signal_emitter(&self) -> Option<SignalEmitter<'static>> {
        let conn = self.conn.read().unwrap().clone()?;
        match SignalEmitter::new(&conn, OBJECT_PATH) {
            Ok(emitter) => Some(emitter),
            Err(err) => {
                error!(error = %err, "failed to create signal emitter");
                None
            }
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| anyhow!("task join error: {err}"))?
}

fn to_bus_error(err: anyhow::Error) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

/// The io.github.shini4i.AsdBrightness interface exported on the bus.
///
/// zbus also exports org.freedesktop.DBus.Introspectable (and Peer /
/// Properties) for the served object.
struct BrightnessInterface {
    server: Arc<Server>,
}

#[interface(name = "io.github.shini4i.AsdBrightness")]
impl BrightnessInterface {
    async fn list_displays(&self) -> Vec<(String, String)> {
        self.server.list_displays()
    }

    async fn get_brightness(&self, serial: String) -> zbus::fdo::Result<u32> {
        self.server
            .get_brightness(&serial)
            .await
            .map_err(to_bus_error)
    }

    async fn set_brightness(&self, serial: String, brightness: u32) -> zbus::fdo::Result<()> {
        self.server
            .set_brightness(&serial, brightness)
            .await
            .map_err(to_bus_error)
    }

    async fn increase_brightness(&self, serial: String, step: u32) -> zbus::fdo::Result<()> {
        self.server
            .increase_brightness(&serial, step)
            .await
            .map_err(to_bus_error)
    }

    async fn decrease_brightness(&self, serial: String, step: u32) -> zbus::fdo::Result<()> {
        self.server
            .decrease_brightness(&serial, step)
            .await
            .map_err(to_bus_error)
    }

    async fn set_all_brightness(&self, brightness: u32) -> zbus::fdo::Result<()> {
        self.server
            .set_all_brightness(brightness)
            .await
            .map_err(to_bus_error)
    }

    #[zbus(signal)]
    async fn display_added(
        emitter: &SignalEmitter<'_>,
        serial: &str,
        product_name: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn display_removed(emitter: &SignalEmitter<'_>, serial: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn brightness_changed(
        emitter: &SignalEmitter<'_>,
        serial: &str,
        brightness: u32,
    ) -> zbus::Result<()>;
}
