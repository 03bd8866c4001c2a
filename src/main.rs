use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

#[macro_use]
extern crate tracing;

mod brightness;
mod coordinator;
mod error;
mod hid;
mod hotplug;
mod service;

use crate::coordinator::Coordinator;
use crate::hid::{DisplayManager, HidBackend};
use crate::hotplug::HotplugMonitor;
use crate::service::Server;

/// Maximum time to wait for graceful shutdown before forcing exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// D-Bus daemon for controlling Apple Studio Display brightness via USB HID.
///
/// Exposes methods for listing connected displays, getting and setting
/// brightness levels, and emits signals when displays are connected or
/// disconnected.
#[derive(Parser)]
#[command(name = "asd-brightness-daemon", version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logs(verbose: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directives = if verbose {
        format!("info,{}=debug", env!("CARGO_CRATE_NAME"))
    } else {
        format!("warn,{}=info", env!("CARGO_CRATE_NAME"))
    };
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(default_directives));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());

    if let Ok(journal_layer) = tracing_journald::layer() {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .with(journal_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt_layer)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logs(cli.verbose);

    info!("starting asd-brightness-daemon");

    let backend = Arc::new(HidBackend::new().context("failed to initialize HID library")?);
    let manager = Arc::new(DisplayManager::new(
        backend.clone().enumerator(),
        backend.opener(),
    ));

    if let Err(err) = manager.refresh() {
        error!(error = %format!("{err:#}"), "failed to enumerate displays");
    }
    match manager.count() {
        0 => warn!("no Apple Studio Displays found"),
        count => info!(count, "found Apple Studio Displays"),
    }

    let server = Arc::new(Server::new(manager.clone()));
    server
        .clone()
        .start()
        .await
        .context("failed to start D-Bus server")?;

    let coordinator = Coordinator::new(manager.clone(), server.clone());
    server.set_device_error_handler(coordinator.device_error_handler());

    let monitor = Arc::new(HotplugMonitor::new(coordinator.hotplug_handler()));
    monitor.set_recovery_handler(coordinator.recovery_handler());
    if let Err(err) = monitor.start() {
        error!(
            error = %format!("{err:#}"),
            "failed to start udev monitor (hot-plug detection disabled)"
        );
    }

    info!("daemon running, send SIGINT or SIGTERM to stop");
    wait_for_shutdown().await;
    info!("shutting down");

    let shutdown = tokio::spawn({
        let monitor = monitor.clone();
        let server = server.clone();
        let manager = manager.clone();
        async move {
            monitor.stop();
            server.stop().await;
            if let Err(err) = tokio::task::spawn_blocking(move || manager.close()).await {
                error!(error = %err, "failed to close display manager");
            }
        }
    });

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(_) => info!("daemon stopped gracefully"),
        Err(_) => warn!(timeout = ?SHUTDOWN_TIMEOUT, "shutdown timed out, forcing exit"),
    }

    Ok(())
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
