//! cardgate - serial gateway for an RFID door reader.
//!
//! The reader speaks a line-oriented text protocol over a serial port. This
//! crate keeps that link alive, answers card presentations with an
//! authorization decision, follows the break schedule and watches the
//! reader's heartbeat. The binary wires it to a local SQLite store.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod codec;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod gpio;
pub mod heartbeat;
pub mod link;
pub mod policy;
pub mod schedule;
pub mod serial;
pub mod store;

#[cfg(test)]
mod testing;

use clap::Parser;
use config::{Cli, Command, GatewayConfig};
use error::GatewayError;
use gateway::{Collaborators, Gateway};
use gpio::{ResetLine, SysfsResetLine};

const DEFAULT_LOG_FILTER: &str = "info,cardgate=debug";

// ============================================================================
// Logging
// ============================================================================

/// Initialize structured logging (console + daily rolling file).
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &GatewayConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.logging.level.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    });

    let log_dir = diagnostics::get_log_dir(config.logging.dir.as_deref());
    diagnostics::prune_old_logs(&log_dir);
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // The process logs until it exits; the guard must never flush early.
    std::mem::forget(guard);
}

// ============================================================================
// Entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli)?;

    if cli.command == Some(Command::ListPorts) {
        let ports = serial::list_ports()?;
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    init_logging(&config);
    info!(about = %diagnostics::get_about_info(), "Starting cardgate");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_gateway(config))?;
    Ok(())
}

async fn run_gateway(config: GatewayConfig) -> Result<(), GatewayError> {
    let store = Arc::new(
        db::SqliteStore::open(&config.store.path)?
            .with_poll_interval(config.timing.settings_poll()),
    );
    let connector = Arc::new(serial::SerialConnector::new(
        &config.interface.port,
        config.interface.baudrate,
    ));
    let reset_line = open_reset_line(&config);

    let gateway = Gateway::new(
        config,
        connector,
        Collaborators {
            directory: store.clone(),
            settings: store.clone(),
            sink: store,
        },
        reset_line,
    );

    let handle = gateway.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            handle.shutdown();
        }
    });

    gateway.run().await
}

/// Export the configured reset line. A line that cannot be set up is
/// logged and left out; the gateway runs without power-cycle support.
fn open_reset_line(config: &GatewayConfig) -> Option<Box<dyn ResetLine>> {
    let pin = config.gpio.reset_pin?;
    let line = SysfsResetLine::new(pin, config.gpio.base_path.clone());
    match line.init() {
        Ok(()) => {
            info!(line = %line.describe(), "Reset line ready");
            Some(Box::new(line))
        }
        Err(e) => {
            let base = config
                .gpio
                .base_path
                .as_deref()
                .unwrap_or(Path::new(gpio::DEFAULT_SYSFS_BASE));
            warn!(pin, base = %base.display(), error = %e, "Reset line unavailable");
            None
        }
    }
}
