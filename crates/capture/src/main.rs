//! ios-screen-usb
//!
//! Activates the hidden screen mirroring configuration of an attached iOS
//! device and dumps its raw frame stream.

use anyhow::{Context, Result};
use capture::config::expand_path;
use capture::usb::{
    ActivationController, DeviceCatalog, DeviceList, DeviceSummary, RusbBackend, UsbBackend,
};
use capture::{
    CaptureConfig, CaptureError, ConsumerGate, Diagnostic, FrameDump, LogFormat, ReaderExit,
    setup_logging, start_with_retry,
};
use clap::{Parser, Subcommand};
use protocol::{Endianness, HeaderByteOrder};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ios-screen-usb")]
#[command(
    author,
    version,
    about = "Capture the screen of an iOS device over USB",
    arg_required_else_help = true
)]
#[command(long_about = "
Activates the hidden screen mirroring USB configuration of an iOS device and
reads its bulk frame stream.

EXAMPLES:
    # List attached iOS devices as JSON
    ios-screen-usb devices

    # Dump frames from the first device to a file
    ios-screen-usb pull --output capture.bin

    # Pick a device and log transfers
    ios-screen-usb --udid 00008030-001A2B3C4D5E6F70 --log-level debug pull

CONFIGURATION:
    Configuration is looked up in the following order:
    1. Path specified with --config
    2. ~/.config/ios-screen-usb/capture.toml
    3. /etc/ios-screen-usb/capture.toml
    4. Built-in defaults
")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Device serial; the first attached device is used when omitted
    #[arg(short, long, global = true, value_name = "UDID", default_value = "")]
    udid: String,

    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log line format
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached iOS devices
    Devices,
    /// Expose the screen mirroring configuration
    Enable,
    /// Hide the screen mirroring configuration
    Disable,
    /// Stream frames until Ctrl+C
    Pull {
        /// Frame dump target, `-` for stdout
        #[arg(short, long, value_name = "PATH|-", default_value = "-")]
        output: String,
    },
}

#[derive(Debug, Serialize)]
struct DisableResult {
    udid: String,
    disable_request_sent: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = CaptureConfig::default();
        let path = CaptureConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config =
        CaptureConfig::load_or_default(args.config.clone()).context("Failed to load configuration")?;

    // Use CLI log settings if specified, otherwise use config values
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);
    let log_format = args.log_format.unwrap_or(config.general.log_format);
    setup_logging(log_level, log_format).context("Failed to setup logging")?;

    info!("ios-screen-usb v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = args.command else {
        return Ok(());
    };

    let backend: Arc<dyn UsbBackend> = Arc::new(
        RusbBackend::new().map_err(|e| CaptureError::usb("open libusb context", e))?,
    );

    match command {
        Command::Devices => list_devices(backend).await,
        Command::Enable => enable(backend, config, args.udid).await,
        Command::Disable => disable(backend, args.udid).await,
        Command::Pull { output } => pull(backend, config, args.udid, output).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

/// Print attached iOS devices as JSON
async fn list_devices(backend: Arc<dyn UsbBackend>) -> Result<()> {
    let devices = tokio::task::spawn_blocking(move || DeviceCatalog::new(backend).list())
        .await
        .context("Device listing task failed")??;

    let listing = DeviceList::new(&devices);
    info!("Found {} iOS device(s)", listing.devices.len());
    print_json(&listing)
}

async fn enable(backend: Arc<dyn UsbBackend>, config: CaptureConfig, udid: String) -> Result<()> {
    let settings = config.session_settings().activation;

    let summary = tokio::task::spawn_blocking(move || -> capture::Result<DeviceSummary> {
        let catalog = DeviceCatalog::new(backend);
        let conn = catalog.select_by_serial(&udid)?;
        let mut controller = ActivationController::new(catalog, settings);
        let active = controller.activate(conn)?;
        Ok(active.descriptor().summary())
    })
    .await
    .context("Activation task failed")??;

    print_json(&summary)
}

async fn disable(backend: Arc<dyn UsbBackend>, udid: String) -> Result<()> {
    let result = tokio::task::spawn_blocking(move || -> capture::Result<DisableResult> {
        let catalog = DeviceCatalog::new(backend);
        let conn = catalog.select_by_serial(&udid)?;
        let controller = ActivationController::new(catalog, Default::default());
        let sent = controller.deactivate(conn.as_ref());
        Ok(DisableResult {
            udid: conn.descriptor().serial.clone(),
            disable_request_sent: sent,
        })
    })
    .await
    .context("Deactivation task failed")??;

    print_json(&result)
}

/// Stream frames into `output` until Ctrl+C or the reader stops
async fn pull(
    backend: Arc<dyn UsbBackend>,
    config: CaptureConfig,
    udid: String,
    output: String,
) -> Result<()> {
    let writer: Box<dyn Write + Send> = if output == "-" {
        Box::new(BufWriter::new(io::stdout()))
    } else {
        let path = expand_path(&PathBuf::from(&output));
        let file = File::create(&path)
            .with_context(|| format!("Failed to create output file: {}", path.display()))?;
        Box::new(BufWriter::new(file))
    };

    let dump_order = match config.stream.byte_order {
        HeaderByteOrder::Big => Endianness::Big,
        HeaderByteOrder::Little | HeaderByteOrder::Auto => Endianness::Little,
    };
    let gate = ConsumerGate::new(Box::new(FrameDump::new(writer, dump_order)));

    let settings = config.session_settings();
    let policy = config.retry_policy();
    let mut session = tokio::task::spawn_blocking(move || {
        start_with_retry(backend, settings, &udid, gate, policy)
    })
    .await
    .context("Session start task failed")??;

    let exit_rx = session.take_reader_exit();
    info!("Press Ctrl+C to stop");

    let reader_exit = tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, stopping..."),
                Err(e) => error!("Error waiting for Ctrl+C: {}", e),
            }
            None
        }
        exit = wait_for_exit(exit_rx) => Some(exit),
    };

    let report = tokio::task::spawn_blocking(move || session.stop())
        .await
        .context("Session stop task failed")?;
    info!("Teardown finished: {:?}", report.order());
    if !report.is_clean() {
        for step in report.steps.iter().filter(|s| s.error.is_some()) {
            error!("Teardown step {:?} failed", step.step);
        }
    }

    match reader_exit {
        Some(ReaderExit::Corrupted(e)) => Err(CaptureError::StreamCorruption(e).into()),
        Some(ReaderExit::Failed(e)) => Err(CaptureError::Io(e).into()),
        _ => Ok(()),
    }
}

async fn wait_for_exit(exit_rx: Option<oneshot::Receiver<ReaderExit>>) -> ReaderExit {
    match exit_rx {
        Some(rx) => rx.await.unwrap_or(ReaderExit::Closed),
        None => std::future::pending().await,
    }
}

/// Print a failure as a JSON diagnostic on stderr
fn report_failure(err: &anyhow::Error) {
    let diagnostic = match err.downcast_ref::<CaptureError>() {
        Some(capture_err) => Diagnostic {
            kind: capture_err.kind().to_string(),
            message: format!("{:#}", err),
        },
        None => Diagnostic {
            kind: "Error".to_string(),
            message: format!("{:#}", err),
        },
    };

    match serde_json::to_string(&diagnostic) {
        Ok(json) => eprintln!("{}", json),
        Err(_) => eprintln!("{}: {}", diagnostic.kind, diagnostic.message),
    }
}
