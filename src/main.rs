//! hidstream command-line tool
//!
//! Lists devices, monitors input reports and sends output/feature reports.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use hidstream::validate::parse_byte_list;
use hidstream::{
    list_devices_async, AdapterConfig, DeviceSelector, HidBackend, HidDevice, HidDeviceAsync,
    HidError, HidapiBackend,
};

mod cli;
use cli::{Cli, Commands, FeatureCommands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            AdapterConfig::load(path)?
        }
        None => AdapterConfig::default(),
    };
    debug!("Adapter config: {:?}", config);

    match cli.command {
        Commands::List { vid, pid, json } => list(vid, pid, json).await,
        Commands::Monitor { selector, count } => monitor(selector, count, config).await,
        Commands::Write { selector, bytes } => {
            let report = parse_byte_list(&bytes.join(" "))?;
            let device = open_sync(&selector, config)?;
            let written = device.write(&report)?;
            println!("Wrote {written} bytes");
            device.close()?;
            Ok(())
        }
        Commands::Feature(FeatureCommands::Get {
            selector,
            report_id,
            length,
        }) => {
            let device = open_sync(&selector, config)?;
            let report = device.get_feature_report(report_id, length)?;
            println!("{}", hex(&report));
            device.close()?;
            Ok(())
        }
        Commands::Feature(FeatureCommands::Send { selector, bytes }) => {
            let report = parse_byte_list(&bytes.join(" "))?;
            let device = open_sync(&selector, config)?;
            let sent = device.send_feature_report(&report)?;
            println!("Sent {sent} bytes");
            device.close()?;
            Ok(())
        }
        Commands::Info { selector } => {
            let device = open_sync(&selector, config)?;
            let desc = device.device_info()?;
            println!("{}", serde_json::to_string_pretty(&desc)?);
            device.close()?;
            Ok(())
        }
    }
}

fn open_sync(selector: &DeviceSelector, config: AdapterConfig) -> Result<HidDevice> {
    HidDevice::open_with(&HidapiBackend::new(), selector, config)
        .with_context(|| format!("Failed to open {selector}"))
}

async fn list(vid: Option<u16>, pid: Option<u16>, json: bool) -> Result<()> {
    let devices = list_devices_async(vid, pid).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("No HID devices found");
    }
    for desc in &devices {
        println!("{desc}");
    }
    Ok(())
}

enum MonitorEvent {
    Report(Vec<u8>),
    Error(HidError),
}

async fn monitor(
    selector: DeviceSelector,
    count: Option<usize>,
    config: AdapterConfig,
) -> Result<()> {
    let backend: Arc<dyn HidBackend> = Arc::new(HidapiBackend::new());
    let device = HidDeviceAsync::open_with(backend, selector.clone(), config)
        .await
        .with_context(|| format!("Failed to open {selector}"))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let data_tx = tx.clone();
    device.on_data(move |report| {
        let _ = data_tx.send(MonitorEvent::Report(report.clone()));
    })?;
    device.on_error(move |error| {
        let _ = tx.send(MonitorEvent::Error(error.clone()));
    })?;

    info!("Monitoring {}. Press Ctrl+C to exit.", selector);
    let mut seen = 0usize;
    let result = loop {
        if count.is_some_and(|n| seen >= n) {
            break Ok(());
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
            event = rx.recv() => match event {
                Some(MonitorEvent::Report(report)) => {
                    seen += 1;
                    println!("{:>6}  {}", seen, hex(&report));
                }
                Some(MonitorEvent::Error(error)) => break Err(error),
                None => break Ok(()),
            },
        }
    };

    device.close().await?;
    result.context("Read stream stopped")
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
