// CLI definitions using clap

use clap::{Parser, Subcommand};
use hidstream::DeviceSelector;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hidstream")]
#[command(author, version, about = "Inspect and talk to HID devices")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Adapter config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List connected HID devices
    #[command(visible_alias = "ls")]
    List {
        /// Only devices with this vendor ID (hex)
        #[arg(long, value_parser = parse_hex_u16)]
        vid: Option<u16>,

        /// Only devices with this product ID (hex)
        #[arg(long, value_parser = parse_hex_u16)]
        pid: Option<u16>,

        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print input reports as they arrive (Ctrl-C to stop)
    Monitor {
        /// Device path or VID:PID[:SERIAL]
        selector: DeviceSelector,

        /// Exit after this many reports
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Write an output report
    Write {
        /// Device path or VID:PID[:SERIAL]
        selector: DeviceSelector,

        /// Report bytes, decimal or 0x hex (e.g. 0x01 0x80 255)
        #[arg(required = true, num_args = 1..)]
        bytes: Vec<String>,
    },

    /// Get or send feature reports
    #[command(subcommand)]
    Feature(FeatureCommands),

    /// Show the descriptor of an opened device
    Info {
        /// Device path or VID:PID[:SERIAL]
        selector: DeviceSelector,
    },
}

#[derive(Subcommand)]
pub enum FeatureCommands {
    /// Read a feature report
    Get {
        /// Device path or VID:PID[:SERIAL]
        selector: DeviceSelector,

        /// Report ID
        #[arg(value_parser = clap::value_parser!(u8))]
        report_id: u8,

        /// Buffer length including the report ID byte
        length: usize,
    },

    /// Send a feature report (report ID first)
    Send {
        /// Device path or VID:PID[:SERIAL]
        selector: DeviceSelector,

        /// Report bytes, decimal or 0x hex
        #[arg(required = true, num_args = 1..)]
        bytes: Vec<String>,
    },
}

/// Parse a vendor or product ID given in hex, with or without `0x`
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex ID {s:?}: {e}"))
}
