//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[cfg(feature = "usb")]
const DEFAULT_BACKEND: &str = "usb";
#[cfg(not(feature = "usb"))]
const DEFAULT_BACKEND: &str = "dummy";

/// Parse a slot index, decimal or hex
fn parse_slot(s: &str) -> Result<u8, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u8>().map_err(|e| format!("Invalid slot: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "bootslot")]
#[command(author, version, about = "DFU updater for multi-slot boot flash", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Device profile (TOML); built-in defaults when omitted
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,

    /// USB backend to use (see `bootslot backends`)
    #[arg(short, long, global = true, default_value = DEFAULT_BACKEND)]
    pub backend: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// Device selection shared across commands
#[derive(clap::Args, Debug, Clone, Default)]
pub struct DeviceArgs {
    /// Serial number of the device (optional when exactly one is attached)
    #[arg(short, long)]
    pub serial: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached devices in either mode
    List,

    /// Show a device's DFU descriptor, state and slot layout
    Info {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Write a firmware image into a slot
    Flash {
        #[command(flatten)]
        device: DeviceArgs,

        /// Target slot
        #[arg(long, value_parser = parse_slot)]
        slot: u8,

        /// Image file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Rewrite the slot table for the profile's layout
    Table {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Clear a device's error status
    Clear {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// List compiled-in backends
    Backends,
}
