//! CLI command implementations
//!
//! Every command resolves its device the same way: the serial number given on
//! the command line, or the only matching device attached.

pub mod clear;
pub mod flash;
pub mod info;
pub mod list;
pub mod table;

use std::time::Duration;

use bootslot_dfu::{DeviceHandle, Host, UsbBus};

use crate::backends;
use crate::error::CliError;

/// How long to wait for a device named by serial number to show up
const FIND_TIMEOUT: Duration = Duration::from_secs(2);

/// List compiled-in backends
pub fn list_backends() {
    println!("Available backends:");
    println!();
    for backend in backends::available_backends() {
        println!("  {:<8} - {}", backend.name, backend.description);
    }
}

/// Resolve the device a command operates on
pub fn select_device<B: UsbBus>(
    host: &Host<B>,
    serial: Option<&str>,
) -> Result<DeviceHandle, Box<dyn std::error::Error>> {
    if let Some(serial) = serial {
        return Ok(host.find(serial, FIND_TIMEOUT)?);
    }

    let mut devices = host.enumerate()?;
    match devices.len() {
        0 => Err(CliError::NoDevice.into()),
        1 => Ok(devices.remove(0)),
        n => Err(CliError::MultipleDevices(n).into()),
    }
}

pub(crate) fn format_size(bytes: u32) -> String {
    if bytes >= 1024 * 1024 && bytes % (1024 * 1024) == 0 {
        format!("{} MiB", bytes / (1024 * 1024))
    } else if bytes >= 1024 && bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{} B", bytes)
    }
}
