//! Device discovery
//!
//! Devices are matched by vendor id and either of the two product ids the
//! firmware uses (one while the application runs, one in DFU mode). The
//! serial number is the only identity that survives the mode switch; a
//! match whose listing lacks it is opened briefly to read it.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DfuError, Result};
use crate::transport::{UsbBus, UsbDeviceInfo};

/// Product ids of one device model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProductIds {
    /// Product id while the application runs
    pub app: u16,
    /// Product id in DFU mode
    pub dfu: u16,
}

/// Which firmware a device is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normal application with a runtime DFU interface
    Application,
    /// DFU-mode firmware
    Update,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("application"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// Stable identity of a device across the mode switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Vendor id
    pub vendor_id: u16,
    /// Product id in application mode
    pub app_product_id: u16,
    /// Product id in DFU mode
    pub dfu_product_id: u16,
    /// Serial number string
    pub serial: String,
    /// `bcdDevice` as last seen
    pub revision: u16,
}

/// A discovered device, not yet opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Who the device is
    pub identity: DeviceIdentity,
    /// Product id it currently enumerates with
    pub product_id: u16,
    /// Mode derived from the product id
    pub mode: Mode,
    /// Bus information used to open it
    pub info: UsbDeviceInfo,
}

impl DeviceHandle {
    /// Serial number
    pub fn serial(&self) -> &str {
        &self.identity.serial
    }
}

/// List matching devices
///
/// Only a failure to list the bus is an error; devices that cannot be opened
/// or report no serial number are logged and skipped. A device is only
/// opened when the bus listing does not already carry its serial number.
pub fn enumerate<B: UsbBus + ?Sized>(bus: &B, vendor_id: u16, pids: ProductIds) -> Result<Vec<DeviceHandle>> {
    let devices = bus.devices().map_err(DfuError::Enumerate)?;
    let mut found = Vec::new();

    for info in devices {
        if info.vendor_id != vendor_id {
            continue;
        }
        let mode = if info.product_id == pids.app {
            Mode::Application
        } else if info.product_id == pids.dfu {
            Mode::Update
        } else {
            continue;
        };

        let serial = match info.serial.clone() {
            Some(serial) => Some(serial),
            None => match bus.open(&info) {
                Ok(transport) => transport.serial_number(),
                Err(e) => {
                    log::warn!(
                        "Skipping {:04X}:{:04X} at {}: {}",
                        info.vendor_id,
                        info.product_id,
                        info.location,
                        e
                    );
                    continue;
                }
            },
        };
        let Some(serial) = serial else {
            log::warn!("Skipping device at {}: no serial number", info.location);
            continue;
        };

        log::debug!("Found {} in {} mode at {}", serial, mode, info.location);
        found.push(DeviceHandle {
            identity: DeviceIdentity {
                vendor_id,
                app_product_id: pids.app,
                dfu_product_id: pids.dfu,
                serial,
                revision: info.revision,
            },
            product_id: info.product_id,
            mode,
            info,
        });
    }

    Ok(found)
}

/// Wait for the device with `serial` to appear
///
/// Scans every `interval` until a match appears (in `mode`, if given) or
/// `timeout` elapses. At least one scan is always made.
pub fn find<B: UsbBus + ?Sized>(
    bus: &B,
    vendor_id: u16,
    pids: ProductIds,
    serial: &str,
    mode: Option<Mode>,
    timeout: Duration,
    interval: Duration,
) -> Result<DeviceHandle> {
    let deadline = Instant::now() + timeout;
    loop {
        let matched = enumerate(bus, vendor_id, pids)?
            .into_iter()
            .find(|d| d.identity.serial == serial && mode.map_or(true, |m| d.mode == m));
        if let Some(handle) = matched {
            return Ok(handle);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DfuError::NotFound {
                serial: serial.to_string(),
            });
        }
        thread::sleep(interval.min(deadline - now));
    }
}
