//! USB backend over nusb
//!
//! Lists devices with `nusb::list_devices`, finds the DFU interface (class
//! 0xFE, subclass 1) in the active configuration and issues class requests
//! to it. Blocking throughout.

use std::time::Duration;

use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient, TransferError};
use nusb::{Interface, MaybeFuture};

use bootslot_core::dfu::{
    is_dfu_interface, FunctionalDescriptor, Request, FUNCTIONAL_DESCRIPTOR_TYPE,
};

use crate::error::TransportError;
use crate::transport::{ControlTransport, UsbBus, UsbDeviceInfo};

fn location(info: &nusb::DeviceInfo) -> String {
    format!("{}-{}", info.bus_id(), info.device_address())
}

fn map_transfer(e: TransferError) -> TransportError {
    match e {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Timeout,
        other => TransportError::Usb(other.to_string()),
    }
}

/// The host's USB bus
#[derive(Debug, Clone)]
pub struct NusbBus {
    timeout: Duration,
}

impl NusbBus {
    /// Bus whose control requests give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for NusbBus {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl UsbBus for NusbBus {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let devices = nusb::list_devices()
            .wait()
            .map_err(|e| TransportError::Usb(e.to_string()))?;
        Ok(devices
            .map(|d| UsbDeviceInfo {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                revision: d.device_version(),
                serial: d.serial_number().map(str::to_string),
                location: location(&d),
            })
            .collect())
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn ControlTransport>, TransportError> {
        let device_info = nusb::list_devices()
            .wait()
            .map_err(|e| TransportError::Open(e.to_string()))?
            .find(|d| location(d) == info.location)
            .ok_or(TransportError::Disconnected)?;

        log::debug!(
            "Opening {:04X}:{:04X} at {}",
            device_info.vendor_id(),
            device_info.product_id(),
            info.location
        );
        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let config = device
            .active_configuration()
            .map_err(|e| TransportError::Open(format!("failed to get configuration: {}", e)))?;

        let mut found = None;
        for alt in config.interface_alt_settings() {
            if !is_dfu_interface(alt.class(), alt.subclass(), alt.protocol()) {
                continue;
            }
            let descriptor = alt
                .descriptors()
                .filter(|d| d.descriptor_type() == FUNCTIONAL_DESCRIPTOR_TYPE)
                .find_map(|d| FunctionalDescriptor::parse(&d[..]).ok());
            if found.is_none() || descriptor.is_some() {
                found = Some((alt.interface_number(), descriptor));
            }
            if descriptor.is_some() {
                break;
            }
        }
        let (iface_num, descriptor) = found.ok_or(TransportError::NoDfuInterface)?;
        log::debug!("DFU interface {} ({:?})", iface_num, descriptor);

        let interface = device
            .claim_interface(iface_num)
            .wait()
            .map_err(|e| TransportError::Open(format!("failed to claim interface {}: {}", iface_num, e)))?;

        Ok(Box::new(NusbTransport {
            interface,
            iface_num,
            descriptor,
            serial: device_info.serial_number().map(str::to_string),
            timeout: self.timeout,
        }))
    }
}

/// Claimed DFU interface
pub struct NusbTransport {
    interface: Interface,
    iface_num: u8,
    descriptor: Option<FunctionalDescriptor>,
    serial: Option<String>,
    timeout: Duration,
}

impl ControlTransport for NusbTransport {
    fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: request as u8,
                    value,
                    index: u16::from(self.iface_num),
                    data,
                },
                self.timeout,
            )
            .wait()
            .map_err(map_transfer)
    }

    fn control_in(&mut self, request: Request, value: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        self.interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: request as u8,
                    value,
                    index: u16::from(self.iface_num),
                    length,
                },
                self.timeout,
            )
            .wait()
            .map_err(map_transfer)
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError> {
        self.interface
            .set_alt_setting(alt)
            .wait()
            .map_err(|e| TransportError::Usb(e.to_string()))
    }

    fn functional_descriptor(&self) -> Option<FunctionalDescriptor> {
        self.descriptor
    }

    fn serial_number(&self) -> Option<String> {
        self.serial.clone()
    }
}
