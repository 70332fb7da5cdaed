//! Transport seams
//!
//! The host client never talks to a USB stack directly. It lists and opens
//! devices through a [`UsbBus`] and issues class requests on the DFU
//! interface through the [`ControlTransport`] that `open` returns. Dropping
//! the transport releases the device.

use bootslot_core::dfu::{FunctionalDescriptor, Request};

use crate::error::TransportError;

/// What the bus reports about a device without opening it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    /// Vendor id
    pub vendor_id: u16,
    /// Product id
    pub product_id: u16,
    /// `bcdDevice`
    pub revision: u16,
    /// Serial number, if the platform exposes it without opening the device
    pub serial: Option<String>,
    /// Backend-specific location used to open the device again
    pub location: String,
}

/// Class requests on an opened DFU interface
pub trait ControlTransport: Send {
    /// Host-to-device class request with a data stage
    fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> Result<(), TransportError>;

    /// Device-to-host class request reading up to `length` bytes
    fn control_in(&mut self, request: Request, value: u16, length: u16) -> Result<Vec<u8>, TransportError>;

    /// SET_INTERFACE on the DFU interface
    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError>;

    /// The interface's DFU functional descriptor
    fn functional_descriptor(&self) -> Option<FunctionalDescriptor>;

    /// Serial number string read from the device
    fn serial_number(&self) -> Option<String>;
}

/// A USB bus that can be listed and opened
pub trait UsbBus {
    /// List every device currently attached
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError>;

    /// Open a listed device and claim its DFU interface
    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn ControlTransport>, TransportError>;
}

impl<B: UsbBus + ?Sized> UsbBus for Box<B> {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        (**self).devices()
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn ControlTransport>, TransportError> {
        (**self).open(info)
    }
}

impl<B: UsbBus + ?Sized> UsbBus for &B {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        (**self).devices()
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn ControlTransport>, TransportError> {
        (**self).open(info)
    }
}
