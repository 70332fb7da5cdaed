//! bootslot-dfu - Host side of a DFU slot update
//!
//! Finds devices by vendor/product id and serial number, switches them from
//! their application into DFU mode and streams images into flash slots or
//! writes the slot table, with every wait bounded and every failure reported
//! with the stage it happened in.
//!
//! # Features
//!
//! - `usb` - Real hardware through nusb ([`usb::NusbBus`])
//! - `dummy` - A simulated bus backed by the emulated flash ([`sim::SimBus`])

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod discovery;
pub mod error;
pub mod session;
#[cfg(any(test, feature = "dummy"))]
pub mod sim;
pub mod transport;
#[cfg(feature = "usb")]
pub mod usb;

pub use client::{Canceller, DfuHandle, Host, HostConfig, Progress, TransferReport, TransferSession};
pub use discovery::{DeviceHandle, DeviceIdentity, Mode, ProductIds};
pub use error::{DfuError, ErrorKind, Result, Stage, TransportError};
pub use session::{SessionGuard, SessionRegistry};
pub use transport::{ControlTransport, UsbBus, UsbDeviceInfo};
