//! Backend registration and dispatch
//!
//! The set of USB backends is fixed at compile time by cargo features.

use bootslot_core::config::DeviceProfile;
use bootslot_dfu::UsbBus;

use crate::error::CliError;

/// Serial number of the simulated device
#[cfg(feature = "dummy")]
pub const DUMMY_SERIAL: &str = "DUMMY0001";

/// Information about a backend
pub struct BackendInfo {
    /// Name used on the command line
    pub name: &'static str,
    /// Short description
    pub description: &'static str,
}

/// All backends enabled at compile time
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "usb")]
    backends.push(BackendInfo {
        name: "usb",
        description: "USB devices through nusb",
    });

    #[cfg(feature = "dummy")]
    backends.push(BackendInfo {
        name: "dummy",
        description: "Simulated device with in-memory flash (serial DUMMY0001)",
    });

    backends
}

/// Comma-separated backend names
pub fn backend_names() -> String {
    available_backends()
        .iter()
        .map(|b| b.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Open the bus called `name`
#[allow(unused_variables)]
pub fn open_bus(name: &str, profile: &DeviceProfile) -> Result<Box<dyn UsbBus>, CliError> {
    match name {
        #[cfg(feature = "usb")]
        "usb" => Ok(Box::new(bootslot_dfu::usb::NusbBus::new(
            profile.timing.control_timeout(),
        ))),
        #[cfg(feature = "dummy")]
        "dummy" => {
            use bootslot_dfu::sim::{SimBus, SimDeviceConfig};
            let mut bus = SimBus::new();
            bus.attach(SimDeviceConfig::from_profile(profile, DUMMY_SERIAL)?)?;
            log::info!("Simulated device {} attached", DUMMY_SERIAL);
            Ok(Box::new(bus))
        }
        _ => Err(CliError::UnknownBackend {
            name: name.to_string(),
            available: backend_names(),
        }),
    }
}
