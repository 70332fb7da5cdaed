//! Table command implementation

use bootslot_core::config::DeviceProfile;
use bootslot_dfu::{Host, UsbBus};

use super::select_device;

/// Rewrite the slot table for the profile's layout
pub fn run<B: UsbBus>(
    host: &Host<B>,
    profile: &DeviceProfile,
    serial: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let geometry = profile.geometry()?;
    let device = select_device(host, serial)?;
    let mut dfu = host.enter_update_mode(&device)?;

    let report = host.write_partitions(&mut dfu, &geometry)?;
    println!(
        "Slot table for {} slots written ({} bytes)",
        host.config().slot_count,
        report.bytes
    );
    Ok(())
}
