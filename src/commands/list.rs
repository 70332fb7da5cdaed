//! List command implementation

use bootslot_dfu::{Host, UsbBus};

/// Print every matching device
pub fn run<B: UsbBus>(host: &Host<B>) -> Result<(), Box<dyn std::error::Error>> {
    let devices = host.enumerate()?;
    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }

    println!("{:<20} {:<12} {:<10} {:>8}", "Serial", "Mode", "ID", "Revision");
    println!("{}", "-".repeat(54));
    for device in &devices {
        println!(
            "{:<20} {:<12} {:04X}:{:04X} {:>8}",
            device.serial(),
            device.mode.to_string(),
            device.identity.vendor_id,
            device.product_id,
            format!("{:X}.{:02X}", device.identity.revision >> 8, device.identity.revision & 0xFF)
        );
    }
    Ok(())
}
