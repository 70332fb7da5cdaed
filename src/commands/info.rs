//! Info command implementation

use bootslot_core::config::DeviceProfile;
use bootslot_core::partition::{compute_partitions, slot_table_partition};
use bootslot_core::slot_table::{decode_slot_table, encode_slot_table};
use bootslot_dfu::{Host, UsbBus};

use super::{format_size, select_device};

/// Show the device's DFU interface and the profile's slot layout
pub fn run<B: UsbBus>(
    host: &Host<B>,
    profile: &DeviceProfile,
    serial: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let device = select_device(host, serial)?;
    println!("Device:        {} ({} mode)", device.serial(), device.mode);

    let mut dfu = host.enter_update_mode(&device)?;
    let descriptor = *dfu.descriptor();
    let report = dfu.get_status()?;
    println!(
        "DFU version:   {:X}.{:02X}",
        descriptor.dfu_version >> 8,
        descriptor.dfu_version & 0xFF
    );
    println!("Transfer size: {} bytes", descriptor.transfer_size);
    println!("Detach:        {} ms", descriptor.detach_timeout_ms);
    println!("Attributes:    {:?}", descriptor.attributes);
    println!("State:         {} ({})", report.state, report.status);
    dfu.close();

    let geometry = profile.geometry()?;
    let slots = compute_partitions(&geometry, profile.flash.slots)?;
    let table = slot_table_partition(&geometry, profile.flash.slots);
    println!();
    println!(
        "Flash:         {} ({} pages, {} erase blocks)",
        format_size(geometry.total_size),
        format_size(geometry.page_size),
        format_size(geometry.erase_block_size)
    );
    println!(
        "  table   alt {}  0x{:08X}..0x{:08X}",
        table.index, table.start, table.end
    );
    for slot in &slots {
        println!(
            "  slot {}  alt {}  0x{:08X}..0x{:08X}  {}",
            slot.index,
            slot.index,
            slot.start,
            slot.end,
            format_size(slot.size())
        );
    }

    let encoded = encode_slot_table(&slots, geometry.address_width)?;
    println!();
    println!("Slot table ({} bytes):", encoded.len());
    for (i, record) in decode_slot_table(&encoded)?.iter().enumerate() {
        println!(
            "  record {}  boot 0x{:08X} ({}-byte address)",
            i,
            record.boot_address,
            record.address_width.bytes()
        );
    }
    Ok(())
}
