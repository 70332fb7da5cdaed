//! Clear command implementation

use bootslot_core::dfu::State;
use bootslot_dfu::{Host, UsbBus};

use super::select_device;

/// Return a device in the error state to dfuIDLE
pub fn run<B: UsbBus>(host: &Host<B>, serial: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let device = select_device(host, serial)?;
    let mut dfu = host.enter_update_mode(&device)?;

    let report = dfu.get_status()?;
    if report.state != State::Error {
        println!("{} is in {}, nothing to clear", device.serial(), report.state);
        return Ok(());
    }

    println!("Clearing '{}' on {}", report.status, device.serial());
    host.clear_status(&mut dfu)?;
    println!("{} is back in {}", device.serial(), State::DfuIdle);
    Ok(())
}
