//! Flash command implementation

use std::fs;
use std::path::Path;

use bootslot_dfu::{DfuError, Host, Progress, UsbBus};
use indicatif::{ProgressBar, ProgressStyle};

use super::select_device;

fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) Writing",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Write `input` into `slot`
pub fn run<B: UsbBus>(
    host: &Host<B>,
    serial: Option<&str>,
    slot: u8,
    input: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = fs::read(input)?;
    println!("Read {} bytes from {:?}", data.len(), input);

    let device = select_device(host, serial)?;
    let mut dfu = host.enter_update_mode(&device)?;

    let pb = progress_bar(data.len());
    let mut on_progress = |p: Progress| pb.set_position(p.bytes_done as u64);
    let result = host.upload(&mut dfu, slot, &data, Some(&mut on_progress));

    match result {
        Ok(report) => {
            pb.finish_with_message("done");
            println!(
                "Slot {} written: {} bytes in {} transfers ({:.2?})",
                report.slot, report.bytes, report.chunks, report.elapsed
            );
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            explain(&e);
            Err(e.into())
        }
    }
}

/// Tell the user what state the slot is left in
fn explain(err: &DfuError) {
    if err.slot_indeterminate() {
        eprintln!("The slot may hold a partial image; flash it again before booting from it.");
    } else if err.is_retry_safe() {
        eprintln!("Nothing was written; the command can be retried.");
    }
}
