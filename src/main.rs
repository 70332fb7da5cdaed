//! bootslot - Firmware updates for devices booting from multi-slot flash
//!
//! Talks USB DFU to a device's bootloader: switches it from its application
//! into DFU mode, streams an image into one flash slot and rewrites the slot
//! table that tells the boot ROM where each slot starts.

mod backends;
mod cli;
mod commands;
mod error;

use bootslot_core::config::DeviceProfile;
use bootslot_dfu::{Host, HostConfig};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {}
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    if let Commands::Backends = cli.command {
        commands::list_backends();
        return Ok(());
    }

    let profile = load_profile(cli.profile.as_deref())?;
    let bus = backends::open_bus(&cli.backend, &profile)?;
    let host = Host::new(bus, HostConfig::from(&profile));

    match cli.command {
        Commands::List => commands::list::run(&host),
        Commands::Info { device } => commands::info::run(&host, &profile, device.serial.as_deref()),
        Commands::Flash {
            device,
            slot,
            input,
        } => commands::flash::run(&host, device.serial.as_deref(), slot, &input),
        Commands::Table { device } => commands::table::run(&host, &profile, device.serial.as_deref()),
        Commands::Clear { device } => commands::clear::run(&host, device.serial.as_deref()),
        Commands::Backends => Ok(()),
    }
}

/// Load the profile at `path`, or the built-in defaults
fn load_profile(path: Option<&Path>) -> Result<DeviceProfile, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let profile = DeviceProfile::from_toml_file(path)?;
            log::debug!("Loaded profile {}", path.display());
            Ok(profile)
        }
        None => {
            log::debug!("Using built-in device profile");
            Ok(DeviceProfile::default())
        }
    }
}
