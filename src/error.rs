//! CLI errors

use bootslot_core::config::ConfigError;
use thiserror::Error;

/// Failures outside the DFU protocol itself
#[derive(Debug, Error)]
pub enum CliError {
    /// `--backend` named something not compiled in
    #[error("unknown backend '{name}' (available: {available})")]
    UnknownBackend { name: String, available: String },

    /// Profile could not be loaded
    #[error(transparent)]
    Profile(#[from] ConfigError),

    /// Simulated device could not be built from the profile
    #[error("cannot simulate this device: {0}")]
    Simulation(#[from] bootslot_core::Error),

    /// No matching device is attached
    #[error("no device found")]
    NoDevice,

    /// More than one device matches and no serial number was given
    #[error("{0} devices found, pick one with --serial")]
    MultipleDevices(usize),
}
