//! bootslot-core - Flash slot model and device-side DFU machinery
//!
//! This crate contains everything that runs on (or models) the device being
//! updated: the flash geometry and slot partitioning, the boot jump table
//! written at the start of flash, the SPI flash program engine and the DFU
//! responder state machine that drives it. It is `no_std` compatible so the
//! same code can back real firmware and the host-side simulator.
//!
//! # Features
//!
//! - `std` - Enable standard library support and TOML device profiles
//!
//! # Example
//!
//! ```ignore
//! use bootslot_core::geometry::FlashGeometry;
//! use bootslot_core::partition::compute_partitions;
//! use bootslot_core::slot_table::encode_slot_table;
//!
//! let geometry = FlashGeometry::default();
//! let slots = compute_partitions(&geometry, 4)?;
//! let table = encode_slot_table(&slots, geometry.address_width)?;
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "std")]
extern crate std;

pub mod channel;
#[cfg(feature = "std")]
pub mod config;
pub mod dfu;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod partition;
pub mod programmer;
pub mod protocol;
pub mod responder;
pub mod slot_table;
pub mod spi;

pub use error::{Error, Result};
