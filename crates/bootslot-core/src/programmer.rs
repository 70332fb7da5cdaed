//! SPI master abstraction
//!
//! The flash program engine only ever needs to push single-I/O commands at
//! the boot flash, so the master trait is small and synchronous. Firmware
//! implements it over its SPI peripheral; the host-side simulator implements
//! it over an in-memory emulator.

use crate::error::Result;
use crate::spi::SpiCommand;
use bitflags::bitflags;

bitflags! {
    /// Optional capabilities of a master
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpiFeatures: u32 {
        /// Can clock out 4-byte addresses
        const FOUR_BYTE_ADDR = 1 << 0;
    }
}

impl Default for SpiFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

/// SPI master driving the boot flash
///
/// `execute` must perform the whole transaction (opcode, address, write data,
/// read data) with chip select held for its duration. Nothing here waits:
/// callers poll the status register themselves.
pub trait SpiMaster {
    /// Capabilities beyond plain 3-byte commands
    fn features(&self) -> SpiFeatures {
        SpiFeatures::FOUR_BYTE_ADDR
    }

    /// Longest data phase one program command may carry
    fn max_write_len(&self) -> usize;

    /// Run one command
    fn execute(&mut self, cmd: &mut SpiCommand<'_>) -> Result<()>;
}

impl<M: SpiMaster + ?Sized> SpiMaster for &mut M {
    fn features(&self) -> SpiFeatures {
        (**self).features()
    }

    fn max_write_len(&self) -> usize {
        (**self).max_write_len()
    }

    fn execute(&mut self, cmd: &mut SpiCommand<'_>) -> Result<()> {
        (**self).execute(cmd)
    }
}
