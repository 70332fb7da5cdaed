//! Flash geometry
//!
//! Describes the boot flash as the program engine and the partition model
//! see it: total size, program page, erase block and address width.

use crate::error::{Error, Result};
use crate::spi::{opcodes, AddressWidth};

/// Largest page the engine buffers for a single program burst
pub const MAX_PAGE_SIZE: u32 = 512;

/// Physical layout of the boot flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Total flash size in bytes
    pub total_size: u32,
    /// Program page size in bytes
    pub page_size: u32,
    /// Erase block size in bytes (4 KiB, 32 KiB or 64 KiB)
    pub erase_block_size: u32,
    /// Address width used on the wire
    pub address_width: AddressWidth,
}

impl Default for FlashGeometry {
    /// A 16 MiB part with 256 byte pages and 64 KiB erase blocks
    fn default() -> Self {
        Self {
            total_size: 16 * 1024 * 1024,
            page_size: 256,
            erase_block_size: 64 * 1024,
            address_width: AddressWidth::ThreeByte,
        }
    }
}

impl FlashGeometry {
    /// Create a geometry and validate it
    pub fn new(
        total_size: u32,
        page_size: u32,
        erase_block_size: u32,
        address_width: AddressWidth,
    ) -> Result<Self> {
        let geometry = Self {
            total_size,
            page_size,
            erase_block_size,
            address_width,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Check the size and divisibility rules
    ///
    /// The page divides the erase block, the erase block divides the total
    /// size, the erase block has a matching opcode and the whole part is
    /// addressable with the configured width.
    pub fn validate(&self) -> Result<()> {
        if self.total_size == 0 || self.page_size == 0 || self.erase_block_size == 0 {
            return Err(Error::InvalidGeometry);
        }
        if self.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidGeometry);
        }
        if self.erase_block_size % self.page_size != 0 || self.total_size % self.erase_block_size != 0 {
            return Err(Error::InvalidGeometry);
        }
        if self.address_width == AddressWidth::None {
            return Err(Error::InvalidGeometry);
        }
        if u64::from(self.total_size) > self.address_width.max_size() {
            return Err(Error::InvalidGeometry);
        }
        self.erase_opcode().map(|_| ())
    }

    /// Erase opcode for the configured erase block and address width
    pub fn erase_opcode(&self) -> Result<u8> {
        let four = self.address_width == AddressWidth::FourByte;
        match (self.erase_block_size, four) {
            (0x1000, false) => Ok(opcodes::SE_20),
            (0x1000, true) => Ok(opcodes::SE_21),
            (0x8000, false) => Ok(opcodes::BE_52),
            (0x8000, true) => Ok(opcodes::BE_5C),
            (0x10000, false) => Ok(opcodes::BE_D8),
            (0x10000, true) => Ok(opcodes::BE_DC),
            _ => Err(Error::InvalidGeometry),
        }
    }

    /// Page program opcode for the configured address width
    pub fn program_opcode(&self) -> u8 {
        crate::protocol::spi25::program_opcode(self.address_width)
    }

    /// Number of erase blocks on the part
    pub fn erase_block_count(&self) -> u32 {
        self.total_size / self.erase_block_size
    }

    /// Start of the erase block containing `addr`
    pub fn block_base(&self, addr: u32) -> u32 {
        addr - addr % self.erase_block_size
    }

    /// Bytes left in the page containing `addr`
    pub fn page_remaining(&self, addr: u32) -> u32 {
        self.page_size - addr % self.page_size
    }
}
