//! JEDEC SPI NOR opcodes used by the update path
//!
//! Write enable, page program, block erase and the status register are all
//! the engine needs; the plain reads serve tests and read-back.

/// Set the write enable latch
pub const WREN: u8 = 0x06;
/// Clear the write enable latch
pub const WRDI: u8 = 0x04;

/// Read status register 1
pub const RDSR: u8 = 0x05;
/// Busy: an erase or program is running
pub const SR1_WIP: u8 = 0x01;
/// Write enable latch is set
pub const SR1_WEL: u8 = 0x02;

/// Read, 3-byte address
pub const READ: u8 = 0x03;
/// Read, 4-byte address
pub const READ_4B: u8 = 0x13;

/// Page program, 3-byte address
pub const PP: u8 = 0x02;
/// Page program, 4-byte address
pub const PP_4B: u8 = 0x12;

/// 4 KiB erase, 3-byte address
pub const SE_20: u8 = 0x20;
/// 4 KiB erase, 4-byte address
pub const SE_21: u8 = 0x21;
/// 32 KiB erase, 3-byte address
pub const BE_52: u8 = 0x52;
/// 32 KiB erase, 4-byte address
pub const BE_5C: u8 = 0x5C;
/// 64 KiB erase, 3-byte address
pub const BE_D8: u8 = 0xD8;
/// 64 KiB erase, 4-byte address
pub const BE_DC: u8 = 0xDC;
