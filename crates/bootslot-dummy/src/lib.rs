//! bootslot-dummy - In-memory SPI NOR emulator for testing
//!
//! Emulates the boot flash behind a [`SpiMaster`]: program can only clear
//! bits, erase sets a whole block to `0xFF`, and both need the write enable
//! latch. Unlike an instant in-memory copy it also models the busy bit: after
//! an erase or program the status register reports WIP for a configurable
//! number of reads. Faults can be injected to exercise error paths.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use bootslot_core::error::{Error, Result};
use bootslot_core::programmer::{SpiFeatures, SpiMaster};
use bootslot_core::spi::{opcodes, SpiCommand};

/// Size and timing of the emulated part
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Bytes of storage
    pub size: usize,
    /// Largest program burst, and the wrap boundary it must not cross
    pub page_size: usize,
    /// Status reads that report busy after a page program
    pub program_busy_reads: u32,
    /// Status reads that report busy after an erase
    pub erase_busy_reads: u32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            size: 16 * 1024 * 1024,
            page_size: 256,
            program_busy_reads: 2,
            erase_busy_reads: 8,
        }
    }
}

/// One erase command the flash accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRecord {
    /// Opcode that was accepted
    pub opcode: u8,
    /// Block-aligned address that was erased
    pub addr: u32,
}

/// Dummy flash
///
/// Emulates a SPI NOR part in memory for testing purposes.
#[cfg(feature = "alloc")]
pub struct DummyFlash {
    config: DummyConfig,
    data: Vec<u8>,
    write_enabled: bool,
    busy_reads_left: u32,
    stuck_busy: bool,
    write_protect: bool,
    fail_program: bool,
    erase_log: Vec<EraseRecord>,
    programs: usize,
    busy_violations: usize,
}

#[cfg(feature = "alloc")]
impl DummyFlash {
    /// Create a new erased dummy flash with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let data = vec![0xFF; config.size];
        Self {
            config,
            data,
            write_enabled: false,
            busy_reads_left: 0,
            stuck_busy: false,
            write_protect: false,
            fail_program: false,
            erase_log: Vec::new(),
            programs: 0,
            busy_violations: 0,
        }
    }

    /// Emulated part whose first bytes are `initial_data` (the rest erased)
    pub fn with_data(config: DummyConfig, initial_data: &[u8]) -> Self {
        let mut flash = Self::new(config);
        let len = core::cmp::min(initial_data.len(), flash.data.len());
        flash.data[..len].copy_from_slice(&initial_data[..len]);
        flash
    }

    /// Current contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size and timing in use
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Every erase accepted so far, in order
    pub fn erase_log(&self) -> &[EraseRecord] {
        &self.erase_log
    }

    /// Number of page programs accepted so far
    pub fn program_count(&self) -> usize {
        self.programs
    }

    /// Commands that arrived while the part was still busy
    pub fn busy_violations(&self) -> usize {
        self.busy_violations
    }

    /// Keep the busy bit set forever (or release it)
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    /// Ignore WREN so every program and erase is refused
    pub fn set_write_protect(&mut self, protect: bool) {
        self.write_protect = protect;
    }

    /// Make page programs fail at the bus level
    pub fn set_fail_program(&mut self, fail: bool) {
        self.fail_program = fail;
    }

    fn is_busy(&self) -> bool {
        self.stuck_busy || self.busy_reads_left > 0
    }

    fn status1(&mut self) -> u8 {
        let mut sr = 0;
        if self.is_busy() {
            sr |= opcodes::SR1_WIP;
            self.busy_reads_left = self.busy_reads_left.saturating_sub(1);
        }
        if self.write_enabled {
            sr |= opcodes::SR1_WEL;
        }
        sr
    }

    fn handle_read(&mut self, cmd: &mut SpiCommand<'_>) -> Result<()> {
        let addr = cmd.address.unwrap_or(0) as usize;
        let len = cmd.read_buf.len();

        if addr + len > self.data.len() {
            return Err(Error::AddressOutOfBounds);
        }

        cmd.read_buf.copy_from_slice(&self.data[addr..addr + len]);
        Ok(())
    }

    fn handle_page_program(&mut self, cmd: &SpiCommand<'_>) -> Result<()> {
        if self.fail_program {
            return Err(Error::SpiTransferFailed);
        }
        if !self.write_enabled {
            return Err(Error::WriteProtected);
        }

        let addr = cmd.address.unwrap_or(0) as usize;
        let data = cmd.write_data;
        let page = self.config.page_size;

        if addr + data.len() > self.data.len() {
            return Err(Error::AddressOutOfBounds);
        }
        // A real part wraps inside the page; treat that as a caller bug
        if data.len() > page || addr % page + data.len() > page {
            return Err(Error::InvalidAlignment);
        }

        for (i, &byte) in data.iter().enumerate() {
            self.data[addr + i] &= byte;
        }

        log::trace!("dummy: PP {} bytes at 0x{:08X}", data.len(), addr);
        self.programs += 1;
        self.write_enabled = false;
        self.busy_reads_left = self.config.program_busy_reads;
        Ok(())
    }

    fn handle_block_erase(&mut self, cmd: &SpiCommand<'_>, erase_size: usize) -> Result<()> {
        if !self.write_enabled {
            return Err(Error::WriteProtected);
        }

        let addr = cmd.address.unwrap_or(0) as usize;

        let aligned_addr = addr & !(erase_size - 1);

        if aligned_addr + erase_size > self.data.len() {
            return Err(Error::AddressOutOfBounds);
        }

        self.data[aligned_addr..aligned_addr + erase_size].fill(0xFF);

        log::trace!("dummy: erase 0x{:02X} at 0x{:08X}", cmd.opcode, aligned_addr);
        self.erase_log.push(EraseRecord {
            opcode: cmd.opcode,
            addr: aligned_addr as u32,
        });
        self.write_enabled = false;
        self.busy_reads_left = self.config.erase_busy_reads;
        Ok(())
    }
}

#[cfg(feature = "alloc")]
impl SpiMaster for DummyFlash {
    fn features(&self) -> SpiFeatures {
        SpiFeatures::FOUR_BYTE_ADDR
    }

    fn max_write_len(&self) -> usize {
        self.config.page_size
    }

    fn execute(&mut self, cmd: &mut SpiCommand<'_>) -> Result<()> {
        // Only RDSR is answered while an operation is running
        if cmd.opcode != opcodes::RDSR && self.is_busy() {
            log::warn!("dummy: opcode 0x{:02X} while busy", cmd.opcode);
            self.busy_violations += 1;
            return Ok(());
        }

        match cmd.opcode {
            opcodes::RDSR => {
                if !cmd.read_buf.is_empty() {
                    cmd.read_buf[0] = self.status1();
                }
                Ok(())
            }

            opcodes::WREN => {
                self.write_enabled = !self.write_protect;
                Ok(())
            }
            opcodes::WRDI => {
                self.write_enabled = false;
                Ok(())
            }

            opcodes::READ | opcodes::READ_4B => self.handle_read(cmd),

            opcodes::PP | opcodes::PP_4B => self.handle_page_program(cmd),

            opcodes::SE_20 | opcodes::SE_21 => self.handle_block_erase(cmd, 4 * 1024),
            opcodes::BE_52 | opcodes::BE_5C => self.handle_block_erase(cmd, 32 * 1024),
            opcodes::BE_D8 | opcodes::BE_DC => self.handle_block_erase(cmd, 64 * 1024),

            _ => Err(Error::OpcodeNotSupported),
        }
    }
}
