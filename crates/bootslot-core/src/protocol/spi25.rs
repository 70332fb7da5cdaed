//! SPI25 protocol implementation
//!
//! The JEDEC command sequences the flash program engine issues. Unlike a
//! blocking programmer, nothing here waits for the busy bit: each function
//! starts one operation and returns, and the caller polls `is_busy` on its
//! own schedule.

use crate::error::{Error, Result};
use crate::programmer::{SpiFeatures, SpiMaster};
use crate::spi::{opcodes, AddressWidth, SpiCommand};

/// Read the status register 1
pub fn read_status1<M: SpiMaster + ?Sized>(master: &mut M) -> Result<u8> {
    let mut buf = [0u8; 1];
    let mut cmd = SpiCommand::read_reg(opcodes::RDSR, &mut buf);
    master.execute(&mut cmd)?;
    Ok(buf[0])
}

/// Check the WIP (Write In Progress) bit once
pub fn is_busy<M: SpiMaster + ?Sized>(master: &mut M) -> Result<bool> {
    Ok(read_status1(master)? & opcodes::SR1_WIP != 0)
}

/// Send the Write Enable command
pub fn write_enable<M: SpiMaster + ?Sized>(master: &mut M) -> Result<()> {
    let mut cmd = SpiCommand::simple(opcodes::WREN);
    master.execute(&mut cmd)
}

fn check_width<M: SpiMaster + ?Sized>(master: &M, width: AddressWidth) -> Result<()> {
    match width {
        AddressWidth::None => Err(Error::InvalidGeometry),
        AddressWidth::FourByte if !master.features().contains(SpiFeatures::FOUR_BYTE_ADDR) => {
            Err(Error::OpcodeNotSupported)
        }
        _ => Ok(()),
    }
}

/// Page-program opcode for an address width
pub fn program_opcode(width: AddressWidth) -> u8 {
    match width {
        AddressWidth::FourByte => opcodes::PP_4B,
        _ => opcodes::PP,
    }
}

/// Start a page program
///
/// Sends WREN followed by PP/PP_4B. `data` must not cross a page boundary;
/// the caller is responsible for splitting it.
pub fn start_page_program<M: SpiMaster + ?Sized>(
    master: &mut M,
    width: AddressWidth,
    addr: u32,
    data: &[u8],
) -> Result<()> {
    check_width(master, width)?;
    if data.len() > master.max_write_len() {
        return Err(Error::InvalidAlignment);
    }
    write_enable(master)?;
    let mut cmd = SpiCommand::write(program_opcode(width), width, addr, data);
    master.execute(&mut cmd)
}

/// Start an erase with the given opcode
///
/// Sends WREN followed by the erase command. `addr` must be aligned to the
/// erase size the opcode implies.
pub fn start_erase<M: SpiMaster + ?Sized>(
    master: &mut M,
    opcode: u8,
    width: AddressWidth,
    addr: u32,
) -> Result<()> {
    check_width(master, width)?;
    write_enable(master)?;
    let mut cmd = SpiCommand::erase(opcode, width, addr);
    master.execute(&mut cmd)
}

/// Read flash contents with a 3- or 4-byte address
pub fn read<M: SpiMaster + ?Sized>(
    master: &mut M,
    width: AddressWidth,
    addr: u32,
    buf: &mut [u8],
) -> Result<()> {
    check_width(master, width)?;
    let opcode = match width {
        AddressWidth::FourByte => opcodes::READ_4B,
        _ => opcodes::READ,
    };
    let mut cmd = SpiCommand::read(opcode, width, addr, buf);
    master.execute(&mut cmd)
}
