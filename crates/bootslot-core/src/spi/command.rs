//! SPI command structure

use super::AddressWidth;

/// A single SPI transaction
///
/// Borrowed buffers only, so commands can be built on the device without an
/// allocator.
pub struct SpiCommand<'a> {
    /// Opcode byte
    pub opcode: u8,
    /// Address phase, if the command has one
    pub address: Option<u32>,
    /// Bytes in the address phase
    pub address_width: AddressWidth,
    /// Data clocked out after the header
    pub write_data: &'a [u8],
    /// Data clocked in after the header
    pub read_buf: &'a mut [u8],
}

impl<'a> SpiCommand<'a> {
    fn build(
        opcode: u8,
        address: Option<(AddressWidth, u32)>,
        write_data: &'a [u8],
        read_buf: &'a mut [u8],
    ) -> Self {
        let (address_width, address) = match address {
            Some((width, addr)) => (width, Some(addr)),
            None => (AddressWidth::None, None),
        };
        Self {
            opcode,
            address,
            address_width,
            write_data,
            read_buf,
        }
    }

    /// Opcode only (WREN, WRDI)
    pub fn simple(opcode: u8) -> Self {
        Self::build(opcode, None, &[], &mut [])
    }

    /// Register read without address (RDSR)
    pub fn read_reg(opcode: u8, buf: &'a mut [u8]) -> Self {
        Self::build(opcode, None, &[], buf)
    }

    /// Addressed read
    pub fn read(opcode: u8, width: AddressWidth, addr: u32, buf: &'a mut [u8]) -> Self {
        Self::build(opcode, Some((width, addr)), &[], buf)
    }

    /// Addressed write (page program)
    pub fn write(opcode: u8, width: AddressWidth, addr: u32, data: &'a [u8]) -> Self {
        Self::build(opcode, Some((width, addr)), data, &mut [])
    }

    /// Addressed command without data phase (erase)
    pub fn erase(opcode: u8, width: AddressWidth, addr: u32) -> Self {
        Self::build(opcode, Some((width, addr)), &[], &mut [])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let cmd = SpiCommand::simple(0x06);
        assert_eq!(cmd.address, None);
        assert_eq!(cmd.address_width, AddressWidth::None);

        let cmd = SpiCommand::erase(0xDC, AddressWidth::FourByte, 0x0100_0000);
        assert_eq!(cmd.address, Some(0x0100_0000));
        assert_eq!(cmd.address_width, AddressWidth::FourByte);
        assert!(cmd.write_data.is_empty() && cmd.read_buf.is_empty());

        let data = [1, 2, 3];
        let cmd = SpiCommand::write(0x02, AddressWidth::ThreeByte, 0x100, &data);
        assert_eq!(cmd.write_data, &data);
    }
}
