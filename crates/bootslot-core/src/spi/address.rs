//! Address width types

/// Address width for SPI commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "std", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressWidth {
    /// No address phase
    None,
    /// 3-byte (24-bit) address - supports up to 16 MiB
    #[default]
    ThreeByte,
    /// 4-byte (32-bit) address - supports up to 4 GiB
    FourByte,
}

impl AddressWidth {
    /// Returns the number of address bytes
    pub const fn bytes(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::ThreeByte => 3,
            Self::FourByte => 4,
        }
    }

    /// Map a byte count back to a width
    pub const fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            0 => Some(Self::None),
            3 => Some(Self::ThreeByte),
            4 => Some(Self::FourByte),
            _ => None,
        }
    }

    /// Returns the number of addressable bytes (0 when there is no address)
    pub const fn max_size(&self) -> u64 {
        match self {
            Self::None => 0,
            Self::ThreeByte => 1 << 24,
            Self::FourByte => 1 << 32,
        }
    }

    /// Encode an address big-endian into `buf`, returning the bytes used
    pub fn encode(&self, address: u32, buf: &mut [u8]) -> usize {
        let n = self.bytes() as usize;
        let be = address.to_be_bytes();
        buf[..n].copy_from_slice(&be[4 - n..]);
        n
    }

    /// Decode a big-endian address of this width from the start of `buf`
    pub fn decode(&self, buf: &[u8]) -> Option<u32> {
        let n = self.bytes() as usize;
        if buf.len() < n {
            return None;
        }
        Some(buf[..n].iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }
}
