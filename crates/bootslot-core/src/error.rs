//! Error types for bootslot-core
//!
//! A single `Copy` error enum shared by the geometry model, the slot table
//! codec, the flash program engine and the DFU wire decoding. It carries no
//! heap data so it can be used from firmware.

use core::fmt;

use crate::engine::OperationKind;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // SPI errors
    /// SPI transfer failed
    SpiTransferFailed,
    /// Opcode is not supported by the flash or programmer
    OpcodeNotSupported,

    // Storage errors
    /// The busy bit did not clear within the allowed number of polls
    FlashTimeout {
        /// Operation that was in flight
        kind: OperationKind,
        /// Address the operation was issued at
        addr: u32,
    },
    /// Flash refused a write because the write enable latch was not set
    WriteProtected,
    /// Address is outside the flash or the active slot
    AddressOutOfBounds,
    /// Operation requires an aligned address or size
    InvalidAlignment,
    /// An operation was requested while another one is still running
    EngineBusy,
    /// No transfer session is open on the engine
    NoSession,

    // Geometry and slot errors
    /// Flash geometry violates a size or divisibility rule
    InvalidGeometry,
    /// Slot count is zero or larger than the supported maximum
    InvalidSlotCount,
    /// Slots would be smaller than one erase block
    SlotTooSmall,
    /// Slot index does not exist
    SlotOutOfRange,
    /// Encoded slot table does not fit where it must be stored
    TableTooLarge,
    /// Slot table bytes are malformed
    InvalidSlotTable,

    // Device-side sizing errors
    /// The byte channel cannot hold a full flash page
    ChannelTooSmall,

    // DFU wire errors
    /// Device response is shorter than the field being decoded
    ResponseTooShort {
        /// Bytes received
        got: usize,
        /// Bytes required
        expected: usize,
    },
    /// Unknown DFU state code
    UnknownState(u8),
    /// Unknown DFU status code
    UnknownStatus(u8),
    /// Unknown DFU request code
    UnknownRequest(u8),
    /// Descriptor is not a DFU functional descriptor
    InvalidDescriptor,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpiTransferFailed => write!(f, "SPI transfer failed"),
            Self::OpcodeNotSupported => write!(f, "SPI opcode not supported"),
            Self::FlashTimeout { kind, addr } => {
                write!(f, "flash {} at 0x{:08X} never cleared the busy bit", kind, addr)
            }
            Self::WriteProtected => write!(f, "flash write enable latch not set"),
            Self::AddressOutOfBounds => write!(f, "address out of bounds"),
            Self::InvalidAlignment => write!(f, "invalid alignment"),
            Self::EngineBusy => write!(f, "flash program engine is busy"),
            Self::NoSession => write!(f, "no transfer session is open"),
            Self::InvalidGeometry => write!(f, "invalid flash geometry"),
            Self::InvalidSlotCount => write!(f, "invalid slot count"),
            Self::SlotTooSmall => write!(f, "slots would be smaller than one erase block"),
            Self::SlotOutOfRange => write!(f, "slot index out of range"),
            Self::TableTooLarge => write!(f, "slot table too large"),
            Self::InvalidSlotTable => write!(f, "malformed slot table"),
            Self::ChannelTooSmall => write!(f, "byte channel smaller than a flash page"),
            Self::ResponseTooShort { got, expected } => {
                write!(f, "response too short: got {} bytes, expected {}", got, expected)
            }
            Self::UnknownState(code) => write!(f, "unknown DFU state {}", code),
            Self::UnknownStatus(code) => write!(f, "unknown DFU status 0x{:02X}", code),
            Self::UnknownRequest(code) => write!(f, "unknown DFU request {}", code),
            Self::InvalidDescriptor => write!(f, "not a DFU functional descriptor"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
