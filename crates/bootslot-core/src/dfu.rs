//! DFU 1.1 wire types
//!
//! Request codes, device states, status codes, the 6-byte GET_STATUS
//! response and the class-specific functional descriptor. Both the device
//! responder and the host client speak in these types.

use core::fmt;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Descriptor type of the DFU functional descriptor
pub const FUNCTIONAL_DESCRIPTOR_TYPE: u8 = 0x21;
/// Length of the DFU 1.1 functional descriptor
pub const FUNCTIONAL_DESCRIPTOR_LEN: usize = 9;
/// Interface class of DFU interfaces (application specific)
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;
/// Interface subclass of DFU interfaces
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;
/// Interface protocol while the application runs
pub const DFU_PROTOCOL_RUNTIME: u8 = 0x01;
/// Interface protocol in DFU mode
pub const DFU_PROTOCOL_DFU_MODE: u8 = 0x02;
/// Length of the GET_STATUS response
pub const STATUS_LEN: usize = 6;
/// DFU specification release implemented (BCD)
pub const DFU_VERSION: u16 = 0x0110;

/// Whether an interface's class triple identifies a DFU interface, in
/// either the runtime or the DFU-mode protocol
pub fn is_dfu_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    class == DFU_INTERFACE_CLASS
        && subclass == DFU_INTERFACE_SUBCLASS
        && matches!(protocol, DFU_PROTOCOL_RUNTIME | DFU_PROTOCOL_DFU_MODE)
}

/// Class-specific DFU requests
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask the application to reset into DFU mode
    Detach = 0,
    /// Send one block of firmware (zero length finalizes)
    Dnload = 1,
    /// Read one block of firmware back
    Upload = 2,
    /// Read the 6-byte status report
    GetStatus = 3,
    /// Leave the error state
    ClrStatus = 4,
    /// Read the state byte only
    GetState = 5,
    /// Abandon the current transfer
    Abort = 6,
}

impl TryFrom<u8> for Request {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Detach,
            1 => Self::Dnload,
            2 => Self::Upload,
            3 => Self::GetStatus,
            4 => Self::ClrStatus,
            5 => Self::GetState,
            6 => Self::Abort,
            other => return Err(Error::UnknownRequest(other)),
        })
    }
}

/// Device state as reported in `bState`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Device is running its normal application
    AppIdle = 0,
    /// Application received DETACH and waits for a reset
    AppDetach = 1,
    /// DFU mode, waiting for requests
    DfuIdle = 2,
    /// A block was received, waiting for GET_STATUS
    DlSync = 3,
    /// A block is being written to flash
    DlBusy = 4,
    /// Download in progress, expecting the next DNLOAD
    DlIdle = 5,
    /// Final block received, waiting for GET_STATUS to manifest
    ManifestSync = 6,
    /// Manifestation in progress
    Manifest = 7,
    /// Manifested, waiting for a reset
    ManifestWaitReset = 8,
    /// Upload in progress
    UploadIdle = 9,
    /// An error occurred, waiting for CLR_STATUS
    Error = 10,
}

impl State {
    /// Whether the device runs its DFU-mode firmware in this state
    pub fn is_dfu_mode(&self) -> bool {
        !matches!(self, Self::AppIdle | Self::AppDetach)
    }
}

impl TryFrom<u8> for State {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::AppIdle,
            1 => Self::AppDetach,
            2 => Self::DfuIdle,
            3 => Self::DlSync,
            4 => Self::DlBusy,
            5 => Self::DlIdle,
            6 => Self::ManifestSync,
            7 => Self::Manifest,
            8 => Self::ManifestWaitReset,
            9 => Self::UploadIdle,
            10 => Self::Error,
            other => return Err(Error::UnknownState(other)),
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AppIdle => "appIDLE",
            Self::AppDetach => "appDETACH",
            Self::DfuIdle => "dfuIDLE",
            Self::DlSync => "dfuDNLOAD-SYNC",
            Self::DlBusy => "dfuDNBUSY",
            Self::DlIdle => "dfuDNLOAD-IDLE",
            Self::ManifestSync => "dfuMANIFEST-SYNC",
            Self::Manifest => "dfuMANIFEST",
            Self::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            Self::UploadIdle => "dfuUPLOAD-IDLE",
            Self::Error => "dfuERROR",
        };
        f.write_str(name)
    }
}

/// Status code as reported in `bStatus`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No error condition is present
    Ok = 0x00,
    /// File is not targeted for use by this device
    ErrTarget = 0x01,
    /// File fails a vendor-specific verification test
    ErrFile = 0x02,
    /// Device is unable to write memory
    ErrWrite = 0x03,
    /// Memory erase function failed
    ErrErase = 0x04,
    /// Memory erase check failed
    ErrCheckErased = 0x05,
    /// Program memory function failed
    ErrProg = 0x06,
    /// Programmed memory failed verification
    ErrVerify = 0x07,
    /// Received address is out of range
    ErrAddress = 0x08,
    /// Zero-length DNLOAD before all data arrived
    ErrNotdone = 0x09,
    /// Firmware is corrupt
    ErrFirmware = 0x0A,
    /// Vendor-specific error
    ErrVendor = 0x0B,
    /// Unexpected USB reset
    ErrUsbr = 0x0C,
    /// Unexpected power on reset
    ErrPOR = 0x0D,
    /// Unknown failure
    ErrUnknown = 0x0E,
    /// Device stalled an unexpected request
    ErrStalledPkt = 0x0F,
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            0x00 => Self::Ok,
            0x01 => Self::ErrTarget,
            0x02 => Self::ErrFile,
            0x03 => Self::ErrWrite,
            0x04 => Self::ErrErase,
            0x05 => Self::ErrCheckErased,
            0x06 => Self::ErrProg,
            0x07 => Self::ErrVerify,
            0x08 => Self::ErrAddress,
            0x09 => Self::ErrNotdone,
            0x0A => Self::ErrFirmware,
            0x0B => Self::ErrVendor,
            0x0C => Self::ErrUsbr,
            0x0D => Self::ErrPOR,
            0x0E => Self::ErrUnknown,
            0x0F => Self::ErrStalledPkt,
            other => return Err(Error::UnknownStatus(other)),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "OK",
            Self::ErrTarget => "file not targeted for this device",
            Self::ErrFile => "file failed verification",
            Self::ErrWrite => "unable to write memory",
            Self::ErrErase => "memory erase failed",
            Self::ErrCheckErased => "memory erase check failed",
            Self::ErrProg => "program memory failed",
            Self::ErrVerify => "programmed memory failed verification",
            Self::ErrAddress => "address out of range",
            Self::ErrNotdone => "download not complete",
            Self::ErrFirmware => "firmware corrupt",
            Self::ErrVendor => "vendor-specific error",
            Self::ErrUsbr => "unexpected USB reset",
            Self::ErrPOR => "unexpected power on reset",
            Self::ErrUnknown => "unknown error",
            Self::ErrStalledPkt => "stalled unexpected request",
        };
        f.write_str(text)
    }
}

/// Decoded GET_STATUS response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    /// `bStatus`
    pub status: Status,
    /// `bwPollTimeout`, 24 bits
    pub poll_timeout_ms: u32,
    /// `bState`
    pub state: State,
    /// `iString`
    pub string_index: u8,
}

impl StatusReport {
    /// Encode into the 6-byte wire layout
    pub fn to_bytes(&self) -> [u8; STATUS_LEN] {
        let t = self.poll_timeout_ms.min(0x00FF_FFFF).to_le_bytes();
        [
            self.status as u8,
            t[0],
            t[1],
            t[2],
            self.state as u8,
            self.string_index,
        ]
    }

    /// Decode from a GET_STATUS response
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < STATUS_LEN {
            return Err(Error::ResponseTooShort {
                got: buf.len(),
                expected: STATUS_LEN,
            });
        }
        Ok(Self {
            status: Status::try_from(buf[0])?,
            poll_timeout_ms: u32::from_le_bytes([buf[1], buf[2], buf[3], 0]),
            state: State::try_from(buf[4])?,
            string_index: buf[5],
        })
    }
}

bitflags! {
    /// `bmAttributes` of the functional descriptor
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DfuAttributes: u8 {
        /// Device accepts DNLOAD
        const CAN_DNLOAD = 1 << 0;
        /// Device answers UPLOAD
        const CAN_UPLOAD = 1 << 1;
        /// Device stays responsive after manifestation
        const MANIFESTATION_TOLERANT = 1 << 2;
        /// Device detaches itself after DETACH instead of waiting for a bus reset
        const WILL_DETACH = 1 << 3;
    }
}

/// DFU functional descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionalDescriptor {
    /// Capability bits
    pub attributes: DfuAttributes,
    /// Time the device waits for a reset after DETACH
    pub detach_timeout_ms: u16,
    /// Largest DNLOAD payload the device accepts
    pub transfer_size: u16,
    /// DFU release in BCD
    pub dfu_version: u16,
}

impl FunctionalDescriptor {
    /// Parse a raw descriptor, including its length and type bytes
    ///
    /// DFU 1.0 descriptors omit `bcdDFUVersion`; those parse as version 1.0.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 7 {
            return Err(Error::ResponseTooShort {
                got: buf.len(),
                expected: FUNCTIONAL_DESCRIPTOR_LEN,
            });
        }
        if buf[1] != FUNCTIONAL_DESCRIPTOR_TYPE {
            return Err(Error::InvalidDescriptor);
        }
        let dfu_version = if buf.len() >= FUNCTIONAL_DESCRIPTOR_LEN {
            u16::from_le_bytes([buf[7], buf[8]])
        } else {
            0x0100
        };
        Ok(Self {
            attributes: DfuAttributes::from_bits_truncate(buf[2]),
            detach_timeout_ms: u16::from_le_bytes([buf[3], buf[4]]),
            transfer_size: u16::from_le_bytes([buf[5], buf[6]]),
            dfu_version,
        })
    }

    /// Encode as the 9-byte descriptor
    pub fn to_bytes(&self) -> [u8; FUNCTIONAL_DESCRIPTOR_LEN] {
        let detach = self.detach_timeout_ms.to_le_bytes();
        let ts = self.transfer_size.to_le_bytes();
        let ver = self.dfu_version.to_le_bytes();
        [
            FUNCTIONAL_DESCRIPTOR_LEN as u8,
            FUNCTIONAL_DESCRIPTOR_TYPE,
            self.attributes.bits(),
            detach[0],
            detach[1],
            ts[0],
            ts[1],
            ver[0],
            ver[1],
        ]
    }
}
