//! Error types for the DFU host client

use std::fmt;
use std::time::Duration;

use bootslot_core::dfu::{State, Status};
use thiserror::Error;

/// Failures of the USB transport itself
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Device went away mid-transfer
    #[error("device disconnected")]
    Disconnected,

    /// Control transfer did not complete in time
    #[error("control transfer timed out")]
    Timeout,

    /// Device stalled the request
    #[error("request stalled by device")]
    Stall,

    /// The handle was closed (cancelled or already released)
    #[error("transport closed")]
    Closed,

    /// Device could not be opened or claimed
    #[error("failed to open device: {0}")]
    Open(String),

    /// Any other USB stack error
    #[error("USB error: {0}")]
    Usb(String),

    /// Device exposes no DFU interface
    #[error("device has no DFU interface")]
    NoDfuInterface,
}

/// Step of a host operation an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Status check before a transfer
    Preflight,
    /// DETACH request to the running application
    Detach,
    /// Waiting for and reopening the device in DFU mode
    Reattach,
    /// SET_INTERFACE to the slot's alternate setting
    SelectSlot,
    /// DNLOAD chunks and their status polls
    Download,
    /// Zero-length DNLOAD and its status poll
    Finalize,
    /// CLR_STATUS and its confirmation
    ClearStatus,
    /// Slot table download
    SlotTable,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preflight => "preflight",
            Self::Detach => "detach",
            Self::Reattach => "reattach",
            Self::SelectSlot => "select slot",
            Self::Download => "download",
            Self::Finalize => "finalize",
            Self::ClearStatus => "clear status",
            Self::SlotTable => "slot table",
        };
        f.write_str(name)
    }
}

/// Broad class of a [`DfuError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// USB transport failure
    Transport,
    /// Device answered outside the protocol's expectations
    Protocol,
    /// Device reported a flash failure
    Storage,
    /// Device could not be found
    Discovery,
    /// Caller asked for something impossible
    Usage,
}

/// Errors from the DFU host client
#[derive(Debug, Error)]
pub enum DfuError {
    /// USB transport failure
    #[error("{stage}: {source}")]
    Transport {
        /// Step that was running
        stage: Stage,
        /// Underlying transport failure
        #[source]
        source: TransportError,
    },

    /// Listing the bus failed
    #[error("failed to list USB devices: {0}")]
    Enumerate(#[source] TransportError),

    /// Device is in a state the step does not allow
    #[error("{stage}: expected {expected}, device is in {got}")]
    UnexpectedState {
        /// Step that was running
        stage: Stage,
        /// State the step needs
        expected: State,
        /// State the device reported
        got: State,
    },

    /// Device reported an error status
    #[error("{stage}: device reported '{status}' in {state}{}", location(.block, .offset))]
    DeviceFault {
        /// Step that was running
        stage: Stage,
        /// Status the device reported
        status: Status,
        /// State the device reported
        state: State,
        /// Block number of the failing chunk
        block: Option<u16>,
        /// Image offset of the failing chunk
        offset: Option<u32>,
    },

    /// Zero-length DNLOAD did not bring the device back to dfuIDLE
    #[error("finalize: device reported '{status}' in {state}")]
    FinalizeFailed {
        /// Status after the zero-length DNLOAD
        status: Status,
        /// State after the zero-length DNLOAD
        state: State,
    },

    /// Device did not come back after DETACH
    #[error("device {serial} did not reappear in DFU mode within {timeout:?}")]
    ReattachTimeout {
        /// Serial number waited for
        serial: String,
        /// How long the host waited
        timeout: Duration,
    },

    /// No device with this serial number
    #[error("no device with serial {serial}")]
    NotFound {
        /// Serial number searched for
        serial: String,
    },

    /// Another session is already talking to this device
    #[error("device {serial} already has an active session")]
    SessionBusy {
        /// Serial number of the busy device
        serial: String,
    },

    /// Device stayed busy longer than the retry bound
    #[error("{stage}: device still busy after {attempts} status polls{}", location(.block, &None))]
    PollExhausted {
        /// Step that was running
        stage: Stage,
        /// Block number being confirmed
        block: Option<u16>,
        /// Polls made before giving up
        attempts: u32,
    },

    /// Slot index does not exist on this device
    #[error("slot {slot} out of range (device has {slots} slots)")]
    InvalidSlot {
        /// Requested slot
        slot: u8,
        /// Slots the device has
        slots: u8,
    },

    /// Encoded slot table does not fit in one DNLOAD
    #[error("slot table is {len} bytes but the device accepts {transfer_size} per transfer")]
    TableTooLarge {
        /// Encoded table length
        len: usize,
        /// Device transfer size
        transfer_size: u16,
    },

    /// Slot layout could not be computed or encoded
    #[error("slot layout: {0}")]
    Layout(#[from] bootslot_core::Error),

    /// Device sent bytes that do not decode
    #[error("{stage}: {source}")]
    Malformed {
        /// Step that was running
        stage: Stage,
        /// Decoding failure
        #[source]
        source: bootslot_core::Error,
    },
}

fn location(block: &Option<u16>, offset: &Option<u32>) -> String {
    match (block, offset) {
        (Some(b), Some(o)) => format!(" at block {} (offset 0x{:X})", b, o),
        (Some(b), None) => format!(" at block {}", b),
        _ => String::new(),
    }
}

impl DfuError {
    /// Wrap a transport error with its stage
    pub fn transport(stage: Stage, source: TransportError) -> Self {
        Self::Transport { stage, source }
    }

    /// Stage the error happened in, when it belongs to one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Transport { stage, .. }
            | Self::UnexpectedState { stage, .. }
            | Self::DeviceFault { stage, .. }
            | Self::PollExhausted { stage, .. }
            | Self::Malformed { stage, .. } => Some(*stage),
            Self::FinalizeFailed { .. } => Some(Stage::Finalize),
            Self::ReattachTimeout { .. } => Some(Stage::Reattach),
            _ => None,
        }
    }

    /// Broad class of the failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Enumerate(_) | Self::ReattachTimeout { .. } | Self::NotFound { .. } => {
                ErrorKind::Discovery
            }
            Self::DeviceFault { status, .. } if is_storage_status(*status) => ErrorKind::Storage,
            Self::DeviceFault { .. }
            | Self::UnexpectedState { .. }
            | Self::FinalizeFailed { .. }
            | Self::PollExhausted { .. }
            | Self::Malformed { .. } => ErrorKind::Protocol,
            Self::SessionBusy { .. }
            | Self::InvalidSlot { .. }
            | Self::TableTooLarge { .. }
            | Self::Layout(_) => ErrorKind::Usage,
        }
    }

    /// Whether repeating the same call can succeed without other action
    ///
    /// True for failures before any slot data was sent, and for discovery
    /// and session conflicts.
    pub fn is_retry_safe(&self) -> bool {
        match self {
            Self::Enumerate(_)
            | Self::NotFound { .. }
            | Self::ReattachTimeout { .. }
            | Self::SessionBusy { .. } => true,
            Self::DeviceFault { .. }
            | Self::InvalidSlot { .. }
            | Self::TableTooLarge { .. }
            | Self::Layout(_) => false,
            _ => matches!(
                self.stage(),
                Some(Stage::Preflight | Stage::Detach | Stage::Reattach | Stage::SelectSlot)
            ),
        }
    }

    /// Whether the target slot may hold a partial image
    pub fn slot_indeterminate(&self) -> bool {
        matches!(
            self.stage(),
            Some(Stage::Download | Stage::Finalize | Stage::SlotTable)
        )
    }
}

fn is_storage_status(status: Status) -> bool {
    matches!(
        status,
        Status::ErrWrite
            | Status::ErrErase
            | Status::ErrCheckErased
            | Status::ErrProg
            | Status::ErrVerify
    )
}

/// Result type for host operations
pub type Result<T> = std::result::Result<T, DfuError>;
