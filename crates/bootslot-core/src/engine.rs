//! Flash program engine
//!
//! Streams one transfer session into a region of the flash. The engine never
//! blocks: every call to [`FlashProgramEngine::poll`] performs at most one
//! flash action (an erase or page program, each preceded by write enable) or
//! one status register read, and reports where it stands. That gives the DFU
//! responder a real busy window to report while the flash works.
//!
//! Erase blocks are erased lazily in front of the write cursor. A per-session
//! high-water mark records how far erasing has progressed, so each block is
//! erased at most once no matter how chunks fall across block boundaries.

use core::fmt;
use core::ops::Range;

use crate::channel::ByteChannel;
use crate::error::{Error, Result};
use crate::geometry::{FlashGeometry, MAX_PAGE_SIZE};
use crate::programmer::SpiMaster;
use crate::protocol::spi25;

/// What the flash is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Erasing one erase block
    Erase,
    /// Programming one page slice
    Program,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase => f.write_str("erase"),
            Self::Program => f.write_str("program"),
        }
    }
}

/// Bounds on busy-bit polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Status reads allowed before an erase counts as hung
    pub max_erase_polls: u32,
    /// Status reads allowed before a page program counts as hung
    pub max_program_polls: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_erase_polls: 200_000,
            max_program_polls: 10_000,
        }
    }
}

/// Result of one engine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// No chunk is queued
    Idle,
    /// Work is in progress
    Busy,
    /// The next page slice is not fully in the channel yet
    WaitingForData,
    /// The last page of the queued chunk is confirmed written
    ChunkDone,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: OperationKind,
    addr: u32,
    len: u32,
    polls: u32,
}

/// State of one transfer session
#[derive(Debug, Clone)]
pub struct FlashOperation {
    /// Region the session may write
    pub range: Range<u32>,
    /// Kind of the flash action started most recently
    pub kind: OperationKind,
    /// Next address to program
    pub cursor: u32,
    /// Bytes of the queued chunk not yet confirmed written
    pub remaining: u32,
    erased_until: u32,
    pending: Option<Pending>,
}

impl FlashOperation {
    /// First address not yet erased by this session
    pub fn erased_until(&self) -> u32 {
        self.erased_until
    }

    /// Bytes confirmed written so far
    pub fn written(&self) -> u32 {
        self.cursor - self.range.start
    }

    /// Whether a flash action is in flight
    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }
}

/// Erase-before-write page programmer for one flash
pub struct FlashProgramEngine {
    geometry: FlashGeometry,
    config: EngineConfig,
    op: Option<FlashOperation>,
}

impl FlashProgramEngine {
    /// Create an engine for a validated geometry
    pub fn new(geometry: FlashGeometry, config: EngineConfig) -> Result<Self> {
        geometry.validate()?;
        Ok(Self {
            geometry,
            config,
            op: None,
        })
    }

    /// Flash geometry the engine was built for
    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    /// The current session, if any
    pub fn operation(&self) -> Option<&FlashOperation> {
        self.op.as_ref()
    }

    /// Open a session over `range`
    ///
    /// The range must start on an erase block boundary and lie inside the
    /// flash. Any previous session that is not mid-operation is replaced.
    pub fn begin(&mut self, range: Range<u32>) -> Result<()> {
        if self.op.as_ref().is_some_and(|op| op.in_flight()) {
            return Err(Error::EngineBusy);
        }
        if range.start >= range.end || range.end > self.geometry.total_size {
            return Err(Error::AddressOutOfBounds);
        }
        if range.start % self.geometry.erase_block_size != 0 {
            return Err(Error::InvalidAlignment);
        }
        log::debug!("engine: session 0x{:08X}..0x{:08X}", range.start, range.end);
        self.op = Some(FlashOperation {
            kind: OperationKind::Erase,
            cursor: range.start,
            remaining: 0,
            erased_until: range.start,
            pending: None,
            range,
        });
        Ok(())
    }

    /// Announce a chunk of `len` bytes that will arrive through the channel
    pub fn queue_chunk(&mut self, len: u32) -> Result<()> {
        let op = self.op.as_mut().ok_or(Error::NoSession)?;
        if op.remaining != 0 || op.pending.is_some() {
            return Err(Error::EngineBusy);
        }
        let end = op.cursor.checked_add(len).ok_or(Error::AddressOutOfBounds)?;
        if end > op.range.end {
            return Err(Error::AddressOutOfBounds);
        }
        op.remaining = len;
        Ok(())
    }

    /// Whether the queued chunk still has bytes to write
    pub fn is_busy(&self) -> bool {
        self.op
            .as_ref()
            .is_some_and(|op| op.remaining != 0 || op.pending.is_some())
    }

    /// Perform one step
    ///
    /// On error the in-flight action is dropped and the session stays open
    /// but should be abandoned by the caller.
    pub fn poll<M: SpiMaster + ?Sized, const N: usize>(
        &mut self,
        master: &mut M,
        channel: &mut ByteChannel<N>,
    ) -> Result<EngineEvent> {
        let geometry = self.geometry;
        let config = self.config;
        let Some(op) = self.op.as_mut() else {
            return Ok(EngineEvent::Idle);
        };

        if let Some(mut pending) = op.pending {
            if spi25::is_busy(master)? {
                pending.polls += 1;
                let limit = match pending.kind {
                    OperationKind::Erase => config.max_erase_polls,
                    OperationKind::Program => config.max_program_polls,
                };
                if pending.polls >= limit {
                    op.pending = None;
                    log::debug!("engine: {} at 0x{:08X} timed out", pending.kind, pending.addr);
                    return Err(Error::FlashTimeout {
                        kind: pending.kind,
                        addr: pending.addr,
                    });
                }
                op.pending = Some(pending);
                return Ok(EngineEvent::Busy);
            }

            op.pending = None;
            match pending.kind {
                OperationKind::Erase => {
                    op.erased_until = pending.addr + geometry.erase_block_size;
                    log::trace!("engine: erased block 0x{:08X}", pending.addr);
                }
                OperationKind::Program => {
                    op.cursor += pending.len;
                    op.remaining -= pending.len;
                    log::trace!("engine: programmed {} bytes at 0x{:08X}", pending.len, pending.addr);
                    if op.remaining == 0 {
                        return Ok(EngineEvent::ChunkDone);
                    }
                }
            }
            return Ok(EngineEvent::Busy);
        }

        if op.remaining == 0 {
            return Ok(EngineEvent::Idle);
        }

        if op.cursor >= op.erased_until {
            let addr = geometry.block_base(op.cursor);
            spi25::start_erase(master, geometry.erase_opcode()?, geometry.address_width, addr)?;
            op.kind = OperationKind::Erase;
            op.pending = Some(Pending {
                kind: OperationKind::Erase,
                addr,
                len: geometry.erase_block_size,
                polls: 0,
            });
            return Ok(EngineEvent::Busy);
        }

        let slice = geometry
            .page_remaining(op.cursor)
            .min(op.remaining)
            .min(op.erased_until - op.cursor);
        let mut buf = [0u8; MAX_PAGE_SIZE as usize];
        let buf = &mut buf[..slice as usize];
        if !channel.pop_into(buf) {
            return Ok(EngineEvent::WaitingForData);
        }
        op.kind = OperationKind::Program;
        spi25::start_page_program(master, geometry.address_width, op.cursor, buf)?;
        op.pending = Some(Pending {
            kind: OperationKind::Program,
            addr: op.cursor,
            len: slice,
            polls: 0,
        });
        Ok(EngineEvent::Busy)
    }

    /// Close the session once everything queued is written
    ///
    /// Returns the number of bytes the session wrote.
    pub fn finish(&mut self) -> Result<u32> {
        if self.is_busy() {
            return Err(Error::EngineBusy);
        }
        let op = self.op.take().ok_or(Error::NoSession)?;
        log::debug!("engine: session closed after {} bytes", op.written());
        Ok(op.written())
    }

    /// Drop the session, whatever state it is in
    pub fn abandon(&mut self) {
        if let Some(op) = self.op.take() {
            log::debug!("engine: session abandoned at 0x{:08X}", op.cursor);
        }
    }
}
