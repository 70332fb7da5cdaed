//! DFU responder
//!
//! Device-side DFU state machine. It owns the flash (through its SPI
//! master), the program engine and the byte channel between them, and turns
//! class requests into engine work:
//!
//! | State   | Request         | Effect                    | Next    |
//! |---------|-----------------|---------------------------|---------|
//! | AppIdle | DETACH          | schedule reset to update  | AppIdle |
//! | DfuIdle | DNLOAD len=0    | nothing                   | DfuIdle |
//! | DfuIdle | DNLOAD len>0    | open session, queue chunk | DlBusy  |
//! | DlBusy  | engine done     |                           | DlSync  |
//! | DlSync  | GET_STATUS      | report OK/DlSync          | DlIdle  |
//! | DlIdle  | DNLOAD len>0    | queue next chunk          | DlBusy  |
//! | DlIdle  | DNLOAD len=0    | close session             | DfuIdle |
//! | any     | engine fault    |                           | Error   |
//! | Error   | CLR_STATUS      | clear fault               | DfuIdle |
//!
//! GET_STATUS and GET_STATE are answered everywhere. In application mode
//! anything else stalls without a state change; in DFU mode anything else
//! stalls and enters `Error`.
//!
//! The USB stack calls [`DfuResponder::control_out`], [`DfuResponder::data_out`]
//! and [`DfuResponder::control_in`] from its request handler and
//! [`DfuResponder::poll`] from the main loop.

use crate::channel::ByteChannel;
use crate::dfu::{
    DfuAttributes, FunctionalDescriptor, Request, State, Status, StatusReport, DFU_VERSION,
    STATUS_LEN,
};
use crate::engine::{EngineConfig, EngineEvent, FlashProgramEngine, OperationKind};
use crate::error::{Error, Result};
use crate::geometry::FlashGeometry;
use crate::partition::{compute_partitions, slot_table_partition, Partition, PartitionTable};
use crate::programmer::SpiMaster;

/// Responder tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderConfig {
    /// Largest DNLOAD payload accepted (`wTransferSize`)
    pub transfer_size: u16,
    /// `bwPollTimeout` reported while the flash is busy
    pub poll_timeout_ms: u32,
    /// `wDetachTimeOut` advertised in the functional descriptor
    pub detach_timeout_ms: u16,
    /// Busy-bit polling bounds
    pub engine: EngineConfig,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            transfer_size: 1024,
            poll_timeout_ms: 5,
            detach_timeout_ms: 1000,
            engine: EngineConfig::default(),
        }
    }
}

/// Which firmware runs after a reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Normal application with the runtime DFU interface
    Application,
    /// DFU-mode firmware
    Update,
}

/// The parts of a SETUP packet the responder looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setup {
    /// `bRequest`
    pub request: u8,
    /// `wValue` (block number for DNLOAD)
    pub value: u16,
    /// `wLength`
    pub length: u16,
}

impl Setup {
    /// Build a setup packet for a known request
    pub fn new(request: Request, value: u16, length: u16) -> Self {
        Self {
            request: request as u8,
            value,
            length,
        }
    }
}

/// Outcome of a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlReply {
    /// Request completed
    Ack,
    /// Only `accepted` bytes of the data stage fit; resend the rest
    Nak {
        /// Bytes taken from this data stage
        accepted: usize,
    },
    /// IN data stage
    Data(heapless::Vec<u8, STATUS_LEN>),
    /// Request rejected
    Stall,
}

/// Device-side DFU state machine driving one flash
pub struct DfuResponder<M: SpiMaster, const N: usize> {
    master: M,
    engine: FlashProgramEngine,
    channel: ByteChannel<N>,
    partitions: PartitionTable,
    table: Partition,
    config: ResponderConfig,
    state: State,
    status: Status,
    alt: u8,
    next_block: u16,
    chunks: u32,
    unaccepted: usize,
    detach_requested: bool,
    fault: Option<Error>,
}

impl<M: SpiMaster, const N: usize> DfuResponder<M, N> {
    /// Create a responder in application mode
    ///
    /// Fails if the geometry or slot count is invalid or if the channel
    /// cannot hold a full page.
    pub fn new(
        master: M,
        geometry: FlashGeometry,
        slot_count: usize,
        config: ResponderConfig,
    ) -> Result<Self> {
        let partitions = compute_partitions(&geometry, slot_count)?;
        let engine = FlashProgramEngine::new(geometry, config.engine)?;
        let channel = ByteChannel::new();
        if channel.capacity() < geometry.page_size as usize {
            return Err(Error::ChannelTooSmall);
        }
        if config.transfer_size == 0 {
            return Err(Error::InvalidGeometry);
        }
        Ok(Self {
            master,
            engine,
            channel,
            table: slot_table_partition(&geometry, slot_count),
            partitions,
            config,
            state: State::AppIdle,
            status: Status::Ok,
            alt: 0,
            next_block: 0,
            chunks: 0,
            unaccepted: 0,
            detach_requested: false,
            fault: None,
        })
    }

    /// Current DFU state
    pub fn state(&self) -> State {
        self.state
    }

    /// Current DFU status
    pub fn status(&self) -> Status {
        self.status
    }

    /// The engine error that moved the responder into `Error`, if any
    pub fn fault(&self) -> Option<Error> {
        self.fault
    }

    /// Whether DETACH was received and a reset into update mode is due
    pub fn detach_requested(&self) -> bool {
        self.detach_requested
    }

    /// Selected alternate setting
    pub fn alternate(&self) -> u8 {
        self.alt
    }

    /// Slots served by this responder
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// The SPI master (and the flash behind it)
    pub fn master(&self) -> &M {
        &self.master
    }

    /// Mutable access to the SPI master
    pub fn master_mut(&mut self) -> &mut M {
        &mut self.master
    }

    /// Functional descriptor advertised on every DFU interface
    pub fn functional_descriptor(&self) -> FunctionalDescriptor {
        FunctionalDescriptor {
            attributes: DfuAttributes::CAN_DNLOAD
                | DfuAttributes::MANIFESTATION_TOLERANT
                | DfuAttributes::WILL_DETACH,
            detach_timeout_ms: self.config.detach_timeout_ms,
            transfer_size: self.config.transfer_size,
            dfu_version: DFU_VERSION,
        }
    }

    fn new_state_status(&mut self, state: State, status: Status) {
        if state != self.state {
            log::debug!("dfu: {} -> {} ({})", self.state, state, status);
        }
        self.state = state;
        self.status = status;
    }

    fn new_state_ok(&mut self, state: State) {
        self.new_state_status(state, Status::Ok);
    }

    fn drop_session(&mut self) {
        self.engine.abandon();
        self.channel.clear();
        self.unaccepted = 0;
        self.next_block = 0;
        self.chunks = 0;
    }

    /// Reject a request: stall, and in DFU mode enter `Error`
    fn reject(&mut self, status: Status) -> ControlReply {
        if self.state.is_dfu_mode() && self.state != State::Error {
            self.drop_session();
            self.new_state_status(State::Error, status);
        }
        ControlReply::Stall
    }

    fn storage_fault(&mut self, err: Error) {
        let kind = self
            .engine
            .operation()
            .map(|op| op.kind)
            .unwrap_or(OperationKind::Program);
        let status = fault_status(err, kind);
        log::debug!("dfu: storage fault {} -> {}", err, status);
        self.fault = Some(err);
        self.drop_session();
        self.new_state_status(State::Error, status);
    }

    fn target(&self) -> Option<Partition> {
        if usize::from(self.alt) == self.partitions.len() {
            Some(self.table)
        } else {
            self.partitions.get(usize::from(self.alt)).copied()
        }
    }

    fn is_table_target(&self) -> bool {
        usize::from(self.alt) == self.partitions.len()
    }

    /// Handle a host-to-device class request with its data stage
    pub fn control_out(&mut self, setup: Setup, data: &[u8]) -> ControlReply {
        log::trace!("dfu: OUT req={} value={} len={}", setup.request, setup.value, data.len());
        let request = Request::try_from(setup.request);

        if self.state == State::AppIdle {
            return match request {
                Ok(Request::Detach) => {
                    log::info!("dfu: detach requested");
                    self.detach_requested = true;
                    ControlReply::Ack
                }
                _ => ControlReply::Stall,
            };
        }

        match request {
            Ok(Request::Dnload) => self.dnload(setup, data),
            Ok(Request::ClrStatus) => {
                if self.state == State::Error {
                    log::debug!("dfu: clearing {}", self.status);
                    self.fault = None;
                    self.drop_session();
                    self.new_state_ok(State::DfuIdle);
                }
                ControlReply::Ack
            }
            _ => self.reject(Status::ErrStalledPkt),
        }
    }

    fn dnload(&mut self, setup: Setup, data: &[u8]) -> ControlReply {
        if self.state == State::Error {
            return ControlReply::Stall;
        }
        if !matches!(self.state, State::DfuIdle | State::DlIdle) {
            return self.reject(Status::ErrStalledPkt);
        }
        if usize::from(setup.length) != data.len() {
            return self.reject(Status::ErrStalledPkt);
        }

        if data.is_empty() {
            if self.state == State::DlIdle {
                match self.engine.finish() {
                    Ok(written) => {
                        log::info!("dfu: alt {} complete, {} bytes", self.alt, written);
                        self.next_block = 0;
                        self.chunks = 0;
                        self.new_state_ok(State::DfuIdle);
                    }
                    Err(e) => self.storage_fault(e),
                }
            }
            return ControlReply::Ack;
        }

        if data.len() > usize::from(self.config.transfer_size) {
            return self.reject(Status::ErrStalledPkt);
        }
        if setup.value != self.next_block {
            log::debug!("dfu: block {} out of sequence, expected {}", setup.value, self.next_block);
            return self.reject(Status::ErrAddress);
        }
        if self.is_table_target() && self.chunks > 0 {
            return self.reject(Status::ErrAddress);
        }

        if self.state == State::DfuIdle {
            let Some(target) = self.target() else {
                return self.reject(Status::ErrTarget);
            };
            if let Err(e) = self.engine.begin(target.range()) {
                return self.reject(misuse_status(e));
            }
        }
        if let Err(e) = self.engine.queue_chunk(data.len() as u32) {
            return self.reject(misuse_status(e));
        }

        self.next_block = self.next_block.wrapping_add(1);
        self.chunks += 1;
        self.new_state_ok(State::DlBusy);

        let accepted = self.channel.push_slice(data);
        self.unaccepted = data.len() - accepted;
        if self.unaccepted == 0 {
            ControlReply::Ack
        } else {
            ControlReply::Nak { accepted }
        }
    }

    /// Continue a DNLOAD data stage that was answered with NAK
    pub fn data_out(&mut self, data: &[u8]) -> ControlReply {
        if self.state != State::DlBusy || self.unaccepted == 0 || data.len() != self.unaccepted {
            return self.reject(Status::ErrStalledPkt);
        }
        let accepted = self.channel.push_slice(data);
        self.unaccepted -= accepted;
        if self.unaccepted == 0 {
            ControlReply::Ack
        } else {
            ControlReply::Nak { accepted }
        }
    }

    /// Handle a device-to-host class request
    pub fn control_in(&mut self, setup: Setup) -> ControlReply {
        log::trace!("dfu: IN req={} len={}", setup.request, setup.length);
        match Request::try_from(setup.request) {
            Ok(Request::GetStatus) => {
                let report = self.status_report();
                if self.state == State::DlSync {
                    self.new_state_ok(State::DlIdle);
                }
                let len = usize::from(setup.length).min(STATUS_LEN);
                let mut out = heapless::Vec::new();
                // len <= STATUS_LEN
                let _ = out.extend_from_slice(&report.to_bytes()[..len]);
                ControlReply::Data(out)
            }
            Ok(Request::GetState) => {
                if setup.length == 0 {
                    return ControlReply::Stall;
                }
                let mut out = heapless::Vec::new();
                let _ = out.push(self.state as u8);
                ControlReply::Data(out)
            }
            _ if self.state == State::AppIdle => ControlReply::Stall,
            _ => self.reject(Status::ErrStalledPkt),
        }
    }

    /// The report GET_STATUS would return right now
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.status,
            poll_timeout_ms: if self.state == State::DlBusy {
                self.config.poll_timeout_ms
            } else {
                0
            },
            state: self.state,
            string_index: 0,
        }
    }

    /// Handle SET_INTERFACE on the DFU interface
    pub fn set_alternate(&mut self, alt: u8) -> ControlReply {
        if self.state != State::DfuIdle || usize::from(alt) > self.partitions.len() {
            log::debug!("dfu: refusing alt {} in {}", alt, self.state);
            return ControlReply::Stall;
        }
        self.alt = alt;
        log::debug!("dfu: alt {} selected", alt);
        ControlReply::Ack
    }

    /// Drive the program engine one step
    pub fn poll(&mut self) {
        if self.state != State::DlBusy {
            return;
        }
        match self.engine.poll(&mut self.master, &mut self.channel) {
            Ok(EngineEvent::ChunkDone) => self.new_state_ok(State::DlSync),
            Ok(_) => {}
            Err(e) => self.storage_fault(e),
        }
    }

    /// Reset the device into `mode`, abandoning any in-flight operation
    pub fn reset(&mut self, mode: BootMode) {
        self.drop_session();
        self.detach_requested = false;
        self.fault = None;
        self.alt = 0;
        let state = match mode {
            BootMode::Application => State::AppIdle,
            BootMode::Update => State::DfuIdle,
        };
        log::debug!("dfu: reset into {:?}", mode);
        self.new_state_ok(state);
    }
}

/// Status for a chunk the engine refused before touching flash
fn misuse_status(err: Error) -> Status {
    match err {
        Error::AddressOutOfBounds | Error::InvalidAlignment => Status::ErrAddress,
        _ => Status::ErrStalledPkt,
    }
}

/// DFU status reported for an engine error
pub fn fault_status(err: Error, kind: OperationKind) -> Status {
    match (err, kind) {
        (Error::FlashTimeout { kind: OperationKind::Erase, .. }, _) => Status::ErrErase,
        (Error::FlashTimeout { kind: OperationKind::Program, .. }, _) => Status::ErrProg,
        (Error::WriteProtected | Error::AddressOutOfBounds, _) => Status::ErrWrite,
        (Error::InvalidAlignment, _) => Status::ErrAddress,
        (_, OperationKind::Erase) => Status::ErrErase,
        (_, OperationKind::Program) => Status::ErrProg,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{geometry, MockFlash};

    type Responder = DfuResponder<MockFlash, 1024>;

    fn config() -> ResponderConfig {
        ResponderConfig {
            transfer_size: 512,
            ..ResponderConfig::default()
        }
    }

    fn responder() -> Responder {
        let mut r = Responder::new(MockFlash::new(1), geometry(), 3, config()).unwrap();
        r.reset(BootMode::Update);
        r
    }

    fn get_status<const K: usize>(r: &mut DfuResponder<MockFlash, K>) -> StatusReport {
        match r.control_in(Setup::new(Request::GetStatus, 0, 6)) {
            ControlReply::Data(d) => StatusReport::from_bytes(&d).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn settle<const K: usize>(r: &mut DfuResponder<MockFlash, K>) {
        for _ in 0..10_000 {
            if r.state() != State::DlBusy {
                return;
            }
            r.poll();
        }
        panic!("engine never settled");
    }

    fn dnload(r: &mut Responder, block: u16, data: &[u8]) -> ControlReply {
        r.control_out(Setup::new(Request::Dnload, block, data.len() as u16), data)
    }

    /// Drive the responder into `state`
    fn responder_in(state: State) -> Responder {
        let mut r = responder();
        match state {
            State::AppIdle => r.reset(BootMode::Application),
            State::DfuIdle => {}
            State::DlBusy => {
                dnload(&mut r, 0, &[1; 64]);
            }
            State::DlSync => {
                dnload(&mut r, 0, &[1; 64]);
                settle(&mut r);
            }
            State::DlIdle => {
                dnload(&mut r, 0, &[1; 64]);
                settle(&mut r);
                get_status(&mut r);
            }
            State::Error => {
                r.control_out(Setup::new(Request::Abort, 0, 0), &[]);
            }
            _ => unreachable!(),
        }
        assert_eq!(r.state(), state);
        r
    }

    const STATES: [State; 6] = [
        State::AppIdle,
        State::DfuIdle,
        State::DlSync,
        State::DlBusy,
        State::DlIdle,
        State::Error,
    ];

    #[test]
    fn test_full_download_sequence() {
        let mut r = responder();
        assert_eq!(r.set_alternate(1), ControlReply::Ack);
        let image: [u8; 1200] = core::array::from_fn(|i| (i * 7) as u8);
        for (block, chunk) in image.chunks(512).enumerate() {
            assert_eq!(dnload(&mut r, block as u16, chunk), ControlReply::Ack);
            assert_eq!(r.state(), State::DlBusy);
            settle(&mut r);
            let report = get_status(&mut r);
            assert_eq!((report.status, report.state), (Status::Ok, State::DlSync));
            assert_eq!(r.state(), State::DlIdle);
        }
        assert_eq!(dnload(&mut r, 3, &[]), ControlReply::Ack);
        assert_eq!(r.state(), State::DfuIdle);
        let start = r.partitions()[1].start as usize;
        assert_eq!(&r.master().data[start..start + image.len()], &image[..]);
    }

    #[test]
    fn test_status_and_state_answered_everywhere() {
        for state in STATES {
            let mut r = responder_in(state);
            let report = get_status(&mut r);
            assert_eq!(report.state, state);
            let after = match state {
                State::DlSync => State::DlIdle,
                other => other,
            };
            assert_eq!(r.state(), after);

            let mut r = responder_in(state);
            assert_eq!(
                r.control_in(Setup::new(Request::GetState, 0, 1)),
                ControlReply::Data(heapless::Vec::from_slice(&[state as u8]).unwrap())
            );
            assert_eq!(r.state(), state);
            assert_eq!(r.control_in(Setup::new(Request::GetState, 0, 0)), ControlReply::Stall);
        }
    }

    #[test]
    fn test_unexpected_requests_are_total() {
        let out_requests = [0u8, 1, 2, 4, 6, 7, 0x42];
        for state in STATES {
            for &req in &out_requests {
                let mut r = responder_in(state);
                let setup = Setup {
                    request: req,
                    value: 9,
                    length: 4,
                };
                let reply = r.control_out(setup, &[0; 4]);
                let expected = match (state, Request::try_from(req)) {
                    (State::AppIdle, Ok(Request::Detach)) => (ControlReply::Ack, State::AppIdle),
                    (State::AppIdle, _) => (ControlReply::Stall, State::AppIdle),
                    (State::Error, Ok(Request::ClrStatus)) => (ControlReply::Ack, State::DfuIdle),
                    (_, Ok(Request::ClrStatus)) => (ControlReply::Ack, state),
                    _ => (ControlReply::Stall, State::Error),
                };
                assert_eq!((reply, r.state()), expected, "state {} request {}", state, req);
            }
        }
    }

    #[test]
    fn test_misuse_status_codes() {
        let mut r = responder();
        assert_eq!(dnload(&mut r, 5, &[0; 8]), ControlReply::Stall);
        assert_eq!((r.state(), r.status()), (State::Error, Status::ErrAddress));

        let mut r = responder();
        assert_eq!(dnload(&mut r, 0, &[0; 513]), ControlReply::Stall);
        assert_eq!(r.status(), Status::ErrStalledPkt);

        // a 4 KiB slot cannot take 4 KiB + 1
        let mut r = responder();
        for block in 0..8u16 {
            assert_eq!(dnload(&mut r, block, &[0; 512]), ControlReply::Ack);
            settle(&mut r);
            get_status(&mut r);
        }
        assert_eq!(dnload(&mut r, 8, &[0; 1]), ControlReply::Stall);
        assert_eq!(r.status(), Status::ErrAddress);

        // DNLOAD in Error stalls and stays there
        assert_eq!(dnload(&mut r, 0, &[0; 1]), ControlReply::Stall);
        assert_eq!(r.state(), State::Error);
    }

    #[test]
    fn test_clear_status_is_idempotent() {
        let mut r = responder_in(State::Error);
        let clr = Setup::new(Request::ClrStatus, 0, 0);
        assert_eq!(r.control_out(clr, &[]), ControlReply::Ack);
        assert_eq!((r.state(), r.status()), (State::DfuIdle, Status::Ok));
        assert_eq!(r.control_out(clr, &[]), ControlReply::Ack);
        assert_eq!((r.state(), r.status()), (State::DfuIdle, Status::Ok));
    }

    #[test]
    fn test_zero_length_in_idle_is_noop() {
        let mut r = responder();
        assert_eq!(dnload(&mut r, 0, &[]), ControlReply::Ack);
        assert_eq!(r.state(), State::DfuIdle);
    }

    #[test]
    fn test_flash_timeout_enters_error() {
        let config = ResponderConfig {
            engine: EngineConfig {
                max_erase_polls: 50,
                max_program_polls: 50,
            },
            ..config()
        };
        let mut r = Responder::new(MockFlash::new(1), geometry(), 3, config).unwrap();
        r.reset(BootMode::Update);
        r.master_mut().stuck = true;
        dnload(&mut r, 0, &[0; 16]);
        settle(&mut r);
        let report = get_status(&mut r);
        assert_eq!((report.state, report.status), (State::Error, Status::ErrErase));
        assert!(matches!(r.fault(), Some(Error::FlashTimeout { .. })));
    }

    #[test]
    fn test_backpressure_small_channel() {
        let mut r: DfuResponder<MockFlash, 300> =
            DfuResponder::new(MockFlash::new(0), geometry(), 3, config()).unwrap();
        r.reset(BootMode::Update);
        let data: [u8; 512] = core::array::from_fn(|i| i as u8);
        let mut reply = r.control_out(Setup::new(Request::Dnload, 0, 512), &data);
        let mut sent = 0;
        for _ in 0..100 {
            match reply {
                ControlReply::Nak { accepted } => {
                    sent += accepted;
                    r.poll();
                    reply = r.data_out(&data[sent..]);
                }
                ControlReply::Ack => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(reply, ControlReply::Ack);
        settle(&mut r);
        assert_eq!(get_status(&mut r).state, State::DlSync);
        let start = r.partitions()[0].start as usize;
        assert_eq!(&r.master().data[start..start + 512], &data[..]);
    }

    #[test]
    fn test_channel_must_hold_a_page() {
        let r = DfuResponder::<MockFlash, 200>::new(MockFlash::new(0), geometry(), 3, config());
        assert!(matches!(r, Err(Error::ChannelTooSmall)));
    }

    #[test]
    fn test_table_target_takes_one_chunk() {
        let mut r = responder();
        assert_eq!(r.set_alternate(3), ControlReply::Ack);
        assert_eq!(r.set_alternate(4), ControlReply::Stall);
        dnload(&mut r, 0, &[0x7E; 96]);
        settle(&mut r);
        get_status(&mut r);
        assert_eq!(dnload(&mut r, 1, &[0; 32]), ControlReply::Stall);
        assert_eq!(r.status(), Status::ErrAddress);
    }

    #[test]
    fn test_set_alternate_only_in_idle() {
        let mut r = responder_in(State::DlIdle);
        assert_eq!(r.set_alternate(1), ControlReply::Stall);
        let mut r = responder_in(State::AppIdle);
        assert_eq!(r.set_alternate(0), ControlReply::Stall);
    }

    #[test]
    fn test_detach_and_reset() {
        let mut r = responder_in(State::AppIdle);
        assert_eq!(r.control_out(Setup::new(Request::Detach, 1000, 0), &[]), ControlReply::Ack);
        assert!(r.detach_requested());
        r.reset(BootMode::Update);
        assert_eq!(r.state(), State::DfuIdle);
        assert!(!r.detach_requested());
    }

    #[test]
    fn test_reset_abandons_transfer() {
        let mut r = responder_in(State::DlBusy);
        r.reset(BootMode::Update);
        assert_eq!(r.state(), State::DfuIdle);
        assert_eq!(dnload(&mut r, 0, &[0; 4]), ControlReply::Ack);
    }
}
