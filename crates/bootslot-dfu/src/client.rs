//! DFU host client
//!
//! [`Host`] is the scoped context every operation runs in: it owns the bus,
//! the timing configuration and the session registry. Nothing here is
//! global, so two hosts (or a host per test) never interfere.
//!
//! A typical update:
//!
//! ```ignore
//! let host = Host::new(bus, HostConfig::from(&profile));
//! let device = host.find("SN0042", Duration::from_secs(2))?;
//! let mut dfu = host.enter_update_mode(&device)?;
//! host.upload(&mut dfu, 1, &image, None)?;
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bootslot_core::config::DeviceProfile;
use bootslot_core::dfu::{FunctionalDescriptor, Request, State, Status, StatusReport, STATUS_LEN};
use bootslot_core::geometry::FlashGeometry;
use bootslot_core::partition::compute_partitions;
use bootslot_core::slot_table::encode_slot_table;

use crate::discovery::{self, DeviceHandle, DeviceIdentity, Mode, ProductIds};
use crate::error::{DfuError, Result, Stage, TransportError};
use crate::session::SessionRegistry;
use crate::transport::{ControlTransport, UsbBus};

/// Host-side timing and device matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Vendor id of the device
    pub vendor_id: u16,
    /// Product ids in both modes
    pub product_ids: ProductIds,
    /// Number of firmware slots; the slot table sits at this alternate setting
    pub slot_count: u8,
    /// How long to wait for the device after DETACH
    pub detach_timeout: Duration,
    /// Shortest pause between status polls while the device is busy
    pub poll_interval: Duration,
    /// Cap on the pause the device may ask for between status polls
    pub max_poll_wait: Duration,
    /// Status polls allowed per chunk
    pub poll_retries: u32,
    /// Pause between bus scans
    pub enumerate_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::from(&DeviceProfile::default())
    }
}

impl From<&DeviceProfile> for HostConfig {
    fn from(profile: &DeviceProfile) -> Self {
        Self {
            vendor_id: profile.device.vendor_id,
            product_ids: ProductIds {
                app: profile.device.app_product_id,
                dfu: profile.device.dfu_product_id,
            },
            slot_count: profile.flash.slots.min(u8::MAX as usize) as u8,
            detach_timeout: profile.timing.detach_timeout(),
            poll_interval: profile.timing.poll_interval(),
            max_poll_wait: profile.timing.max_poll_wait(),
            poll_retries: profile.timing.poll_retries,
            enumerate_interval: profile.timing.enumerate_interval(),
        }
    }
}

/// Progress of an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes acknowledged by the device
    pub bytes_done: usize,
    /// Image size
    pub total: usize,
    /// Block number just acknowledged
    pub block: u16,
}

/// Bookkeeping for one upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    /// Target slot (alternate setting)
    pub slot: u8,
    /// Image size
    pub total_len: usize,
    /// Bytes per DNLOAD
    pub transfer_size: u16,
    /// Block number of the next DNLOAD
    pub next_block: u16,
    /// Bytes the device has confirmed
    pub acknowledged: usize,
}

/// Summary of a completed upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    /// Slot written
    pub slot: u8,
    /// Bytes written
    pub bytes: usize,
    /// DNLOAD requests carrying data
    pub chunks: usize,
    /// Wall time of the transfer
    pub elapsed: Duration,
}

/// Closes a [`DfuHandle`] from elsewhere
///
/// The handle drops its transport at its next request, which then fails with
/// a transport error.
#[derive(Debug, Clone)]
pub struct Canceller {
    flag: Arc<AtomicBool>,
}

impl Canceller {
    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// An opened device in DFU mode
pub struct DfuHandle {
    identity: DeviceIdentity,
    transport: Option<Box<dyn ControlTransport>>,
    descriptor: FunctionalDescriptor,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for DfuHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DfuHandle")
            .field("identity", &self.identity)
            .field("descriptor", &self.descriptor)
            .field("open", &self.is_open())
            .finish()
    }
}

impl DfuHandle {
    fn new(identity: DeviceIdentity, transport: Box<dyn ControlTransport>) -> std::result::Result<Self, TransportError> {
        let descriptor = transport
            .functional_descriptor()
            .ok_or(TransportError::NoDfuInterface)?;
        Ok(Self {
            identity,
            transport: Some(transport),
            descriptor,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Who the device is
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// The functional descriptor read when the handle was opened
    pub fn descriptor(&self) -> &FunctionalDescriptor {
        &self.descriptor
    }

    /// A handle that can cancel this one from another thread or callback
    pub fn canceller(&self) -> Canceller {
        Canceller {
            flag: Arc::clone(&self.cancelled),
        }
    }

    /// Whether the transport is still open
    pub fn is_open(&self) -> bool {
        self.transport.is_some() && !self.cancelled.load(Ordering::SeqCst)
    }

    /// Release the device
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            log::debug!("Closed {}", self.identity.serial);
        }
    }

    fn transport(&mut self, stage: Stage) -> Result<&mut (dyn ControlTransport + 'static)> {
        if self.cancelled.load(Ordering::SeqCst) && self.transport.is_some() {
            log::info!("Transfer to {} cancelled", self.identity.serial);
            self.close();
        }
        self.transport
            .as_deref_mut()
            .ok_or_else(|| DfuError::transport(stage, TransportError::Closed))
    }

    fn status_in(&mut self, stage: Stage) -> Result<StatusReport> {
        let bytes = self
            .transport(stage)?
            .control_in(Request::GetStatus, 0, STATUS_LEN as u16)
            .map_err(|e| DfuError::transport(stage, e))?;
        let report = StatusReport::from_bytes(&bytes).map_err(|source| DfuError::Malformed { stage, source })?;
        log::trace!(
            "GETSTATUS: {} {} poll {}ms",
            report.state,
            report.status,
            report.poll_timeout_ms
        );
        Ok(report)
    }

    fn dnload(&mut self, stage: Stage, block: u16, data: &[u8]) -> Result<()> {
        log::trace!("DNLOAD block {} ({} bytes)", block, data.len());
        self.transport(stage)?
            .control_out(Request::Dnload, block, data)
            .map_err(|e| DfuError::transport(stage, e))
    }

    fn set_alt(&mut self, alt: u8) -> Result<()> {
        self.transport(Stage::SelectSlot)?
            .set_alt_setting(alt)
            .map_err(|e| DfuError::transport(Stage::SelectSlot, e))
    }

    /// Read the full status report
    pub fn get_status(&mut self) -> Result<StatusReport> {
        self.status_in(Stage::Preflight)
    }

    /// Read the state byte
    pub fn get_state(&mut self) -> Result<State> {
        let stage = Stage::Preflight;
        let bytes = self
            .transport(stage)?
            .control_in(Request::GetState, 0, 1)
            .map_err(|e| DfuError::transport(stage, e))?;
        let code = *bytes.first().ok_or_else(|| DfuError::Malformed {
            stage,
            source: bootslot_core::Error::ResponseTooShort { got: 0, expected: 1 },
        })?;
        State::try_from(code).map_err(|source| DfuError::Malformed { stage, source })
    }
}

/// Scoped host context
pub struct Host<B: UsbBus> {
    bus: B,
    config: HostConfig,
    sessions: SessionRegistry,
}

impl<B: UsbBus> Host<B> {
    /// Create a host over `bus`
    pub fn new(bus: B, config: HostConfig) -> Self {
        Self {
            bus,
            config,
            sessions: SessionRegistry::new(),
        }
    }

    /// The configuration in use
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// The bus the host talks to
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Sessions currently running on this host
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// List matching devices in either mode
    pub fn enumerate(&self) -> Result<Vec<DeviceHandle>> {
        discovery::enumerate(&self.bus, self.config.vendor_id, self.config.product_ids)
    }

    /// Wait up to `timeout` for the device with `serial`
    pub fn find(&self, serial: &str, timeout: Duration) -> Result<DeviceHandle> {
        discovery::find(
            &self.bus,
            self.config.vendor_id,
            self.config.product_ids,
            serial,
            None,
            timeout,
            self.config.enumerate_interval,
        )
    }

    fn open(&self, device: &DeviceHandle, stage: Stage) -> Result<DfuHandle> {
        let transport = self
            .bus
            .open(&device.info)
            .map_err(|e| DfuError::transport(stage, e))?;
        DfuHandle::new(device.identity.clone(), transport).map_err(|e| DfuError::transport(stage, e))
    }

    /// Get a handle on the device's DFU-mode firmware
    ///
    /// A device that already reports a DFU-mode state is used as is.
    /// Otherwise it is sent DETACH, released, waited for under its serial
    /// number and reopened, and must come back in `dfuIDLE`.
    pub fn enter_update_mode(&self, device: &DeviceHandle) -> Result<DfuHandle> {
        let mut handle = self.open(device, Stage::Preflight)?;
        let report = handle.status_in(Stage::Preflight)?;
        if report.state.is_dfu_mode() {
            log::debug!("{} already in DFU mode ({})", device.serial(), report.state);
            return Ok(handle);
        }

        let timeout_ms = handle
            .descriptor
            .detach_timeout_ms
            .min(self.config.detach_timeout.as_millis().min(u16::MAX as u128) as u16);
        log::info!("Detaching {}", device.serial());
        let detached = handle
            .transport(Stage::Detach)?
            .control_out(Request::Detach, timeout_ms, &[]);
        match detached {
            Ok(()) => {}
            // the device may reset before the status stage completes
            Err(e @ (TransportError::Disconnected | TransportError::Stall | TransportError::Timeout)) => {
                log::warn!("DETACH to {} not acknowledged ({}), waiting for it anyway", device.serial(), e);
            }
            Err(e) => return Err(DfuError::transport(Stage::Detach, e)),
        }
        handle.close();

        let reattached = discovery::find(
            &self.bus,
            self.config.vendor_id,
            self.config.product_ids,
            device.serial(),
            Some(Mode::Update),
            self.config.detach_timeout,
            self.config.enumerate_interval,
        );
        let reattached = match reattached {
            Ok(d) => d,
            Err(DfuError::NotFound { serial }) => {
                return Err(DfuError::ReattachTimeout {
                    serial,
                    timeout: self.config.detach_timeout,
                })
            }
            Err(e) => return Err(e),
        };

        let mut handle = self.open(&reattached, Stage::Reattach)?;
        let report = handle.status_in(Stage::Reattach)?;
        if report.state != State::DfuIdle {
            return Err(DfuError::UnexpectedState {
                stage: Stage::Reattach,
                expected: State::DfuIdle,
                got: report.state,
            });
        }
        log::info!("{} is in DFU mode", device.serial());
        Ok(handle)
    }

    /// Select the alternate setting of `slot`
    pub fn select_slot(&self, dfu: &mut DfuHandle, slot: u8) -> Result<()> {
        if slot >= self.config.slot_count {
            return Err(DfuError::InvalidSlot {
                slot,
                slots: self.config.slot_count,
            });
        }
        dfu.set_alt(slot)
    }

    /// Leave the error state
    pub fn clear_status(&self, dfu: &mut DfuHandle) -> Result<()> {
        let stage = Stage::ClearStatus;
        dfu.transport(stage)?
            .control_out(Request::ClrStatus, 0, &[])
            .map_err(|e| DfuError::transport(stage, e))?;
        let report = dfu.status_in(stage)?;
        if report.state != State::DfuIdle {
            return Err(DfuError::UnexpectedState {
                stage,
                expected: State::DfuIdle,
                got: report.state,
            });
        }
        log::info!("Cleared status on {}", dfu.identity.serial);
        Ok(())
    }

    fn preflight(&self, dfu: &mut DfuHandle) -> Result<()> {
        let report = dfu.status_in(Stage::Preflight)?;
        match report.state {
            State::DfuIdle => Ok(()),
            State::Error => Err(DfuError::DeviceFault {
                stage: Stage::Preflight,
                status: report.status,
                state: report.state,
                block: None,
                offset: None,
            }),
            got => Err(DfuError::UnexpectedState {
                stage: Stage::Preflight,
                expected: State::DfuIdle,
                got,
            }),
        }
    }

    /// Write `data` into `slot`
    ///
    /// Sends the image in transfer-size chunks, waits for each to be
    /// confirmed and finishes with a zero-length DNLOAD. An empty image only
    /// performs that final step.
    pub fn upload(
        &self,
        dfu: &mut DfuHandle,
        slot: u8,
        data: &[u8],
        progress: Option<&mut dyn FnMut(Progress)>,
    ) -> Result<TransferReport> {
        let _session = self.sessions.acquire(&dfu.identity.serial)?;
        self.preflight(dfu)?;
        self.select_slot(dfu, slot)?;

        log::info!(
            "Uploading {} bytes to slot {} of {}",
            data.len(),
            slot,
            dfu.identity.serial
        );
        let report = self.download(dfu, slot, data, Stage::Download, progress)?;
        log::info!(
            "Slot {} written: {} bytes in {} chunks ({:.2?})",
            slot,
            report.bytes,
            report.chunks,
            report.elapsed
        );
        Ok(report)
    }

    /// Write an encoded slot table in a single DNLOAD
    pub fn write_slot_table(&self, dfu: &mut DfuHandle, table: &[u8]) -> Result<TransferReport> {
        let _session = self.sessions.acquire(&dfu.identity.serial)?;
        let transfer_size = dfu.descriptor.transfer_size;
        if table.len() > usize::from(transfer_size) {
            return Err(DfuError::TableTooLarge {
                len: table.len(),
                transfer_size,
            });
        }
        self.preflight(dfu)?;
        let alt = self.config.slot_count;
        dfu.set_alt(alt)?;

        log::info!("Writing {} byte slot table to {}", table.len(), dfu.identity.serial);
        self.download(dfu, alt, table, Stage::SlotTable, None)
    }

    /// Partition `geometry` into the configured number of slots and write
    /// the matching slot table
    pub fn write_partitions(&self, dfu: &mut DfuHandle, geometry: &FlashGeometry) -> Result<TransferReport> {
        let partitions = compute_partitions(geometry, usize::from(self.config.slot_count))?;
        for p in &partitions {
            log::debug!("slot {}: 0x{:08X}..0x{:08X}", p.index, p.start, p.end);
        }
        let table = encode_slot_table(&partitions, geometry.address_width)?;
        self.write_slot_table(dfu, &table)
    }

    fn download(
        &self,
        dfu: &mut DfuHandle,
        slot: u8,
        data: &[u8],
        stage: Stage,
        mut progress: Option<&mut dyn FnMut(Progress)>,
    ) -> Result<TransferReport> {
        let started = Instant::now();
        let transfer_size = dfu.descriptor.transfer_size;
        if transfer_size == 0 {
            return Err(DfuError::Malformed {
                stage,
                source: bootslot_core::Error::InvalidDescriptor,
            });
        }
        let mut session = TransferSession {
            slot,
            total_len: data.len(),
            transfer_size,
            next_block: 0,
            acknowledged: 0,
        };
        let mut chunks = 0;

        for chunk in data.chunks(usize::from(transfer_size)) {
            let block = session.next_block;
            let offset = session.acknowledged as u32;
            if let Err(e) = dfu.dnload(stage, block, chunk) {
                return Err(self.explain_stall(dfu, e, stage, block, offset));
            }

            let report = self.wait_while_busy(dfu, stage, block)?;
            if report.status != Status::Ok || report.state != State::DlSync {
                return Err(DfuError::DeviceFault {
                    stage,
                    status: report.status,
                    state: report.state,
                    block: Some(block),
                    offset: Some(offset),
                });
            }

            session.acknowledged += chunk.len();
            session.next_block = block.wrapping_add(1);
            chunks += 1;
            log::debug!("Block {} acknowledged ({}/{})", block, session.acknowledged, session.total_len);
            if let Some(cb) = progress.as_mut() {
                cb(Progress {
                    bytes_done: session.acknowledged,
                    total: session.total_len,
                    block,
                });
            }
        }

        let finalize = if stage == Stage::Download { Stage::Finalize } else { stage };
        dfu.dnload(finalize, session.next_block, &[])?;
        let report = dfu.status_in(finalize)?;
        if report.state != State::DfuIdle || report.status != Status::Ok {
            return Err(DfuError::FinalizeFailed {
                status: report.status,
                state: report.state,
            });
        }

        Ok(TransferReport {
            slot,
            bytes: session.acknowledged,
            chunks,
            elapsed: started.elapsed(),
        })
    }

    /// Poll GET_STATUS until the device leaves dfuDNBUSY
    fn wait_while_busy(&self, dfu: &mut DfuHandle, stage: Stage, block: u16) -> Result<StatusReport> {
        for _ in 0..self.config.poll_retries {
            let report = dfu.status_in(stage)?;
            if report.state != State::DlBusy {
                return Ok(report);
            }
            let wait = poll_delay(report.poll_timeout_ms, &self.config);
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
        Err(DfuError::PollExhausted {
            stage,
            block: Some(block),
            attempts: self.config.poll_retries,
        })
    }

    /// Turn a stalled DNLOAD into the device's own account of what went wrong
    fn explain_stall(&self, dfu: &mut DfuHandle, err: DfuError, stage: Stage, block: u16, offset: u32) -> DfuError {
        if !matches!(err, DfuError::Transport { source: TransportError::Stall, .. }) {
            return err;
        }
        match dfu.status_in(stage) {
            Ok(report) if report.status != Status::Ok => DfuError::DeviceFault {
                stage,
                status: report.status,
                state: report.state,
                block: Some(block),
                offset: Some(offset),
            },
            _ => err,
        }
    }
}

/// Pause before the next status poll: what the device asked for, no less
/// than `poll_interval` and no more than `max_poll_wait`
fn poll_delay(poll_timeout_ms: u32, config: &HostConfig) -> Duration {
    Duration::from_millis(u64::from(poll_timeout_ms))
        .max(config.poll_interval)
        .min(config.max_poll_wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sim::{SimBus, SimDevice, SimDeviceConfig};
    use crate::transport::UsbDeviceInfo;
    use bootslot_core::engine::EngineConfig;
    use bootslot_core::responder::{BootMode, ResponderConfig};
    use bootslot_core::slot_table::decode_slot_table;

    const TS: usize = 1024;
    const SERIAL: &str = "SIM0001";

    fn host_config() -> HostConfig {
        HostConfig {
            vendor_id: 0x1209,
            product_ids: ProductIds {
                app: 0x5BF0,
                dfu: 0x5BF1,
            },
            slot_count: 4,
            detach_timeout: Duration::from_secs(2),
            poll_interval: Duration::ZERO,
            max_poll_wait: Duration::ZERO,
            poll_retries: 100_000,
            enumerate_interval: Duration::from_millis(5),
        }
    }

    fn setup_with(sim: SimDeviceConfig, config: HostConfig) -> (Host<SimBus>, SimDevice) {
        let mut bus = SimBus::new();
        let device = bus.attach(sim).unwrap();
        (Host::new(bus, config), device)
    }

    fn setup(sim: SimDeviceConfig) -> (Host<SimBus>, SimDevice) {
        setup_with(sim, host_config())
    }

    fn update_mode() -> SimDeviceConfig {
        SimDeviceConfig {
            start_mode: BootMode::Update,
            ..SimDeviceConfig::default()
        }
    }

    fn open(host: &Host<SimBus>) -> DfuHandle {
        let device = host.find(SERIAL, Duration::from_secs(1)).unwrap();
        host.enter_update_mode(&device).unwrap()
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_upload_round_trip() {
        for len in [0, 1, TS - 1, TS, TS + 1, 10 * TS] {
            let (host, device) = setup(update_mode());
            let mut dfu = open(&host);
            let data = image(len);

            let report = host.upload(&mut dfu, 1, &data, None).unwrap();
            let chunks = (len + TS - 1) / TS;
            assert_eq!(report.slot, 1);
            assert_eq!(report.bytes, len, "len {}", len);
            assert_eq!(report.chunks, chunks, "len {}", len);
            assert_eq!(device.dnload_count(), chunks, "len {}", len);

            let slot = device.slots()[1].clone();
            assert_eq!(device.flash_data(slot.start..slot.start + len), data, "len {}", len);
            assert!(device
                .flash_data(slot.start + len..slot.start + len + 64)
                .iter()
                .all(|&b| b == 0xFF));
            assert_eq!(device.state(), State::DfuIdle);

            let last = device
                .request_log()
                .into_iter()
                .rev()
                .find(|r| r.request == Request::Dnload)
                .unwrap();
            assert_eq!(last.length, 0);
            assert_eq!(usize::from(last.value), chunks);
        }
    }

    #[test]
    fn test_empty_image_touches_no_flash() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        host.upload(&mut dfu, 0, &[], None).unwrap();
        assert!(device.erase_log().is_empty());
    }

    #[test]
    fn test_each_block_erased_once() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        host.upload(&mut dfu, 2, &image(10 * TS), None).unwrap();

        let slot = device.slots()[2].clone();
        let erased: Vec<u32> = device.erase_log().iter().map(|e| e.addr).collect();
        let expected: Vec<u32> = (0..3).map(|i| slot.start as u32 + i * 4096).collect();
        assert_eq!(erased, expected);
    }

    #[test]
    fn test_progress_reports_every_chunk() {
        let (host, _device) = setup(update_mode());
        let mut dfu = open(&host);
        let mut seen = Vec::new();
        let mut cb = |p: Progress| seen.push(p);
        host.upload(&mut dfu, 0, &image(3 * TS + 10), Some(&mut cb)).unwrap();

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].bytes_done, TS);
        assert_eq!(seen[3].bytes_done, 3 * TS + 10);
        assert_eq!(seen[3].total, 3 * TS + 10);
        assert_eq!(seen[3].block, 3);
    }

    #[test]
    fn test_enter_update_mode_detaches_and_reattaches() {
        let (host, device) = setup(SimDeviceConfig {
            reattach_delay: Some(Duration::from_millis(30)),
            ..SimDeviceConfig::default()
        });
        let found = host.find(SERIAL, Duration::ZERO).unwrap();
        assert_eq!(found.mode, Mode::Application);

        let started = Instant::now();
        let mut dfu = host.enter_update_mode(&found).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(dfu.get_state().unwrap(), State::DfuIdle);
        assert_eq!(dfu.identity().serial, SERIAL);
        assert_eq!(device.open_handles(), 1);
        assert!(device.request_log().iter().any(|r| r.request == Request::Detach));

        let data = image(3000);
        host.upload(&mut dfu, 3, &data, None).unwrap();
        let slot = device.slots()[3].clone();
        assert_eq!(device.flash_data(slot.start..slot.start + data.len()), data);

        drop(dfu);
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn test_enter_update_mode_reuses_dfu_device() {
        let (host, device) = setup(update_mode());
        let _dfu = open(&host);
        assert!(device.request_log().iter().all(|r| r.request != Request::Detach));
    }

    #[test]
    fn test_reattach_timeout_is_bounded() {
        let (host, device) = setup_with(
            SimDeviceConfig {
                reattach_delay: None,
                ..SimDeviceConfig::default()
            },
            HostConfig {
                detach_timeout: Duration::from_millis(100),
                ..host_config()
            },
        );
        let found = host.find(SERIAL, Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = host.enter_update_mode(&found).unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, DfuError::ReattachTimeout { ref serial, .. } if serial == SERIAL));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert!(err.is_retry_safe());
        assert!(!device.is_present());
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn test_storage_fault_blocks_until_cleared() {
        let (host, device) = setup(SimDeviceConfig {
            responder: ResponderConfig {
                engine: EngineConfig {
                    max_erase_polls: 20,
                    max_program_polls: 20,
                },
                ..ResponderConfig::default()
            },
            ..update_mode()
        });
        let mut dfu = open(&host);
        device.set_stuck_busy(true);

        let err = host.upload(&mut dfu, 0, &image(2 * TS), None).unwrap_err();
        match &err {
            DfuError::DeviceFault {
                stage,
                status,
                state,
                block,
                offset,
            } => {
                assert_eq!(*stage, Stage::Download);
                assert_eq!(*status, Status::ErrErase);
                assert_eq!(*state, State::Error);
                assert_eq!(*block, Some(0));
                assert_eq!(*offset, Some(0));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert!(err.slot_indeterminate());
        assert!(!err.is_retry_safe());

        let err = host.upload(&mut dfu, 0, &image(16), None).unwrap_err();
        assert!(matches!(
            err,
            DfuError::DeviceFault {
                stage: Stage::Preflight,
                status: Status::ErrErase,
                ..
            }
        ));

        device.set_stuck_busy(false);
        host.clear_status(&mut dfu).unwrap();
        let data = image(2 * TS);
        host.upload(&mut dfu, 0, &data, None).unwrap();
        let slot = device.slots()[0].clone();
        assert_eq!(device.flash_data(slot.start..slot.start + data.len()), data);
    }

    #[test]
    fn test_program_fault() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        device.set_fail_program(true);

        let err = host.upload(&mut dfu, 0, &image(TS), None).unwrap_err();
        assert!(matches!(
            err,
            DfuError::DeviceFault {
                status: Status::ErrProg,
                ..
            }
        ));
        assert_eq!(device.state(), State::Error);
    }

    #[test]
    fn test_image_larger_than_slot_is_refused() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let slots = device.slots();
        let size = slots[1].len();

        let err = host.upload(&mut dfu, 1, &image(size + 1), None).unwrap_err();
        match err {
            DfuError::DeviceFault {
                status,
                block,
                offset,
                ..
            } => {
                assert_eq!(status, Status::ErrAddress);
                assert_eq!(block, Some((size / TS) as u16));
                assert_eq!(offset, Some(size as u32));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(device
            .flash_data(slots[2].start..slots[2].start + 256)
            .iter()
            .all(|&b| b == 0xFF));
    }

    #[test]
    fn test_invalid_slot() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let err = host.upload(&mut dfu, 4, &image(10), None).unwrap_err();
        assert!(matches!(err, DfuError::InvalidSlot { slot: 4, slots: 4 }));
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(device.dnload_count(), 0);
    }

    #[test]
    fn test_one_session_per_device() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);

        let guard = host.sessions().acquire(SERIAL).unwrap();
        let err = host.upload(&mut dfu, 0, &image(10), None).unwrap_err();
        assert!(matches!(err, DfuError::SessionBusy { .. }));
        assert!(err.is_retry_safe());
        assert_eq!(device.dnload_count(), 0);

        drop(guard);
        host.upload(&mut dfu, 0, &image(10), None).unwrap();
        assert!(!host.sessions().is_active(SERIAL));
    }

    #[test]
    fn test_cancel_releases_device() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let canceller = dfu.canceller();

        let mut calls = 0;
        let mut cb = |_: Progress| {
            calls += 1;
            canceller.cancel();
        };
        let err = host.upload(&mut dfu, 0, &image(4 * TS), Some(&mut cb)).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Transport {
                stage: Stage::Download,
                source: TransportError::Closed
            }
        ));
        assert!(err.slot_indeterminate());
        assert_eq!(calls, 1);
        assert!(!dfu.is_open());
        assert_eq!(device.open_handles(), 0);
        assert_eq!(device.dnload_count(), 1);
        assert!(!host.sessions().is_active(SERIAL));
    }

    #[test]
    fn test_write_slot_table() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let geometry = SimDeviceConfig::default().geometry;
        let partitions = compute_partitions(&geometry, 4).unwrap();
        let table = encode_slot_table(&partitions, geometry.address_width).unwrap();

        let report = host.write_slot_table(&mut dfu, &table).unwrap();
        assert_eq!(report.slot, 4);
        assert_eq!(report.chunks, 1);
        assert_eq!(device.flash_data(0..table.len()), table.to_vec());

        let records = decode_slot_table(&device.flash_data(0..4096)).unwrap();
        assert_eq!(records.len(), 4);
        for (record, partition) in records.iter().zip(partitions.iter()) {
            assert_eq!(record.boot_address, partition.start);
        }
    }

    #[test]
    fn test_write_partitions() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let geometry = SimDeviceConfig::default().geometry;
        host.write_partitions(&mut dfu, &geometry).unwrap();

        let records = decode_slot_table(&device.flash_data(0..4096)).unwrap();
        let starts: Vec<u32> = records.iter().map(|r| r.boot_address).collect();
        let expected: Vec<u32> = device.slots().iter().map(|s| s.start as u32).collect();
        assert_eq!(starts, expected);
    }

    #[test]
    fn test_write_partitions_rejects_bad_layout() {
        let (host, device) = setup_with(
            update_mode(),
            HostConfig {
                slot_count: 9,
                ..host_config()
            },
        );
        let mut dfu = open(&host);
        let geometry = SimDeviceConfig::default().geometry;
        let err = host.write_partitions(&mut dfu, &geometry).unwrap_err();
        assert!(matches!(err, DfuError::Layout(bootslot_core::Error::InvalidSlotCount)));
        assert_eq!(device.dnload_count(), 0);
    }

    #[test]
    fn test_slot_table_must_fit_one_transfer() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let err = host.write_slot_table(&mut dfu, &vec![0u8; TS + 1]).unwrap_err();
        assert!(matches!(
            err,
            DfuError::TableTooLarge {
                len,
                transfer_size: 1024
            } if len == TS + 1
        ));
        assert_eq!(device.dnload_count(), 0);
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (host, _device) = setup(update_mode());
        let mut dfu = open(&host);
        dfu.close();
        let err = host.upload(&mut dfu, 0, &image(10), None).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Transport {
                source: TransportError::Closed,
                ..
            }
        ));
    }

    /// Bus whose transports report a lost connection once DETACH went out
    struct ResetOnDetachBus(SimBus);

    struct ResetOnDetach(Box<dyn ControlTransport>);

    impl ControlTransport for ResetOnDetach {
        fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> std::result::Result<(), TransportError> {
            self.0.control_out(request, value, data)?;
            if request == Request::Detach {
                return Err(TransportError::Disconnected);
            }
            Ok(())
        }

        fn control_in(&mut self, request: Request, value: u16, length: u16) -> std::result::Result<Vec<u8>, TransportError> {
            self.0.control_in(request, value, length)
        }

        fn set_alt_setting(&mut self, alt: u8) -> std::result::Result<(), TransportError> {
            self.0.set_alt_setting(alt)
        }

        fn functional_descriptor(&self) -> Option<FunctionalDescriptor> {
            self.0.functional_descriptor()
        }

        fn serial_number(&self) -> Option<String> {
            self.0.serial_number()
        }
    }

    impl UsbBus for ResetOnDetachBus {
        fn devices(&self) -> std::result::Result<Vec<UsbDeviceInfo>, TransportError> {
            self.0.devices()
        }

        fn open(&self, info: &UsbDeviceInfo) -> std::result::Result<Box<dyn ControlTransport>, TransportError> {
            Ok(Box::new(ResetOnDetach(self.0.open(info)?)))
        }
    }

    #[test]
    fn test_detach_without_status_stage_still_reattaches() {
        let mut bus = SimBus::new();
        let device = bus.attach(SimDeviceConfig::default()).unwrap();
        let host = Host::new(ResetOnDetachBus(bus), host_config());

        let found = host.find(SERIAL, Duration::ZERO).unwrap();
        assert_eq!(found.mode, Mode::Application);
        let mut dfu = host.enter_update_mode(&found).unwrap();
        assert_eq!(dfu.get_state().unwrap(), State::DfuIdle);
        assert_eq!(device.open_handles(), 1);
    }

    #[test]
    fn test_detach_failure_other_than_reset_is_fatal() {
        struct RefusingBus(SimBus);
        struct Refusing(Box<dyn ControlTransport>);

        impl ControlTransport for Refusing {
            fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> std::result::Result<(), TransportError> {
                if request == Request::Detach {
                    return Err(TransportError::Usb("pipe error".into()));
                }
                self.0.control_out(request, value, data)
            }

            fn control_in(&mut self, request: Request, value: u16, length: u16) -> std::result::Result<Vec<u8>, TransportError> {
                self.0.control_in(request, value, length)
            }

            fn set_alt_setting(&mut self, alt: u8) -> std::result::Result<(), TransportError> {
                self.0.set_alt_setting(alt)
            }

            fn functional_descriptor(&self) -> Option<FunctionalDescriptor> {
                self.0.functional_descriptor()
            }

            fn serial_number(&self) -> Option<String> {
                self.0.serial_number()
            }
        }

        impl UsbBus for RefusingBus {
            fn devices(&self) -> std::result::Result<Vec<UsbDeviceInfo>, TransportError> {
                self.0.devices()
            }

            fn open(&self, info: &UsbDeviceInfo) -> std::result::Result<Box<dyn ControlTransport>, TransportError> {
                Ok(Box::new(Refusing(self.0.open(info)?)))
            }
        }

        let mut bus = SimBus::new();
        let device = bus.attach(SimDeviceConfig::default()).unwrap();
        let host = Host::new(RefusingBus(bus), host_config());
        let found = host.find(SERIAL, Duration::ZERO).unwrap();
        let err = host.enter_update_mode(&found).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Transport {
                stage: Stage::Detach,
                source: TransportError::Usb(_)
            }
        ));
        assert!(device.is_present());
        assert_eq!(device.open_handles(), 0);
    }

    #[test]
    fn test_poll_delay_honours_device() {
        let config = HostConfig {
            poll_interval: Duration::from_millis(2),
            max_poll_wait: Duration::from_millis(500),
            ..host_config()
        };
        assert_eq!(poll_delay(0, &config), Duration::from_millis(2));
        assert_eq!(poll_delay(40, &config), Duration::from_millis(40));
        assert_eq!(poll_delay(0x00FF_FFFF, &config), Duration::from_millis(500));
    }

    #[test]
    fn test_power_cycle_abandons_transfer() {
        let (host, device) = setup(update_mode());
        let mut dfu = open(&host);
        let slot = device.slots()[1].clone();

        let mut cb = |p: Progress| {
            if p.block == 0 {
                device.power_cycle(BootMode::Update);
            }
        };
        let err = host.upload(&mut dfu, 1, &image(4 * TS), Some(&mut cb)).unwrap_err();
        assert!(matches!(
            err,
            DfuError::Transport {
                stage: Stage::Download,
                source: TransportError::Disconnected
            }
        ));
        assert!(err.slot_indeterminate());
        assert_eq!(device.state(), State::DfuIdle);
        drop(dfu);

        let data = image(4 * TS);
        let mut dfu = open(&host);
        host.upload(&mut dfu, 1, &data, None).unwrap();
        assert_eq!(device.flash_data(slot.start..slot.start + data.len()), data);
        let first_block_erases = device
            .erase_log()
            .iter()
            .filter(|e| e.addr == slot.start as u32)
            .count();
        assert_eq!(first_block_erases, 2);
    }
}
