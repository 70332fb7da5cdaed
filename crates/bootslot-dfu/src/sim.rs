//! Simulated USB bus
//!
//! Puts a real [`DfuResponder`] driving a [`DummyFlash`] behind the
//! [`UsbBus`] / [`ControlTransport`] seams. The device takes a few engine
//! steps before each request it sees, so the host observes genuine busy
//! windows, and it drops off the bus after DETACH and comes back (or not)
//! on a schedule, so the reattach path runs exactly as on hardware.

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bootslot_core::config::DeviceProfile;
use bootslot_core::dfu::{FunctionalDescriptor, Request, State};
use bootslot_core::geometry::FlashGeometry;
use bootslot_core::responder::{BootMode, ControlReply, DfuResponder, ResponderConfig, Setup};
use bootslot_dummy::{DummyConfig, DummyFlash, EraseRecord};

use crate::error::TransportError;
use crate::transport::{ControlTransport, UsbBus, UsbDeviceInfo};

/// Byte channel size of simulated devices (smaller than one transfer, so
/// large DNLOADs are NAKed)
pub const SIM_CHANNEL: usize = 512;

/// Data-stage retries before a NAKed transfer times out
const MAX_NAKS: usize = 10_000;

type SimResponder = DfuResponder<DummyFlash, SIM_CHANNEL>;

/// How a simulated device looks and behaves
#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    /// Serial number string
    pub serial: String,
    /// Vendor id
    pub vendor_id: u16,
    /// Product id in application mode
    pub app_product_id: u16,
    /// Product id in DFU mode
    pub dfu_product_id: u16,
    /// `bcdDevice`
    pub revision: u16,
    /// Flash layout
    pub geometry: FlashGeometry,
    /// Number of slots
    pub slot_count: usize,
    /// Responder tuning
    pub responder: ResponderConfig,
    /// Busy latency of the emulated flash
    pub flash: DummyConfig,
    /// Time off the bus after DETACH; `None` never comes back
    pub reattach_delay: Option<Duration>,
    /// Engine steps the device runs before handling each request
    pub steps_per_request: usize,
    /// Firmware running at power-up
    pub start_mode: BootMode,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            serial: "SIM0001".to_string(),
            vendor_id: 0x1209,
            app_product_id: 0x5BF0,
            dfu_product_id: 0x5BF1,
            revision: 0x0100,
            geometry: FlashGeometry {
                total_size: 1024 * 1024,
                page_size: 256,
                erase_block_size: 4096,
                address_width: bootslot_core::spi::AddressWidth::ThreeByte,
            },
            slot_count: 4,
            responder: ResponderConfig::default(),
            flash: DummyConfig::default(),
            reattach_delay: Some(Duration::from_millis(20)),
            steps_per_request: 8,
            start_mode: BootMode::Application,
        }
    }
}

impl SimDeviceConfig {
    /// A device matching a profile's ids and flash layout
    pub fn from_profile(profile: &DeviceProfile, serial: &str) -> Result<Self, bootslot_core::config::ConfigError> {
        Ok(Self {
            serial: serial.to_string(),
            vendor_id: profile.device.vendor_id,
            app_product_id: profile.device.app_product_id,
            dfu_product_id: profile.device.dfu_product_id,
            geometry: profile.geometry()?,
            slot_count: profile.flash.slots,
            ..Self::default()
        })
    }
}

/// One logged control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    /// Request code
    pub request: Request,
    /// `wValue`
    pub value: u16,
    /// Data stage length
    pub length: usize,
    /// Whether the device stalled it
    pub stalled: bool,
}

struct SimState {
    config: SimDeviceConfig,
    responder: SimResponder,
    present: bool,
    return_at: Option<Instant>,
    return_mode: BootMode,
    generation: u64,
    open_handles: usize,
    fail_open: bool,
    log: Vec<RequestRecord>,
}

impl SimState {
    /// Bring the device back if its time off the bus is over
    fn tick(&mut self) {
        if self.present {
            return;
        }
        if let Some(at) = self.return_at {
            if Instant::now() >= at {
                self.responder.reset(self.return_mode);
                self.present = true;
                self.return_at = None;
                log::trace!("sim: {} back on the bus", self.config.serial);
            }
        }
    }

    fn disconnect(&mut self, mode: BootMode) {
        self.present = false;
        self.generation += 1;
        self.return_mode = mode;
        self.return_at = self.config.reattach_delay.map(|d| Instant::now() + d);
        log::trace!("sim: {} left the bus", self.config.serial);
    }

    fn advance(&mut self, steps: usize) {
        for _ in 0..steps {
            self.responder.poll();
        }
    }

    fn record(&mut self, request: Request, value: u16, length: usize, stalled: bool) {
        self.log.push(RequestRecord {
            request,
            value,
            length,
            stalled,
        });
    }
}

/// Shared handle on a simulated device, for tests and the CLI
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Build a device with erased flash
    pub fn new(mut config: SimDeviceConfig) -> bootslot_core::Result<Self> {
        config.flash.size = config.geometry.total_size as usize;
        config.flash.page_size = config.geometry.page_size as usize;
        let flash = DummyFlash::new(config.flash.clone());
        let mut responder = SimResponder::new(flash, config.geometry, config.slot_count, config.responder)?;
        responder.reset(config.start_mode);
        Ok(Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                responder,
                present: true,
                return_at: None,
                return_mode: BootMode::Update,
                generation: 0,
                open_handles: 0,
                fail_open: false,
                log: Vec::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serial number
    pub fn serial(&self) -> String {
        self.lock().config.serial.clone()
    }

    /// Current DFU state
    pub fn state(&self) -> State {
        self.lock().responder.state()
    }

    /// Whether the device is currently on the bus
    pub fn is_present(&self) -> bool {
        let mut state = self.lock();
        state.tick();
        state.present
    }

    /// Number of transports currently open on the device
    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    /// Copy of a flash range
    pub fn flash_data(&self, range: Range<usize>) -> Vec<u8> {
        self.lock().responder.master().data()[range].to_vec()
    }

    /// Erases the flash accepted so far
    pub fn erase_log(&self) -> Vec<EraseRecord> {
        self.lock().responder.master().erase_log().to_vec()
    }

    /// Every request the device saw
    pub fn request_log(&self) -> Vec<RequestRecord> {
        self.lock().log.clone()
    }

    /// Number of DNLOAD requests carrying data
    pub fn dnload_count(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|r| r.request == Request::Dnload && r.length > 0)
            .count()
    }

    /// Slot ranges the device serves
    pub fn slots(&self) -> Vec<Range<usize>> {
        self.lock()
            .responder
            .partitions()
            .iter()
            .map(|p| p.start as usize..p.end as usize)
            .collect()
    }

    /// Hold the flash busy bit set
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.lock().responder.master_mut().set_stuck_busy(stuck);
    }

    /// Make page programs fail
    pub fn set_fail_program(&self, fail: bool) {
        self.lock().responder.master_mut().set_fail_program(fail);
    }

    /// Make every open attempt fail
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Power-cycle the device into `mode`
    pub fn power_cycle(&self, mode: BootMode) {
        let mut state = self.lock();
        state.generation += 1;
        state.present = true;
        state.return_at = None;
        state.responder.reset(mode);
    }
}

/// A bus holding simulated devices
#[derive(Clone, Default)]
pub struct SimBus {
    devices: Vec<SimDevice>,
}

impl SimBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in and return a handle on it
    pub fn attach(&mut self, config: SimDeviceConfig) -> bootslot_core::Result<SimDevice> {
        let device = SimDevice::new(config)?;
        self.devices.push(device.clone());
        Ok(device)
    }

    fn device_at(&self, location: &str) -> Option<&SimDevice> {
        let index: usize = location.strip_prefix("sim-")?.parse().ok()?;
        self.devices.get(index)
    }
}

impl UsbBus for SimBus {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>, TransportError> {
        let mut list = Vec::new();
        for (i, device) in self.devices.iter().enumerate() {
            let mut state = device.lock();
            state.tick();
            if !state.present {
                continue;
            }
            let product_id = if state.responder.state().is_dfu_mode() {
                state.config.dfu_product_id
            } else {
                state.config.app_product_id
            };
            list.push(UsbDeviceInfo {
                vendor_id: state.config.vendor_id,
                product_id,
                revision: state.config.revision,
                serial: None,
                location: format!("sim-{}", i),
            });
        }
        Ok(list)
    }

    fn open(&self, info: &UsbDeviceInfo) -> Result<Box<dyn ControlTransport>, TransportError> {
        let device = self
            .device_at(&info.location)
            .ok_or_else(|| TransportError::Open(format!("no device at {}", info.location)))?;
        let mut state = device.lock();
        state.tick();
        if !state.present {
            return Err(TransportError::Open("device not present".to_string()));
        }
        if state.fail_open {
            return Err(TransportError::Open("access denied".to_string()));
        }
        state.open_handles += 1;
        Ok(Box::new(SimTransport {
            device: device.clone(),
            generation: state.generation,
            serial: state.config.serial.clone(),
            descriptor: state.responder.functional_descriptor(),
            steps: state.config.steps_per_request,
        }))
    }
}

struct SimTransport {
    device: SimDevice,
    generation: u64,
    serial: String,
    descriptor: FunctionalDescriptor,
    steps: usize,
}

impl SimTransport {
    fn with_state<T>(
        &mut self,
        f: impl FnOnce(&mut SimState, usize) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.device.lock();
        state.tick();
        if !state.present || state.generation != self.generation {
            return Err(TransportError::Disconnected);
        }
        state.advance(self.steps);
        f(&mut state, self.steps)
    }
}

impl ControlTransport for SimTransport {
    fn control_out(&mut self, request: Request, value: u16, data: &[u8]) -> Result<(), TransportError> {
        self.with_state(|state, steps| {
            let setup = Setup::new(request, value, data.len() as u16);
            let mut reply = state.responder.control_out(setup, data);
            let mut sent = 0;
            let mut naks = 0;
            while let ControlReply::Nak { accepted } = reply {
                sent += accepted;
                naks += 1;
                if naks > MAX_NAKS {
                    return Err(TransportError::Timeout);
                }
                state.advance(steps.max(1));
                reply = state.responder.data_out(&data[sent..]);
            }

            let stalled = reply == ControlReply::Stall;
            state.record(request, value, data.len(), stalled);
            match reply {
                ControlReply::Ack => {
                    if request == Request::Detach && state.responder.detach_requested() {
                        state.disconnect(BootMode::Update);
                    }
                    Ok(())
                }
                ControlReply::Stall => Err(TransportError::Stall),
                other => Err(TransportError::Usb(format!("unexpected reply {:?}", other))),
            }
        })
    }

    fn control_in(&mut self, request: Request, value: u16, length: u16) -> Result<Vec<u8>, TransportError> {
        self.with_state(|state, _| {
            let reply = state.responder.control_in(Setup::new(request, value, length));
            state.record(request, value, usize::from(length), reply == ControlReply::Stall);
            match reply {
                ControlReply::Data(bytes) => Ok(bytes.to_vec()),
                ControlReply::Stall => Err(TransportError::Stall),
                other => Err(TransportError::Usb(format!("unexpected reply {:?}", other))),
            }
        })
    }

    fn set_alt_setting(&mut self, alt: u8) -> Result<(), TransportError> {
        self.with_state(|state, _| match state.responder.set_alternate(alt) {
            ControlReply::Ack => Ok(()),
            _ => Err(TransportError::Stall),
        })
    }

    fn functional_descriptor(&self) -> Option<FunctionalDescriptor> {
        Some(self.descriptor)
    }

    fn serial_number(&self) -> Option<String> {
        Some(self.serial.clone())
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.device.lock().open_handles -= 1;
    }
}
