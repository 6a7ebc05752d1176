// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the hardware and application services, used by
//! tests and by `faux-dmc`. Each is a cheap handle onto shared state so a
//! test can keep one copy and hand another to the controller.

use crate::config::DeviceTopology;
use crate::device_ops::DeviceQuery;
use crate::device_ops::DeviceTransport;
use crate::error::DeviceOpError;
use crate::error::FlashError;
use crate::error::SpiError;
use crate::platform::DmcEvent;
use crate::platform::DockApplication;
use crate::platform::EraseBlock;
use crate::platform::FlashRows;
use crate::platform::HostBusy;
use crate::platform::HostLink;
use crate::platform::SignatureVerifier;
use crate::platform::SpiFlash;
use crate::spi::SPI_PAGE_SIZE;
use dmc_messages::ImageMode;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::Notification;
use dmc_messages::SignatureAlgorithm;
use dmc_messages::FW_VERSION_SIZE;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug)]
struct FlashState {
    row_size: usize,
    data: Vec<u8>,
    /// Writes left before power fails.
    power_left: Option<usize>,
    flashing_mode: bool,
    writes: usize,
}

/// Internal flash. Power loss can be scheduled: the interrupted row is left
/// erased and every later write fails until power is restored.
#[derive(Debug, Clone)]
pub struct SimFlash(Arc<Mutex<FlashState>>);

impl SimFlash {
    pub fn new(rows: u16, row_size: usize) -> Self {
        Self::from_image(row_size, vec![0xFF; usize::from(rows) * row_size])
    }

    /// `data` is truncated to whole rows.
    pub fn from_image(row_size: usize, mut data: Vec<u8>) -> Self {
        data.truncate(data.len() / row_size * row_size);
        Self(Arc::new(Mutex::new(FlashState {
            row_size,
            data,
            power_left: None,
            flashing_mode: false,
            writes: 0,
        })))
    }

    pub fn image(&self) -> Vec<u8> {
        self.0.lock().unwrap().data.clone()
    }

    pub fn row(&self, row: u16) -> Vec<u8> {
        let state = self.0.lock().unwrap();
        let start = usize::from(row) * state.row_size;
        state.data[start..start + state.row_size].to_vec()
    }

    pub fn erase_row(&self, row: u16) {
        let mut state = self.0.lock().unwrap();
        let start = usize::from(row) * state.row_size;
        let end = start + state.row_size;
        state.data[start..end].fill(0xFF);
    }

    /// Let `writes` more row writes through, then lose power.
    pub fn cut_power_after(&self, writes: usize) {
        self.0.lock().unwrap().power_left = Some(writes);
    }

    pub fn restore_power(&self) {
        self.0.lock().unwrap().power_left = None;
    }

    pub fn writes(&self) -> usize {
        self.0.lock().unwrap().writes
    }

    pub fn is_flashing(&self) -> bool {
        self.0.lock().unwrap().flashing_mode
    }
}

impl FlashRows for SimFlash {
    fn row_size(&self) -> usize {
        self.0.lock().unwrap().row_size
    }

    fn read_row(&mut self, row: u16, buf: &mut [u8]) -> Result<(), FlashError> {
        let state = self.0.lock().unwrap();
        if buf.len() != state.row_size {
            return Err(FlashError::BadRowLength {
                expected: state.row_size,
                got: buf.len(),
            });
        }
        let start = usize::from(row) * state.row_size;
        let src = state
            .data
            .get(start..start + state.row_size)
            .ok_or(FlashError::RowOutOfRange { row })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_row(&mut self, row: u16, data: &[u8]) -> Result<(), FlashError> {
        let mut state = self.0.lock().unwrap();
        let row_size = state.row_size;
        if data.len() != row_size {
            return Err(FlashError::BadRowLength {
                expected: row_size,
                got: data.len(),
            });
        }
        let start = usize::from(row) * row_size;
        if start + row_size > state.data.len() {
            return Err(FlashError::RowOutOfRange { row });
        }
        match state.power_left {
            Some(0) => {
                // Erased, never programmed.
                state.data[start..start + row_size].fill(0xFF);
                return Err(FlashError::WriteFailed { row });
            }
            Some(n) => state.power_left = Some(n - 1),
            None => (),
        }
        state.data[start..start + row_size].copy_from_slice(data);
        state.writes += 1;
        Ok(())
    }

    fn set_flashing_mode(&mut self, enabled: bool) {
        self.0.lock().unwrap().flashing_mode = enabled;
    }
}

#[derive(Debug)]
struct SpiState {
    data: Vec<u8>,
    write_enabled: bool,
    busy_ticks: u32,
    busy_left: u32,
    fail_reads: bool,
    erases: Vec<(u32, EraseBlock)>,
    programs: Vec<(u32, usize)>,
}

/// SPI NOR flash: erase sets bits, programming can only clear them, and
/// every command needs write enable and leaves the part busy for a
/// configurable number of polls.
#[derive(Debug, Clone)]
pub struct SimSpiFlash(Arc<Mutex<SpiState>>);

impl SimSpiFlash {
    pub fn new(size: usize) -> Self {
        Self::from_image(vec![0xFF; size])
    }

    pub fn from_image(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(SpiState {
            data,
            write_enabled: false,
            busy_ticks: 0,
            busy_left: 0,
            fail_reads: false,
            erases: Vec::new(),
            programs: Vec::new(),
        })))
    }

    pub fn image(&self) -> Vec<u8> {
        self.0.lock().unwrap().data.clone()
    }

    /// Store bytes directly, bypassing erase and programming rules.
    pub fn load(&self, addr: u32, bytes: &[u8]) {
        let mut state = self.0.lock().unwrap();
        let start = addr as usize;
        state.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn contents(&self, addr: u32, len: usize) -> Vec<u8> {
        let state = self.0.lock().unwrap();
        state.data[addr as usize..addr as usize + len].to_vec()
    }

    pub fn set_busy_ticks(&self, ticks: u32) {
        self.0.lock().unwrap().busy_ticks = ticks;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.0.lock().unwrap().fail_reads = fail;
    }

    pub fn erases(&self) -> Vec<(u32, EraseBlock)> {
        self.0.lock().unwrap().erases.clone()
    }

    pub fn programs(&self) -> Vec<(u32, usize)> {
        self.0.lock().unwrap().programs.clone()
    }
}

impl SpiState {
    fn range(
        &self,
        addr: u32,
        len: usize,
    ) -> Result<std::ops::Range<usize>, SpiError> {
        let start = addr as usize;
        if start + len > self.data.len() {
            return Err(SpiError::OutOfBounds { addr, len });
        }
        Ok(start..start + len)
    }

    fn start_command(&mut self) -> bool {
        let ok = self.write_enabled && self.busy_left == 0;
        self.write_enabled = false;
        self.busy_left = self.busy_ticks;
        ok
    }
}

impl SpiFlash for SimSpiFlash {
    fn write_enable(&mut self, enabled: bool) -> Result<(), SpiError> {
        self.0.lock().unwrap().write_enabled = enabled;
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SpiError> {
        let state = self.0.lock().unwrap();
        if state.fail_reads {
            return Err(SpiError::ReadFailed { addr });
        }
        let range = state.range(addr, buf.len())?;
        buf.copy_from_slice(&state.data[range]);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), SpiError> {
        let mut state = self.0.lock().unwrap();
        let page_end = (addr | (SPI_PAGE_SIZE - 1)) as usize + 1;
        let range = state.range(addr, data.len())?;
        if range.end > page_end || !state.start_command() {
            return Err(SpiError::WriteFailed { addr });
        }
        for (dst, src) in state.data[range].iter_mut().zip(data) {
            *dst &= *src;
        }
        state.programs.push((addr, data.len()));
        Ok(())
    }

    fn erase(&mut self, addr: u32, block: EraseBlock) -> Result<(), SpiError> {
        let mut state = self.0.lock().unwrap();
        let range = state.range(addr, block.size() as usize)?;
        if addr % block.size() != 0 || !state.start_command() {
            return Err(SpiError::EraseFailed { addr });
        }
        state.data[range].fill(0xFF);
        state.erases.push((addr, block));
        Ok(())
    }

    fn is_busy(&mut self) -> bool {
        let mut state = self.0.lock().unwrap();
        if state.busy_left > 0 {
            state.busy_left -= 1;
            true
        } else {
            false
        }
    }
}

/// The signature [`SimVerifier`] accepts: SHA-256 of the key and the digest,
/// repeated out to the algorithm's signature length.
pub fn sim_signature(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    digest: &[u8; 32],
) -> Vec<u8> {
    let block: [u8; 32] =
        Sha256::new().chain_update(public_key).chain_update(digest).finalize().into();
    block.iter().copied().cycle().take(algorithm.signature_len()).collect()
}

/// Accepts exactly the signatures produced by [`sim_signature`].
#[derive(Debug, Clone, Default)]
pub struct SimVerifier;

impl SignatureVerifier for SimVerifier {
    fn verify(
        &mut self,
        algorithm: SignatureAlgorithm,
        digest: &[u8; 32],
        signature: &[u8],
        public_key: &[u8],
    ) -> bool {
        signature == sim_signature(algorithm, public_key, digest)
    }
}

#[derive(Debug, Default)]
struct HostState {
    queue: VecDeque<Notification>,
    busy: bool,
}

/// Collects interrupt endpoint notifications for a simulated host.
#[derive(Debug, Clone, Default)]
pub struct SimHost(Arc<Mutex<HostState>>);

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<Notification> {
        self.0.lock().unwrap().queue.pop_front()
    }

    pub fn drain(&self) -> Vec<Notification> {
        self.0.lock().unwrap().queue.drain(..).collect()
    }

    /// Refuse notifications, as an endpoint with a transfer outstanding
    /// would.
    pub fn set_busy(&self, busy: bool) {
        self.0.lock().unwrap().busy = busy;
    }
}

impl HostLink for SimHost {
    fn notify(&mut self, notification: Notification) -> Result<(), HostBusy> {
        let mut state = self.0.lock().unwrap();
        if state.busy {
            return Err(HostBusy);
        }
        state.queue.push_back(notification);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AppState {
    events: Vec<DmcEvent>,
    resets: usize,
    factory_condition: bool,
}

/// Records application events and reset requests.
#[derive(Debug, Clone, Default)]
pub struct SimApp(Arc<Mutex<AppState>>);

impl SimApp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_factory_condition(&self, factory: bool) {
        self.0.lock().unwrap().factory_condition = factory;
    }

    pub fn events(&self) -> Vec<DmcEvent> {
        self.0.lock().unwrap().events.clone()
    }

    /// Events other than state changes.
    pub fn milestones(&self) -> Vec<DmcEvent> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, DmcEvent::StateChanged { .. }))
            .collect()
    }

    pub fn resets(&self) -> usize {
        self.0.lock().unwrap().resets
    }
}

impl DockApplication for SimApp {
    fn dock_reset(&mut self) {
        self.0.lock().unwrap().resets += 1;
    }

    fn is_factory_condition(&mut self) -> bool {
        self.0.lock().unwrap().factory_condition
    }

    fn event(&mut self, event: DmcEvent) {
        self.0.lock().unwrap().events.push(event);
    }
}

/// One external device as seen through its transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDevice {
    pub running: ImageType,
    pub image1: ImageStatus,
    pub image2: ImageStatus,
    pub bootloader_version: [u8; FW_VERSION_SIZE],
    pub image1_version: [u8; FW_VERSION_SIZE],
    pub image2_version: [u8; FW_VERSION_SIZE],
    /// Rows written, by device row number.
    #[serde(default)]
    pub rows: BTreeMap<u16, Vec<u8>>,
    /// Polls answered "busy" before each row is acknowledged.
    #[serde(default)]
    pub ack_delay: u32,
    /// Readiness queries answered "not yet" after power-on.
    #[serde(default)]
    pub boot_delay: u32,
    /// Fail this many of the next row writes.
    #[serde(default)]
    pub fail_writes: u32,
    #[serde(skip)]
    flashing: Option<ImageType>,
    #[serde(skip)]
    pending: Option<(u32, Result<(), DeviceOpError>)>,
}

impl SimDevice {
    pub fn new(running: ImageType, version: [u8; FW_VERSION_SIZE]) -> Self {
        Self {
            running,
            image1: ImageStatus::Valid,
            image2: ImageStatus::Valid,
            bootloader_version: [0; FW_VERSION_SIZE],
            image1_version: version,
            image2_version: version,
            rows: BTreeMap::new(),
            ack_delay: 0,
            boot_delay: 0,
            fail_writes: 0,
            flashing: None,
            pending: None,
        }
    }

    fn image_status_mut(&mut self, image: ImageType) -> Option<&mut ImageStatus> {
        match image {
            ImageType::Bootloader => None,
            ImageType::Image1 => Some(&mut self.image1),
            ImageType::Image2 => Some(&mut self.image2),
        }
    }
}

/// Transport to any number of [`SimDevice`]s, keyed by component ID.
#[derive(Debug, Clone, Default)]
pub struct SimTransport(Arc<Mutex<BTreeMap<u8, SimDevice>>>);

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: BTreeMap<u8, SimDevice>) -> Self {
        Self(Arc::new(Mutex::new(devices)))
    }

    pub fn insert(&self, component_id: u8, device: SimDevice) {
        self.0.lock().unwrap().insert(component_id, device);
    }

    pub fn device(&self, component_id: u8) -> Option<SimDevice> {
        self.0.lock().unwrap().get(&component_id).cloned()
    }

    pub fn devices(&self) -> BTreeMap<u8, SimDevice> {
        self.0.lock().unwrap().clone()
    }

    pub fn update<F: FnOnce(&mut SimDevice)>(&self, component_id: u8, f: F) {
        if let Some(device) = self.0.lock().unwrap().get_mut(&component_id) {
            f(device);
        }
    }

    fn with<R>(
        &self,
        topology: &DeviceTopology,
        f: impl FnOnce(&mut SimDevice) -> Result<R, DeviceOpError>,
    ) -> Result<R, DeviceOpError> {
        let component = topology.component_id;
        let mut devices = self.0.lock().unwrap();
        let device = devices
            .get_mut(&component)
            .ok_or(DeviceOpError::NoResponse { component })?;
        f(device)
    }
}

impl DeviceTransport for SimTransport {
    fn is_ready(&mut self, topology: &DeviceTopology) -> bool {
        self.with(topology, |d| {
            if d.boot_delay > 0 {
                d.boot_delay -= 1;
                Ok(false)
            } else {
                Ok(true)
            }
        })
        .unwrap_or(false)
    }

    fn query(
        &mut self,
        topology: &DeviceTopology,
    ) -> Result<DeviceQuery, DeviceOpError> {
        self.with(topology, |d| {
            Ok(DeviceQuery {
                running: d.running,
                image1: d.image1,
                image2: d.image2,
                bootloader_version: d.bootloader_version,
                image1_version: d.image1_version,
                image2_version: d.image2_version,
            })
        })
    }

    fn enter_flashing(
        &mut self,
        topology: &DeviceTopology,
        image: ImageType,
    ) -> Result<(), DeviceOpError> {
        let component = topology.component_id;
        self.with(topology, |d| {
            if d.running == image && topology.image_mode != ImageMode::SingleImage
            {
                return Err(DeviceOpError::Unsupported {
                    component,
                    operation: "flash the running image",
                });
            }
            if let Some(status) = d.image_status_mut(image) {
                *status = ImageStatus::Invalid;
            }
            d.flashing = Some(image);
            Ok(())
        })
    }

    fn start_row_write(
        &mut self,
        topology: &DeviceTopology,
        row: u16,
        data: &[u8],
    ) -> Result<(), DeviceOpError> {
        let component = topology.component_id;
        self.with(topology, |d| {
            if d.flashing.is_none() || d.pending.is_some() {
                return Err(DeviceOpError::RowRejected { component, row });
            }
            let result = if d.fail_writes > 0 {
                d.fail_writes -= 1;
                Err(DeviceOpError::RowRejected { component, row })
            } else {
                d.rows.insert(row, data.to_vec());
                Ok(())
            };
            d.pending = Some((d.ack_delay, result));
            Ok(())
        })
    }

    fn poll_write(
        &mut self,
        topology: &DeviceTopology,
    ) -> Option<Result<(), DeviceOpError>> {
        let component = topology.component_id;
        let mut devices = self.0.lock().unwrap();
        let Some(device) = devices.get_mut(&component) else {
            return Some(Err(DeviceOpError::NoResponse { component }));
        };
        match device.pending.take() {
            Some((0, result)) => Some(result),
            Some((n, result)) => {
                device.pending = Some((n - 1, result));
                None
            }
            None => Some(Err(DeviceOpError::NoResponse { component })),
        }
    }

    fn exit_flashing(
        &mut self,
        topology: &DeviceTopology,
        success: bool,
    ) -> Result<(), DeviceOpError> {
        self.with(topology, |d| {
            if let Some(image) = d.flashing.take() {
                if success {
                    if let Some(status) = d.image_status_mut(image) {
                        *status = ImageStatus::Valid;
                    }
                }
            }
            d.pending = None;
            Ok(())
        })
    }

    fn jump_to_alternate(
        &mut self,
        topology: &DeviceTopology,
    ) -> Result<(), DeviceOpError> {
        let component = topology.component_id;
        self.with(topology, |d| {
            let next = d.running.alternate().ok_or(DeviceOpError::Unsupported {
                component,
                operation: "jump from the bootloader",
            })?;
            let valid = d.image_status_mut(next).map(|s| *s) == Some(ImageStatus::Valid);
            if !valid {
                return Err(DeviceOpError::Unsupported {
                    component,
                    operation: "jump to an invalid image",
                });
            }
            d.running = next;
            Ok(())
        })
    }
}
