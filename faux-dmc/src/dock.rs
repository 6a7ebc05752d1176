// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated dock backed by a state directory, and the USB link a host
//! uses to talk to it.

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use dmc_fwupdate::device_ops::DmcFirmware;
use dmc_fwupdate::device_ops::DmcSelfOps;
use dmc_fwupdate::device_ops::SpiComponentOps;
use dmc_fwupdate::device_ops::TransportOps;
use dmc_fwupdate::platform::SignatureVerifier;
use dmc_fwupdate::platform::SpiFlash;
use dmc_fwupdate::sim::SimApp;
use dmc_fwupdate::sim::SimDevice;
use dmc_fwupdate::sim::SimFlash;
use dmc_fwupdate::sim::SimHost;
use dmc_fwupdate::sim::SimSpiFlash;
use dmc_fwupdate::sim::SimTransport;
use dmc_fwupdate::Controller;
use dmc_fwupdate::DeviceOpsTable;
use dmc_fwupdate::DmcConfig;
use dmc_fwupdate::Platform;
use dmc_messages::dmc_impl::handle_bulk_out;
use dmc_messages::dmc_impl::handle_vendor_request;
use dmc_messages::DeviceType;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::IntEpMessage;
use dmc_messages::Notification;
use dmc_messages::SerializedSize;
use dmc_messages::SetupPacket;
use dmc_messages::SignatureAlgorithm;
use dmc_messages::VendorRequest;
use dmc_messages::DMC_COMPONENT_ID;
use dmc_messages::MAX_RESPONSE_SIZE;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::Signature;
use p256::ecdsa::VerifyingKey;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::Logger;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const CONFIG_FILE: &str = "dmc.json";
const DEVICES_FILE: &str = "devices.json";
const FLASH_FILE: &str = "flash.bin";
const SPI_FILE: &str = "spi.bin";

/// Internal flash geometry of the simulated controller.
pub const FLASH_ROW_SIZE: usize = 256;

/// Everything about the dock that is not flash contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockDevices {
    pub dmc: DmcFirmware,
    #[serde(default)]
    pub factory_condition: bool,
    /// External devices by component ID.
    #[serde(default)]
    pub devices: BTreeMap<u8, SimDevice>,
}

/// Checks ECDSA-P256 signatures over the FWCT digest. Public keys are SEC1
/// encoded points.
#[derive(Debug, Default)]
pub struct P256Verifier;

impl SignatureVerifier for P256Verifier {
    fn verify(
        &mut self,
        algorithm: SignatureAlgorithm,
        digest: &[u8; 32],
        signature: &[u8],
        public_key: &[u8],
    ) -> bool {
        if algorithm != SignatureAlgorithm::EcdsaP256 {
            return false;
        }
        let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_prehash(digest, &signature).is_ok()
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let s = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&s)
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value)?;
    fs::write(path, s)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// On-disk state of one simulated dock.
pub struct StateDir {
    path: PathBuf,
}

impl StateDir {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Create a fresh dock: erased flash, and the given configuration and
    /// devices.
    pub fn init(
        &self,
        config: &DmcConfig,
        devices: &DockDevices,
        flash_rows: u16,
    ) -> Result<()> {
        config.validate().context("invalid dock configuration")?;
        fs::create_dir_all(&self.path).with_context(|| {
            format!("failed to create {}", self.path.display())
        })?;
        write_json(&self.path.join(CONFIG_FILE), config)?;
        write_json(&self.path.join(DEVICES_FILE), devices)?;
        let flash = vec![0xFF; usize::from(flash_rows) * FLASH_ROW_SIZE];
        fs::write(self.path.join(FLASH_FILE), flash)
            .context("failed to write internal flash image")?;
        if let Some(spi) = config.spi {
            let size = spi
                .primary_addr
                .max(spi.factory_addr)
                .saturating_add(spi.package_size);
            fs::write(self.path.join(SPI_FILE), vec![0xFF; size as usize])
                .context("failed to write SPI flash image")?;
        }
        Ok(())
    }

    /// Power the dock on from its saved state.
    pub fn load(&self, log: &Logger) -> Result<SimDock> {
        let config = fs::read_to_string(self.path.join(CONFIG_FILE))
            .with_context(|| {
                format!("no dock in {} (run `init`?)", self.path.display())
            })?;
        let config =
            DmcConfig::from_json(&config).context("invalid dock configuration")?;
        let devices: DockDevices = read_json(&self.path.join(DEVICES_FILE))?;
        let flash = fs::read(self.path.join(FLASH_FILE))
            .context("failed to read internal flash image")?;
        let flash = SimFlash::from_image(FLASH_ROW_SIZE, flash);
        let spi = match config.spi {
            Some(_) => Some(SimSpiFlash::from_image(
                fs::read(self.path.join(SPI_FILE))
                    .context("failed to read SPI flash image")?,
            )),
            None => None,
        };

        let transport = SimTransport::from_devices(devices.devices.clone());
        let app = SimApp::new();
        app.set_factory_condition(devices.factory_condition);
        let host = SimHost::new();

        let mut ops = DeviceOpsTable::new();
        for device in &config.cdtt.devices {
            let entry: Box<dyn dmc_fwupdate::DeviceOperations> =
                match device.device_type {
                    t if t.is_dmc() => Box::new(DmcSelfOps::new(
                        config.flash,
                        devices.dmc,
                    )),
                    DeviceType::SpiComponent => Box::new(SpiComponentOps),
                    _ => Box::new(TransportOps::new(transport.clone())),
                };
            ops.register(device.device_type, entry);
        }

        let platform = Platform {
            flash: Box::new(flash.clone()),
            spi: spi
                .clone()
                .map(|s| Box::new(s) as Box<dyn SpiFlash + Send>),
            verifier: Box::new(P256Verifier),
            host: Box::new(host.clone()),
            app: Box::new(app.clone()),
        };
        let controller = Controller::new(config, platform, ops, log)
            .context("failed to start controller")?;
        info!(log, "dock powered on"; "state_dir" => %self.path.display());

        Ok(SimDock {
            controller,
            flash,
            spi,
            transport,
            app,
            host,
            devices,
            path: self.path.clone(),
            log: log.clone(),
        })
    }
}

/// A running simulated dock.
pub struct SimDock {
    pub controller: Controller,
    flash: SimFlash,
    spi: Option<SimSpiFlash>,
    transport: SimTransport,
    app: SimApp,
    host: SimHost,
    devices: DockDevices,
    path: PathBuf,
    log: Logger,
}

impl SimDock {
    pub fn host(&self) -> SimHost {
        self.host.clone()
    }

    pub fn app(&self) -> SimApp {
        self.app.clone()
    }

    /// Read `len` bytes of SPI flash at `addr`.
    pub fn spi_contents(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        let spi = self.spi.as_ref().context("dock has no SPI flash")?;
        let image = spi.image();
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= image.len())
            .with_context(|| {
                format!("{len} bytes at {addr:#x} exceeds SPI flash")
            })?;
        Ok(image[start..end].to_vec())
    }

    /// Write flash contents and device state back to the state directory.
    pub fn save(&mut self) -> Result<()> {
        fs::write(self.path.join(FLASH_FILE), self.flash.image())
            .context("failed to save internal flash image")?;
        if let Some(spi) = &self.spi {
            fs::write(self.path.join(SPI_FILE), spi.image())
                .context("failed to save SPI flash image")?;
        }
        self.devices.devices = self.transport.devices();
        if let Some(status) =
            self.controller.metadata().status.device(DMC_COMPONENT_ID)
        {
            let dmc = &mut self.devices.dmc;
            if let Some(running) = status.current_image() {
                dmc.running = running;
            }
            dmc.image1_version = *status.version(ImageType::Image1);
            dmc.image2_version = *status.version(ImageType::Image2);
            dmc.image1_valid =
                status.image_status(ImageType::Image1) == ImageStatus::Valid;
            dmc.image2_valid =
                status.image_status(ImageType::Image2) == ImageStatus::Valid;
        }
        write_json(&self.path.join(DEVICES_FILE), &self.devices)?;
        debug!(
            self.log, "dock state saved";
            "resets" => self.app.resets(),
        );
        Ok(())
    }
}

/// The host's view of a dock: vendor control transfers, the bulk OUT
/// endpoint, and the interrupt endpoint. The dock runs its state machine in
/// a background task between transfers.
pub struct UsbLink {
    dock: Arc<Mutex<SimDock>>,
    host: SimHost,
    tick: Duration,
    ticker: JoinHandle<()>,
}

impl UsbLink {
    pub fn attach(dock: SimDock, tick: Duration) -> Self {
        let host = dock.host();
        let dock = Arc::new(Mutex::new(dock));
        let ticker = tokio::spawn({
            let dock = Arc::clone(&dock);
            async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    interval.tick().await;
                    dock.lock().await.controller.task();
                }
            }
        });
        Self { dock, host, tick, ticker }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Run the state machine until it parks, or `max_ticks` run out.
    pub async fn settle(&self, max_ticks: usize) -> usize {
        self.dock.lock().await.controller.run_until_idle(max_ticks)
    }

    pub async fn with_dock<R>(&self, f: impl FnOnce(&mut SimDock) -> R) -> R {
        f(&mut *self.dock.lock().await)
    }

    /// Issue one vendor request; a stall comes back as an error.
    pub async fn control(
        &self,
        request: VendorRequest,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut setup = [0; SetupPacket::MAX_SIZE];
        dmc_messages::serialize(&mut setup, &request.to_setup())
            .context("failed to encode setup packet")?;
        let mut out = [0; MAX_RESPONSE_SIZE];
        let mut dock = self.dock.lock().await;
        let n = handle_vendor_request(&setup, data, &mut dock.controller, &mut out)
            .with_context(|| {
                format!("{} stalled", <&str>::from(request))
            })?;
        Ok(out[..n].to_vec())
    }

    pub async fn bulk_out(&self, data: &[u8]) -> Result<()> {
        let mut dock = self.dock.lock().await;
        handle_bulk_out(data, &mut dock.controller)
            .context("bulk OUT transfer stalled")
    }

    /// Wait for the next interrupt endpoint message.
    pub async fn interrupt(&self, timeout: Duration) -> Result<Notification> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(notification) = self.host.pop() {
                // Round-trip through the wire form the host would see.
                let mut buf = [0; IntEpMessage::MAX_SIZE];
                dmc_messages::serialize(
                    &mut buf,
                    &IntEpMessage::from(notification),
                )
                .context("failed to encode notification")?;
                let (msg, _) =
                    dmc_messages::deserialize::<IntEpMessage>(&buf)
                        .context("failed to decode notification")?;
                return Notification::try_from(msg)
                    .map_err(|err| anyhow!("bad notification: {err}"));
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("no notification from dock (waited {timeout:?})");
            }
            tokio::time::sleep(self.tick).await;
        }
    }

    /// Stop the background task and save the dock.
    pub async fn detach(self) -> Result<()> {
        self.ticker.abort();
        self.dock.lock().await.save()
    }
}
