// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end update scenarios against a simulated dock.

use dmc_fwupdate::config::Cdtt;
use dmc_fwupdate::config::DeviceAccess;
use dmc_fwupdate::config::DeviceTopology;
use dmc_fwupdate::config::FlashLayout;
use dmc_fwupdate::config::RowRange;
use dmc_fwupdate::config::SecurityConfig;
use dmc_fwupdate::config::SpiLayout;
use dmc_fwupdate::config::UpdatePolicy;
use dmc_fwupdate::device_ops::DmcFirmware;
use dmc_fwupdate::device_ops::DmcSelfOps;
use dmc_fwupdate::device_ops::SpiComponentOps;
use dmc_fwupdate::device_ops::TransportOps;
use dmc_fwupdate::metadata::AppFlags;
use dmc_fwupdate::metadata::Package;
use dmc_fwupdate::metadata::Phase2Trigger;
use dmc_fwupdate::sim::sim_signature;
use dmc_fwupdate::sim::SimApp;
use dmc_fwupdate::sim::SimDevice;
use dmc_fwupdate::sim::SimFlash;
use dmc_fwupdate::sim::SimHost;
use dmc_fwupdate::sim::SimSpiFlash;
use dmc_fwupdate::sim::SimTransport;
use dmc_fwupdate::sim::SimVerifier;
use dmc_fwupdate::Controller;
use dmc_fwupdate::DeviceOpsTable;
use dmc_fwupdate::DmcConfig;
use dmc_fwupdate::DmcEvent;
use dmc_fwupdate::DmcState;
use dmc_fwupdate::Platform;
use dmc_messages::dmc_impl::handle_vendor_request;
use dmc_messages::dmc_impl::DmcHandler;
use dmc_messages::fw_version_bytes;
use dmc_messages::fwct::CompositePackage;
use dmc_messages::fwct::Fwct;
use dmc_messages::fwct::FwctBuilder;
use dmc_messages::fwct::FwctIdentity;
use dmc_messages::fwct::ImageSpec;
use dmc_messages::DeviceType;
use dmc_messages::DockIdentity;
use dmc_messages::DockStatusCode;
use dmc_messages::EcdsaSignature;
use dmc_messages::FwctAnalysisStatus;
use dmc_messages::ImageMode;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::Notification;
use dmc_messages::SerializedSize;
use dmc_messages::SetupPacket;
use dmc_messages::SignatureAlgorithm;
use dmc_messages::StatusCode;
use dmc_messages::VendorRequest;
use dmc_messages::ECDSA_SIG_LEN;
use dmc_messages::MAX_RESPONSE_SIZE;
use slog::o;
use slog::Drain;
use slog::Logger;

const ROW: usize = 256;
const MAX_TICKS: usize = 10_000;
const KEY: &[u8] = b"dock signing key";
const FACTORY_ADDR: u32 = 0x10000;
const PACKAGE_SIZE: u32 = 0x10000;

const DMC: u8 = 0;
const PD: u8 = 1;
const HUB: u8 = 2;
const SPI: u8 = 3;

fn test_logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

fn identity() -> FwctIdentity {
    FwctIdentity { cdtt_version: 2, vid: 0x04b4, pid: 0x5210, device_id: 0x0007 }
}

fn config(secured_only: bool) -> DmcConfig {
    let id = identity();
    let device = |component_id, device_type, image_mode, access| DeviceTopology {
        component_id,
        device_type,
        image_mode,
        access,
    };
    DmcConfig {
        cdtt: Cdtt {
            cdtt_version: id.cdtt_version,
            vid: id.vid,
            pid: id.pid,
            device_id: id.device_id,
            vendor: "Dockworks".to_string(),
            product: "USB-C Travel Dock".to_string(),
            devices: vec![
                device(
                    DMC,
                    DeviceType::DmcPmg1s3,
                    ImageMode::DualSymmetric,
                    DeviceAccess::Internal,
                ),
                device(
                    PD,
                    DeviceType::Ccg5,
                    ImageMode::DualSymmetric,
                    DeviceAccess::Hpi { i2c_address: 0x08 },
                ),
                device(
                    HUB,
                    DeviceType::Hx3,
                    ImageMode::SingleImage,
                    DeviceAccess::I2c { i2c_address: 0x60 },
                ),
                device(
                    SPI,
                    DeviceType::SpiComponent,
                    ImageMode::SingleImage,
                    DeviceAccess::Internal,
                ),
            ],
        },
        security: SecurityConfig {
            secured_only,
            algorithm: SignatureAlgorithm::EcdsaP256,
            key_slot: 0,
            public_keys: vec![KEY.to_vec()],
        },
        policy: UpdatePolicy::default(),
        spi: Some(SpiLayout {
            primary_addr: 0,
            factory_addr: FACTORY_ADDR,
            package_size: PACKAGE_SIZE,
        }),
        flash: FlashLayout {
            metadata_row: 0,
            metadata_rows_per_copy: 2,
            fault_log_row: 4,
            dmc_image1: RowRange { first: 8, count: 32 },
            dmc_image2: RowRange { first: 40, count: 32 },
        },
    }
}

/// Everything that survives a controller restart.
struct Dock {
    config: DmcConfig,
    flash: SimFlash,
    spi: SimSpiFlash,
    host: SimHost,
    app: SimApp,
    devices: SimTransport,
    dmc: DmcFirmware,
    log: Logger,
}

impl Dock {
    fn new(config: DmcConfig) -> Self {
        let v1 = fw_version_bytes(1, 0);
        let devices = SimTransport::new();
        devices.insert(PD, SimDevice::new(ImageType::Image1, v1));
        devices.insert(HUB, SimDevice::new(ImageType::Image1, v1));
        Self {
            config,
            flash: SimFlash::new(72, ROW),
            spi: SimSpiFlash::new(2 * PACKAGE_SIZE as usize),
            host: SimHost::new(),
            app: SimApp::new(),
            devices,
            dmc: DmcFirmware {
                running: ImageType::Image1,
                bootloader_version: fw_version_bytes(0, 1),
                image1_version: v1,
                image2_version: v1,
                image1_valid: true,
                image2_valid: true,
            },
            log: test_logger(),
        }
    }

    /// A controller fresh out of reset, before its first tick.
    fn power_on(&self) -> Controller {
        let ops = DeviceOpsTable::new()
            .with(
                DeviceType::DmcPmg1s3,
                Box::new(DmcSelfOps::new(self.config.flash, self.dmc)),
            )
            .with(
                DeviceType::Ccg5,
                Box::new(TransportOps::new(self.devices.clone())),
            )
            .with(
                DeviceType::Hx3,
                Box::new(TransportOps::new(self.devices.clone())),
            )
            .with(DeviceType::SpiComponent, Box::new(SpiComponentOps));
        let platform = Platform {
            flash: Box::new(self.flash.clone()),
            spi: Some(Box::new(self.spi.clone())),
            verifier: Box::new(SimVerifier),
            host: Box::new(self.host.clone()),
            app: Box::new(self.app.clone()),
        };
        Controller::new(self.config.clone(), platform, ops, &self.log).unwrap()
    }

    fn boot(&self) -> Controller {
        let mut dmc = self.power_on();
        dmc.run_until_idle(MAX_TICKS);
        dmc
    }

    /// States entered, in order, since event `from`.
    fn visited(&self, from: usize) -> Vec<DmcState> {
        self.app.events()[from..]
            .iter()
            .filter_map(|e| match e {
                DmcEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }
}

fn image(
    component_id: u8,
    device_type: DeviceType,
    image_type: ImageType,
    fw_version: u32,
    rows: u16,
    start_row: u16,
) -> ImageSpec {
    let len = usize::from(rows) * ROW;
    ImageSpec {
        device_type,
        image_type,
        component_id,
        row_size: ROW,
        fw_version,
        app_version: 0,
        segments: vec![(start_row, rows)],
        data: (0..len).map(|i| (i * 7) as u8 ^ component_id).collect(),
    }
}

fn package(composite_version: u32, images: Vec<ImageSpec>) -> CompositePackage {
    images
        .into_iter()
        .fold(FwctBuilder::new(identity(), composite_version), |b, i| {
            b.image(i)
        })
        .build()
        .unwrap()
}

/// An outer package carrying `inner` as the SPI component's image.
fn spi_package(composite_version: u32, inner: &CompositePackage) -> CompositePackage {
    let data = inner.to_spi_image(&[]).unwrap();
    package(
        composite_version,
        vec![ImageSpec {
            device_type: DeviceType::SpiComponent,
            image_type: ImageType::Image1,
            component_id: SPI,
            row_size: ROW,
            fw_version: composite_version,
            app_version: 0,
            segments: vec![],
            data,
        }],
    )
}

fn signature_for(package: &CompositePackage) -> EcdsaSignature {
    let sig =
        sim_signature(SignatureAlgorithm::EcdsaP256, KEY, &package.digest());
    let mut out = [0; ECDSA_SIG_LEN];
    out.copy_from_slice(&sig);
    EcdsaSignature(out)
}

/// Stream one FWCT image the way the host does: announce each segment,
/// then send its rows in endpoint-sized packets. Stops early if the dock
/// reports a failed row.
fn stream_image(dmc: &mut Controller, package: &CompositePackage, index: u8) {
    let fwct = Fwct::parse(&package.table).unwrap();
    let image = fwct.image(usize::from(index)).unwrap();
    let data = &package.images[usize::from(index)];
    let mut offset = 0;
    for segment in fwct.segments(&image).filter(|s| s.row_count > 0) {
        dmc.run_until_idle(MAX_TICKS);
        if dmc.image_write(segment.start_row, segment.row_count).is_err() {
            return;
        }
        for _ in 0..segment.row_count {
            for packet in data[offset..offset + image.row_size].chunks(64) {
                dmc.row_data(packet).unwrap();
            }
            offset += image.row_size;
            dmc.run_until_idle(MAX_TICKS);
            if dmc.image_write_status() != StatusCode::Success {
                return;
            }
        }
    }
}

/// Run a Phase 1 update to completion, returning every notification other
/// than per-row status.
fn phase1(
    dock: &Dock,
    dmc: &mut Controller,
    package: &CompositePackage,
    signature: Option<&EcdsaSignature>,
) -> Vec<Notification> {
    dmc.upgrade_start(signature).unwrap();
    dmc.fwct_write(&package.table).unwrap();
    let mut seen = Vec::new();
    for _ in 0..64 {
        dmc.run_until_idle(MAX_TICKS);
        let Some(notification) = dock.host.pop() else {
            break;
        };
        match notification {
            Notification::ImageWriteStatus(_) => continue,
            Notification::FwUpgradeRequest { image_index } => {
                seen.push(notification);
                stream_image(dmc, package, image_index);
            }
            other => seen.push(other),
        }
    }
    seen
}

fn assert_in_order(visited: &[DmcState], expected: &[DmcState]) {
    let mut rest = visited.iter();
    for state in expected {
        assert!(
            rest.any(|s| s == state),
            "{state:?} not reached in order; visited {visited:?}"
        );
    }
}

#[test]
fn scenario_a_single_device_phase1() {
    let dock = Dock::new(config(false));
    dock.devices.update(PD, |d| d.image2 = ImageStatus::Invalid);
    let mut dmc = dock.boot();
    assert_eq!(dmc.state(), DmcState::WaitForStart);
    let pd = dmc.metadata().status.device(PD).copied().unwrap();
    assert_eq!(pd.image_status(ImageType::Image2), ImageStatus::Invalid);

    let pkg = package(
        4,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 4, 0x100)],
    );
    let start = dock.app.events().len();
    let notifications = phase1(&dock, &mut dmc, &pkg, None);

    assert_in_order(
        &dock.visited(start),
        &[
            DmcState::WaitForFwct,
            DmcState::Phase1Checks,
            DmcState::FwctAnalysis,
            DmcState::FwUpdateAnalysis,
            DmcState::PrepareUpdate,
            DmcState::InitiateFwUpgradeRqt,
            DmcState::WaitForImgWrite,
            DmcState::WaitForUsbData,
            DmcState::ImgWriteInProgress,
            DmcState::ImgWriteStatus,
            DmcState::PartialUpdateComplete,
            DmcState::PreUpdateComplete,
            DmcState::FwUpdateComplete,
            DmcState::SendRenumNotification,
            DmcState::WaitForStart,
        ],
    );
    assert_eq!(
        notifications,
        [
            Notification::FwUpgradeRequest { image_index: 0 },
            Notification::FwUpgradeStatus(StatusCode::Success),
            Notification::Reenumerate,
        ]
    );

    let pd = dmc.metadata().status.device(PD).copied().unwrap();
    assert_eq!(pd.image_status(ImageType::Image2), ImageStatus::Valid);
    assert_eq!(*pd.version(ImageType::Image2), fw_version_bytes(2, 0));
    assert_eq!(pd.update_attempts(ImageType::Image2), 0);
    let status = dmc.dock_status();
    assert_eq!(status.status(), DockStatusCode::Phase1UpdateComplete);
    assert_eq!(status.header.composite_version, 4);
    assert_eq!(dmc.upgrade_status(), StatusCode::Success);
    assert_eq!(dmc.metadata().active_target(), None);

    let device = dock.devices.device(PD).unwrap();
    let rows = device.rows.values().cloned().collect::<Vec<_>>().concat();
    assert_eq!(rows, pkg.images[0]);
    assert_eq!(device.rows.keys().copied().collect::<Vec<_>>(), [
        0x100, 0x101, 0x102, 0x103
    ]);

    // The record survives a restart.
    let dmc = dock.boot();
    let pd = dmc.metadata().status.device(PD).copied().unwrap();
    assert_eq!(pd.image_status(ImageType::Image2), ImageStatus::Valid);
}

#[test]
fn scenario_b_older_composite_version_rejected() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    let first = package(
        5,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 2, 0)],
    );
    phase1(&dock, &mut dmc, &first, None);
    assert_eq!(dmc.dock_status().header.composite_version, 5);

    let older = package(
        3,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0)],
    );
    let start = dock.app.events().len();
    let notifications = phase1(&dock, &mut dmc, &older, None);

    assert_eq!(
        notifications,
        [Notification::FwctAnalysisStatus(
            FwctAnalysisStatus::InvalidCompositeVersion
        )]
    );
    let visited = dock.visited(start);
    assert_in_order(
        &visited,
        &[
            DmcState::FwctAnalysis,
            DmcState::ValidationStatusUpdate,
            DmcState::WaitForStart,
        ],
    );
    assert!(!visited.contains(&DmcState::PrepareUpdate));
    assert!(dock.devices.device(HUB).unwrap().rows.is_empty());
    assert_eq!(
        dmc.upgrade_status(),
        StatusCode::Failed(DockStatusCode::Phase2FailInvalidCompositeVersion as u8)
    );
    let status = dmc.dock_status();
    assert_eq!(status.status(), DockStatusCode::Phase1UpdateFail);
    assert_eq!(status.header.composite_version, 5);
}

#[test]
fn scenario_c_spi_read_failure_in_phase2() {
    let dock = Dock::new(config(false));
    let inner = package(
        2,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0)],
    );
    let spi_image = inner.to_spi_image(&[]).unwrap();
    dock.spi.load(0, &spi_image);
    dock.spi.load(FACTORY_ADDR, &spi_image);
    let factory = dock.spi.contents(FACTORY_ADDR, PACKAGE_SIZE as usize);

    let mut dmc = dock.boot();
    dock.spi.fail_reads(true);
    dmc.trigger_phase2_update().unwrap();
    dmc.run_until_idle(MAX_TICKS);

    assert_eq!(dmc.state(), DmcState::WaitForStart);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2FailSpiReadFailed
    );
    assert_eq!(
        dmc.upgrade_status(),
        StatusCode::Failed(DockStatusCode::Phase2FailSpiReadFailed as u8)
    );
    assert_eq!(dmc.metadata().phase2_trigger(), Phase2Trigger::None);
    let milestones = dock.app.milestones();
    assert!(milestones.contains(&DmcEvent::UpdateFailed));
    assert!(milestones.contains(&DmcEvent::Phase2UpdateEnded));

    dock.spi.fail_reads(false);
    assert!(dock.spi.erases().is_empty());
    assert_eq!(dock.spi.contents(FACTORY_ADDR, PACKAGE_SIZE as usize), factory);
    assert!(dock.devices.device(HUB).unwrap().rows.is_empty());
}

#[test]
fn scenario_d_power_loss_mid_row_write() {
    let dock = Dock::new(config(false));
    dock.devices.update(PD, |d| d.ack_delay = 3);
    let mut dmc = dock.boot();
    let pkg = package(
        3,
        vec![
            image(DMC, DeviceType::DmcPmg1s3, ImageType::Image2, 2, 2, 40),
            image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 3, 0),
            image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0),
        ],
    );

    dmc.upgrade_start(None).unwrap();
    dmc.fwct_write(&pkg.table).unwrap();
    dmc.run_until_idle(MAX_TICKS);
    stream_image(&mut dmc, &pkg, 0);
    assert_eq!(dmc.state(), DmcState::WaitForImgWrite);
    assert_eq!(dock.flash.row(40), pkg.images[0][..ROW]);

    // First row of device 2 is handed over, then power goes.
    dmc.image_write(0, 3).unwrap();
    for packet in pkg.images[1][..ROW].chunks(64) {
        dmc.row_data(packet).unwrap();
    }
    assert_eq!(dmc.state(), DmcState::ImgWriteInProgress);
    dmc.task();
    assert_eq!(dmc.state(), DmcState::WaitHpiStatusOrIdle);
    assert_eq!(dmc.row_data(&[0; 64]), Err(dmc_messages::DmcError::Busy));
    drop(dmc);

    let start = dock.app.events().len();
    let dmc = dock.boot();
    assert_in_order(
        &dock.visited(start),
        &[DmcState::ErrorRecovery, DmcState::WaitForStart],
    );
    assert!(!dock.visited(start).contains(&DmcState::FwUpdateComplete));

    let status = dmc.metadata().status;
    let pd = status.device(PD).unwrap();
    assert_eq!(pd.image_status(ImageType::Image2), ImageStatus::Invalid);
    assert_eq!(pd.update_attempts(ImageType::Image2), 1);
    let hub = status.device(HUB).unwrap();
    assert_ne!(*hub.version(ImageType::Image1), fw_version_bytes(2, 0));
    let own = status.device(DMC).unwrap();
    assert_eq!(own.image_status(ImageType::Image2), ImageStatus::Valid);
    assert_eq!(status.status(), DockStatusCode::Phase1UpdatePartial);
    assert_eq!(dmc.metadata().active_target(), None);
    assert_eq!(dmc.fault_log().fw_update_failures, 1);
    assert_eq!(dmc.fault_log().power_cycles, 2);
    assert!(dock.app.milestones().contains(&DmcEvent::ImageWriteFailed {
        component: PD,
        image: ImageType::Image2,
    }));
}

#[test]
fn failing_image_is_retried_a_bounded_number_of_times() {
    let dock = Dock::new(config(false));
    dock.devices.update(HUB, |d| d.fail_writes = 100);
    let mut dmc = dock.boot();
    let pkg = package(
        2,
        vec![
            image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0),
            image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 1, 0),
        ],
    );
    let notifications = phase1(&dock, &mut dmc, &pkg, None);

    let max = dock.config.policy.max_update_attempts;
    let requests = notifications
        .iter()
        .filter(|n| **n == Notification::FwUpgradeRequest { image_index: 0 })
        .count();
    assert_eq!(requests, usize::from(max));

    let status = dmc.metadata().status;
    let hub = status.device(HUB).unwrap();
    assert_eq!(hub.image_status(ImageType::Image1), ImageStatus::Invalid);
    assert_eq!(hub.update_attempts(ImageType::Image1), max);
    // The other device is still updated.
    let pd = status.device(PD).unwrap();
    assert_eq!(pd.image_status(ImageType::Image2), ImageStatus::Valid);
    assert_eq!(status.status(), DockStatusCode::Phase1UpdateCompletePartial);
    assert_eq!(dmc.fault_log().fw_update_failures, u16::from(max));
    assert!(dock.app.milestones().contains(&DmcEvent::PendingUpdates));
    assert!(notifications.contains(&Notification::FwUpgradeStatus(
        StatusCode::Failed(DockStatusCode::Phase1UpdateCompletePartial as u8)
    )));

    // A fresh host start gets a fresh set of attempts.
    dock.devices.update(HUB, |d| d.fail_writes = 0);
    phase1(&dock, &mut dmc, &pkg, None);
    let hub = dmc.metadata().status.device(HUB).copied().unwrap();
    assert_eq!(hub.image_status(ImageType::Image1), ImageStatus::Valid);
    assert_eq!(hub.update_attempts(ImageType::Image1), 0);
}

#[test]
fn bad_signature_never_reaches_image_writes() {
    let dock = Dock::new(config(true));
    let mut dmc = dock.boot();
    let pkg = package(
        2,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 2, 0)],
    );

    let mut forged = signature_for(&pkg);
    forged.0[0] ^= 0x80;
    for signature in [None, Some(&forged)] {
        let start = dock.app.events().len();
        let notifications = phase1(&dock, &mut dmc, &pkg, signature);
        assert_eq!(
            notifications,
            [Notification::FwctAnalysisStatus(
                FwctAnalysisStatus::AuthenticationFailed
            )]
        );
        let visited = dock.visited(start);
        assert_in_order(
            &visited,
            &[DmcState::Authenticating, DmcState::ValidationStatusUpdate],
        );
        for state in [
            DmcState::FwctAnalysis,
            DmcState::PrepareUpdate,
            DmcState::ImgWriteInProgress,
        ] {
            assert!(!visited.contains(&state), "reached {state:?}");
        }
    }
    assert!(dock.devices.device(PD).unwrap().rows.is_empty());
    assert_eq!(dmc.fault_log().phase1_auth_failures, 2);

    let signature = signature_for(&pkg);
    let notifications = phase1(&dock, &mut dmc, &pkg, Some(&signature));
    assert!(notifications
        .contains(&Notification::FwUpgradeStatus(StatusCode::Success)));
    assert!(dock.app.milestones().contains(&DmcEvent::AuthenticationSucceeded));
}

fn identity_over_usb(dmc: &mut Controller) -> DockIdentity {
    let request =
        VendorRequest::GetDockIdentity { length: DockIdentity::MAX_SIZE as u16 };
    let mut setup = [0; SetupPacket::MAX_SIZE];
    dmc_messages::serialize(&mut setup, &request.to_setup()).unwrap();
    let mut out = [0; MAX_RESPONSE_SIZE];
    let n = handle_vendor_request(&setup, &[], dmc, &mut out).unwrap();
    dmc_messages::deserialize::<DockIdentity>(&out[..n]).unwrap().0
}

#[test]
fn identity_survives_no_op_update() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    let before = identity_over_usb(&mut dmc);
    let composite = dmc.dock_status().header.composite_version;

    // Everything in this FWCT is already installed.
    let pkg = package(
        composite,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 1, 2, 0)],
    );
    let notifications = phase1(&dock, &mut dmc, &pkg, None);
    assert_eq!(
        notifications,
        [Notification::FwUpgradeStatus(StatusCode::Success)]
    );
    assert!(dock.devices.device(PD).unwrap().rows.is_empty());

    let after = identity_over_usb(&mut dmc);
    assert_eq!(before, after);
    assert_eq!(after.vid, 0x04b4);
    assert_eq!(after.pid, 0x5210);
    assert_eq!(dmc.dock_status().header.composite_version, composite);
}

#[test]
fn phase1_spi_package_rolls_into_phase2() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    let inner = package(
        6,
        vec![
            image(DMC, DeviceType::DmcPmg1s3, ImageType::Image1, 2, 2, 8),
            image(DMC, DeviceType::DmcPmg1s3, ImageType::Image2, 2, 2, 40),
            image(PD, DeviceType::Ccg5, ImageType::Image1, 2, 2, 0),
            image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 2, 0x80),
        ],
    );
    let outer = spi_package(6, &inner);
    let notifications = phase1(&dock, &mut dmc, &outer, None);
    assert!(notifications
        .contains(&Notification::FwUpgradeStatus(StatusCode::Success)));
    dmc.run_until_idle(MAX_TICKS);

    let spi_image = inner.to_spi_image(&[]).unwrap();
    assert_eq!(dock.spi.contents(0, spi_image.len()), spi_image);

    // Both dual-image devices end up with both images updated: the PD
    // controller jumps once, the dock controller reboots into each image.
    assert_eq!(dmc.state(), DmcState::WaitForStart);
    assert_eq!(dock.app.resets(), 2);
    let status = dmc.dock_status();
    assert_eq!(status.status(), DockStatusCode::Phase2UpdateCompleteFull);
    assert_eq!(status.header.composite_version, 6);
    for component in [DMC, PD] {
        let device = status.device(component).unwrap();
        for image in [ImageType::Image1, ImageType::Image2] {
            assert_eq!(device.image_status(image), ImageStatus::Valid);
            assert_eq!(*device.version(image), fw_version_bytes(2, 0));
        }
    }
    assert_eq!(dock.devices.device(PD).unwrap().running, ImageType::Image2);
    assert_eq!(dmc.metadata().phase2_trigger(), Phase2Trigger::None);
    assert_eq!(dmc.metadata().phase2_update_counter, 0);
    let milestones = dock.app.milestones();
    assert!(milestones.contains(&DmcEvent::Phase2UpdateStarted));
    assert!(milestones.contains(&DmcEvent::DockReset));
    assert_eq!(milestones.last(), Some(&DmcEvent::Phase2UpdateEnded));
}

#[test]
fn factory_backup_and_fallback() {
    let dock = Dock::new(config(false));
    let inner = package(
        2,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0)],
    );
    let spi_image = inner.to_spi_image(&[]).unwrap();
    dock.spi.load(0, &spi_image);
    dock.app.set_factory_condition(true);

    let mut dmc = dock.boot();
    assert!(dmc
        .metadata()
        .app_flags()
        .contains(AppFlags::FACTORY_BACKUP_DONE));
    assert_eq!(dock.spi.contents(FACTORY_ADDR, spi_image.len()), spi_image);
    assert!(dock.app.milestones().contains(&DmcEvent::FactoryBackupStarted));
    dock.app.set_factory_condition(false);

    // Phase 2 keeps getting cut short while reading the primary package.
    dmc.trigger_phase2_update().unwrap();
    let max = dock.config.policy.max_phase2_attempts;
    for _ in 0..max {
        for _ in 0..MAX_TICKS {
            if dmc.state() == DmcState::Phase2ReadFwct {
                break;
            }
            dmc.task();
        }
        assert_eq!(dmc.state(), DmcState::Phase2ReadFwct);
        assert_eq!(dmc.metadata().candidate_package(), Package::Primary);
        dmc = dock.power_on();
    }

    dmc.run_until_idle(MAX_TICKS);
    assert_eq!(dmc.metadata().candidate_package(), Package::Factory);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2UpdateCompleteFull
    );
    let hub = dock.devices.device(HUB).unwrap();
    assert_eq!(hub.rows.len(), 2);
}

#[test]
fn phase2_from_erased_spi_fails() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    assert!(!dmc
        .metadata()
        .app_flags()
        .contains(AppFlags::FACTORY_BACKUP_DONE));
    assert!(dock.app.milestones().contains(&DmcEvent::FactoryBackupNotDone));

    // An erased primary region holds no package.
    dmc.trigger_phase2_update().unwrap();
    dmc.run_until_idle(MAX_TICKS);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2FailNoValidSpiPackage
    );
    assert_eq!(dmc.metadata().phase2_trigger(), Phase2Trigger::None);
}

#[test]
fn host_commands_outside_their_states() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    use dmc_messages::DmcError;

    assert_eq!(dmc.fwct_write(&[0; 64]), Err(DmcError::NotReady));
    assert_eq!(dmc.image_write(0, 1), Err(DmcError::NotReady));
    assert_eq!(dmc.row_data(&[0; 64]), Err(DmcError::NotReady));
    assert_eq!(dmc.image_write_status(), StatusCode::Idle);

    dmc.upgrade_start(None).unwrap();
    assert_eq!(dmc.upgrade_start(None), Err(DmcError::NotReady));
    assert_eq!(dmc.trigger_phase2_update(), Err(DmcError::Busy));
    assert_eq!(dmc.upgrade_status(), StatusCode::InProgress);

    dmc.state_reset().unwrap();
    assert_eq!(dmc.state(), DmcState::WaitForStart);
    assert_eq!(dmc.upgrade_status(), StatusCode::Idle);

    let mut log = [0; MAX_RESPONSE_SIZE];
    let n = dmc.flash_log(&mut log).unwrap();
    assert!(n > 0);
}

/// Trigger a Phase 2 update of whatever is in SPI flash and let it run out.
/// Returns the states it went through.
fn run_phase2(dock: &Dock, dmc: &mut Controller) -> Vec<DmcState> {
    let start = dock.app.events().len();
    dmc.trigger_phase2_update().unwrap();
    dmc.run_until_idle(MAX_TICKS);
    dock.visited(start)
}

fn assert_no_image_writes(visited: &[DmcState]) {
    for state in [
        DmcState::PrepareUpdate,
        DmcState::Phase2ReadImgData,
        DmcState::ImgWriteInProgress,
    ] {
        assert!(!visited.contains(&state), "reached {state:?}");
    }
}

#[test]
fn phase2_bad_signature_never_reaches_image_writes() {
    let dock = Dock::new(config(true));
    let inner = package(
        2,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0)],
    );
    let mut forged = signature_for(&inner);
    forged.0[0] ^= 0x80;
    dock.spi.load(0, &inner.to_spi_image(&[forged.0.as_slice()]).unwrap());
    let mut dmc = dock.boot();

    let visited = run_phase2(&dock, &mut dmc);
    assert_in_order(
        &visited,
        &[
            DmcState::Phase2ReadSignature,
            DmcState::Authenticating,
            DmcState::ValidationStatusUpdate,
            DmcState::Phase2Error,
            DmcState::WaitForStart,
        ],
    );
    assert!(!visited.contains(&DmcState::FwctAnalysis));
    assert_no_image_writes(&visited);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2FailAuthenticationFailed
    );
    assert_eq!(
        dmc.upgrade_status(),
        StatusCode::Failed(DockStatusCode::Phase2FailAuthenticationFailed as u8)
    );
    assert_eq!(dmc.fault_log().phase2_auth_failures, 1);
    assert_eq!(dmc.metadata().phase2_trigger(), Phase2Trigger::None);
    assert!(dock.devices.device(HUB).unwrap().rows.is_empty());

    // The same package with its real signature goes through.
    let signature = signature_for(&inner);
    dock.spi.load(0, &inner.to_spi_image(&[signature.0.as_slice()]).unwrap());
    run_phase2(&dock, &mut dmc);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2UpdateCompleteFull
    );
    assert_eq!(dock.devices.device(HUB).unwrap().rows.len(), 2);
}

#[test]
fn phase2_package_for_another_dock_rejected() {
    let dock = Dock::new(config(false));
    let foreign = FwctBuilder::new(
        FwctIdentity { pid: 0x9999, ..identity() },
        2,
    )
    .image(image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0))
    .build()
    .unwrap();
    dock.spi.load(0, &foreign.to_spi_image(&[]).unwrap());
    let mut dmc = dock.boot();

    let visited = run_phase2(&dock, &mut dmc);
    assert_in_order(
        &visited,
        &[
            DmcState::FwctAnalysis,
            DmcState::ValidationStatusUpdate,
            DmcState::Phase2Error,
        ],
    );
    assert_no_image_writes(&visited);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2FailInvalidDockIdentity
    );
    assert!(dock.devices.device(HUB).unwrap().rows.is_empty());
}

#[test]
fn phase2_older_composite_version_rejected() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    let current = package(
        5,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 2, 0)],
    );
    phase1(&dock, &mut dmc, &current, None);
    assert_eq!(dmc.dock_status().header.composite_version, 5);

    let older = package(
        3,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0)],
    );
    dock.spi.load(0, &older.to_spi_image(&[]).unwrap());
    let visited = run_phase2(&dock, &mut dmc);
    assert_no_image_writes(&visited);
    let status = dmc.dock_status();
    assert_eq!(
        status.status(),
        DockStatusCode::Phase2FailInvalidCompositeVersion
    );
    assert_eq!(status.header.composite_version, 5);
    assert!(dock.devices.device(HUB).unwrap().rows.is_empty());
}

#[test]
fn phase2_without_factory_backup_gives_up() {
    let dock = Dock::new(config(false));
    let inner = package(
        2,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 2, 0)],
    );
    dock.spi.load(0, &inner.to_spi_image(&[]).unwrap());
    let mut dmc = dock.boot();
    assert!(!dmc
        .metadata()
        .app_flags()
        .contains(AppFlags::FACTORY_BACKUP_DONE));

    // Every attempt on the primary package is cut short.
    dmc.trigger_phase2_update().unwrap();
    for _ in 0..dock.config.policy.max_phase2_attempts {
        for _ in 0..MAX_TICKS {
            if dmc.state() == DmcState::Phase2ReadFwct {
                break;
            }
            dmc.task();
        }
        assert_eq!(dmc.state(), DmcState::Phase2ReadFwct);
        dmc = dock.power_on();
    }

    dmc.run_until_idle(MAX_TICKS);
    assert_eq!(dmc.state(), DmcState::WaitForStart);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2FailNoValidFactoryPackage
    );
    assert_eq!(dmc.metadata().candidate_package(), Package::Primary);
    assert_eq!(dmc.metadata().phase2_trigger(), Phase2Trigger::None);
    assert!(dock.devices.device(HUB).unwrap().rows.is_empty());
}

#[test]
fn metadata_write_failure_reports_update_failed() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    let pkg = package(
        2,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 2, 0)],
    );
    dmc.upgrade_start(None).unwrap();
    dmc.fwct_write(&pkg.table).unwrap();
    dock.flash.cut_power_after(0);
    let start = dock.app.events().len();
    dmc.run_until_idle(MAX_TICKS);

    assert_eq!(dmc.state(), DmcState::FwUpdateFailed);
    assert!(!dock.visited(start).contains(&DmcState::InitiateFwUpgradeRqt));
    let failed = StatusCode::Failed(DockStatusCode::Phase1UpdateFail as u8);
    assert_eq!(dmc.upgrade_status(), failed);
    assert_eq!(dock.host.drain(), [Notification::FwUpgradeStatus(failed)]);
    assert!(dock.app.milestones().contains(&DmcEvent::UpdateFailed));
    assert!(dock.devices.device(PD).unwrap().rows.is_empty());
    assert_eq!(
        dmc.upgrade_start(None),
        Err(dmc_messages::DmcError::NotReady)
    );

    // Flash still holds the record from before the update.
    dock.flash.restore_power();
    let fresh = dock.boot();
    assert_eq!(fresh.dock_status().status(), DockStatusCode::Idle);
    assert_eq!(fresh.metadata().active_target(), None);
    let pd = fresh.metadata().status.device(PD).copied().unwrap();
    assert_eq!(pd.update_attempts(ImageType::Image2), 0);

    dmc.state_reset().unwrap();
    assert_eq!(dmc.upgrade_status(), StatusCode::Idle);
}

#[test]
fn failed_alternate_image_is_never_booted() {
    let dock = Dock::new(config(false));
    let pkg = package(
        3,
        vec![
            image(DMC, DeviceType::DmcPmg1s3, ImageType::Image1, 2, 2, 8),
            image(DMC, DeviceType::DmcPmg1s3, ImageType::Image2, 2, 2, 40),
        ],
    );
    let mut spi_image = pkg.to_spi_image(&[]).unwrap();
    let image2 = Fwct::parse(&pkg.table).unwrap().image(1).unwrap();
    spi_image[image2.offset as usize + 5] ^= 0xFF;
    dock.spi.load(0, &spi_image);
    let mut dmc = dock.boot();

    let visited = run_phase2(&dock, &mut dmc);
    assert!(!visited.contains(&DmcState::JumpToAlternate));
    assert_eq!(dock.app.resets(), 0);
    assert_eq!(dmc.state(), DmcState::WaitForStart);

    let max = dock.config.policy.max_update_attempts;
    let own = dmc.metadata().status.device(DMC).copied().unwrap();
    assert_eq!(own.current_image(), Some(ImageType::Image1));
    assert_eq!(own.image_status(ImageType::Image1), ImageStatus::Valid);
    assert_eq!(*own.version(ImageType::Image1), fw_version_bytes(1, 0));
    assert_eq!(own.image_status(ImageType::Image2), ImageStatus::Invalid);
    assert_eq!(own.update_attempts(ImageType::Image2), max);
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2UpdateCompletePartial
    );
}

#[test]
fn no_jump_into_an_invalid_image() {
    let mut dock = Dock::new(config(false));
    dock.dmc.image2_valid = false;
    // Only the running image is in the package; the other one stays bad.
    let pkg = package(
        3,
        vec![image(DMC, DeviceType::DmcPmg1s3, ImageType::Image1, 2, 2, 8)],
    );
    dock.spi.load(0, &pkg.to_spi_image(&[]).unwrap());
    let mut dmc = dock.boot();

    let visited = run_phase2(&dock, &mut dmc);
    assert!(!visited.contains(&DmcState::JumpToAlternate));
    assert_eq!(dock.app.resets(), 0);
    let own = dmc.metadata().status.device(DMC).copied().unwrap();
    assert_eq!(own.current_image(), Some(ImageType::Image1));
    assert_eq!(
        dmc.dock_status().status(),
        DockStatusCode::Phase2UpdateCompletePartial
    );
    assert!(dock.app.milestones().contains(&DmcEvent::PendingUpdates));
}

#[test]
fn factory_backup_hashes_a_chunk_per_tick() {
    let dock = Dock::new(config(false));
    let inner = package(
        2,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 16, 0)],
    );
    dock.spi.load(0, &inner.to_spi_image(&[]).unwrap());
    dock.app.set_factory_condition(true);

    let mut dmc = dock.power_on();
    for _ in 0..MAX_TICKS {
        if dmc.state() == DmcState::Phase2FactoryBackup {
            break;
        }
        dmc.task();
    }
    assert_eq!(dmc.state(), DmcState::Phase2FactoryBackup);
    let mut ticks = 0;
    while dmc.state() == DmcState::Phase2FactoryBackup && ticks < MAX_TICKS {
        assert!(dock.spi.erases().is_empty());
        dmc.task();
        ticks += 1;
    }
    // 4 KiB of image data, hashed a piece at a time.
    assert!(ticks >= 5, "package validated in {ticks} ticks");

    dmc.run_until_idle(MAX_TICKS);
    assert!(dmc
        .metadata()
        .app_flags()
        .contains(AppFlags::FACTORY_BACKUP_DONE));
}

#[test]
fn corrupt_primary_package_is_not_backed_up() {
    let dock = Dock::new(config(false));
    let inner = package(
        2,
        vec![image(HUB, DeviceType::Hx3, ImageType::Image1, 2, 4, 0)],
    );
    let mut spi_image = inner.to_spi_image(&[]).unwrap();
    let hub = Fwct::parse(&inner.table).unwrap().image(0).unwrap();
    spi_image[hub.offset as usize + 3 * ROW] ^= 0x01;
    dock.spi.load(0, &spi_image);
    dock.app.set_factory_condition(true);

    let dmc = dock.boot();
    assert!(!dmc
        .metadata()
        .app_flags()
        .contains(AppFlags::FACTORY_BACKUP_DONE));
    let milestones = dock.app.milestones();
    assert!(milestones.contains(&DmcEvent::FactoryBackupNotDone));
    assert!(!milestones.contains(&DmcEvent::FactoryBackupStarted));
    assert!(dock.spi.erases().is_empty());
}

#[test]
fn image_without_rows_rejected() {
    let dock = Dock::new(config(false));
    let mut dmc = dock.boot();
    let pkg = package(
        2,
        vec![image(PD, DeviceType::Ccg5, ImageType::Image2, 2, 0, 0)],
    );
    let start = dock.app.events().len();
    let notifications = phase1(&dock, &mut dmc, &pkg, None);

    assert_eq!(
        notifications,
        [Notification::FwctAnalysisStatus(FwctAnalysisStatus::InvalidFwct)]
    );
    assert!(!dock.visited(start).contains(&DmcState::WaitForImgWrite));
    assert_eq!(dmc.state(), DmcState::WaitForStart);
}
