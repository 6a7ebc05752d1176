// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The update state machine.
//!
//! [`Controller::task`] runs exactly one state per call and never waits on
//! hardware: anything slow (SPI erase and program, a device acknowledging a
//! row) is started once and then polled on later ticks. Host requests arrive
//! through the [`DmcHandler`] implementation and only ever move the machine
//! between states that are waiting for them.

mod execute;
mod phase2;
mod validate;

use crate::config::DmcConfig;
use crate::device_ops::DeviceContext;
use crate::device_ops::DeviceOperations;
use crate::device_ops::DeviceOpsTable;
use crate::error::ConfigError;
use crate::error::DeviceOpError;
use crate::error::MetadataError;
use crate::fault_log::Fault;
use crate::fault_log::FaultLog;
use crate::fault_log::FaultLogRecord;
use crate::metadata::DockMetadata;
use crate::metadata::LoadOutcome;
use crate::metadata::MetadataStore;
use crate::metadata::Package;
use crate::metadata::Phase2Trigger;
use crate::platform::DmcEvent;
use crate::platform::DockApplication;
use crate::platform::FlashRows;
use crate::platform::HostLink;
use crate::platform::Platform;
use crate::platform::SignatureVerifier;
use crate::session::Phase;
use crate::session::UpdateSession;
use crate::spi::SpiPackageManager;
use dmc_messages::dmc_impl::DmcHandler;
use dmc_messages::fwct::MAX_TABLE_SIZE;
use dmc_messages::DeviceStatus;
use dmc_messages::DmcError;
use dmc_messages::DockIdentity;
use dmc_messages::DockStatus;
use dmc_messages::DockStatusCode;
use dmc_messages::EcdsaSignature;
use dmc_messages::ImageType;
use dmc_messages::Notification;
use dmc_messages::StatusCode;
use hubpack::SerializedSize;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;

/// Controller states. The discriminants are the state IDs reported to the
/// application with [`DmcEvent::StateChanged`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::IntoStaticStr,
)]
#[repr(u8)]
pub enum DmcState {
    WaitForStart = 0,
    PowerOn = 1,
    Phase2FactoryBackup = 2,
    Phase2FactoryBackupCopy = 3,
    Phase2Checks = 4,
    Phase2ReadFwct = 5,
    Phase2ReadSignature = 6,
    WaitForFwct = 7,
    Phase1Checks = 8,
    Authenticating = 9,
    FwctAnalysis = 10,
    ValidationStatusUpdate = 11,
    FwUpdateAnalysis = 12,
    PrepareUpdate = 13,
    InitiateFwUpgradeRqt = 14,
    WaitForImgWrite = 15,
    Phase2ReadImgSegInfo = 16,
    WaitForUsbData = 17,
    Phase2ReadImgData = 18,
    ImgWriteInProgress = 19,
    ImgWriteStatus = 20,
    WaitHpiStatusOrIdle = 21,
    PartialUpdateComplete = 22,
    SendRenumNotification = 23,
    JumpToAlternate = 24,
    PreUpdateComplete = 25,
    FwUpdateComplete = 26,
    ErrorRecovery = 27,
    FwUpdateFailed = 28,
    WaitHpiStatusOrIdle2 = 29,
    Phase2Error = 30,
    Phase1WaitForTrigger = 31,
    WaitForSpiFlashOprComplete = 32,
}

impl DmcState {
    pub fn id(self) -> u8 {
        self as u8
    }

    /// States during which a row may be half written.
    fn is_row_write(self) -> bool {
        matches!(
            self,
            DmcState::ImgWriteInProgress
                | DmcState::WaitHpiStatusOrIdle
                | DmcState::WaitHpiStatusOrIdle2
                | DmcState::WaitForSpiFlashOprComplete
        )
    }
}

pub struct Controller {
    config: DmcConfig,
    flash: Box<dyn FlashRows + Send>,
    spi: Option<SpiPackageManager>,
    verifier: Box<dyn SignatureVerifier + Send>,
    host: Box<dyn HostLink + Send>,
    app: Box<dyn DockApplication + Send>,
    ops: DeviceOpsTable,
    metadata: MetadataStore,
    fault_log: FaultLog,
    state: DmcState,
    session: Option<UpdateSession>,
    /// Where [`DmcState::WaitForSpiFlashOprComplete`] goes once the SPI
    /// operation ends.
    spi_resume: DmcState,
    /// The Dock Status code [`DmcState::Phase2Error`] records.
    pending_failure: Option<DockStatusCode>,
    /// A package being validated across ticks.
    package_check: Option<phase2::PackageCheck>,
    booted: bool,
    outcome: StatusCode,
    log: Logger,
}

impl Controller {
    pub fn new(
        config: DmcConfig,
        platform: Platform,
        ops: DeviceOpsTable,
        log: &Logger,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        for device in &config.cdtt.devices {
            if !ops.contains(device.device_type) {
                return Err(ConfigError::UnsupportedDeviceType(
                    device.device_type,
                ));
            }
        }

        let log = log.new(o!("component" => "dmc"));
        let Platform { mut flash, spi, verifier, host, app } = platform;
        let row_size = flash.row_size();
        if row_size < FaultLogRecord::MAX_SIZE {
            return Err(ConfigError::FlashLayout("row too small for fault log"));
        }
        let spi = match (config.spi, spi) {
            (Some(layout), Some(flash)) => {
                Some(SpiPackageManager::new(flash, layout, &log))
            }
            (Some(_), None) => return Err(ConfigError::MissingSpiFlash),
            (None, _) => None,
        };
        let metadata = MetadataStore::new(&config.flash, row_size, &log)?;
        let fault_log =
            FaultLog::load(config.flash.fault_log_row, &mut *flash, &log);

        Ok(Self {
            config,
            flash,
            spi,
            verifier,
            host,
            app,
            ops,
            metadata,
            fault_log,
            state: DmcState::PowerOn,
            session: None,
            spi_resume: DmcState::WaitForStart,
            pending_failure: None,
            package_check: None,
            booted: false,
            outcome: StatusCode::Idle,
            log,
        })
    }

    pub fn state(&self) -> DmcState {
        self.state
    }

    pub fn config(&self) -> &DmcConfig {
        &self.config
    }

    pub fn metadata(&self) -> &DockMetadata {
        self.metadata.metadata()
    }

    pub fn fault_log(&self) -> &FaultLogRecord {
        self.fault_log.record()
    }

    pub fn spi(&mut self) -> Option<&mut SpiPackageManager> {
        self.spi.as_mut()
    }

    /// Whether the machine is parked waiting for the host or for a trigger.
    pub fn is_idle(&self) -> bool {
        matches!(
            self.state,
            DmcState::WaitForStart
                | DmcState::WaitForFwct
                | DmcState::WaitForImgWrite
                | DmcState::WaitForUsbData
                | DmcState::Phase1WaitForTrigger
                | DmcState::FwUpdateFailed
        )
    }

    /// Run one state.
    pub fn task(&mut self) {
        let next = match self.state {
            DmcState::WaitForStart
            | DmcState::WaitForFwct
            | DmcState::WaitForImgWrite
            | DmcState::WaitForUsbData
            | DmcState::Phase1WaitForTrigger
            | DmcState::FwUpdateFailed => self.state,
            DmcState::PowerOn => self.power_on(),
            DmcState::Phase2FactoryBackup => self.phase2_factory_backup(),
            DmcState::Phase2FactoryBackupCopy => {
                self.phase2_factory_backup_copy()
            }
            DmcState::Phase2Checks => self.phase2_checks(),
            DmcState::Phase2ReadFwct => self.phase2_read_fwct(),
            DmcState::Phase2ReadSignature => self.phase2_read_signature(),
            DmcState::Phase1Checks => self.phase1_checks(),
            DmcState::Authenticating => self.authenticating(),
            DmcState::FwctAnalysis => self.fwct_analysis(),
            DmcState::ValidationStatusUpdate => {
                self.validation_status_update()
            }
            DmcState::FwUpdateAnalysis => self.fw_update_analysis(),
            DmcState::PrepareUpdate => self.prepare_update(),
            DmcState::InitiateFwUpgradeRqt => self.initiate_fw_upgrade_rqt(),
            DmcState::Phase2ReadImgSegInfo => self.phase2_read_img_seg_info(),
            DmcState::Phase2ReadImgData => self.phase2_read_img_data(),
            DmcState::ImgWriteInProgress => self.img_write_in_progress(),
            DmcState::ImgWriteStatus => self.img_write_status(),
            DmcState::WaitHpiStatusOrIdle | DmcState::WaitHpiStatusOrIdle2 => {
                self.wait_for_hook()
            }
            DmcState::PartialUpdateComplete => self.partial_update_complete(),
            DmcState::SendRenumNotification => self.send_renum_notification(),
            DmcState::JumpToAlternate => self.jump_to_alternate(),
            DmcState::PreUpdateComplete => self.pre_update_complete(),
            DmcState::FwUpdateComplete => self.fw_update_complete(),
            DmcState::ErrorRecovery => self.error_recovery(),
            DmcState::Phase2Error => self.phase2_error(),
            DmcState::WaitForSpiFlashOprComplete => self.wait_for_spi(),
        };
        self.goto(next);
    }

    /// Run states until the machine parks, or `max_ticks` runs out. Returns
    /// the number of ticks used.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> usize {
        for tick in 0..max_ticks {
            if self.is_idle() {
                return tick;
            }
            self.task();
        }
        max_ticks
    }

    fn goto(&mut self, next: DmcState) {
        if next == self.state {
            return;
        }
        debug!(
            self.log, "state change";
            "from" => <&str>::from(self.state),
            "to" => <&str>::from(next),
        );
        self.app.event(DmcEvent::StateChanged { from: self.state, to: next });
        self.state = next;
    }

    /// Start an SPI operation's wait, resuming at `resume` when it ends.
    fn wait_spi_then(&mut self, resume: DmcState) -> DmcState {
        self.spi_resume = resume;
        DmcState::WaitForSpiFlashOprComplete
    }

    fn wait_for_spi(&mut self) -> DmcState {
        let Some(spi) = self.spi.as_mut() else {
            return self.spi_resume;
        };
        match spi.continue_operation() {
            crate::spi::SpiProgress::Pending { .. } => self.state,
            _ => self.spi_resume,
        }
    }

    /// Run a hook for `component` with a context built from the
    /// controller's own parts. `None` if the component is not in the
    /// topology.
    fn device_call<R>(
        &mut self,
        component: u8,
        f: impl FnOnce(&mut dyn DeviceOperations, &mut DeviceContext<'_>) -> R,
    ) -> Option<R> {
        let topology = *self.config.cdtt.device(component)?;
        let ops = self.ops.get_mut(topology.device_type)?;
        let status = self.metadata.device_status_mut(component)?;
        let mut ctx = DeviceContext {
            topology: &topology,
            status,
            flash: &mut *self.flash,
            spi: self.spi.as_mut(),
            app: &mut *self.app,
            log: &self.log,
        };
        Some(f(ops, &mut ctx))
    }

    fn commit(&mut self, reset_counters: bool) -> Result<(), MetadataError> {
        let result = self.metadata.commit(&mut *self.flash, reset_counters);
        if let Err(err) = &result {
            error!(self.log, "metadata commit failed"; err);
        }
        result
    }

    fn count_fault(&mut self, fault: Fault) {
        if let Err(err) = self.fault_log.count(&mut *self.flash, fault) {
            warn!(self.log, "failed to update fault log"; &err);
        }
    }

    fn notify(&mut self, notification: Notification) -> bool {
        match self.host.notify(notification) {
            Ok(()) => true,
            Err(_) => {
                debug!(
                    self.log, "host endpoint busy";
                    "notification" => <&str>::from(notification),
                );
                false
            }
        }
    }

    fn set_dock_status(&mut self, code: DockStatusCode) {
        self.metadata.metadata_mut().status.set_status(code);
    }

    fn phase(&self) -> Option<Phase> {
        self.session.as_ref().map(|s| s.phase)
    }

    fn in_progress_code(&self) -> DockStatusCode {
        match self.phase() {
            Some(Phase::Two) => DockStatusCode::Phase2UpdateInProgress,
            _ => DockStatusCode::Phase1UpdateInProgress,
        }
    }

    fn partial_code(&self) -> DockStatusCode {
        match self.phase() {
            Some(Phase::Two) => DockStatusCode::Phase2UpdatePartial,
            _ => DockStatusCode::Phase1UpdatePartial,
        }
    }

    /// An update ran into something that should not happen. The metadata
    /// stays as last committed; the failure is reported and the host has to
    /// reset the state machine.
    fn fail(&mut self, reason: &str) -> DmcState {
        error!(self.log, "firmware update failed"; "reason" => reason);
        let code = match self.phase() {
            Some(Phase::Two) => DockStatusCode::Phase2UpdatePartial,
            _ => DockStatusCode::Phase1UpdateFail,
        };
        self.outcome = StatusCode::Failed(code as u8);
        self.count_fault(Fault::FwUpdateFailure);
        self.app.event(DmcEvent::UpdateFailed);
        if self.phase() != Some(Phase::Two) {
            self.notify(Notification::FwUpgradeStatus(self.outcome));
        }
        DmcState::FwUpdateFailed
    }

    fn power_on(&mut self) -> DmcState {
        if !self.booted {
            self.booted = true;
            self.count_fault(Fault::PowerCycle);
            for device in &self.config.cdtt.devices {
                if let Some(ops) = self.ops.get_mut(device.device_type) {
                    ops.configure_hardware(device);
                }
            }
        }

        let loaded = match self.metadata.load(&mut *self.flash) {
            LoadOutcome::Loaded { .. } => {
                self.metadata.metadata().cdtt_checksum
                    == self.config.cdtt.checksum()
            }
            LoadOutcome::NoValidCopy => false,
        };
        if !loaded {
            // Every device has to answer before the record is rebuilt.
            let waiting = self.config.cdtt.devices.iter().find(|d| {
                self.ops
                    .get_mut(d.device_type)
                    .is_some_and(|ops| ops.is_query_deferred(d))
            });
            if let Some(device) = waiting {
                debug!(
                    self.log, "waiting for device before rebuilding metadata";
                    "component" => device.component_id,
                );
                return self.state;
            }
            if self.rebuild_metadata().is_err() {
                self.pending_failure =
                    Some(DockStatusCode::Phase2FailRamInitFailed);
                return DmcState::Phase2Error;
            }
        }

        let metadata = self.metadata.metadata();
        let status = metadata.status.status();
        if metadata.soft_reset_pending {
            self.metadata.metadata_mut().soft_reset_pending = false;
            let _ = self.commit(false);
        }

        let metadata = self.metadata.metadata();
        if metadata.active_target().is_some() {
            info!(
                self.log, "update was interrupted";
                "status" => <&str>::from(status),
            );
            return DmcState::ErrorRecovery;
        }
        if status.is_in_progress() && !status.is_phase2() {
            self.set_dock_status(DockStatusCode::Phase1UpdatePartial);
            let _ = self.commit(false);
        }
        self.after_power_on()
    }

    /// Where power-on goes once the metadata is settled.
    fn after_power_on(&mut self) -> DmcState {
        let metadata = self.metadata.metadata();
        let backup_done = metadata
            .app_flags()
            .contains(crate::metadata::AppFlags::FACTORY_BACKUP_DONE);
        if self.spi.is_some() && !backup_done {
            return DmcState::Phase2FactoryBackup;
        }
        self.phase2_or_idle()
    }

    fn phase2_or_idle(&self) -> DmcState {
        let trigger = self.metadata.metadata().phase2_trigger();
        if self.spi.is_some() && trigger != Phase2Trigger::None {
            DmcState::Phase2Checks
        } else {
            DmcState::WaitForStart
        }
    }

    /// Build fresh metadata from the topology and live device queries.
    fn rebuild_metadata(&mut self) -> Result<(), MetadataError> {
        info!(self.log, "rebuilding dock metadata");
        let mut metadata = DockMetadata::default();
        metadata.secured_only = self.config.security.secured_only;
        metadata.cdtt_checksum = self.config.cdtt.checksum();
        let status = &mut metadata.status;
        for device in &self.config.cdtt.devices {
            status.devices[usize::from(device.component_id)] =
                DeviceStatus::new(
                    device.device_type,
                    device.component_id,
                    device.image_mode,
                );
            status.header.device_count =
                status.header.device_count.max(device.component_id + 1);
        }
        status.set_status(DockStatusCode::Idle);
        status.refresh_length();
        self.metadata.replace(metadata);

        let components = self
            .config
            .cdtt
            .devices
            .iter()
            .map(|d| d.component_id)
            .collect::<Vec<_>>();
        for component in components {
            let result = self
                .device_call(component, |ops, ctx| ops.initialize_parameters(ctx));
            if let Some(Err(err)) = result {
                warn!(
                    self.log, "failed to query device";
                    "component" => component,
                    &err,
                );
            }
        }
        self.commit(true)
    }

    /// A fresh update gets the full number of attempts for every image.
    fn clear_update_attempts(&mut self) {
        let status = &mut self.metadata.metadata_mut().status;
        for device in status.devices.iter_mut().filter(|d| d.is_populated()) {
            device.clear_update_attempts(ImageType::Image1);
            device.clear_update_attempts(ImageType::Image2);
        }
    }

    /// Abandon the current attempt. An image being written stays invalid.
    fn abandon_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(spi) = self.spi.as_mut() {
            spi.cancel();
        }
        if let Some(job) = session.job.take() {
            let image = job.image;
            let component = job.component();
            self.device_call(component, |ops, ctx| {
                let _ = ops.finish_update(ctx, &image, false);
                ops.deinit_context(ctx);
            });
            self.metadata.metadata_mut().set_active_target(None);
        }
        let status = self.metadata.metadata().status.status();
        if status.is_in_progress() {
            let code = match session.phase {
                Phase::One => DockStatusCode::Phase1UpdatePartial,
                Phase::Two => DockStatusCode::Phase2UpdatePartial,
            };
            self.set_dock_status(code);
        }
        let _ = self.commit(false);
    }
}

impl DmcHandler for Controller {
    fn upgrade_start(
        &mut self,
        signature: Option<&EcdsaSignature>,
    ) -> Result<(), DmcError> {
        if self.state != DmcState::WaitForStart {
            return Err(DmcError::NotReady);
        }
        info!(
            self.log, "host started an update";
            "signed" => signature.is_some(),
        );
        self.clear_update_attempts();
        let mut session = UpdateSession::new(Phase::One, Package::Primary);
        session.signature = signature.map(|s| s.0.to_vec());
        self.session = Some(session);
        self.pending_failure = None;
        self.outcome = StatusCode::InProgress;
        self.goto(DmcState::WaitForFwct);
        Ok(())
    }

    fn fwct_write(&mut self, fwct: &[u8]) -> Result<(), DmcError> {
        if self.state != DmcState::WaitForFwct {
            return Err(DmcError::NotReady);
        }
        if fwct.len() > MAX_TABLE_SIZE {
            return Err(DmcError::BadParam);
        }
        let session = self.session.as_mut().ok_or(DmcError::NotReady)?;
        session.fwct = None;
        session.received = fwct.to_vec();
        self.goto(DmcState::Phase1Checks);
        Ok(())
    }

    fn image_write(
        &mut self,
        start_row: u16,
        row_count: u16,
    ) -> Result<(), DmcError> {
        if self.state != DmcState::WaitForImgWrite {
            return Err(if self.state.is_row_write() {
                DmcError::Busy
            } else {
                DmcError::NotReady
            });
        }
        let segment = self
            .session
            .as_ref()
            .and_then(|s| s.job.as_ref())
            .and_then(|job| job.segment())
            .ok_or(DmcError::NotReady)?;
        if segment.start_row != start_row || segment.row_count != row_count {
            warn!(
                self.log, "host announced an unexpected segment";
                "start_row" => start_row,
                "row_count" => row_count,
                "expected_start_row" => segment.start_row,
                "expected_row_count" => segment.row_count,
            );
            return Err(DmcError::BadParam);
        }
        self.goto(DmcState::WaitForUsbData);
        Ok(())
    }

    fn row_data(&mut self, data: &[u8]) -> Result<(), DmcError> {
        if self.state != DmcState::WaitForUsbData {
            return Err(if self.state.is_row_write() {
                DmcError::Busy
            } else {
                DmcError::NotReady
            });
        }
        let job = self
            .session
            .as_mut()
            .and_then(|s| s.job.as_mut())
            .ok_or(DmcError::NotReady)?;
        if job.buf.len() + data.len() > job.image.row_size {
            return Err(DmcError::BadParam);
        }
        job.buf.extend_from_slice(data);
        if job.buf.len() == job.image.row_size {
            self.goto(DmcState::ImgWriteInProgress);
        }
        Ok(())
    }

    fn image_write_status(&mut self) -> StatusCode {
        match &self.session {
            Some(_) if self.state.is_row_write() => StatusCode::InProgress,
            Some(_) if self.state == DmcState::ImgWriteStatus => {
                StatusCode::InProgress
            }
            Some(session) => session.last_row_status,
            None => StatusCode::Idle,
        }
    }

    fn upgrade_status(&mut self) -> StatusCode {
        self.outcome
    }

    fn dock_status(&mut self) -> DockStatus {
        let mut status = self.metadata.metadata().status;
        status.refresh_length();
        status
    }

    fn dock_identity(&mut self) -> DockIdentity {
        self.config.dock_identity()
    }

    fn state_reset(&mut self) -> Result<(), DmcError> {
        if self.state.is_row_write() || self.state == DmcState::PowerOn {
            return Err(DmcError::Busy);
        }
        info!(
            self.log, "host reset the state machine";
            "state" => <&str>::from(self.state),
        );
        self.abandon_session();
        self.package_check = None;
        self.pending_failure = None;
        self.outcome = StatusCode::Idle;
        self.goto(DmcState::WaitForStart);
        Ok(())
    }

    fn trigger_phase2_update(&mut self) -> Result<(), DmcError> {
        if self.spi.is_none() {
            return Err(DmcError::NotSupported);
        }
        let trigger = match self.state {
            DmcState::WaitForStart => Phase2Trigger::Existing,
            DmcState::Phase1WaitForTrigger => Phase2Trigger::New,
            _ => return Err(DmcError::Busy),
        };
        info!(
            self.log, "host triggered a phase 2 update";
            "trigger" => <&str>::from(trigger),
        );
        self.session = None;
        self.arm_phase2(trigger);
        self.commit(false).map_err(|_| DmcError::NotReady)?;
        self.goto(DmcState::Phase2Checks);
        Ok(())
    }

    fn flash_log(&mut self, out: &mut [u8]) -> Result<usize, DmcError> {
        self.fault_log.encode(out).map_err(|_| DmcError::ResponseTooLarge)
    }
}
