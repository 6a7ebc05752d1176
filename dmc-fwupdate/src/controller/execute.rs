// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Writing images: deciding what to update, moving rows to devices, and
//! recording how each image ended.

use super::Controller;
use super::DmcState;
use crate::config::TriggerMode;
use crate::device_ops::HookOutcome;
use crate::device_ops::HookResult;
use crate::error::DeviceOpError;
use crate::error::SpiError;
use crate::fault_log::Fault;
use crate::metadata::AppFlags;
use crate::metadata::Phase2Trigger;
use crate::platform::DmcEvent;
use crate::session::ImageJob;
use crate::session::NextRow;
use crate::session::PendingHook;
use crate::session::Phase;
use dmc_messages::DeviceType;
use dmc_messages::DockStatusCode;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::Notification;
use dmc_messages::StatusCode;
use dmc_messages::DMC_COMPONENT_ID;
use slog::debug;
use slog::info;
use slog::warn;

impl Controller {
    /// The state that polls a deferred hook in the current phase.
    fn hook_wait_state(&self) -> DmcState {
        match self.phase() {
            Some(Phase::Two) => DmcState::WaitHpiStatusOrIdle2,
            _ => DmcState::WaitHpiStatusOrIdle,
        }
    }

    /// Park on a deferred hook, letting any SPI operation it started run
    /// first.
    fn defer(&mut self, hook: PendingHook) -> DmcState {
        if let Some(session) = self.session.as_mut() {
            session.pending = Some(hook);
        }
        let wait = self.hook_wait_state();
        if self.spi.as_ref().is_some_and(|spi| spi.is_busy()) {
            self.wait_spi_then(wait)
        } else {
            wait
        }
    }

    /// Where rows come from once a device is ready to take them.
    fn first_row_state(&self) -> DmcState {
        match self.phase() {
            Some(Phase::Two) => DmcState::Phase2ReadImgSegInfo,
            _ => DmcState::InitiateFwUpgradeRqt,
        }
    }

    fn device_type(&self, component: u8) -> Option<DeviceType> {
        self.config.cdtt.device(component).map(|d| d.device_type)
    }

    pub(super) fn fw_update_analysis(&mut self) -> DmcState {
        let Some(session) = self.session.as_mut() else {
            return self.fail("update analysis without a session");
        };
        let Some((image, segments)) = session.image(session.cursor) else {
            return self.after_analysis();
        };
        let phase = session.phase;
        let component = image.component_id;
        let Some(topology) = self.config.cdtt.device(component).copied() else {
            return self.fail("FWCT image for unknown component");
        };
        if phase == Phase::Two
            && topology.device_type == DeviceType::SpiComponent
        {
            session.cursor += 1;
            return self.state;
        }
        let Some(ops) = self.ops.get_mut(topology.device_type) else {
            return self.fail("no operations for device type");
        };
        if ops.is_query_deferred(&topology) {
            return self.state;
        }
        let Some(status) = self.metadata.device_status(component).copied()
        else {
            return self.fail("FWCT image for unpopulated component");
        };
        session.cursor += 1;

        let attempts = status.update_attempts(image.image_type);
        if attempts >= self.config.policy.max_update_attempts {
            warn!(
                self.log, "image exhausted its update attempts";
                "component" => component,
                "image" => <&str>::from(image.image_type),
                "attempts" => attempts,
            );
            return self.state;
        }
        let force = self
            .metadata
            .metadata()
            .app_flags()
            .contains(AppFlags::FORCE_UPDATE);
        if !force && !ops.check_version(&status, &image) {
            debug!(
                self.log, "image up to date";
                "component" => component,
                "image" => <&str>::from(image.image_type),
            );
            return self.state;
        }

        let decision = ops.decide_update(&status, &image);
        if decision.jump_to_alternate
            && phase == Phase::Two
            && !ops.skip_jump(&status)
            && (!session.jumped || component == DMC_COMPONENT_ID)
        {
            session.queue_jump(component);
        }
        if !decision.update {
            debug!(
                self.log, "image is running; updating after a jump";
                "component" => component,
                "image" => <&str>::from(image.image_type),
            );
            return self.state;
        }

        info!(
            self.log, "updating image";
            "component" => component,
            "image" => <&str>::from(image.image_type),
            "index" => image.index,
        );
        session.job = Some(ImageJob::new(image, segments));
        DmcState::PrepareUpdate
    }

    /// Whether `component`'s other image is recorded as valid, so the
    /// device can run from it.
    fn alternate_is_valid(&self, component: u8) -> bool {
        self.metadata.device_status(component).is_some_and(|status| {
            status
                .current_image()
                .and_then(ImageType::alternate)
                .is_some_and(|alt| status.image_status(alt) == ImageStatus::Valid)
        })
    }

    /// Forget queued jumps into images that are not valid.
    fn drop_unsafe_jumps(&mut self) {
        let Some(jumps) = self.session.as_ref().map(|s| s.jumps.clone())
        else {
            return;
        };
        let (safe, unsafe_jumps): (Vec<u8>, Vec<u8>) =
            jumps.into_iter().partition(|&c| self.alternate_is_valid(c));
        for component in unsafe_jumps {
            warn!(
                self.log, "not switching to an image that is not valid";
                "component" => component,
            );
        }
        if let Some(session) = self.session.as_mut() {
            session.jumps = safe;
        }
    }

    /// Every FWCT image has been looked at.
    fn after_analysis(&mut self) -> DmcState {
        self.drop_unsafe_jumps();
        let Some(session) = self.session.as_ref() else {
            return DmcState::PreUpdateComplete;
        };
        if session.phase == Phase::Two {
            let other_jumps =
                session.jumps.iter().any(|&c| c != DMC_COMPONENT_ID);
            if (!session.jumped && other_jumps)
                || session.jumps.contains(&DMC_COMPONENT_ID)
            {
                return DmcState::JumpToAlternate;
            }
        }
        DmcState::PreUpdateComplete
    }

    pub(super) fn prepare_update(&mut self) -> DmcState {
        let Some(job) = self.session.as_ref().and_then(|s| s.job.as_ref())
        else {
            return self.fail("prepare without an image");
        };
        let image = job.image;
        let component = job.component();

        self.metadata.set_ram_image_status(
            component,
            image.image_type,
            ImageStatus::Invalid,
        );
        self.metadata
            .metadata_mut()
            .set_active_target(Some((component, image.image_type)));
        self.set_dock_status(self.in_progress_code());
        if self.commit(false).is_err() {
            return self.fail("could not record update start");
        }

        let result = self.device_call(component, |ops, ctx| {
            ops.init_context(ctx);
            ops.prepare_update(ctx, &image)
        });
        match result {
            Some(Ok(HookOutcome::Done)) => self.first_row_state(),
            Some(Ok(HookOutcome::Deferred)) => self.defer(PendingHook::Prepare),
            Some(Err(err)) => {
                warn!(
                    self.log, "device refused to enter update mode";
                    "component" => component,
                    &err,
                );
                DmcState::ErrorRecovery
            }
            None => self.fail("prepare for unknown component"),
        }
    }

    pub(super) fn initiate_fw_upgrade_rqt(&mut self) -> DmcState {
        let Some(job) = self.session.as_ref().and_then(|s| s.job.as_ref())
        else {
            return self.fail("upgrade request without an image");
        };
        let image_index = job.image.index;
        if !self.notify(Notification::FwUpgradeRequest { image_index }) {
            return self.state;
        }
        DmcState::WaitForImgWrite
    }

    pub(super) fn phase2_read_img_seg_info(&mut self) -> DmcState {
        let Some(job) = self.session.as_ref().and_then(|s| s.job.as_ref())
        else {
            return self.fail("segment read without an image");
        };
        match job.segment() {
            Some(segment) => {
                debug!(
                    self.log, "writing segment";
                    "component" => job.component(),
                    "start_row" => segment.start_row,
                    "row_count" => segment.row_count,
                );
                DmcState::Phase2ReadImgData
            }
            None => DmcState::PartialUpdateComplete,
        }
    }

    pub(super) fn phase2_read_img_data(&mut self) -> DmcState {
        let Some(spi) = self.spi.as_mut() else {
            return self.fail("image read without SPI flash");
        };
        let Some(session) = self.session.as_mut() else {
            return self.fail("image read without a session");
        };
        let package = session.package;
        let Some(job) = session.job.as_mut() else {
            return self.fail("image read without an image");
        };
        let offset = job.image.offset + job.data_offset();
        let mut row = vec![0xFF; job.image.row_size];
        match spi.read(package, offset, &mut row) {
            Ok(()) => {
                job.buf = row;
                DmcState::ImgWriteInProgress
            }
            Err(SpiError::Busy) => self.state,
            Err(err) => {
                warn!(
                    self.log, "failed to read image data";
                    "offset" => offset,
                    &err,
                );
                self.pending_failure =
                    Some(DockStatusCode::Phase2FailSpiReadFailed);
                DmcState::ErrorRecovery
            }
        }
    }

    pub(super) fn img_write_in_progress(&mut self) -> DmcState {
        let Some(job) = self.session.as_ref().and_then(|s| s.job.as_ref())
        else {
            return self.fail("row write without an image");
        };
        let image = job.image;
        let Some(row) = job.device_row() else {
            return self.fail("row write past the last segment");
        };
        if job.buf.len() != image.row_size {
            return self.fail("partial row");
        }
        let data = job.buf.clone();

        let result = self.device_call(image.component_id, |ops, ctx| {
            ops.write_row(ctx, &image, row, &data)
        });
        match result {
            Some(Ok(HookOutcome::Done)) => self.row_written(Ok(())),
            Some(Ok(HookOutcome::Deferred)) => {
                self.defer(PendingHook::WriteRow)
            }
            Some(Err(err)) => self.row_written(Err(err)),
            None => self.fail("row write for unknown component"),
        }
    }

    fn row_written(&mut self, result: Result<(), DeviceOpError>) -> DmcState {
        if let Some(session) = self.session.as_mut() {
            session.row_result = Some(result);
        }
        DmcState::ImgWriteStatus
    }

    pub(super) fn wait_for_hook(&mut self) -> DmcState {
        let Some(session) = self.session.as_ref() else {
            return self.fail("hook wait without a session");
        };
        let Some(hook) = session.pending else {
            return self.fail("hook wait with nothing pending");
        };
        let component = match (hook, session.job.as_ref()) {
            (PendingHook::Jump { component }, _) => component,
            (_, Some(job)) => job.component(),
            (_, None) => return self.fail("hook wait without an image"),
        };

        let Some(result) = self.device_call(component, |ops, ctx| ops.poll(ctx))
        else {
            return self.fail("hook wait for unknown component");
        };
        let Some(result) = result else {
            if self.spi.as_ref().is_some_and(|spi| spi.is_busy()) {
                return self.wait_spi_then(self.state);
            }
            return self.state;
        };
        if let Some(session) = self.session.as_mut() {
            session.pending = None;
        }

        match hook {
            PendingHook::Prepare => match result {
                Ok(()) => self.first_row_state(),
                Err(err) => {
                    warn!(
                        self.log, "device failed to enter update mode";
                        "component" => component,
                        &err,
                    );
                    DmcState::ErrorRecovery
                }
            },
            PendingHook::WriteRow => self.row_written(result),
            PendingHook::Finish => match result {
                Ok(()) => {
                    if let Some(job) =
                        self.session.as_mut().and_then(|s| s.job.as_mut())
                    {
                        job.finished = true;
                    }
                    DmcState::PartialUpdateComplete
                }
                Err(err) => {
                    warn!(
                        self.log, "device failed to finish update";
                        "component" => component,
                        &err,
                    );
                    DmcState::ErrorRecovery
                }
            },
            PendingHook::Jump { component } => self.jump_done(component, result),
        }
    }

    pub(super) fn img_write_status(&mut self) -> DmcState {
        let Some(session) = self.session.as_mut() else {
            return self.fail("row status without a session");
        };
        let Some(result) = session.row_result.take() else {
            return self.fail("row status without a result");
        };
        let phase = session.phase;
        let code = match &result {
            Ok(()) => StatusCode::Success,
            Err(_) => StatusCode::GENERIC_FAILURE,
        };
        if phase == Phase::One
            && !self.notify(Notification::ImageWriteStatus(code))
        {
            if let Some(session) = self.session.as_mut() {
                session.row_result = Some(result);
            }
            return self.state;
        }

        let Some(session) = self.session.as_mut() else {
            return self.fail("row status without a session");
        };
        session.last_row_status = code;
        let Some(job) = session.job.as_mut() else {
            return self.fail("row status without an image");
        };
        if let Err(err) = result {
            warn!(
                self.log, "row write failed";
                "component" => job.component(),
                "row" => job.device_row(),
                &err,
            );
            return DmcState::ErrorRecovery;
        }
        let data = std::mem::take(&mut job.buf);
        match (phase, job.advance(&data)) {
            (Phase::One, NextRow::SameSegment) => DmcState::WaitForUsbData,
            (Phase::One, NextRow::NextSegment) => DmcState::WaitForImgWrite,
            (Phase::Two, NextRow::SameSegment) => DmcState::Phase2ReadImgData,
            (Phase::Two, NextRow::NextSegment) => {
                DmcState::Phase2ReadImgSegInfo
            }
            (_, NextRow::Done) => DmcState::PartialUpdateComplete,
        }
    }

    pub(super) fn partial_update_complete(&mut self) -> DmcState {
        let Some(job) = self.session.as_ref().and_then(|s| s.job.as_ref())
        else {
            return self.fail("completion without an image");
        };
        let image = job.image;
        let component = job.component();
        let rows = job.rows_done;

        if !job.finished {
            if !job.digest_matches() {
                warn!(
                    self.log, "image digest mismatch";
                    "component" => component,
                    "image" => <&str>::from(image.image_type),
                );
                return DmcState::ErrorRecovery;
            }
            let result = self.device_call(component, |ops, ctx| {
                ops.finish_update(ctx, &image, true)
            });
            match result {
                Some(Ok(HookOutcome::Done)) => {}
                Some(Ok(HookOutcome::Deferred)) => {
                    return self.defer(PendingHook::Finish);
                }
                Some(Err(err)) => {
                    warn!(
                        self.log, "device failed to finish update";
                        "component" => component,
                        &err,
                    );
                    return DmcState::ErrorRecovery;
                }
                None => return self.fail("completion for unknown component"),
            }
        }

        self.device_call(component, |ops, ctx| ops.deinit_context(ctx));
        if let Some(status) = self.metadata.device_status_mut(component) {
            status.set_image_status(image.image_type, ImageStatus::Valid);
            status.set_version(image.image_type, image.version);
            status.clear_update_attempts(image.image_type);
        }
        self.metadata.metadata_mut().set_active_target(None);
        if self.commit(false).is_err() {
            return self.fail("could not record image update");
        }

        info!(
            self.log, "image updated";
            "component" => component,
            "image" => <&str>::from(image.image_type),
            "rows" => rows,
        );
        self.app.event(DmcEvent::ImageWriteSucceeded {
            component,
            image: image.image_type,
        });
        let spi_component =
            self.device_type(component) == Some(DeviceType::SpiComponent);
        if let Some(session) = self.session.as_mut() {
            session.job = None;
            session.images_written += 1;
            session.spi_written |= spi_component;
        }
        DmcState::FwUpdateAnalysis
    }

    pub(super) fn send_renum_notification(&mut self) -> DmcState {
        if !self.notify(Notification::Reenumerate) {
            return self.state;
        }
        DmcState::WaitForStart
    }

    pub(super) fn jump_to_alternate(&mut self) -> DmcState {
        self.drop_unsafe_jumps();
        let Some(session) = self.session.as_ref() else {
            return self.fail("jump without a session");
        };
        let next = if session.jumped {
            None
        } else {
            session.jumps.iter().copied().find(|&c| c != DMC_COMPONENT_ID)
        };
        let Some(component) = next.or_else(|| {
            session
                .jumps
                .contains(&DMC_COMPONENT_ID)
                .then_some(DMC_COMPONENT_ID)
        }) else {
            return self.after_analysis();
        };

        let result =
            self.device_call(component, |ops, ctx| ops.jump_to_alternate(ctx));
        match result {
            Some(Ok(HookOutcome::Done)) => self.jump_done(component, Ok(())),
            Some(Ok(HookOutcome::Deferred)) => {
                self.defer(PendingHook::Jump { component })
            }
            Some(Err(err)) => self.jump_done(component, Err(err)),
            None => self.fail("jump for unknown component"),
        }
    }

    fn jump_done(
        &mut self,
        component: u8,
        result: Result<(), DeviceOpError>,
    ) -> DmcState {
        if let Some(session) = self.session.as_mut() {
            session.jumps.retain(|&c| c != component);
        }
        match result {
            Ok(()) => {
                if let Some(status) = self.metadata.device_status_mut(component)
                {
                    if let Some(alt) =
                        status.current_image().and_then(|i| i.alternate())
                    {
                        status.set_current_image(alt);
                    }
                }
                if component == DMC_COMPONENT_ID {
                    return self.reset_dock();
                }
                if self.commit(false).is_err() {
                    return self.fail("could not record image switch");
                }
                info!(self.log, "device switched images"; "component" => component);
            }
            Err(err) => {
                warn!(
                    self.log, "device failed to switch images";
                    "component" => component,
                    &err,
                );
            }
        }

        let Some(session) = self.session.as_mut() else {
            return self.fail("jump without a session");
        };
        if session.jumped {
            return self.after_analysis();
        }
        if session.jumps.iter().any(|&c| c != DMC_COMPONENT_ID) {
            return DmcState::JumpToAlternate;
        }
        // Images that were running before the jumps can be written now.
        session.jumped = true;
        session.cursor = 0;
        DmcState::FwUpdateAnalysis
    }

    /// The dock controller switched images: reboot into the new one.
    fn reset_dock(&mut self) -> DmcState {
        let metadata = self.metadata.metadata_mut();
        metadata.soft_reset_pending = true;
        metadata.phase2_update_counter = 0;
        if self.commit(false).is_err() {
            return self.fail("could not record dock reset");
        }
        info!(self.log, "resetting dock into new controller image");
        self.app.event(DmcEvent::DockReset);
        self.app.dock_reset();
        self.session = None;
        self.booted = false;
        DmcState::PowerOn
    }

    pub(super) fn pre_update_complete(&mut self) -> DmcState {
        let Some(session) = self.session.as_ref() else {
            return self.fail("completion without a session");
        };
        let Some(fwct) = session.fwct.as_ref() else {
            return self.fail("completion without an FWCT");
        };
        let phase = session.phase;
        let mut pending = 0;
        for (image, _) in &fwct.images {
            let Some(device_type) = self.device_type(image.component_id)
            else {
                continue;
            };
            if phase == Phase::Two && device_type == DeviceType::SpiComponent {
                continue;
            }
            let (Some(ops), Some(status)) = (
                self.ops.get(device_type),
                self.metadata.device_status(image.component_id),
            ) else {
                continue;
            };
            if ops.check_version(status, image) {
                pending += 1;
            }
        }
        if pending > 0 {
            info!(self.log, "update left images pending"; "pending" => pending);
            self.app.event(DmcEvent::PendingUpdates);
        }
        if let Some(session) = self.session.as_mut() {
            session.full = pending == 0;
        }
        DmcState::FwUpdateComplete
    }

    pub(super) fn fw_update_complete(&mut self) -> DmcState {
        let Some(session) = self.session.as_ref() else {
            return self.fail("completion without a session");
        };
        let composite = session
            .fwct
            .as_ref()
            .map(|fwct| fwct.composite_version())
            .unwrap_or_default();
        let (phase, full) = (session.phase, session.full);
        let (written, spi_written) =
            (session.images_written, session.spi_written);

        let (code, outcome) = match (phase, full) {
            (Phase::One, true) => {
                (DockStatusCode::Phase1UpdateComplete, StatusCode::Success)
            }
            (Phase::One, false) => (
                DockStatusCode::Phase1UpdateCompletePartial,
                StatusCode::Failed(
                    DockStatusCode::Phase1UpdateCompletePartial as u8,
                ),
            ),
            (Phase::Two, true) => {
                (DockStatusCode::Phase2UpdateCompleteFull, StatusCode::Success)
            }
            (Phase::Two, false) => (
                DockStatusCode::Phase2UpdateCompletePartial,
                StatusCode::Failed(
                    DockStatusCode::Phase2UpdateCompletePartial as u8,
                ),
            ),
        };

        let next = match phase {
            Phase::One => {
                if !self.notify(Notification::FwUpgradeStatus(outcome)) {
                    return self.state;
                }
                self.set_dock_status(code);
                if spi_written {
                    match self.config.policy.trigger {
                        TriggerMode::Implicit => {
                            self.arm_phase2(Phase2Trigger::New);
                            DmcState::Phase2Checks
                        }
                        TriggerMode::Explicit => DmcState::Phase1WaitForTrigger,
                    }
                } else if written > 0 {
                    DmcState::SendRenumNotification
                } else {
                    DmcState::WaitForStart
                }
            }
            Phase::Two => {
                let metadata = self.metadata.metadata_mut();
                metadata.status.set_status(code);
                metadata.set_phase2_trigger(Phase2Trigger::None);
                metadata.phase2_update_counter = 0;
                metadata.set_app_flag(AppFlags::FORCE_UPDATE, false);
                self.app.event(DmcEvent::Phase2UpdateEnded);
                DmcState::WaitForStart
            }
        };
        if full {
            self.metadata.metadata_mut().status.header.composite_version =
                composite;
        }
        if self.commit(false).is_err() {
            return self.fail("could not record update completion");
        }

        info!(
            self.log, "update complete";
            "phase" => <&str>::from(phase),
            "full" => full,
            "images_written" => written,
        );
        self.session = None;
        self.outcome = outcome;
        next
    }

    pub(super) fn error_recovery(&mut self) -> DmcState {
        let Some(session) = self.session.as_mut() else {
            return self.recover_interrupted();
        };
        let Some(mut job) = session.job.take() else {
            return self.fail("recovery without an image");
        };
        session.pending = None;
        session.row_result = None;
        if let Some(spi) = self.spi.as_mut() {
            spi.cancel();
        }

        let image = job.image;
        let component = job.component();
        self.device_call(component, |ops, ctx| {
            let _: HookResult = ops.finish_update(ctx, &image, false);
            ops.deinit_context(ctx);
        });
        let attempts = match self.metadata.device_status_mut(component) {
            Some(status) => {
                status.set_image_status(image.image_type, ImageStatus::Invalid);
                status.record_update_attempt(image.image_type)
            }
            None => u8::MAX,
        };
        self.metadata.metadata_mut().set_active_target(None);
        self.set_dock_status(self.partial_code());
        self.count_fault(Fault::FwUpdateFailure);
        self.app.event(DmcEvent::ImageWriteFailed {
            component,
            image: image.image_type,
        });
        if self.commit(false).is_err() {
            return self.fail("could not record image failure");
        }

        if self.pending_failure.is_some() {
            return DmcState::Phase2Error;
        }
        if attempts < self.config.policy.max_update_attempts {
            info!(
                self.log, "retrying image";
                "component" => component,
                "image" => <&str>::from(image.image_type),
                "attempt" => attempts + 1,
            );
            job.restart();
            if let Some(session) = self.session.as_mut() {
                session.job = Some(job);
            }
            return DmcState::PrepareUpdate;
        }
        warn!(
            self.log, "giving up on image";
            "component" => component,
            "image" => <&str>::from(image.image_type),
            "attempts" => attempts,
        );
        if let Some(session) = self.session.as_mut() {
            session.jumps.retain(|&c| c != component);
        }
        DmcState::FwUpdateAnalysis
    }

    /// Power came back with an image write recorded as in flight.
    fn recover_interrupted(&mut self) -> DmcState {
        let Some((component, image)) =
            self.metadata.metadata().active_target()
        else {
            return self.after_power_on();
        };
        warn!(
            self.log, "image write was interrupted";
            "component" => component,
            "image" => <&str>::from(image),
        );
        if let Some(status) = self.metadata.device_status_mut(component) {
            status.set_image_status(image, ImageStatus::Invalid);
            status.record_update_attempt(image);
        }
        let metadata = self.metadata.metadata_mut();
        metadata.set_active_target(None);
        let code = if metadata.status.status().is_phase2() {
            DockStatusCode::Phase2UpdatePartial
        } else {
            DockStatusCode::Phase1UpdatePartial
        };
        metadata.status.set_status(code);
        self.count_fault(Fault::FwUpdateFailure);
        self.app.event(DmcEvent::ImageWriteFailed { component, image });
        if self.commit(false).is_err() {
            self.pending_failure = Some(DockStatusCode::Phase2FailRamInitFailed);
            return DmcState::Phase2Error;
        }
        self.after_power_on()
    }
}
