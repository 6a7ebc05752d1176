// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FWCT validation: structure, signature, dock identity, and version.

use super::Controller;
use super::DmcState;
use crate::config::Cdtt;
use crate::config::SecurityConfig;
use crate::fault_log::Fault;
use crate::platform::DmcEvent;
use crate::platform::SignatureVerifier;
use crate::session::FwctTable;
use crate::session::Phase;
use dmc_messages::DockStatusCode;
use dmc_messages::FwctAnalysisStatus;
use dmc_messages::Notification;
use dmc_messages::SignatureAlgorithm;
use dmc_messages::StatusCode;
use slog::debug;
use slog::info;
use slog::warn;

/// Why a signature was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AuthError {
    NoKey,
    Algorithm,
    Mismatch,
}

/// Check `signature` over the FWCT digest with the configured key.
pub(super) fn verify_signature(
    security: &SecurityConfig,
    verifier: &mut dyn SignatureVerifier,
    digest: &[u8; 32],
    signature: Option<&[u8]>,
) -> Result<(), AuthError> {
    let key = security.public_key().ok_or(AuthError::NoKey)?;
    let signature = signature.ok_or(AuthError::Mismatch)?;
    if SignatureAlgorithm::from_signature_len(signature.len())
        != Some(security.algorithm)
    {
        return Err(AuthError::Algorithm);
    }
    if verifier.verify(security.algorithm, digest, signature, key) {
        Ok(())
    } else {
        Err(AuthError::Mismatch)
    }
}

/// Check the FWCT header against this dock's topology table.
pub(super) fn identity_matches(cdtt: &Cdtt, fwct: &FwctTable) -> bool {
    let info = &fwct.info;
    info.cdtt_version == cdtt.cdtt_version
        && info.vid.get() == cdtt.vid
        && info.pid.get() == cdtt.pid
        && info.device_id.get() == cdtt.device_id
}

impl Controller {
    /// Record why validation failed and report it.
    pub(super) fn reject(&mut self, reason: FwctAnalysisStatus) -> DmcState {
        warn!(
            self.log, "FWCT rejected";
            "reason" => <&str>::from(reason),
        );
        if let Some(session) = self.session.as_mut() {
            session.failure = Some(reason);
        }
        DmcState::ValidationStatusUpdate
    }

    /// Where a structurally valid FWCT goes next.
    fn after_parse(&self) -> DmcState {
        if self.config.security.secured_only {
            DmcState::Authenticating
        } else {
            DmcState::FwctAnalysis
        }
    }

    pub(super) fn phase1_checks(&mut self) -> DmcState {
        let Some(session) = self.session.as_mut() else {
            return self.fail("FWCT received without a session");
        };
        match FwctTable::parse(&session.received) {
            Ok(fwct) => {
                debug!(
                    self.log, "FWCT received";
                    "images" => fwct.images.len(),
                    "composite_version" => fwct.composite_version(),
                );
                session.fwct = Some(fwct);
                session.received.clear();
                self.after_parse()
            }
            Err(err) => {
                warn!(self.log, "host sent a malformed FWCT"; "err" => %err);
                self.reject(FwctAnalysisStatus::InvalidFwct)
            }
        }
    }

    pub(super) fn authenticating(&mut self) -> DmcState {
        let Some(session) = self.session.as_ref() else {
            return self.fail("authentication without a session");
        };
        let Some(fwct) = session.fwct.as_ref() else {
            return self.fail("authentication without an FWCT");
        };
        let phase = session.phase;
        let result = verify_signature(
            &self.config.security,
            &mut *self.verifier,
            &fwct.digest(),
            session.signature.as_deref(),
        );
        match result {
            Ok(()) => {
                info!(self.log, "FWCT signature verified");
                self.app.event(DmcEvent::AuthenticationSucceeded);
                DmcState::FwctAnalysis
            }
            Err(AuthError::NoKey) if phase == Phase::Two => {
                warn!(self.log, "no public key provisioned");
                self.pending_failure = Some(DockStatusCode::Phase2FailNoValidKey);
                DmcState::Phase2Error
            }
            Err(AuthError::NoKey) => {
                warn!(self.log, "no public key provisioned");
                self.reject(FwctAnalysisStatus::AuthenticationFailed)
            }
            Err(AuthError::Algorithm) => {
                self.reject(FwctAnalysisStatus::InvalidAlgorithm)
            }
            Err(AuthError::Mismatch) => {
                self.count_fault(match phase {
                    Phase::One => Fault::Phase1AuthFailure,
                    Phase::Two => Fault::Phase2AuthFailure,
                });
                self.reject(FwctAnalysisStatus::AuthenticationFailed)
            }
        }
    }

    pub(super) fn fwct_analysis(&mut self) -> DmcState {
        let Some(session) = self.session.as_mut() else {
            return self.fail("analysis without a session");
        };
        let Some(fwct) = session.fwct.as_ref() else {
            return self.fail("analysis without an FWCT");
        };
        let cdtt = &self.config.cdtt;

        let reason = if !identity_matches(cdtt, fwct) {
            Some(FwctAnalysisStatus::InvalidDockIdentity)
        } else if self.config.policy.version_check
            && fwct.composite_version()
                < self.metadata.metadata().status.header.composite_version
        {
            Some(FwctAnalysisStatus::InvalidCompositeVersion)
        } else {
            let bad_image = fwct.images.iter().find(|(image, _)| {
                match cdtt.device(image.component_id) {
                    Some(device) => {
                        image.device_type != device.device_type as u8
                            || !device.image_mode.has_slot(image.image_type)
                    }
                    None => true,
                }
            });
            if let Some((image, _)) = bad_image {
                warn!(
                    self.log, "FWCT image does not fit the dock";
                    "index" => image.index,
                    "component" => image.component_id,
                );
                Some(FwctAnalysisStatus::InvalidFwct)
            } else {
                None
            }
        };
        if let Some(reason) = reason {
            return self.reject(reason);
        }
        session.cursor = 0;
        DmcState::FwUpdateAnalysis
    }

    pub(super) fn validation_status_update(&mut self) -> DmcState {
        let Some(session) = self.session.as_ref() else {
            return self.fail("validation failure without a session");
        };
        let reason =
            session.failure.unwrap_or(FwctAnalysisStatus::InvalidFwct);
        match session.phase {
            Phase::One => {
                if !self.notify(Notification::FwctAnalysisStatus(reason)) {
                    return self.state;
                }
                self.set_dock_status(DockStatusCode::Phase1UpdateFail);
                let _ = self.commit(false);
                self.app.event(DmcEvent::UpdateFailed);
                self.outcome =
                    StatusCode::Failed(reason.phase2_failure() as u8);
                self.session = None;
                DmcState::WaitForStart
            }
            Phase::Two => {
                self.pending_failure = Some(reason.phase2_failure());
                DmcState::Phase2Error
            }
        }
    }
}
