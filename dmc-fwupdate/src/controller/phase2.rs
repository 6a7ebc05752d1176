// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Phase 2: updates the dock starts on its own from a package in SPI flash,
//! and the factory backup of that package.

use super::validate::identity_matches;
use super::validate::verify_signature;
use super::validate::AuthError;
use super::Controller;
use super::DmcState;
use crate::error::SpiError;
use crate::fault_log::Fault;
use crate::metadata::AppFlags;
use crate::metadata::Package;
use crate::metadata::Phase2Trigger;
use crate::platform::DmcEvent;
use crate::session::FwctTable;
use crate::session::Phase;
use crate::session::UpdateSession;
use crate::spi::SpiPackageManager;
use crate::spi::ValidatedPackage;
use dmc_messages::fwct::FwctInfo;
use dmc_messages::fwct::SignatureBlock;
use dmc_messages::fwct::FWCT_SIGNATURE;
use dmc_messages::fwct::MAX_TABLE_SIZE;
use dmc_messages::fwct::SIGNATURE_BLOCK_SIZE;
use dmc_messages::DockStatusCode;
use dmc_messages::FwctAnalysisStatus;
use dmc_messages::StatusCode;
use sha2::Digest;
use sha2::Sha256;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use zerocopy::FromBytes;

/// Bytes of package image data hashed per tick.
const HASH_CHUNK: usize = 1024;

/// A package whose FWCT, identity, and signature checked out, with its
/// images being hashed a chunk per tick.
pub(super) struct PackageCheck {
    package: Package,
    fwct: FwctTable,
    /// Next FWCT image to hash.
    image: usize,
    hasher: Sha256,
    /// Bytes of that image hashed so far.
    hashed: usize,
    /// Package bytes covered so far.
    len: u32,
}

enum CheckProgress {
    /// Call again on the next tick.
    Pending,
    Valid(ValidatedPackage),
}

/// Why a package could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFailure {
    /// An erase or program is still outstanding; try again later.
    Busy,
    Read,
    /// No FWCT at the start of the package.
    NoPackage,
    Malformed,
}

impl From<SpiError> for ReadFailure {
    fn from(err: SpiError) -> Self {
        match err {
            SpiError::Busy => ReadFailure::Busy,
            _ => ReadFailure::Read,
        }
    }
}

fn read_fwct(
    spi: &mut SpiPackageManager,
    package: Package,
) -> Result<FwctTable, ReadFailure> {
    let mut header = [0; FwctInfo::SIZE];
    spi.read(package, 0, &mut header)?;
    let info = FwctInfo::read_from_bytes(&header[..])
        .map_err(|_| ReadFailure::Malformed)?;
    if info.signature.get() != FWCT_SIGNATURE {
        return Err(ReadFailure::NoPackage);
    }
    let size = usize::from(info.size.get());
    if size < FwctInfo::SIZE || size > MAX_TABLE_SIZE {
        return Err(ReadFailure::Malformed);
    }
    let mut table = vec![0; size];
    spi.read(package, 0, &mut table)?;
    FwctTable::parse(&table).map_err(|_| ReadFailure::Malformed)
}

fn read_signature_block(
    spi: &mut SpiPackageManager,
    package: Package,
    fwct: &FwctTable,
) -> Result<Vec<u8>, ReadFailure> {
    let mut block = vec![0; SIGNATURE_BLOCK_SIZE];
    spi.read(package, fwct.table.len() as u32, &mut block)?;
    Ok(block)
}

impl Controller {
    /// Ask for a Phase 2 update on the next pass through
    /// [`DmcState::Phase2Checks`].
    pub(super) fn arm_phase2(&mut self, trigger: Phase2Trigger) {
        let metadata = self.metadata.metadata_mut();
        metadata.set_phase2_trigger(trigger);
        metadata.set_candidate_package(Package::Primary);
        metadata.phase2_update_counter = 0;
        if trigger == Phase2Trigger::New {
            self.clear_update_attempts();
        }
    }

    pub(super) fn phase2_factory_backup(&mut self) -> DmcState {
        if !self.app.is_factory_condition() {
            debug!(self.log, "dock has left the factory; no backup taken");
            self.app.event(DmcEvent::FactoryBackupNotDone);
            return self.phase2_or_idle();
        }
        let package = match self.check_package(Package::Primary) {
            Ok(CheckProgress::Valid(package)) => package,
            Ok(CheckProgress::Pending) => return self.state,
            Err(DockStatusCode::Phase2FailNoValidSpiPackage) => {
                info!(self.log, "no primary package to back up");
                self.app.event(DmcEvent::FactoryBackupNotDone);
                return self.phase2_or_idle();
            }
            Err(code) => {
                warn!(
                    self.log, "primary package failed validation";
                    "status" => <&str>::from(code),
                );
                return self.backup_failed();
            }
        };

        info!(
            self.log, "backing up primary package to factory region";
            "len" => package.len(),
        );
        self.app.event(DmcEvent::FactoryBackupStarted);
        self.set_dock_status(DockStatusCode::Phase2FactoryBackup);
        let Some(spi) = self.spi.as_mut() else {
            return self.phase2_or_idle();
        };
        if let Err(err) = spi.copy_primary_to_factory(&package) {
            warn!(self.log, "failed to start factory backup"; &err);
            return self.backup_failed();
        }
        self.wait_spi_then(DmcState::Phase2FactoryBackupCopy)
    }

    pub(super) fn phase2_factory_backup_copy(&mut self) -> DmcState {
        let result = self.spi.as_mut().and_then(|spi| spi.take_result());
        match result {
            Some(Ok(())) => {
                info!(self.log, "factory backup complete");
                let metadata = self.metadata.metadata_mut();
                metadata.set_app_flag(AppFlags::FACTORY_BACKUP_DONE, true);
                metadata.status.set_status(DockStatusCode::Idle);
                if self.commit(false).is_err() {
                    return self.backup_failed();
                }
                self.phase2_or_idle()
            }
            Some(Err(err)) => {
                warn!(self.log, "factory backup failed"; &err);
                self.backup_failed()
            }
            None => {
                warn!(self.log, "factory backup ended without a result");
                self.backup_failed()
            }
        }
    }

    fn backup_failed(&mut self) -> DmcState {
        self.app.event(DmcEvent::FactoryBackupFailed);
        self.pending_failure =
            Some(DockStatusCode::Phase2FailFactoryBackupFailed);
        DmcState::Phase2Error
    }

    /// Validate a package a step per call: FWCT, identity and signature
    /// first, then one chunk of image data at a time.
    fn check_package(
        &mut self,
        package: Package,
    ) -> Result<CheckProgress, DockStatusCode> {
        let mut check = match self.package_check.take() {
            Some(check) if check.package == package => check,
            _ => {
                self.package_check = self.start_package_check(package)?;
                return Ok(CheckProgress::Pending);
            }
        };
        match self.hash_package_chunk(&mut check)? {
            Some(valid) => Ok(CheckProgress::Valid(valid)),
            None => {
                self.package_check = Some(check);
                Ok(CheckProgress::Pending)
            }
        }
    }

    /// Check everything but the image digests. `Ok(None)` means the SPI
    /// flash is busy.
    fn start_package_check(
        &mut self,
        package: Package,
    ) -> Result<Option<PackageCheck>, DockStatusCode> {
        let Some(spi) = self.spi.as_mut() else {
            return Err(DockStatusCode::Phase2FailNoValidSpiPackage);
        };
        let fwct = match read_fwct(spi, package) {
            Ok(fwct) => fwct,
            Err(ReadFailure::Busy) => return Ok(None),
            Err(ReadFailure::Read) => {
                return Err(DockStatusCode::Phase2FailSpiReadFailed)
            }
            Err(ReadFailure::NoPackage) => {
                return Err(DockStatusCode::Phase2FailNoValidSpiPackage)
            }
            Err(ReadFailure::Malformed) => {
                return Err(DockStatusCode::Phase2FailInvalidFwct)
            }
        };
        if !identity_matches(&self.config.cdtt, &fwct) {
            return Err(DockStatusCode::Phase2FailInvalidDockIdentity);
        }

        let security = &self.config.security;
        if security.secured_only {
            let block = read_signature_block(spi, package, &fwct)
                .map_err(|_| DockStatusCode::Phase2FailSpiReadFailed)?;
            let block = SignatureBlock::parse(&block)
                .map_err(|_| DockStatusCode::Phase2FailAuthenticationFailed)?;
            verify_signature(
                security,
                &mut *self.verifier,
                &fwct.digest(),
                block.signature(usize::from(security.key_slot)),
            )
            .map_err(|err| match err {
                AuthError::NoKey => DockStatusCode::Phase2FailNoValidKey,
                AuthError::Algorithm => {
                    DockStatusCode::Phase2FailInvalidAlgorithm
                }
                AuthError::Mismatch => {
                    DockStatusCode::Phase2FailAuthenticationFailed
                }
            })?;
        }

        let len = (fwct.table.len() + SIGNATURE_BLOCK_SIZE) as u32;
        Ok(Some(PackageCheck {
            package,
            fwct,
            image: 0,
            hasher: Sha256::new(),
            hashed: 0,
            len,
        }))
    }

    /// Hash the next chunk of image data. `Ok(Some(..))` once every image
    /// matched its digest.
    fn hash_package_chunk(
        &mut self,
        check: &mut PackageCheck,
    ) -> Result<Option<ValidatedPackage>, DockStatusCode> {
        let Some(spi) = self.spi.as_mut() else {
            return Err(DockStatusCode::Phase2FailNoValidSpiPackage);
        };
        let Some(image) =
            check.fwct.images.get(check.image).map(|(image, _)| *image)
        else {
            return Ok(Some(ValidatedPackage::new(check.len)));
        };
        let padded =
            (image.size as usize).div_ceil(image.row_size) * image.row_size;
        let n = HASH_CHUNK.min(padded - check.hashed);
        let mut chunk = [0; HASH_CHUNK];
        let addr = image.offset + check.hashed as u32;
        match spi.read(check.package, addr, &mut chunk[..n]) {
            Ok(()) => (),
            Err(SpiError::Busy) => return Ok(None),
            Err(_) => return Err(DockStatusCode::Phase2FailNoValidSpiPackage),
        }
        check.hasher.update(&chunk[..n]);
        check.hashed += n;
        if check.hashed < padded {
            return Ok(None);
        }

        let digest: [u8; 32] =
            std::mem::replace(&mut check.hasher, Sha256::new())
                .finalize()
                .into();
        if digest != image.digest {
            warn!(
                self.log, "package image digest mismatch";
                "package" => <&str>::from(check.package),
                "index" => image.index,
            );
            return Err(DockStatusCode::Phase2FailNoValidSpiPackage);
        }
        check.len = check.len.max(image.offset + padded as u32);
        check.image += 1;
        check.hashed = 0;
        Ok(None)
    }

    pub(super) fn phase2_checks(&mut self) -> DmcState {
        if self.spi.is_none() {
            return DmcState::WaitForStart;
        }
        let max_attempts = self.config.policy.max_phase2_attempts;
        let metadata = self.metadata.metadata_mut();
        if metadata.phase2_trigger() == Phase2Trigger::None {
            return DmcState::WaitForStart;
        }
        metadata.phase2_update_counter =
            metadata.phase2_update_counter.saturating_add(1);
        let backup_done =
            metadata.app_flags().contains(AppFlags::FACTORY_BACKUP_DONE);
        if metadata.phase2_update_counter > max_attempts {
            match metadata.candidate_package() {
                Package::Primary if backup_done => {
                    metadata.set_candidate_package(Package::Factory);
                    metadata.phase2_update_counter = 1;
                    warn!(
                        self.log,
                        "primary package keeps failing; using factory package"
                    );
                }
                _ => {
                    self.pending_failure =
                        Some(DockStatusCode::Phase2FailNoValidFactoryPackage);
                    return DmcState::Phase2Error;
                }
            }
        }
        let package = metadata.candidate_package();
        let attempt = metadata.phase2_update_counter;
        if self.commit(false).is_err() {
            self.pending_failure = Some(DockStatusCode::Phase2FailRamInitFailed);
            return DmcState::Phase2Error;
        }

        info!(
            self.log, "starting phase 2 update";
            "package" => <&str>::from(package),
            "attempt" => attempt,
        );
        self.app.event(DmcEvent::Phase2UpdateStarted);
        self.session = Some(UpdateSession::new(Phase::Two, package));
        self.outcome = StatusCode::InProgress;
        DmcState::Phase2ReadFwct
    }

    pub(super) fn phase2_read_fwct(&mut self) -> DmcState {
        let Some(spi) = self.spi.as_mut() else {
            return self.fail("phase 2 read without SPI flash");
        };
        let Some(session) = self.session.as_mut() else {
            return self.fail("phase 2 read without a session");
        };
        match read_fwct(spi, session.package) {
            Ok(fwct) => {
                debug!(
                    self.log, "package FWCT read";
                    "images" => fwct.images.len(),
                    "composite_version" => fwct.composite_version(),
                );
                session.fwct = Some(fwct);
                if self.config.security.secured_only {
                    DmcState::Phase2ReadSignature
                } else {
                    DmcState::FwctAnalysis
                }
            }
            Err(ReadFailure::Busy) => self.state,
            Err(ReadFailure::Read) => {
                self.pending_failure =
                    Some(DockStatusCode::Phase2FailSpiReadFailed);
                DmcState::Phase2Error
            }
            Err(ReadFailure::NoPackage) => {
                self.pending_failure =
                    Some(DockStatusCode::Phase2FailNoValidSpiPackage);
                DmcState::Phase2Error
            }
            Err(ReadFailure::Malformed) => {
                self.reject(FwctAnalysisStatus::InvalidFwct)
            }
        }
    }

    pub(super) fn phase2_read_signature(&mut self) -> DmcState {
        let Some(spi) = self.spi.as_mut() else {
            return self.fail("phase 2 read without SPI flash");
        };
        let Some(session) = self.session.as_mut() else {
            return self.fail("phase 2 read without a session");
        };
        let Some(fwct) = session.fwct.as_ref() else {
            return self.fail("signature read without an FWCT");
        };
        let block = match read_signature_block(spi, session.package, fwct) {
            Ok(block) => block,
            Err(ReadFailure::Busy) => return self.state,
            Err(_) => {
                self.pending_failure =
                    Some(DockStatusCode::Phase2FailSpiReadFailed);
                return DmcState::Phase2Error;
            }
        };
        let slot = usize::from(self.config.security.key_slot);
        match SignatureBlock::parse(&block) {
            Ok(block) => {
                session.signature = block.signature(slot).map(<[u8]>::to_vec);
                DmcState::Authenticating
            }
            Err(err) => {
                warn!(self.log, "malformed signature block"; "err" => %err);
                self.reject(FwctAnalysisStatus::AuthenticationFailed)
            }
        }
    }

    pub(super) fn phase2_error(&mut self) -> DmcState {
        let code = self
            .pending_failure
            .take()
            .unwrap_or(DockStatusCode::Phase2FailNoValidSpiPackage);
        error!(
            self.log, "phase 2 update failed";
            "status" => <&str>::from(code),
        );
        self.abandon_session();
        self.count_fault(Fault::FwUpdateFailure);
        let metadata = self.metadata.metadata_mut();
        metadata.status.set_status(code);
        metadata.set_phase2_trigger(Phase2Trigger::None);
        let _ = self.commit(false);
        self.app.event(DmcEvent::UpdateFailed);
        self.app.event(DmcEvent::Phase2UpdateEnded);
        self.outcome = StatusCode::Failed(code as u8);
        DmcState::WaitForStart
    }
}
