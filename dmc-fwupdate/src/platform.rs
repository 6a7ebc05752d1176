// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware and application services the controller is built on.

use crate::controller::DmcState;
use crate::error::FlashError;
use crate::error::SpiError;
use dmc_messages::ImageType;
use dmc_messages::Notification;
use dmc_messages::SignatureAlgorithm;

/// Row-addressed internal flash. A row write is atomic; a sequence of row
/// writes is not.
pub trait FlashRows {
    fn row_size(&self) -> usize;

    fn read_row(&mut self, row: u16, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write_row(&mut self, row: u16, data: &[u8]) -> Result<(), FlashError>;

    /// Enter or leave the mode in which image rows may be written.
    fn set_flashing_mode(&mut self, enabled: bool);
}

/// Granularities a NOR part can erase in one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum EraseBlock {
    Sector4K,
    Block32K,
    Block64K,
}

impl EraseBlock {
    /// Largest first.
    pub const ALL: [Self; 3] = [Self::Block64K, Self::Block32K, Self::Sector4K];

    pub const fn size(self) -> u32 {
        match self {
            Self::Sector4K => 4 * 1024,
            Self::Block32K => 32 * 1024,
            Self::Block64K => 64 * 1024,
        }
    }
}

/// External SPI NOR flash. Erase and program only start the operation;
/// completion is observed through [`SpiFlash::is_busy`].
pub trait SpiFlash {
    fn write_enable(&mut self, enabled: bool) -> Result<(), SpiError>;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), SpiError>;

    /// Program at most one page; must not cross a page boundary.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), SpiError>;

    fn erase(&mut self, addr: u32, block: EraseBlock) -> Result<(), SpiError>;

    fn is_busy(&mut self) -> bool;
}

pub trait SignatureVerifier {
    /// Check `signature` over the SHA-256 `digest` with `public_key`.
    fn verify(
        &mut self,
        algorithm: SignatureAlgorithm,
        digest: &[u8; 32],
        signature: &[u8],
        public_key: &[u8],
    ) -> bool;
}

/// The interrupt endpoint to the host.
pub trait HostLink {
    /// Queue a notification; fails while the endpoint is busy, in which case
    /// the caller tries again on a later tick.
    fn notify(&mut self, notification: Notification) -> Result<(), HostBusy>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBusy;

/// Callbacks into the firmware embedding the controller.
pub trait DockApplication {
    /// Reset the whole dock; the controller resumes from power-on.
    fn dock_reset(&mut self);

    /// Whether the dock is still in the state it left the factory in.
    fn is_factory_condition(&mut self) -> bool;

    fn event(&mut self, event: DmcEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum DmcEvent {
    UpdateFailed,
    Phase2UpdateStarted,
    Phase2UpdateEnded,
    AuthenticationSucceeded,
    ImageWriteSucceeded { component: u8, image: ImageType },
    ImageWriteFailed { component: u8, image: ImageType },
    /// Some images still differ from the composite after an update.
    PendingUpdates,
    FactoryBackupStarted,
    FactoryBackupNotDone,
    FactoryBackupFailed,
    DockReset,
    StateChanged { from: DmcState, to: DmcState },
}

/// Everything the controller needs from its surroundings.
pub struct Platform {
    pub flash: Box<dyn FlashRows + Send>,
    pub spi: Option<Box<dyn SpiFlash + Send>>,
    pub verifier: Box<dyn SignatureVerifier + Send>,
    pub host: Box<dyn HostLink + Send>,
    pub app: Box<dyn DockApplication + Send>,
}
