// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device-type update operations.
//!
//! Each device type in the topology maps to one [`DeviceOperations`]
//! implementation in a [`DeviceOpsTable`]. Supporting a new kind of dock
//! component means registering one more implementation; the controller's
//! state machine does not change.

mod dmc;
mod spi_component;
mod transport;

pub use dmc::DmcFirmware;
pub use dmc::DmcSelfOps;
pub use spi_component::SpiComponentOps;
pub use transport::DeviceQuery;
pub use transport::DeviceTransport;
pub use transport::TransportOps;

use crate::config::DeviceTopology;
use crate::error::DeviceOpError;
use crate::platform::DockApplication;
use crate::platform::FlashRows;
use crate::spi::SpiPackageManager;
use dmc_messages::fwct::FwctImage;
use dmc_messages::DeviceStatus;
use dmc_messages::DeviceType;
use dmc_messages::ImageMode;
use dmc_messages::ImageStatus;
use slog::Logger;
use std::collections::BTreeMap;

/// A hook either finished or started something that must be polled with
/// [`DeviceOperations::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Done,
    Deferred,
}

pub type HookResult = Result<HookOutcome, DeviceOpError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateDecision {
    /// Write the FWCT image now.
    pub update: bool,
    /// Switch the device to its other image once this pass is done.
    pub jump_to_alternate: bool,
}

/// What a hook may touch while it runs.
pub struct DeviceContext<'a> {
    pub topology: &'a DeviceTopology,
    /// The RAM copy of this device's status; the controller commits it.
    pub status: &'a mut DeviceStatus,
    pub flash: &'a mut dyn FlashRows,
    pub spi: Option<&'a mut SpiPackageManager>,
    pub app: &'a mut dyn DockApplication,
    pub log: &'a Logger,
}

pub trait DeviceOperations: Send {
    /// Fill in `ctx.status` from the device itself. Runs when the metadata
    /// has to be rebuilt.
    fn initialize_parameters(
        &mut self,
        ctx: &mut DeviceContext<'_>,
    ) -> Result<(), DeviceOpError>;

    /// Write one row of `image`.
    fn write_row(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        image: &FwctImage,
        row: u16,
        data: &[u8],
    ) -> HookResult;

    /// Whether `image` differs from what the device already holds.
    fn check_version(&self, status: &DeviceStatus, image: &FwctImage) -> bool;

    fn init_context(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn deinit_context(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn prepare_update(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _image: &FwctImage,
    ) -> HookResult {
        Ok(HookOutcome::Done)
    }

    fn finish_update(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _image: &FwctImage,
        _success: bool,
    ) -> HookResult {
        Ok(HookOutcome::Done)
    }

    fn jump_to_alternate(&mut self, _ctx: &mut DeviceContext<'_>) -> HookResult {
        Ok(HookOutcome::Done)
    }

    /// The device cannot be queried yet (e.g., still booting).
    fn is_query_deferred(&mut self, _topology: &DeviceTopology) -> bool {
        false
    }

    /// Must depend only on `status` and `image`.
    fn decide_update(
        &self,
        status: &DeviceStatus,
        image: &FwctImage,
    ) -> UpdateDecision {
        default_decision(status, image)
    }

    fn skip_jump(&self, _status: &DeviceStatus) -> bool {
        false
    }

    fn configure_hardware(&mut self, _topology: &DeviceTopology) {}

    /// Poll a deferred hook: `None` while it is still running.
    fn poll(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
    ) -> Option<Result<(), DeviceOpError>> {
        Some(Ok(()))
    }
}

/// The target image is out of date if it is not valid or carries a
/// different version.
pub fn version_differs(status: &DeviceStatus, image: &FwctImage) -> bool {
    status.image_status(image.image_type) != ImageStatus::Valid
        || *status.version(image.image_type) != image.version
}

/// Single-image devices are rewritten in place. A dual-image device never
/// writes the image it is running from: it first jumps to the other one.
/// After writing the idle image it jumps to it so the new firmware runs.
pub fn default_decision(
    status: &DeviceStatus,
    image: &FwctImage,
) -> UpdateDecision {
    match status.image_mode() {
        Some(ImageMode::DualSymmetric | ImageMode::DualAsymmetric) => {
            if status.current_image() == Some(image.image_type) {
                UpdateDecision { update: false, jump_to_alternate: true }
            } else {
                UpdateDecision { update: true, jump_to_alternate: true }
            }
        }
        Some(ImageMode::SingleImage) | None => {
            UpdateDecision { update: true, jump_to_alternate: false }
        }
    }
}

/// Device operations by type.
#[derive(Default)]
pub struct DeviceOpsTable {
    entries: BTreeMap<DeviceType, Box<dyn DeviceOperations>>,
}

impl DeviceOpsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        device_type: DeviceType,
        ops: Box<dyn DeviceOperations>,
    ) -> &mut Self {
        self.entries.insert(device_type, ops);
        self
    }

    pub fn with(
        mut self,
        device_type: DeviceType,
        ops: Box<dyn DeviceOperations>,
    ) -> Self {
        self.register(device_type, ops);
        self
    }

    pub fn contains(&self, device_type: DeviceType) -> bool {
        self.entries.contains_key(&device_type)
    }

    pub fn get(
        &self,
        device_type: DeviceType,
    ) -> Option<&(dyn DeviceOperations + 'static)> {
        self.entries.get(&device_type).map(|ops| &**ops)
    }

    pub fn get_mut(
        &mut self,
        device_type: DeviceType,
    ) -> Option<&mut (dyn DeviceOperations + 'static)> {
        self.entries.get_mut(&device_type).map(|ops| &mut **ops)
    }
}
