// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices behind an HPI, I2C, or UART link that flash themselves: the
//! controller hands them rows and polls for each acknowledgement.

use super::version_differs;
use super::DeviceContext;
use super::DeviceOperations;
use super::HookOutcome;
use super::HookResult;
use crate::config::DeviceTopology;
use crate::error::DeviceOpError;
use dmc_messages::fwct::FwctImage;
use dmc_messages::DeviceStatus;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::FW_VERSION_SIZE;
use slog::debug;

/// A device's answer to a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceQuery {
    pub running: ImageType,
    pub image1: ImageStatus,
    pub image2: ImageStatus,
    pub bootloader_version: [u8; FW_VERSION_SIZE],
    pub image1_version: [u8; FW_VERSION_SIZE],
    pub image2_version: [u8; FW_VERSION_SIZE],
}

/// The application's link to one class of external device. Calls are
/// addressed by topology entry, so one transport may serve several devices.
pub trait DeviceTransport: Send {
    /// Whether the device is ready to answer queries.
    fn is_ready(&mut self, topology: &DeviceTopology) -> bool;

    fn query(
        &mut self,
        topology: &DeviceTopology,
    ) -> Result<DeviceQuery, DeviceOpError>;

    fn enter_flashing(
        &mut self,
        topology: &DeviceTopology,
        image: ImageType,
    ) -> Result<(), DeviceOpError>;

    /// Hand the device one row; the write completes asynchronously.
    fn start_row_write(
        &mut self,
        topology: &DeviceTopology,
        row: u16,
        data: &[u8],
    ) -> Result<(), DeviceOpError>;

    /// `None` until the device acknowledges the last row.
    fn poll_write(
        &mut self,
        topology: &DeviceTopology,
    ) -> Option<Result<(), DeviceOpError>>;

    fn exit_flashing(
        &mut self,
        topology: &DeviceTopology,
        success: bool,
    ) -> Result<(), DeviceOpError>;

    fn jump_to_alternate(
        &mut self,
        topology: &DeviceTopology,
    ) -> Result<(), DeviceOpError>;
}

pub struct TransportOps<T> {
    transport: T,
}

impl<T: DeviceTransport> TransportOps<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

impl<T: DeviceTransport> DeviceOperations for TransportOps<T> {
    fn initialize_parameters(
        &mut self,
        ctx: &mut DeviceContext<'_>,
    ) -> Result<(), DeviceOpError> {
        let q = self.transport.query(ctx.topology)?;
        let status = &mut *ctx.status;
        status.set_current_image(q.running);
        status.set_image_status(ImageType::Image1, q.image1);
        status.set_image_status(ImageType::Image2, q.image2);
        status.set_version(ImageType::Bootloader, q.bootloader_version);
        status.set_version(ImageType::Image1, q.image1_version);
        status.set_version(ImageType::Image2, q.image2_version);
        Ok(())
    }

    fn prepare_update(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        image: &FwctImage,
    ) -> HookResult {
        self.transport.enter_flashing(ctx.topology, image.image_type)?;
        Ok(HookOutcome::Done)
    }

    fn write_row(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        _image: &FwctImage,
        row: u16,
        data: &[u8],
    ) -> HookResult {
        self.transport.start_row_write(ctx.topology, row, data)?;
        Ok(HookOutcome::Deferred)
    }

    fn finish_update(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        _image: &FwctImage,
        success: bool,
    ) -> HookResult {
        self.transport.exit_flashing(ctx.topology, success)?;
        Ok(HookOutcome::Done)
    }

    fn check_version(&self, status: &DeviceStatus, image: &FwctImage) -> bool {
        version_differs(status, image)
    }

    fn jump_to_alternate(&mut self, ctx: &mut DeviceContext<'_>) -> HookResult {
        debug!(
            ctx.log, "jumping to alternate image";
            "component" => ctx.topology.component_id,
        );
        self.transport.jump_to_alternate(ctx.topology)?;
        Ok(HookOutcome::Done)
    }

    fn is_query_deferred(&mut self, topology: &DeviceTopology) -> bool {
        !self.transport.is_ready(topology)
    }

    fn poll(
        &mut self,
        ctx: &mut DeviceContext<'_>,
    ) -> Option<Result<(), DeviceOpError>> {
        self.transport.poll_write(ctx.topology)
    }
}
