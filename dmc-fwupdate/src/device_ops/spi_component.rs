// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SPI flash as a Phase 1 target: its one image is a composite package
//! stored into the primary region for a later Phase 2 update.

use super::version_differs;
use super::DeviceContext;
use super::DeviceOperations;
use super::HookOutcome;
use super::HookResult;
use crate::error::DeviceOpError;
use crate::error::SpiError;
use crate::metadata::Package;
use crate::spi::SpiPackageManager;
use dmc_messages::fwct::FwctImage;
use dmc_messages::DeviceStatus;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;

#[derive(Debug, Default)]
pub struct SpiComponentOps;

fn spi<'a>(
    ctx: &'a mut DeviceContext<'_>,
) -> Result<&'a mut SpiPackageManager, DeviceOpError> {
    ctx.spi.as_deref_mut().ok_or(DeviceOpError::Spi(SpiError::NotConfigured))
}

impl DeviceOperations for SpiComponentOps {
    fn initialize_parameters(
        &mut self,
        ctx: &mut DeviceContext<'_>,
    ) -> Result<(), DeviceOpError> {
        // Whatever the primary region holds is only trusted after Phase 2
        // validates it.
        ctx.status.set_current_image(ImageType::Image1);
        ctx.status.set_image_status(ImageType::Image1, ImageStatus::Unknown);
        ctx.status.set_image_status(ImageType::Image2, ImageStatus::NotSupported);
        Ok(())
    }

    fn prepare_update(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        _image: &FwctImage,
    ) -> HookResult {
        let spi = spi(ctx)?;
        let len = spi.layout().package_size;
        spi.erase_region(Package::Primary, len)?;
        Ok(HookOutcome::Deferred)
    }

    fn write_row(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        image: &FwctImage,
        row: u16,
        data: &[u8],
    ) -> HookResult {
        let offset = u32::from(row) * image.row_size as u32;
        spi(ctx)?.write(Package::Primary, offset, data)?;
        Ok(HookOutcome::Deferred)
    }

    fn check_version(&self, status: &DeviceStatus, image: &FwctImage) -> bool {
        version_differs(status, image)
    }

    fn poll(
        &mut self,
        ctx: &mut DeviceContext<'_>,
    ) -> Option<Result<(), DeviceOpError>> {
        let component = ctx.topology.component_id;
        let spi = match spi(ctx) {
            Ok(spi) => spi,
            Err(e) => return Some(Err(e)),
        };
        if spi.is_busy() {
            return None;
        }
        Some(match spi.take_result() {
            Some(result) => result.map_err(DeviceOpError::from),
            None => Err(DeviceOpError::NoResponse { component }),
        })
    }
}
