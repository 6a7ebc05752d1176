// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The dock controller updating its own dual-image internal flash.

use super::version_differs;
use super::DeviceContext;
use super::DeviceOperations;
use super::HookOutcome;
use super::HookResult;
use crate::config::FlashLayout;
use crate::error::DeviceOpError;
use dmc_messages::fwct::FwctImage;
use dmc_messages::DeviceStatus;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::FW_VERSION_SIZE;
use serde::Deserialize;
use serde::Serialize;
use slog::info;

/// What the running firmware knows about itself at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmcFirmware {
    pub running: ImageType,
    pub bootloader_version: [u8; FW_VERSION_SIZE],
    pub image1_version: [u8; FW_VERSION_SIZE],
    pub image2_version: [u8; FW_VERSION_SIZE],
    pub image1_valid: bool,
    pub image2_valid: bool,
}

pub struct DmcSelfOps {
    layout: FlashLayout,
    firmware: DmcFirmware,
}

impl DmcSelfOps {
    pub fn new(layout: FlashLayout, firmware: DmcFirmware) -> Self {
        Self { layout, firmware }
    }
}

/// The image the controller is executing from, as recorded in its status.
/// The boot-time answer goes stale after a jump.
fn running(ctx: &DeviceContext<'_>) -> Option<ImageType> {
    ctx.status.current_image()
}

impl DeviceOperations for DmcSelfOps {
    fn initialize_parameters(
        &mut self,
        ctx: &mut DeviceContext<'_>,
    ) -> Result<(), DeviceOpError> {
        let fw = &self.firmware;
        let status = &mut *ctx.status;
        status.set_current_image(fw.running);
        status.set_version(ImageType::Bootloader, fw.bootloader_version);
        status.set_version(ImageType::Image1, fw.image1_version);
        status.set_version(ImageType::Image2, fw.image2_version);
        for (image, valid) in [
            (ImageType::Image1, fw.image1_valid),
            (ImageType::Image2, fw.image2_valid),
        ] {
            let s = if valid { ImageStatus::Valid } else { ImageStatus::Invalid };
            status.set_image_status(image, s);
        }
        Ok(())
    }

    fn prepare_update(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        image: &FwctImage,
    ) -> HookResult {
        if running(ctx) == Some(image.image_type) {
            return Err(DeviceOpError::Unsupported {
                component: ctx.topology.component_id,
                operation: "overwrite the running image",
            });
        }
        ctx.flash.set_flashing_mode(true);
        Ok(HookOutcome::Done)
    }

    fn write_row(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        image: &FwctImage,
        row: u16,
        data: &[u8],
    ) -> HookResult {
        let component = ctx.topology.component_id;
        // Rows outside the target image would land on the running image or
        // on metadata.
        let in_region = self
            .layout
            .dmc_image(image.image_type)
            .is_some_and(|r| r.contains(row));
        if !in_region || running(ctx) == Some(image.image_type) {
            return Err(DeviceOpError::RowRejected { component, row });
        }
        ctx.flash.write_row(row, data)?;
        Ok(HookOutcome::Done)
    }

    fn finish_update(
        &mut self,
        ctx: &mut DeviceContext<'_>,
        image: &FwctImage,
        success: bool,
    ) -> HookResult {
        ctx.flash.set_flashing_mode(false);
        if success {
            match image.image_type {
                ImageType::Image1 => {
                    self.firmware.image1_version = image.version;
                    self.firmware.image1_valid = true;
                }
                ImageType::Image2 => {
                    self.firmware.image2_version = image.version;
                    self.firmware.image2_valid = true;
                }
                ImageType::Bootloader => (),
            }
        }
        Ok(HookOutcome::Done)
    }

    fn check_version(&self, status: &DeviceStatus, image: &FwctImage) -> bool {
        version_differs(status, image)
    }

    /// Booting the other image takes a dock reset, which the controller
    /// issues once the metadata is committed.
    fn jump_to_alternate(&mut self, ctx: &mut DeviceContext<'_>) -> HookResult {
        let component = ctx.topology.component_id;
        let Some(next) = running(ctx).and_then(ImageType::alternate) else {
            return Err(DeviceOpError::Unsupported {
                component,
                operation: "jump from the bootloader",
            });
        };
        if ctx.status.image_status(next) != ImageStatus::Valid {
            return Err(DeviceOpError::Unsupported {
                component,
                operation: "boot an image that is not valid",
            });
        }
        info!(
            ctx.log, "dock controller will boot the other image";
            "image" => <&str>::from(next),
        );
        Ok(HookOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceAccess;
    use crate::config::DeviceTopology;
    use crate::config::RowRange;
    use crate::sim::SimApp;
    use crate::sim::SimFlash;
    use dmc_messages::fw_version_bytes;
    use dmc_messages::DeviceType;
    use dmc_messages::ImageMode;
    use slog::o;

    fn ops() -> DmcSelfOps {
        let v1 = fw_version_bytes(1, 0);
        DmcSelfOps::new(
            FlashLayout {
                metadata_row: 0,
                metadata_rows_per_copy: 2,
                fault_log_row: 4,
                dmc_image1: RowRange { first: 8, count: 8 },
                dmc_image2: RowRange { first: 16, count: 8 },
            },
            DmcFirmware {
                running: ImageType::Image1,
                bootloader_version: v1,
                image1_version: v1,
                image2_version: v1,
                image1_valid: true,
                image2_valid: true,
            },
        )
    }

    #[test]
    fn jump_needs_a_valid_alternate() {
        let topology = DeviceTopology {
            component_id: 0,
            device_type: DeviceType::DmcPmg1s3,
            image_mode: ImageMode::DualSymmetric,
            access: DeviceAccess::Internal,
        };
        let mut status = DeviceStatus::new(
            DeviceType::DmcPmg1s3,
            0,
            ImageMode::DualSymmetric,
        );
        let mut flash = SimFlash::new(24, 64);
        let mut app = SimApp::new();
        let log = slog::Logger::root(slog::Discard, o!());
        let mut ops = ops();

        let mut ctx = DeviceContext {
            topology: &topology,
            status: &mut status,
            flash: &mut flash,
            spi: None,
            app: &mut app,
            log: &log,
        };
        ops.initialize_parameters(&mut ctx).unwrap();
        assert_eq!(ops.jump_to_alternate(&mut ctx), Ok(HookOutcome::Done));

        ctx.status.set_image_status(ImageType::Image2, ImageStatus::Invalid);
        assert!(matches!(
            ops.jump_to_alternate(&mut ctx),
            Err(DeviceOpError::Unsupported { component: 0, .. })
        ));
    }
}
