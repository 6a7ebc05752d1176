// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware update orchestration for a USB dock's management controller.
//!
//! The primary entry point is [`Controller`]: a cooperative state machine
//! that updates the dock's components from an image the host streams over
//! USB (Phase 1) or from a package stored in SPI flash (Phase 2), keeping
//! its progress in dual-copy metadata so a power loss at any point is
//! recoverable.

mod controller;
mod session;

pub mod config;
pub mod device_ops;
pub mod error;
pub mod fault_log;
pub mod metadata;
pub mod platform;
pub mod sim;
pub mod spi;

pub use config::DmcConfig;
pub use controller::Controller;
pub use controller::DmcState;
pub use device_ops::DeviceOperations;
pub use device_ops::DeviceOpsTable;
pub use platform::DmcEvent;
pub use platform::Platform;
