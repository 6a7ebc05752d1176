// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use dmc_messages::DeviceType;
use slog_error_chain::SlogInlineError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum FlashError {
    #[error("flash row {row} out of range")]
    RowOutOfRange { row: u16 },
    #[error("row buffer is {got} bytes, row size is {expected}")]
    BadRowLength { expected: usize, got: usize },
    #[error("failed to write flash row {row}")]
    WriteFailed { row: u16 },
    #[error("failed to read flash row {row}")]
    ReadFailed { row: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum SpiError {
    #[error("SPI range {addr:#x}+{len:#x} out of bounds")]
    OutOfBounds { addr: u32, len: usize },
    #[error("SPI read at {addr:#x} failed")]
    ReadFailed { addr: u32 },
    #[error("SPI program at {addr:#x} failed")]
    WriteFailed { addr: u32 },
    #[error("SPI erase at {addr:#x} failed")]
    EraseFailed { addr: u32 },
    #[error("failed to set SPI write enable")]
    WriteEnable,
    #[error("an SPI operation is already in progress")]
    Busy,
    #[error("no SPI flash is configured")]
    NotConfigured,
}

#[derive(Debug, Error, SlogInlineError)]
pub enum MetadataError {
    #[error("failed to write metadata copy {copy}")]
    Write {
        copy: usize,
        #[source]
        err: FlashError,
    },
    #[error("metadata needs {need} bytes per copy but only {have} are reserved")]
    RegionTooSmall { need: usize, have: usize },
    #[error("failed to serialize metadata")]
    Serialize(#[from] hubpack::error::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, SlogInlineError)]
pub enum DeviceOpError {
    #[error("device {component} did not respond")]
    NoResponse { component: u8 },
    #[error("device {component} rejected row {row}")]
    RowRejected { component: u8, row: u16 },
    #[error("device {component} cannot {operation}")]
    Unsupported { component: u8, operation: &'static str },
    #[error("device {component}: {message}")]
    Transport { component: u8, message: String },
    #[error(transparent)]
    Spi(#[from] SpiError),
    #[error(transparent)]
    Flash(#[from] FlashError),
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigError {
    #[error("topology lists {0} devices (at most 8 are supported)")]
    TooManyDevices(usize),
    #[error("component {0} appears more than once in the topology")]
    DuplicateComponent(u8),
    #[error("component {0} is outside the device status array")]
    ComponentOutOfRange(u8),
    #[error("component 0 must be a dock management controller")]
    MissingDmc,
    #[error("no device operations registered for {0:?}")]
    UnsupportedDeviceType(DeviceType),
    #[error("max update attempts {0} outside 1..=15")]
    BadMaxAttempts(u8),
    #[error("max Phase 2 attempts must be at least 1")]
    BadMaxPhase2Attempts,
    #[error("SPI address {0:#x} is not 4 KiB aligned")]
    UnalignedSpiRegion(u32),
    #[error("SPI package size {0:#x} is out of range")]
    BadPackageSize(u32),
    #[error("SPI primary and factory regions overlap")]
    OverlappingSpiRegions,
    #[error("topology has an SPI component but no SPI layout")]
    MissingSpiLayout,
    #[error("an SPI layout is configured but no SPI flash was supplied")]
    MissingSpiFlash,
    #[error("internal flash regions overlap: {0}")]
    FlashLayout(&'static str),
    #[error("key slot {0} is out of range")]
    BadKeySlot(u8),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("failed to parse configuration")]
    Json(#[from] serde_json::Error),
}
