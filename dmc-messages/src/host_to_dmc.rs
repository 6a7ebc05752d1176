// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types for requests sent from the host to the DMC over the control
//! endpoint.

use crate::fwct;
use crate::BadRequestReason;
use crate::ECDSA_SIG_LEN;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use serde_repr::Deserialize_repr;
use serde_repr::Serialize_repr;

/// `bmRequestType` for a vendor request to the device.
pub const REQUEST_TYPE_VENDOR_OUT: u8 = 0x40;

/// `bmRequestType` for a vendor request from the device.
pub const REQUEST_TYPE_VENDOR_IN: u8 = 0xC0;

const DIRECTION_IN: u8 = 0x80;

/// An 8-byte control transfer setup packet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & DIRECTION_IN != 0
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    SerializedSize,
    Serialize_repr,
    Deserialize_repr,
    strum_macros::IntoStaticStr,
)]
#[repr(u8)]
pub enum VendorOpcode {
    UpgradeStart = 0xD0,
    FwctWrite = 0xD2,
    ImageWrite = 0xD3,
    GetImageWriteStatus = 0xD4,
    GetUpgradeStatus = 0xD5,
    GetDockStatus = 0xD6,
    GetDockIdentity = 0xD7,
    StateReset = 0xD8,
    TriggerPhase2Update = 0xDA,
    RetrieveFlashLog = 0xDE,
}

impl VendorOpcode {
    /// Whether the opcode returns data to the host.
    pub fn is_device_to_host(self) -> bool {
        matches!(
            self,
            Self::GetImageWriteStatus
                | Self::GetUpgradeStatus
                | Self::GetDockStatus
                | Self::GetDockIdentity
                | Self::RetrieveFlashLog
        )
    }
}

impl TryFrom<u8> for VendorOpcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let op = match value {
            0xD0 => Self::UpgradeStart,
            0xD2 => Self::FwctWrite,
            0xD3 => Self::ImageWrite,
            0xD4 => Self::GetImageWriteStatus,
            0xD5 => Self::GetUpgradeStatus,
            0xD6 => Self::GetDockStatus,
            0xD7 => Self::GetDockIdentity,
            0xD8 => Self::StateReset,
            0xDA => Self::TriggerPhase2Update,
            0xDE => Self::RetrieveFlashLog,
            _ => return Err(value),
        };
        Ok(op)
    }
}

/// A decoded vendor request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum VendorRequest {
    /// Begin a Phase 1 update. A signed start carries an
    /// [`EcdsaSignature`](crate::EcdsaSignature) in the data stage.
    UpgradeStart { signed: bool },
    FwctWrite { length: u16 },
    /// Announce the rows of one image segment; the rows themselves follow on
    /// the bulk path.
    ImageWrite { start_row: u16, row_count: u16 },
    GetImageWriteStatus,
    GetUpgradeStatus,
    GetDockStatus { length: u16 },
    GetDockIdentity { length: u16 },
    StateReset,
    TriggerPhase2Update,
    RetrieveFlashLog { length: u16 },
}

impl VendorRequest {
    pub fn opcode(&self) -> VendorOpcode {
        match self {
            Self::UpgradeStart { .. } => VendorOpcode::UpgradeStart,
            Self::FwctWrite { .. } => VendorOpcode::FwctWrite,
            Self::ImageWrite { .. } => VendorOpcode::ImageWrite,
            Self::GetImageWriteStatus => VendorOpcode::GetImageWriteStatus,
            Self::GetUpgradeStatus => VendorOpcode::GetUpgradeStatus,
            Self::GetDockStatus { .. } => VendorOpcode::GetDockStatus,
            Self::GetDockIdentity { .. } => VendorOpcode::GetDockIdentity,
            Self::StateReset => VendorOpcode::StateReset,
            Self::TriggerPhase2Update => VendorOpcode::TriggerPhase2Update,
            Self::RetrieveFlashLog { .. } => VendorOpcode::RetrieveFlashLog,
        }
    }

    /// Decode and validate a setup packet.
    pub fn from_setup(setup: &SetupPacket) -> Result<Self, BadRequestReason> {
        let opcode = VendorOpcode::try_from(setup.request)
            .map_err(BadRequestReason::UnknownOpcode)?;

        if opcode.is_device_to_host() != setup.is_device_to_host() {
            return Err(BadRequestReason::WrongDirection);
        }

        let expect_len = |expected: u16| {
            if setup.length == expected {
                Ok(())
            } else {
                Err(BadRequestReason::BadLength {
                    expected,
                    got: setup.length,
                })
            }
        };

        let request = match opcode {
            VendorOpcode::UpgradeStart => {
                let signed = match setup.value {
                    0 => false,
                    1 => true,
                    _ => return Err(BadRequestReason::BadValue),
                };
                expect_len(if signed { ECDSA_SIG_LEN as u16 } else { 0 })?;
                Self::UpgradeStart { signed }
            }
            VendorOpcode::FwctWrite => {
                let length = setup.length;
                if usize::from(length) < fwct::FwctInfo::SIZE
                    || usize::from(length) > fwct::MAX_TABLE_SIZE
                {
                    return Err(BadRequestReason::BadValue);
                }
                Self::FwctWrite { length }
            }
            VendorOpcode::ImageWrite => {
                expect_len(0)?;
                if setup.index == 0 {
                    return Err(BadRequestReason::BadValue);
                }
                Self::ImageWrite {
                    start_row: setup.value,
                    row_count: setup.index,
                }
            }
            VendorOpcode::GetImageWriteStatus => {
                expect_len(1)?;
                Self::GetImageWriteStatus
            }
            VendorOpcode::GetUpgradeStatus => {
                expect_len(1)?;
                Self::GetUpgradeStatus
            }
            VendorOpcode::GetDockStatus => {
                Self::GetDockStatus { length: setup.length }
            }
            VendorOpcode::GetDockIdentity => {
                Self::GetDockIdentity { length: setup.length }
            }
            VendorOpcode::StateReset => {
                expect_len(0)?;
                Self::StateReset
            }
            VendorOpcode::TriggerPhase2Update => {
                expect_len(0)?;
                Self::TriggerPhase2Update
            }
            VendorOpcode::RetrieveFlashLog => {
                Self::RetrieveFlashLog { length: setup.length }
            }
        };

        Ok(request)
    }

    /// Encode this request as a setup packet.
    pub fn to_setup(&self) -> SetupPacket {
        let opcode = self.opcode();
        let request_type = if opcode.is_device_to_host() {
            REQUEST_TYPE_VENDOR_IN
        } else {
            REQUEST_TYPE_VENDOR_OUT
        };
        let (value, index, length) = match *self {
            Self::UpgradeStart { signed: false } => (0, 0, 0),
            Self::UpgradeStart { signed: true } => (1, 0, ECDSA_SIG_LEN as u16),
            Self::FwctWrite { length } => (0, 0, length),
            Self::ImageWrite { start_row, row_count } => {
                (start_row, row_count, 0)
            }
            Self::GetImageWriteStatus | Self::GetUpgradeStatus => (0, 0, 1),
            Self::GetDockStatus { length }
            | Self::GetDockIdentity { length }
            | Self::RetrieveFlashLog { length } => (0, 0, length),
            Self::StateReset | Self::TriggerPhase2Update => (0, 0, 0),
        };
        SetupPacket {
            request_type,
            request: opcode as u8,
            value,
            index,
            length,
        }
    }
}
