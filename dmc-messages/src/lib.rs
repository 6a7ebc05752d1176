// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

pub mod dmc_impl;
mod dmc_to_host;
pub mod fwct;
mod host_to_dmc;

use core::fmt;
use serde::Deserialize;
use serde::Serialize;
use serde_big_array::BigArray;
use serde_repr::Deserialize_repr;
use serde_repr::Serialize_repr;
use static_assertions::const_assert;

pub use hubpack::error::Error as HubpackError;
pub use hubpack::{deserialize, serialize, SerializedSize};

// Re-export all public types in our submodules for messages in either
// direction.
pub use dmc_to_host::*;
pub use host_to_dmc::*;

/// Number of device slots in the dock status record.
pub const MAX_DEV_COUNT: usize = 8;

/// Size of each version string carried in [`DeviceStatus`].
pub const FW_VERSION_SIZE: usize = 8;

/// FWCT row sizes are expressed in multiples of this many bytes.
pub const ROW_SIZE_MULT: usize = 64;

/// Size of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Size of one signature slot, large enough for the strongest supported
/// algorithm (RSA-2048).
pub const MAX_SIG_LEN: usize = 256;

/// Number of independent signature slots following an FWCT in SPI flash.
pub const NUM_SIG_SLOTS: usize = 2;

/// Size of the signature carried in the data stage of `UpgradeStart`.
pub const ECDSA_SIG_LEN: usize = 64;

/// Size of one control or bulk packet.
pub const EP0_PACKET_SIZE: usize = 64;

/// Maximum size in bytes of any device-to-host control response.
pub const MAX_RESPONSE_SIZE: usize = 512;

/// Component ID reserved for the dock management controller itself.
pub const DMC_COMPONENT_ID: u8 = 0;

const_assert!(DockStatus::MAX_SIZE <= MAX_RESPONSE_SIZE);
const_assert!(DockIdentity::MAX_SIZE <= MAX_RESPONSE_SIZE);

/// Firmware slot of a device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize_repr,
    Deserialize_repr,
    strum_macros::IntoStaticStr,
)]
#[repr(u8)]
pub enum ImageType {
    Bootloader = 0,
    Image1 = 1,
    Image2 = 2,
}

impl ImageType {
    /// Index of this slot in the packed per-image nibble pairs of
    /// [`DeviceStatus`]; the bootloader has no such slot.
    pub fn nibble_index(self) -> Option<usize> {
        match self {
            ImageType::Bootloader => None,
            ImageType::Image1 => Some(0),
            ImageType::Image2 => Some(1),
        }
    }

    /// The other updatable slot of a dual-image device.
    pub fn alternate(self) -> Option<Self> {
        match self {
            ImageType::Bootloader => None,
            ImageType::Image1 => Some(ImageType::Image2),
            ImageType::Image2 => Some(ImageType::Image1),
        }
    }
}

impl TryFrom<u8> for ImageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Bootloader),
            1 => Ok(Self::Image1),
            2 => Ok(Self::Image2),
            _ => Err(value),
        }
    }
}

/// How many application images a device carries and how it boots them.
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
pub enum ImageMode {
    SingleImage = 0,
    DualSymmetric = 1,
    DualAsymmetric = 2,
}

impl ImageMode {
    pub fn has_slot(self, image: ImageType) -> bool {
        match (self, image) {
            (_, ImageType::Bootloader) => false,
            (ImageMode::SingleImage, ImageType::Image1) => true,
            (ImageMode::SingleImage, ImageType::Image2) => false,
            (_, _) => true,
        }
    }
}

impl TryFrom<u8> for ImageMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::SingleImage),
            1 => Ok(Self::DualSymmetric),
            2 => Ok(Self::DualAsymmetric),
            _ => Err(value),
        }
    }
}

/// Device types that can appear in a dock topology.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    SerializedSize,
    Serialize_repr,
    Deserialize_repr,
    strum_macros::IntoStaticStr,
)]
#[repr(u8)]
pub enum DeviceType {
    Ccg3 = 0x01,
    DmcCy7c65219 = 0x02,
    Ccg4 = 0x03,
    Ccg5 = 0x04,
    Hx3 = 0x05,
    Hx3PdHub = 0x0A,
    Hx3PdPd = 0x0B,
    Ccg2 = 0x0D,
    TbtController = 0x0E,
    Ccg5c = 0x12,
    Ccg6 = 0x13,
    Ccg5Tbt = 0x17,
    Ccg5cTbt = 0x18,
    Goshen = 0x1D,
    Foxville = 0x1E,
    DmcPmg1s3 = 0xF0,
    Ccg7sc = 0xF1,
    SpiComponent = 0xFF,
}

impl DeviceType {
    /// Whether this type is a dock management controller, i.e., a valid
    /// type for component 0.
    pub fn is_dmc(self) -> bool {
        matches!(self, DeviceType::DmcCy7c65219 | DeviceType::DmcPmg1s3)
    }
}

impl TryFrom<u8> for DeviceType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let ty = match value {
            0x01 => Self::Ccg3,
            0x02 => Self::DmcCy7c65219,
            0x03 => Self::Ccg4,
            0x04 => Self::Ccg5,
            0x05 => Self::Hx3,
            0x0A => Self::Hx3PdHub,
            0x0B => Self::Hx3PdPd,
            0x0D => Self::Ccg2,
            0x0E => Self::TbtController,
            0x12 => Self::Ccg5c,
            0x13 => Self::Ccg6,
            0x17 => Self::Ccg5Tbt,
            0x18 => Self::Ccg5cTbt,
            0x1D => Self::Goshen,
            0x1E => Self::Foxville,
            0xF0 => Self::DmcPmg1s3,
            0xF1 => Self::Ccg7sc,
            0xFF => Self::SpiComponent,
            _ => return Err(value),
        };
        Ok(ty)
    }
}

/// Signature schemes a composite image may be signed with. All of them sign
/// a SHA-256 digest of the FWCT table.
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
pub enum SignatureAlgorithm {
    EcdsaP256 = 1,
    Rsa1024 = 2,
    Rsa2048 = 3,
}

impl SignatureAlgorithm {
    pub fn signature_len(self) -> usize {
        match self {
            SignatureAlgorithm::EcdsaP256 => ECDSA_SIG_LEN,
            SignatureAlgorithm::Rsa1024 => 128,
            SignatureAlgorithm::Rsa2048 => MAX_SIG_LEN,
        }
    }

    /// Identify the algorithm that produced a signature of `len` bytes.
    pub fn from_signature_len(len: usize) -> Option<Self> {
        [Self::EcdsaP256, Self::Rsa1024, Self::Rsa2048]
            .into_iter()
            .find(|alg| alg.signature_len() == len)
    }
}

/// Signature carried in the data stage of a signed `UpgradeStart`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct EcdsaSignature(#[serde(with = "BigArray")] pub [u8; ECDSA_SIG_LEN]);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub enum BadRequestReason {
    /// The setup packet carried an opcode we do not implement.
    UnknownOpcode(u8),
    /// The request's direction bit did not match the opcode.
    WrongDirection,
    /// The setup packet was not 8 bytes long.
    BadSetupPacket,
    /// The data stage length did not match what the opcode requires.
    BadLength { expected: u16, got: u16 },
    /// A request field held a value outside its domain.
    BadValue,
    /// The data stage failed to deserialize.
    DeserializationError,
}

impl fmt::Display for BadRequestReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode(op) => write!(f, "unknown opcode {op:#04x}"),
            Self::WrongDirection => write!(f, "wrong request direction"),
            Self::BadSetupPacket => write!(f, "malformed setup packet"),
            Self::BadLength { expected, got } => write!(
                f,
                "bad data stage length (expected {expected}, got {got})"
            ),
            Self::BadValue => write!(f, "request field out of range"),
            Self::DeserializationError => {
                write!(f, "failed to deserialize data stage")
            }
        }
    }
}
