// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types for responses and notifications sent from the DMC to the host, and
//! the status records they carry.

use crate::BadRequestReason;
use crate::DeviceType;
use crate::HubpackError;
use crate::ImageMode;
use crate::ImageType;
use crate::FW_VERSION_SIZE;
use crate::MAX_DEV_COUNT;
use core::fmt;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use serde_repr::Deserialize_repr;
use serde_repr::Serialize_repr;
use static_assertions::const_assert_eq;

/// Overall dock status code, persisted in [`DockStatusHeader`].
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
pub enum DockStatusCode {
    Idle = 0x00,
    Phase1UpdateInProgress = 0x01,
    Phase1UpdatePartial = 0x02,
    Phase1UpdateCompletePartial = 0x04,
    /// Phase 1 finished with every image valid; any Phase 2 work is still
    /// outstanding.
    Phase1UpdateComplete = 0x05,
    Phase2UpdateInProgress = 0x81,
    Phase2UpdatePartial = 0x82,
    Phase2FactoryBackup = 0x83,
    Phase2UpdateCompletePartial = 0x84,
    Phase2UpdateCompleteFull = 0x85,
    Phase2FailInvalidFwct = 0x86,
    Phase2FailInvalidDockIdentity = 0x87,
    Phase2FailInvalidCompositeVersion = 0x88,
    Phase2FailAuthenticationFailed = 0x89,
    Phase2FailInvalidAlgorithm = 0x8A,
    Phase2FailSpiReadFailed = 0x8B,
    Phase2FailNoValidKey = 0x8C,
    Phase2FailNoValidSpiPackage = 0x8D,
    Phase2FailRamInitFailed = 0x8E,
    Phase2FailFactoryBackupFailed = 0x8F,
    Phase2FailNoValidFactoryPackage = 0x90,
    Phase1UpdateFail = 0xFF,
}

impl DockStatusCode {
    /// Whether an update had started writing images and had not finished.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Self::Phase1UpdateInProgress
                | Self::Phase1UpdatePartial
                | Self::Phase2UpdateInProgress
                | Self::Phase2UpdatePartial
        )
    }

    pub fn is_phase2(self) -> bool {
        (self as u8) & 0x80 != 0 && self != Self::Phase1UpdateFail
    }

    pub fn is_failure(self) -> bool {
        self as u8 >= Self::Phase2FailInvalidFwct as u8
    }
}

impl TryFrom<u8> for DockStatusCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            0x00 => Self::Idle,
            0x01 => Self::Phase1UpdateInProgress,
            0x02 => Self::Phase1UpdatePartial,
            0x04 => Self::Phase1UpdateCompletePartial,
            0x05 => Self::Phase1UpdateComplete,
            0x81 => Self::Phase2UpdateInProgress,
            0x82 => Self::Phase2UpdatePartial,
            0x83 => Self::Phase2FactoryBackup,
            0x84 => Self::Phase2UpdateCompletePartial,
            0x85 => Self::Phase2UpdateCompleteFull,
            0x86 => Self::Phase2FailInvalidFwct,
            0x87 => Self::Phase2FailInvalidDockIdentity,
            0x88 => Self::Phase2FailInvalidCompositeVersion,
            0x89 => Self::Phase2FailAuthenticationFailed,
            0x8A => Self::Phase2FailInvalidAlgorithm,
            0x8B => Self::Phase2FailSpiReadFailed,
            0x8C => Self::Phase2FailNoValidKey,
            0x8D => Self::Phase2FailNoValidSpiPackage,
            0x8E => Self::Phase2FailRamInitFailed,
            0x8F => Self::Phase2FailFactoryBackupFailed,
            0x90 => Self::Phase2FailNoValidFactoryPackage,
            0xFF => Self::Phase1UpdateFail,
            _ => return Err(value),
        };
        Ok(code)
    }
}

/// Reason an FWCT was rejected before any image was written.
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
pub enum FwctAnalysisStatus {
    InvalidFwct = 0,
    InvalidDockIdentity = 1,
    InvalidCompositeVersion = 2,
    AuthenticationFailed = 3,
    InvalidAlgorithm = 4,
}

impl FwctAnalysisStatus {
    /// The persisted dock status recorded when Phase 2 fails for this
    /// reason.
    pub fn phase2_failure(self) -> DockStatusCode {
        match self {
            Self::InvalidFwct => DockStatusCode::Phase2FailInvalidFwct,
            Self::InvalidDockIdentity => {
                DockStatusCode::Phase2FailInvalidDockIdentity
            }
            Self::InvalidCompositeVersion => {
                DockStatusCode::Phase2FailInvalidCompositeVersion
            }
            Self::AuthenticationFailed => {
                DockStatusCode::Phase2FailAuthenticationFailed
            }
            Self::InvalidAlgorithm => DockStatusCode::Phase2FailInvalidAlgorithm,
        }
    }
}

impl TryFrom<u8> for FwctAnalysisStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::InvalidFwct),
            1 => Ok(Self::InvalidDockIdentity),
            2 => Ok(Self::InvalidCompositeVersion),
            3 => Ok(Self::AuthenticationFailed),
            4 => Ok(Self::InvalidAlgorithm),
            _ => Err(value),
        }
    }
}

/// Validity of one image slot, stored as a nibble.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize_repr,
    Deserialize_repr,
    strum_macros::IntoStaticStr,
)]
#[repr(u8)]
pub enum ImageStatus {
    Unknown = 0,
    Valid = 1,
    Invalid = 2,
    Recovery = 3,
    RecoveredFromSecondary = 4,
    NotSupported = 0xF,
}

impl ImageStatus {
    /// Decode a nibble; reserved values read as `Unknown`.
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0xF {
            1 => Self::Valid,
            2 => Self::Invalid,
            3 => Self::Recovery,
            4 => Self::RecoveredFromSecondary,
            0xF => Self::NotSupported,
            _ => Self::Unknown,
        }
    }
}

/// One-byte status returned by `GetImageWriteStatus` and
/// `GetUpgradeStatus`, and carried by status notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success,
    InProgress,
    Idle,
    /// Any value of 3 or above; `0xFF` when there is nothing more specific
    /// to say.
    Failed(u8),
}

impl StatusCode {
    pub const GENERIC_FAILURE: Self = Self::Failed(0xFF);

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::InProgress => 1,
            Self::Idle => 2,
            Self::Failed(code) => code.max(3),
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Success,
            1 => Self::InProgress,
            2 => Self::Idle,
            n => Self::Failed(n),
        }
    }
}

fn nibble(byte: u8, index: usize) -> u8 {
    (byte >> (4 * index)) & 0xF
}

fn set_nibble(byte: &mut u8, index: usize, value: u8) {
    let shift = 4 * index;
    *byte = (*byte & !(0xF << shift)) | ((value & 0xF) << shift);
}

/// Maximum value of a 4-bit update attempt counter.
pub const MAX_UPDATE_ATTEMPTS: u8 = 0xF;

/// Per-device status entry, exactly 32 bytes on the wire and in flash.
///
/// `img_status` packs the image 1 status in bits 3:0 and the image 2 status
/// in bits 7:4; `update_attempts` packs the attempt counters the same way.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct DeviceStatus {
    device_type: u8,
    component_id: u8,
    image_mode: u8,
    current_image: u8,
    img_status: u8,
    update_attempts: u8,
    pub device_specific: [u8; 2],
    bootloader_version: [u8; FW_VERSION_SIZE],
    image1_version: [u8; FW_VERSION_SIZE],
    image2_version: [u8; FW_VERSION_SIZE],
}

const_assert_eq!(DeviceStatus::MAX_SIZE, 32);

impl DeviceStatus {
    pub fn new(
        device_type: DeviceType,
        component_id: u8,
        image_mode: ImageMode,
    ) -> Self {
        Self {
            device_type: device_type as u8,
            component_id,
            image_mode: image_mode as u8,
            current_image: ImageType::Image1 as u8,
            ..Default::default()
        }
    }

    /// Whether this slot describes a device; unused slots are all zeros.
    pub fn is_populated(&self) -> bool {
        self.device_type != 0
    }

    pub fn device_type(&self) -> Option<DeviceType> {
        DeviceType::try_from(self.device_type).ok()
    }

    pub fn component_id(&self) -> u8 {
        self.component_id
    }

    pub fn image_mode(&self) -> Option<ImageMode> {
        ImageMode::try_from(self.image_mode).ok()
    }

    pub fn current_image(&self) -> Option<ImageType> {
        ImageType::try_from(self.current_image).ok()
    }

    pub fn set_current_image(&mut self, image: ImageType) {
        self.current_image = image as u8;
    }

    /// Status of an updatable slot. The bootloader has none and always
    /// reads as `NotSupported`.
    pub fn image_status(&self, image: ImageType) -> ImageStatus {
        match image.nibble_index() {
            Some(i) => ImageStatus::from_nibble(nibble(self.img_status, i)),
            None => ImageStatus::NotSupported,
        }
    }

    pub fn set_image_status(&mut self, image: ImageType, status: ImageStatus) {
        if let Some(i) = image.nibble_index() {
            set_nibble(&mut self.img_status, i, status as u8);
        }
    }

    pub fn update_attempts(&self, image: ImageType) -> u8 {
        match image.nibble_index() {
            Some(i) => nibble(self.update_attempts, i),
            None => 0,
        }
    }

    /// Count one more failed attempt, saturating at
    /// [`MAX_UPDATE_ATTEMPTS`]. Returns the new count.
    pub fn record_update_attempt(&mut self, image: ImageType) -> u8 {
        let Some(i) = image.nibble_index() else {
            return 0;
        };
        let count = nibble(self.update_attempts, i)
            .saturating_add(1)
            .min(MAX_UPDATE_ATTEMPTS);
        set_nibble(&mut self.update_attempts, i, count);
        count
    }

    pub fn clear_update_attempts(&mut self, image: ImageType) {
        if let Some(i) = image.nibble_index() {
            set_nibble(&mut self.update_attempts, i, 0);
        }
    }

    pub fn version(&self, image: ImageType) -> &[u8; FW_VERSION_SIZE] {
        match image {
            ImageType::Bootloader => &self.bootloader_version,
            ImageType::Image1 => &self.image1_version,
            ImageType::Image2 => &self.image2_version,
        }
    }

    pub fn set_version(
        &mut self,
        image: ImageType,
        version: [u8; FW_VERSION_SIZE],
    ) {
        match image {
            ImageType::Bootloader => self.bootloader_version = version,
            ImageType::Image1 => self.image1_version = version,
            ImageType::Image2 => self.image2_version = version,
        }
    }
}

/// Combine the FWCT's base and application versions into the 8-byte form
/// kept in [`DeviceStatus`].
pub fn fw_version_bytes(
    fw_version: u32,
    app_version: u32,
) -> [u8; FW_VERSION_SIZE] {
    let mut out = [0; FW_VERSION_SIZE];
    out[..4].copy_from_slice(&fw_version.to_le_bytes());
    out[4..].copy_from_slice(&app_version.to_le_bytes());
    out
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct DockStatusHeader {
    dock_status: u8,
    pub device_count: u8,
    /// Length of the `GetDockStatus` response, this header included.
    pub status_length: u16,
    pub composite_version: u32,
}

const_assert_eq!(DockStatusHeader::MAX_SIZE, 8);

impl DockStatusHeader {
    /// The status code; an unrecognized value reads as a Phase 1 failure.
    pub fn status(&self) -> DockStatusCode {
        DockStatusCode::try_from(self.dock_status)
            .unwrap_or(DockStatusCode::Phase1UpdateFail)
    }

    pub fn set_status(&mut self, code: DockStatusCode) {
        self.dock_status = code as u8;
    }
}

/// Dock status record: a header followed by one entry per device slot,
/// indexed by component ID.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct DockStatus {
    pub header: DockStatusHeader,
    pub devices: [DeviceStatus; MAX_DEV_COUNT],
}

const_assert_eq!(DockStatus::MAX_SIZE, 8 + 32 * MAX_DEV_COUNT);

impl DockStatus {
    pub fn status(&self) -> DockStatusCode {
        self.header.status()
    }

    pub fn set_status(&mut self, code: DockStatusCode) {
        self.header.set_status(code);
    }

    pub fn device(&self, component_id: u8) -> Option<&DeviceStatus> {
        self.devices
            .get(usize::from(component_id))
            .filter(|d| d.is_populated())
    }

    pub fn device_mut(
        &mut self,
        component_id: u8,
    ) -> Option<&mut DeviceStatus> {
        self.devices
            .get_mut(usize::from(component_id))
            .filter(|d| d.is_populated())
    }

    fn active_devices(&self) -> usize {
        usize::from(self.header.device_count).min(MAX_DEV_COUNT)
    }

    /// Recompute `status_length` from `device_count`.
    pub fn refresh_length(&mut self) {
        self.header.status_length = (DockStatusHeader::MAX_SIZE
            + self.active_devices() * DeviceStatus::MAX_SIZE)
            as u16;
    }

    /// Serialize the `GetDockStatus` response: the header and the first
    /// `device_count` entries.
    pub fn encode_response(&self, out: &mut [u8]) -> Result<usize, HubpackError> {
        let mut n = hubpack::serialize(out, &self.header)?;
        for device in &self.devices[..self.active_devices()] {
            n += hubpack::serialize(&mut out[n..], device)?;
        }
        Ok(n)
    }

    /// Parse a `GetDockStatus` response.
    pub fn decode_response(data: &[u8]) -> Result<Self, HubpackError> {
        let (header, mut rest) = hubpack::deserialize::<DockStatusHeader>(data)?;
        let mut status = DockStatus { header, ..Default::default() };
        for slot in status.devices.iter_mut().take(status.active_devices()) {
            let (device, r) = hubpack::deserialize::<DeviceStatus>(rest)?;
            *slot = device;
            rest = r;
        }
        Ok(status)
    }
}

/// How the host is expected to get a downloaded update applied.
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
pub enum UpdateModel {
    /// Images are applied as they are received.
    Immediate = 0,
    /// The host must send `TriggerPhase2Update` once the download is done.
    DownloadTrigger = 1,
}

/// Response to `GetDockIdentity`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct DockIdentity {
    /// Zero if the dock topology table is not valid.
    pub structure_version: u8,
    pub cdtt_version: u8,
    pub vid: u16,
    pub pid: u16,
    pub device_id: u16,
    pub vendor_string: [u8; 32],
    pub product_string: [u8; 32],
    pub secured_only: bool,
    pub model: UpdateModel,
}

const_assert_eq!(DockIdentity::MAX_SIZE, 74);

impl DockIdentity {
    pub const STRUCTURE_VERSION: u8 = 2;

    pub fn is_valid(&self) -> bool {
        self.structure_version != 0
    }

    /// The vendor string up to its first nul byte.
    pub fn vendor(&self) -> &[u8] {
        trim_nul(&self.vendor_string)
    }

    /// The product string up to its first nul byte.
    pub fn product(&self) -> &[u8] {
        trim_nul(&self.product_string)
    }
}

/// Copy `s` into a nul-padded fixed-size field, truncating if needed.
pub fn padded_string<const N: usize>(s: &[u8]) -> [u8; N] {
    let mut out = [0; N];
    let n = s.len().min(N);
    out[..n].copy_from_slice(&s[..n]);
    out
}

fn trim_nul(s: &[u8]) -> &[u8] {
    let end = s.iter().position(|&b| b == 0).unwrap_or(s.len());
    &s[..end]
}

/// Opcodes of the interrupt endpoint notifications.
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
pub enum IntOpcode {
    FwUpgradeRequest = 0x01,
    FwUpgradeStatus = 0x80,
    ImageWriteStatus = 0x81,
    Reenumerate = 0x82,
    FwctAnalysisStatus = 0x83,
}

/// Raw interrupt endpoint packet.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    SerializedSize,
    Serialize,
    Deserialize,
)]
pub struct IntEpMessage {
    pub opcode: u8,
    /// Number of meaningful bytes in `data`.
    pub length: u8,
    pub data: [u8; 8],
}

/// A decoded notification from the DMC to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum Notification {
    /// Ask the host to stream image `image_index` of the FWCT.
    FwUpgradeRequest { image_index: u8 },
    FwUpgradeStatus(StatusCode),
    ImageWriteStatus(StatusCode),
    Reenumerate,
    FwctAnalysisStatus(FwctAnalysisStatus),
}

impl From<Notification> for IntEpMessage {
    fn from(n: Notification) -> Self {
        let (opcode, length, byte) = match n {
            Notification::FwUpgradeRequest { image_index } => {
                (IntOpcode::FwUpgradeRequest, 1, image_index)
            }
            Notification::FwUpgradeStatus(code) => {
                (IntOpcode::FwUpgradeStatus, 1, code.as_byte())
            }
            Notification::ImageWriteStatus(code) => {
                (IntOpcode::ImageWriteStatus, 1, code.as_byte())
            }
            Notification::Reenumerate => (IntOpcode::Reenumerate, 0, 0),
            Notification::FwctAnalysisStatus(status) => {
                (IntOpcode::FwctAnalysisStatus, 1, status as u8)
            }
        };
        let mut data = [0; 8];
        data[0] = byte;
        IntEpMessage { opcode: opcode as u8, length, data }
    }
}

impl TryFrom<IntEpMessage> for Notification {
    type Error = BadRequestReason;

    fn try_from(msg: IntEpMessage) -> Result<Self, Self::Error> {
        let byte = msg.data[0];
        let n = match msg.opcode {
            0x01 => Self::FwUpgradeRequest { image_index: byte },
            0x80 => Self::FwUpgradeStatus(StatusCode::from_byte(byte)),
            0x81 => Self::ImageWriteStatus(StatusCode::from_byte(byte)),
            0x82 => Self::Reenumerate,
            0x83 => Self::FwctAnalysisStatus(
                FwctAnalysisStatus::try_from(byte)
                    .map_err(|_| BadRequestReason::BadValue)?,
            ),
            op => return Err(BadRequestReason::UnknownOpcode(op)),
        };
        Ok(n)
    }
}

/// Error returned to the host for a request; on the wire this is a stall.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub enum DmcError {
    BadRequest(BadRequestReason),
    /// A request argument does not fit the current update session.
    BadParam,
    /// The request is not valid in the current state.
    NotReady,
    /// A flash operation is in flight.
    Busy,
    /// The firmware build does not implement the request.
    NotSupported,
    /// The response does not fit the host's buffer.
    ResponseTooLarge,
}

impl fmt::Display for DmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(reason) => write!(f, "bad request: {reason}"),
            Self::BadParam => write!(f, "bad parameter"),
            Self::NotReady => write!(f, "not ready"),
            Self::Busy => write!(f, "busy"),
            Self::NotSupported => write!(f, "not supported"),
            Self::ResponseTooLarge => write!(f, "response too large"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DmcError {}

impl From<BadRequestReason> for DmcError {
    fn from(reason: BadRequestReason) -> Self {
        Self::BadRequest(reason)
    }
}
