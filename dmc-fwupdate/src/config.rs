// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build-time configuration of a dock: its topology table, security and
//! update policy, and where things live in internal and SPI flash.

use crate::error::ConfigError;
use dmc_messages::padded_string;
use dmc_messages::DeviceType;
use dmc_messages::DockIdentity;
use dmc_messages::ImageMode;
use dmc_messages::ImageType;
use dmc_messages::SignatureAlgorithm;
use dmc_messages::UpdateModel;
use dmc_messages::DMC_COMPONENT_ID;
use dmc_messages::MAX_DEV_COUNT;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::ops::Range;

/// Smallest SPI erase unit; package regions must be aligned to it.
pub const SPI_SECTOR_SIZE: u32 = 4 * 1024;

/// Largest composite package the SPI regions are sized for.
pub const MAX_PACKAGE_SIZE: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmcConfig {
    pub cdtt: Cdtt,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub policy: UpdatePolicy,
    /// Absent on docks without Phase 2 support.
    #[serde(default)]
    pub spi: Option<SpiLayout>,
    pub flash: FlashLayout,
}

impl DmcConfig {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cdtt.validate()?;
        self.policy.validate()?;
        self.flash.validate()?;

        if let Some(spi) = &self.spi {
            spi.validate()?;
        } else if self
            .cdtt
            .devices
            .iter()
            .any(|d| d.device_type == DeviceType::SpiComponent)
        {
            return Err(ConfigError::MissingSpiLayout);
        }

        if self.security.secured_only
            && usize::from(self.security.key_slot)
                >= dmc_messages::NUM_SIG_SLOTS
        {
            return Err(ConfigError::BadKeySlot(self.security.key_slot));
        }

        Ok(())
    }

    pub fn update_model(&self) -> UpdateModel {
        match self.policy.trigger {
            TriggerMode::Implicit => UpdateModel::Immediate,
            TriggerMode::Explicit => UpdateModel::DownloadTrigger,
        }
    }

    pub fn dock_identity(&self) -> DockIdentity {
        DockIdentity {
            structure_version: DockIdentity::STRUCTURE_VERSION,
            cdtt_version: self.cdtt.cdtt_version,
            vid: self.cdtt.vid,
            pid: self.cdtt.pid,
            device_id: self.cdtt.device_id,
            vendor_string: padded_string(self.cdtt.vendor.as_bytes()),
            product_string: padded_string(self.cdtt.product.as_bytes()),
            secured_only: self.security.secured_only,
            model: self.update_model(),
        }
    }
}

/// Composite dock topology table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdtt {
    pub cdtt_version: u8,
    pub vid: u16,
    pub pid: u16,
    pub device_id: u16,
    pub vendor: String,
    pub product: String,
    pub devices: Vec<DeviceTopology>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTopology {
    pub component_id: u8,
    pub device_type: DeviceType,
    pub image_mode: ImageMode,
    #[serde(default)]
    pub access: DeviceAccess,
}

/// How the dock controller reaches a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAccess {
    /// The dock controller's own flash, or SPI flash behind it.
    #[default]
    Internal,
    Hpi { i2c_address: u8 },
    I2c { i2c_address: u8 },
    Uart { port: u8 },
}

impl Cdtt {
    pub fn device(&self, component_id: u8) -> Option<&DeviceTopology> {
        self.devices.iter().find(|d| d.component_id == component_id)
    }

    /// A 32-bit byte sum over the table's canonical encoding. Metadata
    /// recorded under a different topology is discarded.
    pub fn checksum(&self) -> u32 {
        let mut bytes = vec![self.cdtt_version];
        bytes.extend_from_slice(&self.vid.to_le_bytes());
        bytes.extend_from_slice(&self.pid.to_le_bytes());
        bytes.extend_from_slice(&self.device_id.to_le_bytes());
        bytes.extend_from_slice(self.vendor.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.product.as_bytes());
        bytes.push(0);
        for d in &self.devices {
            bytes.push(d.component_id);
            bytes.push(d.device_type as u8);
            bytes.push(d.image_mode as u8);
            let (tag, param) = match d.access {
                DeviceAccess::Internal => (0, 0),
                DeviceAccess::Hpi { i2c_address } => (1, i2c_address),
                DeviceAccess::I2c { i2c_address } => (2, i2c_address),
                DeviceAccess::Uart { port } => (3, port),
            };
            bytes.push(tag);
            bytes.push(param);
        }
        bytes.iter().enumerate().fold(0u32, |sum, (i, b)| {
            // Weight by position so reordered devices change the sum.
            sum.wrapping_add(u32::from(*b).wrapping_mul(i as u32 + 1))
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.len() > MAX_DEV_COUNT {
            return Err(ConfigError::TooManyDevices(self.devices.len()));
        }
        let mut seen = BTreeSet::new();
        for d in &self.devices {
            if usize::from(d.component_id) >= MAX_DEV_COUNT {
                return Err(ConfigError::ComponentOutOfRange(d.component_id));
            }
            if !seen.insert(d.component_id) {
                return Err(ConfigError::DuplicateComponent(d.component_id));
            }
        }
        match self.device(DMC_COMPONENT_ID) {
            Some(d) if d.device_type.is_dmc() => Ok(()),
            _ => Err(ConfigError::MissingDmc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Only signed composite images are accepted.
    pub secured_only: bool,
    pub algorithm: SignatureAlgorithm,
    /// Signature slot (and public key) used to authenticate packages.
    pub key_slot: u8,
    #[serde(with = "hex_keys", default)]
    pub public_keys: Vec<Vec<u8>>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secured_only: false,
            algorithm: SignatureAlgorithm::EcdsaP256,
            key_slot: 0,
            public_keys: Vec::new(),
        }
    }
}

impl SecurityConfig {
    pub fn public_key(&self) -> Option<&[u8]> {
        self.public_keys
            .get(usize::from(self.key_slot))
            .map(Vec::as_slice)
            .filter(|k| !k.is_empty())
    }
}

mod hex_keys {
    use serde::de::Error;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        keys: &[Vec<u8>],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        s.collect_seq(keys.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| hex::decode(s).map_err(D::Error::custom))
            .collect()
    }
}

/// How a completed Phase 1 download gets applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Images are written as the FWCT is analyzed.
    #[default]
    Implicit,
    /// The controller waits for `TriggerPhase2Update` after the FWCT is
    /// accepted.
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePolicy {
    /// Reject composite versions older than the one last installed.
    pub version_check: bool,
    /// Per-image attempts before the image is left invalid.
    pub max_update_attempts: u8,
    pub trigger: TriggerMode,
    /// Phase 2 starts from the primary package before falling back to the
    /// factory package.
    pub max_phase2_attempts: u8,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            version_check: true,
            max_update_attempts: 3,
            trigger: TriggerMode::Implicit,
            max_phase2_attempts: 3,
        }
    }
}

impl UpdatePolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=dmc_messages::MAX_UPDATE_ATTEMPTS)
            .contains(&self.max_update_attempts)
        {
            return Err(ConfigError::BadMaxAttempts(self.max_update_attempts));
        }
        if self.max_phase2_attempts == 0 {
            return Err(ConfigError::BadMaxPhase2Attempts);
        }
        Ok(())
    }
}

/// Primary and factory composite packages in external SPI flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiLayout {
    pub primary_addr: u32,
    pub factory_addr: u32,
    /// Size reserved for each package.
    pub package_size: u32,
}

impl SpiLayout {
    fn validate(&self) -> Result<(), ConfigError> {
        for addr in [self.primary_addr, self.factory_addr] {
            if addr % SPI_SECTOR_SIZE != 0 {
                return Err(ConfigError::UnalignedSpiRegion(addr));
            }
        }
        if self.package_size == 0
            || self.package_size > MAX_PACKAGE_SIZE
            || self.package_size % SPI_SECTOR_SIZE != 0
        {
            return Err(ConfigError::BadPackageSize(self.package_size));
        }
        let primary = self.primary_addr..self.primary_addr + self.package_size;
        let factory = self.factory_addr..self.factory_addr + self.package_size;
        if overlaps(&primary, &factory) {
            return Err(ConfigError::OverlappingSpiRegions);
        }
        Ok(())
    }
}

/// A run of internal flash rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub first: u16,
    pub count: u16,
}

impl RowRange {
    pub fn rows(&self) -> Range<u32> {
        u32::from(self.first)..u32::from(self.first) + u32::from(self.count)
    }

    pub fn contains(&self, row: u16) -> bool {
        self.rows().contains(&u32::from(row))
    }
}

/// Where the dock controller keeps its own records and images in internal
/// flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    /// First row of metadata copy 0; copy 1 follows immediately.
    pub metadata_row: u16,
    pub metadata_rows_per_copy: u16,
    pub fault_log_row: u16,
    pub dmc_image1: RowRange,
    pub dmc_image2: RowRange,
}

impl FlashLayout {
    pub fn metadata_copy(&self, copy: usize) -> RowRange {
        RowRange {
            first: self.metadata_row
                + copy as u16 * self.metadata_rows_per_copy,
            count: self.metadata_rows_per_copy,
        }
    }

    pub fn dmc_image(&self, image: ImageType) -> Option<RowRange> {
        match image {
            ImageType::Bootloader => None,
            ImageType::Image1 => Some(self.dmc_image1),
            ImageType::Image2 => Some(self.dmc_image2),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.metadata_rows_per_copy == 0 {
            return Err(ConfigError::FlashLayout("empty metadata region"));
        }
        let metadata = u32::from(self.metadata_row)
            ..u32::from(self.metadata_row)
                + 2 * u32::from(self.metadata_rows_per_copy);
        if metadata.end > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::FlashLayout("metadata past last row"));
        }
        let fault_log =
            u32::from(self.fault_log_row)..u32::from(self.fault_log_row) + 1;
        let image1 = self.dmc_image1.rows();
        let image2 = self.dmc_image2.rows();

        if overlaps(&metadata, &fault_log) {
            return Err(ConfigError::FlashLayout("metadata and fault log"));
        }
        for image in [&image1, &image2] {
            if overlaps(&metadata, image) {
                return Err(ConfigError::FlashLayout("metadata and image"));
            }
            if overlaps(&fault_log, image) {
                return Err(ConfigError::FlashLayout("fault log and image"));
            }
        }
        if overlaps(&image1, &image2) {
            return Err(ConfigError::FlashLayout("image 1 and image 2"));
        }
        Ok(())
    }
}

fn overlaps(a: &Range<u32>, b: &Range<u32>) -> bool {
    a.start < b.end && b.start < a.end
}
