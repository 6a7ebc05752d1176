// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash-resident dock metadata, kept as two redundant copies.

use crate::config::FlashLayout;
use crate::error::FlashError;
use crate::error::MetadataError;
use crate::platform::FlashRows;
use dmc_messages::DeviceStatus;
use dmc_messages::DockStatus;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::o;
use slog::warn;
use slog::Logger;

/// "DM" in little-endian byte order.
pub const METADATA_SIGNATURE: u16 = u16::from_le_bytes(*b"DM");

const NO_TARGET: u8 = 0xFF;

#[derive(Debug, Clone, Copy, SerializedSize, Serialize, Deserialize)]
struct CopyHeader {
    signature: u16,
    length: u16,
    checksum: u32,
}

bitflags::bitflags! {
    /// Single-bit fields of the application status word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AppFlags: u16 {
        const CONSIDER_CRITICAL_UPDATE = 1 << 2;
        const FORCE_UPDATE = 1 << 5;
        const READ_DOCK_ID = 1 << 6;
        const FACTORY_BACKUP_DONE = 1 << 7;
    }
}

const TRIGGER_SHIFT: u16 = 0;
const TRIGGER_MASK: u16 = 0b11 << TRIGGER_SHIFT;
const CANDIDATE_SHIFT: u16 = 3;
const CANDIDATE_MASK: u16 = 0b11 << CANDIDATE_SHIFT;

/// Whether a Phase 2 update is due, and if so whether it has already been
/// started once (and is being resumed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum Phase2Trigger {
    None,
    New,
    Existing,
}

/// The SPI package Phase 2 reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum Package {
    Primary,
    Factory,
}

/// The persisted record, minus the copy header.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct DockMetadata {
    pub secured_only: bool,
    pub update_counter: u8,
    app_status: u16,
    pub phase2_update_counter: u8,
    pub soft_reset_pending: bool,
    active_component: u8,
    active_image: u8,
    pub cdtt_checksum: u32,
    pub status: DockStatus,
}

impl Default for DockMetadata {
    fn default() -> Self {
        Self {
            secured_only: false,
            update_counter: 0,
            app_status: 0,
            phase2_update_counter: 0,
            soft_reset_pending: false,
            active_component: NO_TARGET,
            active_image: NO_TARGET,
            cdtt_checksum: 0,
            status: DockStatus::default(),
        }
    }
}

impl DockMetadata {
    pub fn phase2_trigger(&self) -> Phase2Trigger {
        match (self.app_status & TRIGGER_MASK) >> TRIGGER_SHIFT {
            1 => Phase2Trigger::New,
            2 => Phase2Trigger::Existing,
            _ => Phase2Trigger::None,
        }
    }

    pub fn set_phase2_trigger(&mut self, trigger: Phase2Trigger) {
        let bits = match trigger {
            Phase2Trigger::None => 0,
            Phase2Trigger::New => 1,
            Phase2Trigger::Existing => 2,
        };
        self.app_status =
            (self.app_status & !TRIGGER_MASK) | (bits << TRIGGER_SHIFT);
    }

    /// Unset reads as the primary package.
    pub fn candidate_package(&self) -> Package {
        match (self.app_status & CANDIDATE_MASK) >> CANDIDATE_SHIFT {
            2 => Package::Factory,
            _ => Package::Primary,
        }
    }

    pub fn set_candidate_package(&mut self, package: Package) {
        let bits = match package {
            Package::Primary => 1,
            Package::Factory => 2,
        };
        self.app_status =
            (self.app_status & !CANDIDATE_MASK) | (bits << CANDIDATE_SHIFT);
    }

    pub fn app_flags(&self) -> AppFlags {
        AppFlags::from_bits_truncate(self.app_status)
    }

    pub fn set_app_flag(&mut self, flag: AppFlags, on: bool) {
        if on {
            self.app_status |= flag.bits();
        } else {
            self.app_status &= !flag.bits();
        }
    }

    /// The image being written when this record was committed, if any.
    pub fn active_target(&self) -> Option<(u8, ImageType)> {
        if self.active_component == NO_TARGET {
            return None;
        }
        let image = ImageType::try_from(self.active_image).ok()?;
        Some((self.active_component, image))
    }

    pub fn set_active_target(&mut self, target: Option<(u8, ImageType)>) {
        (self.active_component, self.active_image) = match target {
            Some((component, image)) => (component, image as u8),
            None => (NO_TARGET, NO_TARGET),
        };
    }
}

/// Outcome of reading both copies at power-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { copy: usize },
    /// Neither copy is intact; the caller rebuilds the record from live
    /// device queries.
    NoValidCopy,
}

pub struct MetadataStore {
    layout: FlashLayout,
    row_size: usize,
    ram: DockMetadata,
    /// The copy `load` chose; the other is overwritten first on commit.
    active: usize,
    log: Logger,
}

impl MetadataStore {
    pub const ENCODED_SIZE: usize =
        CopyHeader::MAX_SIZE + DockMetadata::MAX_SIZE;

    pub fn new(
        layout: &FlashLayout,
        row_size: usize,
        log: &Logger,
    ) -> Result<Self, MetadataError> {
        let have = usize::from(layout.metadata_rows_per_copy) * row_size;
        if have < Self::ENCODED_SIZE {
            return Err(MetadataError::RegionTooSmall {
                need: Self::ENCODED_SIZE,
                have,
            });
        }
        Ok(Self {
            layout: *layout,
            row_size,
            ram: DockMetadata::default(),
            active: 0,
            log: log.new(o!("component" => "metadata")),
        })
    }

    pub fn metadata(&self) -> &DockMetadata {
        &self.ram
    }

    pub fn metadata_mut(&mut self) -> &mut DockMetadata {
        &mut self.ram
    }

    pub fn replace(&mut self, metadata: DockMetadata) {
        self.ram = metadata;
    }

    pub fn device_status(&self, component_id: u8) -> Option<&DeviceStatus> {
        self.ram.status.device(component_id)
    }

    pub fn device_status_mut(
        &mut self,
        component_id: u8,
    ) -> Option<&mut DeviceStatus> {
        self.ram.status.device_mut(component_id)
    }

    /// Update one image nibble in RAM only; it reaches flash on the next
    /// [`MetadataStore::commit`]. Returns false for an unpopulated slot.
    pub fn set_ram_image_status(
        &mut self,
        component_id: u8,
        image: ImageType,
        status: ImageStatus,
    ) -> bool {
        match self.ram.status.device_mut(component_id) {
            Some(device) => {
                device.set_image_status(image, status);
                true
            }
            None => false,
        }
    }

    /// Read and validate both copies, keeping the newer intact one (copy 0
    /// on a tie).
    pub fn load(&mut self, flash: &mut dyn FlashRows) -> LoadOutcome {
        let copies = [self.read_copy(flash, 0), self.read_copy(flash, 1)];
        let chosen = match copies {
            [Some(a), Some(b)] => {
                // Counters wrap; the newer one is at most half the range
                // ahead.
                if (b.update_counter.wrapping_sub(a.update_counter) as i8) > 0 {
                    Some((1, b))
                } else {
                    Some((0, a))
                }
            }
            [Some(a), None] => Some((0, a)),
            [None, Some(b)] => Some((1, b)),
            [None, None] => None,
        };

        match chosen {
            Some((copy, metadata)) => {
                debug!(
                    self.log, "loaded metadata";
                    "copy" => copy,
                    "update_counter" => metadata.update_counter,
                );
                self.ram = metadata;
                self.active = copy;
                LoadOutcome::Loaded { copy }
            }
            None => {
                warn!(self.log, "no valid metadata copy");
                self.active = 0;
                LoadOutcome::NoValidCopy
            }
        }
    }

    /// Persist the RAM copy: the standby copy is written in full before the
    /// active one is touched, so one of them is always intact.
    pub fn commit(
        &mut self,
        flash: &mut dyn FlashRows,
        reset_counters: bool,
    ) -> Result<(), MetadataError> {
        self.ram.update_counter = if reset_counters {
            0
        } else {
            self.ram.update_counter.wrapping_add(1)
        };

        let mut buf = vec![
            0xFF;
            usize::from(self.layout.metadata_rows_per_copy)
                * self.row_size
        ];
        encode_copy(&self.ram, &mut buf)?;

        let standby = 1 - self.active;
        self.write_copy(flash, standby, &buf)
            .map_err(|err| MetadataError::Write { copy: standby, err })?;
        let active = self.active;
        if let Err(err) = self.write_copy(flash, active, &buf) {
            // The standby copy is the good one now.
            self.active = standby;
            return Err(MetadataError::Write { copy: active, err });
        }
        debug!(
            self.log, "committed metadata";
            "update_counter" => self.ram.update_counter,
        );
        Ok(())
    }

    fn write_copy(
        &self,
        flash: &mut dyn FlashRows,
        copy: usize,
        buf: &[u8],
    ) -> Result<(), FlashError> {
        let range = self.layout.metadata_copy(copy);
        for (row, chunk) in (range.first..).zip(buf.chunks(self.row_size)) {
            flash.write_row(row, chunk)?;
        }
        Ok(())
    }

    fn read_copy(
        &self,
        flash: &mut dyn FlashRows,
        copy: usize,
    ) -> Option<DockMetadata> {
        let range = self.layout.metadata_copy(copy);
        let mut buf = vec![0; usize::from(range.count) * self.row_size];
        for (row, chunk) in (range.first..).zip(buf.chunks_mut(self.row_size))
        {
            if let Err(err) = flash.read_row(row, chunk) {
                warn!(self.log, "metadata read failed"; "copy" => copy, &err);
                return None;
            }
        }
        let metadata = decode_copy(&buf);
        if metadata.is_none() {
            debug!(self.log, "metadata copy invalid"; "copy" => copy);
        }
        metadata
    }
}

fn byte_sum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |sum, b| sum.wrapping_add(u32::from(*b)))
}

fn encode_copy(
    metadata: &DockMetadata,
    out: &mut [u8],
) -> Result<usize, hubpack::error::Error> {
    if out.len() < CopyHeader::MAX_SIZE {
        return Err(hubpack::error::Error::Overrun);
    }
    let (header_buf, body_buf) = out.split_at_mut(CopyHeader::MAX_SIZE);
    let length = hubpack::serialize(body_buf, metadata)?;
    let header = CopyHeader {
        signature: METADATA_SIGNATURE,
        length: length as u16,
        checksum: 0u32.wrapping_sub(byte_sum(&body_buf[..length])),
    };
    hubpack::serialize(header_buf, &header)?;
    Ok(CopyHeader::MAX_SIZE + length)
}

fn decode_copy(data: &[u8]) -> Option<DockMetadata> {
    let (header, rest) = hubpack::deserialize::<CopyHeader>(data).ok()?;
    if header.signature != METADATA_SIGNATURE
        || usize::from(header.length) != DockMetadata::MAX_SIZE
    {
        return None;
    }
    let body = rest.get(..usize::from(header.length))?;
    if byte_sum(body).wrapping_add(header.checksum) != 0 {
        return None;
    }
    let (metadata, _) = hubpack::deserialize::<DockMetadata>(body).ok()?;
    Some(metadata)
}
