// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware Composite Table (FWCT) layout and parsing.
//!
//! An FWCT is a header, `image_count` image descriptors, and then the segment
//! descriptors of every image in image order. In an SPI package the table is
//! followed by a [`SignatureBlock`] and then the image data, each image at
//! its `img_offset` from the start of the package.

use crate::fw_version_bytes;
use crate::ImageType;
use crate::DIGEST_LEN;
use crate::FW_VERSION_SIZE;
use crate::MAX_DEV_COUNT;
use crate::MAX_SIG_LEN;
use crate::NUM_SIG_SLOTS;
use crate::ROW_SIZE_MULT;
use core::fmt;
use core::mem;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// "FWCT" in little-endian byte order.
pub const FWCT_SIGNATURE: u32 = 0x5443_5746;

/// At most two images per device slot.
pub const MAX_IMAGES: usize = 2 * MAX_DEV_COUNT;

pub const MAX_SEGMENTS: usize = 64;

pub const MAX_TABLE_SIZE: usize = FwctInfo::SIZE
    + MAX_IMAGES * FwctImageInfo::SIZE
    + MAX_SEGMENTS * FwctSegmentInfo::SIZE;

pub const SIGNATURE_BLOCK_SIZE: usize =
    mem::size_of::<U16>() + NUM_SIG_SLOTS * MAX_SIG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwctError {
    /// Fewer bytes than the structure being parsed.
    TooShort,
    /// The header does not start with "FWCT".
    BadSignature(u32),
    /// The header's `size` disagrees with the data or the descriptors.
    BadSize,
    BadChecksum,
    BadImageCount(u8),
    TooManySegments,
    /// Image descriptor `index` is malformed.
    BadImage { index: u8 },
    BadSignatureBlock,
}

impl fmt::Display for FwctError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "FWCT truncated"),
            Self::BadSignature(sig) => {
                write!(f, "bad FWCT signature {sig:#010x}")
            }
            Self::BadSize => write!(f, "FWCT size mismatch"),
            Self::BadChecksum => write!(f, "FWCT checksum mismatch"),
            Self::BadImageCount(n) => write!(f, "bad FWCT image count {n}"),
            Self::TooManySegments => write!(f, "too many FWCT segments"),
            Self::BadImage { index } => {
                write!(f, "malformed FWCT image descriptor {index}")
            }
            Self::BadSignatureBlock => write!(f, "malformed signature block"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FwctError {}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct FwctInfo {
    pub signature: U32,
    pub size: U16,
    pub checksum: u8,
    pub version: u8,
    pub custom_meta_type: u8,
    pub cdtt_version: u8,
    pub vid: U16,
    pub pid: U16,
    pub device_id: U16,
    pub reserved0: [u8; 16],
    pub composite_version: U32,
    pub image_count: u8,
    pub reserved1: [u8; 3],
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct FwctImageInfo {
    pub device_type: u8,
    pub img_type: u8,
    pub comp_id: u8,
    /// Row size in units of [`ROW_SIZE_MULT`] bytes.
    pub row_size: u8,
    pub reserved0: [u8; 4],
    pub fw_version: U32,
    pub app_version: U32,
    pub img_offset: U32,
    pub img_size: U32,
    pub img_digest: [u8; DIGEST_LEN],
    pub num_img_segments: u8,
    pub reserved1: [u8; 3],
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C)]
pub struct FwctSegmentInfo {
    pub img_id: u8,
    pub seg_type: u8,
    pub start_row: U16,
    pub num_rows: U16,
    pub reserved: [u8; 2],
}

impl FwctInfo {
    pub const SIZE: usize = mem::size_of::<Self>();
}

impl FwctImageInfo {
    pub const SIZE: usize = mem::size_of::<Self>();
}

impl FwctSegmentInfo {
    pub const SIZE: usize = mem::size_of::<Self>();
}

static_assertions::const_assert_eq!(FwctInfo::SIZE, 40);
static_assertions::const_assert_eq!(FwctImageInfo::SIZE, 60);
static_assertions::const_assert_eq!(FwctSegmentInfo::SIZE, 8);

/// Typed view of one image descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwctImage {
    /// Position of this image in the FWCT.
    pub index: u8,
    /// Raw device type; checked against the dock topology by the caller.
    pub device_type: u8,
    pub image_type: ImageType,
    pub component_id: u8,
    /// Row size in bytes.
    pub row_size: usize,
    pub version: [u8; FW_VERSION_SIZE],
    pub offset: u32,
    pub size: u32,
    pub digest: [u8; DIGEST_LEN],
    pub segment_count: u8,
    first_segment: usize,
}

impl FwctImage {
    /// Total number of rows over all of this image's segments.
    pub fn row_count(&self, fwct: &Fwct<'_>) -> usize {
        fwct.segments(self).map(|s| usize::from(s.row_count)).sum()
    }
}

/// Typed view of one segment descriptor: a run of consecutive device rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwctSegment {
    pub start_row: u16,
    pub row_count: u16,
}

/// A structurally validated FWCT.
#[derive(Debug, Clone, Copy)]
pub struct Fwct<'a> {
    info: FwctInfo,
    table: &'a [u8],
}

impl<'a> Fwct<'a> {
    /// Validate the table at the front of `data`. Bytes past the header's
    /// `size` are ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self, FwctError> {
        let (info, _) = FwctInfo::read_from_prefix(data)
            .map_err(|_| FwctError::TooShort)?;

        if info.signature.get() != FWCT_SIGNATURE {
            return Err(FwctError::BadSignature(info.signature.get()));
        }

        let size = usize::from(info.size.get());
        if size < FwctInfo::SIZE || size > MAX_TABLE_SIZE {
            return Err(FwctError::BadSize);
        }
        let table = data.get(..size).ok_or(FwctError::TooShort)?;

        if table.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) != 0 {
            return Err(FwctError::BadChecksum);
        }

        let count = usize::from(info.image_count);
        if count == 0 || count > MAX_IMAGES {
            return Err(FwctError::BadImageCount(info.image_count));
        }
        let images_end = FwctInfo::SIZE + count * FwctImageInfo::SIZE;
        if images_end > size {
            return Err(FwctError::BadSize);
        }

        let fwct = Self { info, table };
        let mut total_segments = 0;
        for index in 0..info.image_count {
            let raw = fwct.raw_image(usize::from(index))?;
            if ImageType::try_from(raw.img_type)
                .map_or(true, |t| t == ImageType::Bootloader)
                || raw.row_size == 0
                || raw.num_img_segments == 0
            {
                return Err(FwctError::BadImage { index });
            }
            total_segments += usize::from(raw.num_img_segments);
        }
        if total_segments > MAX_SEGMENTS {
            return Err(FwctError::TooManySegments);
        }
        if images_end + total_segments * FwctSegmentInfo::SIZE != size {
            return Err(FwctError::BadSize);
        }

        // Every image's segments must cover its data, and at least one row.
        for image in fwct.images() {
            let rows = image.row_count(&fwct);
            if rows == 0 || rows * image.row_size < image.size as usize {
                return Err(FwctError::BadImage { index: image.index });
            }
        }

        Ok(fwct)
    }

    pub fn info(&self) -> &FwctInfo {
        &self.info
    }

    /// The table bytes covered by the checksum and the signature.
    pub fn table(&self) -> &'a [u8] {
        self.table
    }

    pub fn composite_version(&self) -> u32 {
        self.info.composite_version.get()
    }

    pub fn image_count(&self) -> usize {
        usize::from(self.info.image_count)
    }

    fn raw_image(&self, index: usize) -> Result<FwctImageInfo, FwctError> {
        let start = FwctInfo::SIZE + index * FwctImageInfo::SIZE;
        let bytes = self
            .table
            .get(start..start + FwctImageInfo::SIZE)
            .ok_or(FwctError::TooShort)?;
        FwctImageInfo::read_from_bytes(bytes).map_err(|_| FwctError::TooShort)
    }

    pub fn image(&self, index: usize) -> Option<FwctImage> {
        if index >= self.image_count() {
            return None;
        }
        let raw = self.raw_image(index).ok()?;
        let mut first_segment = 0;
        for i in 0..index {
            first_segment +=
                usize::from(self.raw_image(i).ok()?.num_img_segments);
        }
        Some(FwctImage {
            index: index as u8,
            device_type: raw.device_type,
            image_type: ImageType::try_from(raw.img_type).ok()?,
            component_id: raw.comp_id,
            row_size: usize::from(raw.row_size) * ROW_SIZE_MULT,
            version: fw_version_bytes(
                raw.fw_version.get(),
                raw.app_version.get(),
            ),
            offset: raw.img_offset.get(),
            size: raw.img_size.get(),
            digest: raw.img_digest,
            segment_count: raw.num_img_segments,
            first_segment,
        })
    }

    pub fn images(&self) -> impl Iterator<Item = FwctImage> + '_ {
        (0..self.image_count()).filter_map(move |i| self.image(i))
    }

    pub fn segments(
        &self,
        image: &FwctImage,
    ) -> impl Iterator<Item = FwctSegment> + 'a {
        let segments_start =
            FwctInfo::SIZE + self.image_count() * FwctImageInfo::SIZE;
        let table = self.table;
        (image.first_segment
            ..image.first_segment + usize::from(image.segment_count))
            .filter_map(move |i| {
                let start = segments_start + i * FwctSegmentInfo::SIZE;
                let bytes = table.get(start..start + FwctSegmentInfo::SIZE)?;
                let raw = FwctSegmentInfo::read_from_bytes(bytes).ok()?;
                Some(FwctSegment {
                    start_row: raw.start_row.get(),
                    row_count: raw.num_rows.get(),
                })
            })
    }

    pub fn segment(&self, image: &FwctImage, n: usize) -> Option<FwctSegment> {
        self.segments(image).nth(n)
    }
}

/// The signature block that follows an FWCT in an SPI package.
#[derive(Debug, Clone, Copy)]
pub struct SignatureBlock<'a> {
    sig_len: usize,
    slots: [&'a [u8]; NUM_SIG_SLOTS],
}

impl<'a> SignatureBlock<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, FwctError> {
        let data = data
            .get(..SIGNATURE_BLOCK_SIZE)
            .ok_or(FwctError::TooShort)?;
        let (sig_len, rest) = U16::read_from_prefix(data)
            .map_err(|_| FwctError::TooShort)?;
        let sig_len = usize::from(sig_len.get());
        if sig_len == 0 || sig_len > MAX_SIG_LEN {
            return Err(FwctError::BadSignatureBlock);
        }
        let (slot0, slot1) = rest.split_at(MAX_SIG_LEN);
        Ok(Self { sig_len, slots: [slot0, slot1] })
    }

    pub fn signature_len(&self) -> usize {
        self.sig_len
    }

    pub fn signature(&self, slot: usize) -> Option<&'a [u8]> {
        self.slots.get(slot).map(|s| &s[..self.sig_len])
    }

    /// Build a block carrying `signatures` (at most one per slot, all the
    /// same length).
    pub fn encode(
        signatures: &[&[u8]],
        out: &mut [u8; SIGNATURE_BLOCK_SIZE],
    ) -> Result<(), FwctError> {
        let sig_len = signatures.first().map_or(0, |s| s.len());
        if signatures.len() > NUM_SIG_SLOTS
            || sig_len > MAX_SIG_LEN
            || signatures.iter().any(|s| s.len() != sig_len)
        {
            return Err(FwctError::BadSignatureBlock);
        }
        out.fill(0);
        out[..2].copy_from_slice(&(sig_len as u16).to_le_bytes());
        for (i, sig) in signatures.iter().enumerate() {
            let start = 2 + i * MAX_SIG_LEN;
            out[start..start + sig_len].copy_from_slice(sig);
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "std"))]
pub use builder::*;

#[cfg(any(test, feature = "std"))]
mod builder {
    use super::*;
    use crate::DeviceType;
    use sha2::Digest;
    use sha2::Sha256;

    /// Dock identity fields stamped into an FWCT header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FwctIdentity {
        pub cdtt_version: u8,
        pub vid: u16,
        pub pid: u16,
        pub device_id: u16,
    }

    /// One image to place in a composite package.
    #[derive(Debug, Clone)]
    pub struct ImageSpec {
        pub device_type: DeviceType,
        pub image_type: ImageType,
        pub component_id: u8,
        /// Row size in bytes; must be a multiple of [`ROW_SIZE_MULT`].
        pub row_size: usize,
        pub fw_version: u32,
        pub app_version: u32,
        /// `(start_row, row_count)` runs; empty means one segment starting
        /// at row 0 covering the whole image.
        pub segments: Vec<(u16, u16)>,
        pub data: Vec<u8>,
    }

    /// A built FWCT plus the row-padded image data it describes.
    #[derive(Debug, Clone)]
    pub struct CompositePackage {
        pub table: Vec<u8>,
        pub images: Vec<Vec<u8>>,
    }

    impl CompositePackage {
        /// SHA-256 over the table: the message a signer signs.
        pub fn digest(&self) -> [u8; DIGEST_LEN] {
            Sha256::digest(&self.table).into()
        }

        /// Lay out the package as stored in SPI flash.
        pub fn to_spi_image(
            &self,
            signatures: &[&[u8]],
        ) -> Result<Vec<u8>, FwctError> {
            // An unsigned package still carries an (all zero) block.
            let mut block = [0; SIGNATURE_BLOCK_SIZE];
            if !signatures.is_empty() {
                SignatureBlock::encode(signatures, &mut block)?;
            }

            let mut out = self.table.clone();
            out.extend_from_slice(&block);
            for image in &self.images {
                out.extend_from_slice(image);
            }
            Ok(out)
        }
    }

    #[derive(Debug, Clone)]
    pub struct FwctBuilder {
        identity: FwctIdentity,
        composite_version: u32,
        images: Vec<ImageSpec>,
    }

    impl FwctBuilder {
        pub fn new(identity: FwctIdentity, composite_version: u32) -> Self {
            Self { identity, composite_version, images: Vec::new() }
        }

        pub fn image(mut self, image: ImageSpec) -> Self {
            self.images.push(image);
            self
        }

        pub fn build(&self) -> Result<CompositePackage, FwctError> {
            let count = self.images.len();
            if count == 0 || count > MAX_IMAGES {
                return Err(FwctError::BadImageCount(count as u8));
            }

            let segments = self
                .images
                .iter()
                .map(|image| {
                    let rows = image.data.len().div_ceil(image.row_size.max(1));
                    if image.segments.is_empty() {
                        vec![(0, rows as u16)]
                    } else {
                        image.segments.clone()
                    }
                })
                .collect::<Vec<_>>();
            let total_segments: usize = segments.iter().map(Vec::len).sum();
            if total_segments > MAX_SEGMENTS {
                return Err(FwctError::TooManySegments);
            }

            let size = FwctInfo::SIZE
                + count * FwctImageInfo::SIZE
                + total_segments * FwctSegmentInfo::SIZE;

            let mut table = Vec::with_capacity(size);
            let info = FwctInfo {
                signature: FWCT_SIGNATURE.into(),
                size: (size as u16).into(),
                checksum: 0,
                version: 1,
                custom_meta_type: 0,
                cdtt_version: self.identity.cdtt_version,
                vid: self.identity.vid.into(),
                pid: self.identity.pid.into(),
                device_id: self.identity.device_id.into(),
                reserved0: [0; 16],
                composite_version: self.composite_version.into(),
                image_count: count as u8,
                reserved1: [0; 3],
            };
            table.extend_from_slice(info.as_bytes());

            let mut offset = size + SIGNATURE_BLOCK_SIZE;
            let mut padded_images = Vec::with_capacity(count);
            for (index, image) in self.images.iter().enumerate() {
                if image.row_size == 0
                    || image.row_size % ROW_SIZE_MULT != 0
                    || image.row_size / ROW_SIZE_MULT > usize::from(u8::MAX)
                    || image.image_type == ImageType::Bootloader
                {
                    return Err(FwctError::BadImage { index: index as u8 });
                }
                let mut data = image.data.clone();
                data.resize(
                    data.len().div_ceil(image.row_size) * image.row_size,
                    0xFF,
                );
                let raw = FwctImageInfo {
                    device_type: image.device_type as u8,
                    img_type: image.image_type as u8,
                    comp_id: image.component_id,
                    row_size: (image.row_size / ROW_SIZE_MULT) as u8,
                    reserved0: [0; 4],
                    fw_version: image.fw_version.into(),
                    app_version: image.app_version.into(),
                    img_offset: (offset as u32).into(),
                    img_size: (image.data.len() as u32).into(),
                    img_digest: Sha256::digest(&data).into(),
                    num_img_segments: segments[index].len() as u8,
                    reserved1: [0; 3],
                };
                table.extend_from_slice(raw.as_bytes());
                offset += data.len();
                padded_images.push(data);
            }

            for (index, runs) in segments.iter().enumerate() {
                for &(start_row, num_rows) in runs {
                    let raw = FwctSegmentInfo {
                        img_id: index as u8,
                        seg_type: 0,
                        start_row: start_row.into(),
                        num_rows: num_rows.into(),
                        reserved: [0; 2],
                    };
                    table.extend_from_slice(raw.as_bytes());
                }
            }

            let sum = table.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
            table[mem::offset_of!(FwctInfo, checksum)] = 0u8.wrapping_sub(sum);

            Ok(CompositePackage { table, images: padded_images })
        }
    }
}
