// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State owned by one update attempt. The controller drops the session when
//! the attempt ends, however it ends.

use crate::error::DeviceOpError;
use crate::metadata::Package;
use dmc_messages::fwct::Fwct;
use dmc_messages::fwct::FwctError;
use dmc_messages::fwct::FwctImage;
use dmc_messages::fwct::FwctInfo;
use dmc_messages::fwct::FwctSegment;
use dmc_messages::FwctAnalysisStatus;
use dmc_messages::StatusCode;
use sha2::Digest;
use sha2::Sha256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub(crate) enum Phase {
    /// Host-driven: the FWCT and every row arrive over USB.
    One,
    /// Dock-initiated: everything is read from a package in SPI flash.
    Two,
}

/// An FWCT copied out of its transfer buffer, with every descriptor
/// decoded.
#[derive(Debug, Clone)]
pub(crate) struct FwctTable {
    pub table: Vec<u8>,
    pub info: FwctInfo,
    pub images: Vec<(FwctImage, Vec<FwctSegment>)>,
}

impl FwctTable {
    pub fn parse(data: &[u8]) -> Result<Self, FwctError> {
        let fwct = Fwct::parse(data)?;
        let images = fwct
            .images()
            .map(|image| {
                let segments = fwct.segments(&image).collect();
                (image, segments)
            })
            .collect();
        Ok(Self { table: fwct.table().to_vec(), info: *fwct.info(), images })
    }

    pub fn composite_version(&self) -> u32 {
        self.info.composite_version.get()
    }

    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(&self.table).into()
    }
}

/// A hook that returned [`HookOutcome::Deferred`] and is being polled.
///
/// [`HookOutcome::Deferred`]: crate::device_ops::HookOutcome::Deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingHook {
    Prepare,
    WriteRow,
    Finish,
    Jump { component: u8 },
}

/// Where an image write goes after a row succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextRow {
    SameSegment,
    NextSegment,
    Done,
}

/// Progress through one image of the FWCT.
#[derive(Debug, Clone)]
pub(crate) struct ImageJob {
    pub image: FwctImage,
    segments: Vec<FwctSegment>,
    segment: usize,
    /// Row within the current segment.
    row: u16,
    /// Rows written over all segments.
    pub rows_done: u32,
    /// Bytes of the current row received so far (Phase 1).
    pub buf: Vec<u8>,
    hasher: Sha256,
    hashed: usize,
    /// `finish_update` has run for this image.
    pub finished: bool,
}

impl ImageJob {
    pub fn new(image: FwctImage, segments: Vec<FwctSegment>) -> Self {
        let mut job = Self {
            image,
            segments,
            segment: 0,
            row: 0,
            rows_done: 0,
            buf: Vec::with_capacity(image.row_size),
            hasher: Sha256::new(),
            hashed: 0,
            finished: false,
        };
        job.skip_empty_segments();
        job
    }

    fn skip_empty_segments(&mut self) {
        while self.segment().is_some_and(|s| s.row_count == 0) {
            self.segment += 1;
        }
    }

    /// Start the image over, e.g. for a retry.
    pub fn restart(&mut self) {
        *self = Self::new(self.image, std::mem::take(&mut self.segments));
    }

    pub fn component(&self) -> u8 {
        self.image.component_id
    }

    pub fn segment(&self) -> Option<FwctSegment> {
        self.segments.get(self.segment).copied()
    }

    /// The device row the next row of data goes to.
    pub fn device_row(&self) -> Option<u16> {
        self.segment().map(|s| s.start_row.wrapping_add(self.row))
    }

    /// Offset of the next row from the start of the image data.
    pub fn data_offset(&self) -> u32 {
        self.rows_done * self.image.row_size as u32
    }

    /// The image data the digest covers: its size rounded up to whole rows.
    fn digest_len(&self) -> usize {
        let size = self.image.size as usize;
        size.div_ceil(self.image.row_size) * self.image.row_size
    }

    /// Count one written row and move on to the next.
    pub fn advance(&mut self, data: &[u8]) -> NextRow {
        let take = self.digest_len().saturating_sub(self.hashed).min(data.len());
        self.hasher.update(&data[..take]);
        self.hashed += take;

        self.rows_done += 1;
        self.row += 1;
        self.buf.clear();
        let Some(segment) = self.segment() else {
            return NextRow::Done;
        };
        if self.row < segment.row_count {
            return NextRow::SameSegment;
        }
        self.segment += 1;
        self.row = 0;
        self.skip_empty_segments();
        if self.segment().is_some() {
            NextRow::NextSegment
        } else {
            NextRow::Done
        }
    }

    /// Whether the rows written hash to the digest in the FWCT.
    pub fn digest_matches(&self) -> bool {
        self.hashed == self.digest_len()
            && <[u8; 32]>::from(self.hasher.clone().finalize())
                == self.image.digest
    }
}

pub(crate) struct UpdateSession {
    pub phase: Phase,
    /// The SPI package a Phase 2 update reads from.
    pub package: Package,
    /// Phase 1: carried by `UpgradeStart`. Phase 2: read from SPI.
    pub signature: Option<Vec<u8>>,
    /// FWCT bytes as the host sent them.
    pub received: Vec<u8>,
    pub fwct: Option<FwctTable>,
    /// Why validation rejected the FWCT.
    pub failure: Option<FwctAnalysisStatus>,
    /// Next FWCT image for update analysis.
    pub cursor: usize,
    pub job: Option<ImageJob>,
    pub pending: Option<PendingHook>,
    pub row_result: Option<Result<(), DeviceOpError>>,
    pub last_row_status: StatusCode,
    /// Components to switch to their other image.
    pub jumps: Vec<u8>,
    /// The jump pass for external devices has run.
    pub jumped: bool,
    pub images_written: usize,
    pub spi_written: bool,
    /// Every image matches the FWCT.
    pub full: bool,
}

impl UpdateSession {
    pub fn new(phase: Phase, package: Package) -> Self {
        Self {
            phase,
            package,
            signature: None,
            received: Vec::new(),
            fwct: None,
            failure: None,
            cursor: 0,
            job: None,
            pending: None,
            row_result: None,
            last_row_status: StatusCode::Idle,
            jumps: Vec::new(),
            jumped: false,
            images_written: 0,
            spi_written: false,
            full: false,
        }
    }

    pub fn image(&self, index: usize) -> Option<(FwctImage, Vec<FwctSegment>)> {
        self.fwct.as_ref()?.images.get(index).cloned()
    }

    pub fn queue_jump(&mut self, component: u8) {
        if !self.jumps.contains(&component) {
            self.jumps.push(component);
        }
    }
}
