// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host side of a Phase 1 update: push a composite package to the dock
//! over its vendor interface.

use crate::dock::UsbLink;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use dmc_messages::fwct::Fwct;
use dmc_messages::fwct::FwctImage;
use dmc_messages::fwct::SignatureBlock;
use dmc_messages::fwct::SIGNATURE_BLOCK_SIZE;
use dmc_messages::EcdsaSignature;
use dmc_messages::Notification;
use dmc_messages::StatusCode;
use dmc_messages::VendorRequest;
use dmc_messages::ECDSA_SIG_LEN;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use sha2::Digest;
use sha2::Sha256;
use slog::debug;
use slog::info;
use slog::warn;
use slog::Logger;
use std::time::Duration;

/// Largest transfer on the bulk OUT endpoint.
pub const BULK_PACKET_SIZE: usize = 64;

/// How long to wait for the dock to ask for the next thing.
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// A composite package as laid out in SPI flash: FWCT, signature block,
/// then row-padded images.
#[derive(Debug, Clone)]
pub struct PackageFile {
    bytes: Vec<u8>,
    table_len: usize,
}

impl PackageFile {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let table_len = Fwct::parse(&bytes)
            .context("package does not start with an FWCT")?
            .table()
            .len();
        Ok(Self { bytes, table_len })
    }

    pub fn fwct(&self) -> Result<Fwct<'_>> {
        Fwct::parse(self.table()).context("corrupt FWCT")
    }

    pub fn table(&self) -> &[u8] {
        &self.bytes[..self.table_len]
    }

    /// SHA-256 of the table; what the package's signature covers.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.table()).into()
    }

    /// The ECDSA signature in `slot` of the signature block, if the package
    /// was signed.
    pub fn signature(&self, slot: usize) -> Result<Option<EcdsaSignature>> {
        let start = self.table().len();
        let Some(block) = self.bytes.get(start..start + SIGNATURE_BLOCK_SIZE)
        else {
            bail!("package truncated before its signature block");
        };
        let Ok(block) = SignatureBlock::parse(block) else {
            return Ok(None);
        };
        let Some(sig) = block.signature(slot) else {
            bail!("no signature slot {slot}");
        };
        let sig: [u8; ECDSA_SIG_LEN] = sig.try_into().with_context(|| {
            format!("{}-byte signature is not ECDSA-P256", sig.len())
        })?;
        Ok(Some(EcdsaSignature(sig)))
    }

    /// The row-padded data of `image`.
    pub fn image_data(&self, image: &FwctImage) -> Result<&[u8]> {
        let rows = image.row_count(&self.fwct()?);
        let start = image.offset as usize;
        let end = start + rows * image.row_size;
        self.bytes.get(start..end).with_context(|| {
            format!(
                "image {} ({rows} rows at {start:#x}) runs past the end of \
                 the package",
                image.index
            )
        })
    }
}

/// What the dock reported at the end of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub outcome: StatusCode,
    pub images_requested: usize,
    pub rows_sent: usize,
    pub reenumerated: bool,
}

/// Run a Phase 1 update of `package`, signed with the signature in `slot`
/// if the package carries one.
pub async fn update(
    link: &UsbLink,
    package: &PackageFile,
    slot: usize,
    progress: bool,
    log: &Logger,
) -> Result<UpdateReport> {
    let signature = package.signature(slot)?;
    let fwct = package.fwct()?;
    info!(
        log, "starting update";
        "composite_version" => fwct.composite_version(),
        "images" => fwct.image_count(),
        "signed" => signature.is_some(),
        "digest" => hex::encode(package.digest()),
    );

    match &signature {
        Some(sig) => {
            link.control(VendorRequest::UpgradeStart { signed: true }, &sig.0)
                .await?
        }
        None => {
            link.control(VendorRequest::UpgradeStart { signed: false }, &[])
                .await?
        }
    };
    let table = package.table();
    link.control(
        VendorRequest::FwctWrite { length: table.len() as u16 },
        table,
    )
    .await?;

    let mut report = UpdateReport {
        outcome: StatusCode::InProgress,
        images_requested: 0,
        rows_sent: 0,
        reenumerated: false,
    };
    loop {
        match link.interrupt(NOTIFICATION_TIMEOUT).await? {
            Notification::FwUpgradeRequest { image_index } => {
                let image = fwct
                    .image(usize::from(image_index))
                    .with_context(|| {
                        format!("dock asked for missing image {image_index}")
                    })?;
                report.images_requested += 1;
                report.rows_sent +=
                    send_image(link, package, &image, progress, log).await?;
            }
            Notification::ImageWriteStatus(code) => {
                debug!(log, "row written"; "status" => ?code);
            }
            Notification::FwctAnalysisStatus(reason) => {
                bail!("dock rejected the package: {}", <&str>::from(reason));
            }
            Notification::Reenumerate => {
                report.reenumerated = true;
            }
            Notification::FwUpgradeStatus(code) => {
                report.outcome = code;
                break;
            }
        }
    }

    // A dock that updated itself re-enumerates shortly after reporting.
    if !report.reenumerated {
        while let Ok(n) = link.interrupt(Duration::from_millis(500)).await {
            if matches!(n, Notification::Reenumerate) {
                report.reenumerated = true;
                break;
            }
        }
    }
    info!(
        log, "update finished";
        "outcome" => ?report.outcome,
        "rows" => report.rows_sent,
        "reenumerated" => report.reenumerated,
    );
    Ok(report)
}

/// Stream every segment of `image`, returning the number of rows the dock
/// accepted. Stops at the first row the dock fails to write; the dock
/// decides whether to ask again.
async fn send_image(
    link: &UsbLink,
    package: &PackageFile,
    image: &FwctImage,
    progress: bool,
    log: &Logger,
) -> Result<usize> {
    let fwct = package.fwct()?;
    let data = package.image_data(image)?;
    let log = log.new(slog::o!(
        "image" => image.index,
        "component" => image.component_id,
    ));

    let bar = if progress {
        ProgressBar::new(image.row_count(&fwct) as u64)
    } else {
        ProgressBar::hidden()
    };
    bar.set_style(
        ProgressStyle::with_template(
            "image {prefix} [{bar:40}] {pos}/{len} rows",
        )
        .context("bad progress template")?
        .progress_chars("=> "),
    );
    bar.set_prefix(image.index.to_string());

    let mut rows = data.chunks(image.row_size);
    let mut accepted = 0;
    for segment in fwct.segments(image).filter(|s| s.row_count > 0) {
        debug!(
            log, "writing segment";
            "start_row" => segment.start_row,
            "row_count" => segment.row_count,
        );
        link.control(
            VendorRequest::ImageWrite {
                start_row: segment.start_row,
                row_count: segment.row_count,
            },
            &[],
        )
        .await?;
        for _ in 0..segment.row_count {
            let row = rows.next().context("image data ran out")?;
            for packet in row.chunks(BULK_PACKET_SIZE) {
                link.bulk_out(packet).await?;
            }
            let status = row_status(link).await?;
            if status != StatusCode::Success {
                bar.abandon();
                warn!(log, "dock failed to write a row"; "status" => ?status);
                return Ok(accepted);
            }
            accepted += 1;
            bar.inc(1);
        }
    }
    bar.finish();
    Ok(accepted)
}

/// Poll `GetImageWriteStatus` until the row in flight settles.
async fn row_status(link: &UsbLink) -> Result<StatusCode> {
    let deadline = tokio::time::Instant::now() + NOTIFICATION_TIMEOUT;
    loop {
        let reply = link.control(VendorRequest::GetImageWriteStatus, &[]).await?;
        let status =
            StatusCode::from_byte(*reply.first().context("empty status")?);
        if status != StatusCode::InProgress {
            return Ok(status);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("row write did not finish (waited {NOTIFICATION_TIMEOUT:?})");
        }
        tokio::time::sleep(link.tick()).await;
    }
}
