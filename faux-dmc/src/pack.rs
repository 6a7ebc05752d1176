// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Build composite packages from a JSON manifest.

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use dmc_messages::fwct::FwctBuilder;
use dmc_messages::fwct::FwctIdentity;
use dmc_messages::fwct::ImageSpec;
use dmc_messages::DeviceType;
use dmc_messages::ImageType;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::Signature;
use p256::ecdsa::SigningKey;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub cdtt_version: u8,
    pub vid: u16,
    pub pid: u16,
    pub device_id: u16,
    pub composite_version: u32,
    pub images: Vec<ManifestImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestImage {
    pub device_type: DeviceType,
    pub image_type: ImageType,
    pub component_id: u8,
    pub row_size: usize,
    pub fw_version: u32,
    #[serde(default)]
    pub app_version: u32,
    /// `[start_row, row_count]` pairs; omitted for one segment from row 0.
    #[serde(default)]
    pub segments: Vec<(u16, u16)>,
    /// Image contents, relative to the manifest.
    pub file: String,
}

/// A package ready to write out.
#[derive(Debug, Clone)]
pub struct Packed {
    pub bytes: Vec<u8>,
    pub digest: [u8; 32],
    /// SEC1 public key matching the signature, if signed.
    pub public_key: Option<Vec<u8>>,
}

/// Read a hex-encoded P-256 secret scalar.
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let s = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let bytes = hex::decode(s.trim()).context("signing key is not hex")?;
    SigningKey::from_slice(&bytes)
        .map_err(|err| anyhow!("bad P-256 signing key: {err}"))
}

/// Build the package `manifest_path` describes, signing it with `key` if
/// given.
pub fn pack(manifest_path: &Path, key: Option<&SigningKey>) -> Result<Packed> {
    let manifest: Manifest = serde_json::from_str(
        &fs::read_to_string(manifest_path).with_context(|| {
            format!("failed to read {}", manifest_path.display())
        })?,
    )
    .with_context(|| format!("failed to parse {}", manifest_path.display()))?;
    let dir = manifest_path.parent().unwrap_or(Path::new("."));

    let identity = FwctIdentity {
        cdtt_version: manifest.cdtt_version,
        vid: manifest.vid,
        pid: manifest.pid,
        device_id: manifest.device_id,
    };
    let mut builder = FwctBuilder::new(identity, manifest.composite_version);
    for image in manifest.images {
        let path = dir.join(&image.file);
        let data = fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        builder = builder.image(ImageSpec {
            device_type: image.device_type,
            image_type: image.image_type,
            component_id: image.component_id,
            row_size: image.row_size,
            fw_version: image.fw_version,
            app_version: image.app_version,
            segments: image.segments,
            data,
        });
    }
    let package = builder
        .build()
        .map_err(|err| anyhow!("failed to build FWCT: {err}"))?;
    let digest = package.digest();

    let (bytes, public_key) = match key {
        Some(key) => {
            let sig: Signature = key
                .sign_prehash(&digest)
                .map_err(|err| anyhow!("failed to sign package: {err}"))?;
            let sig = sig.to_bytes();
            let bytes = package
                .to_spi_image(&[sig.as_slice()])
                .map_err(|err| anyhow!("failed to lay out package: {err}"))?;
            let public =
                key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
            (bytes, Some(public))
        }
        None => (
            package
                .to_spi_image(&[])
                .map_err(|err| anyhow!("failed to lay out package: {err}"))?,
            None,
        ),
    };
    Ok(Packed { bytes, digest, public_key })
}
