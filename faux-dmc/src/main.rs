// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use dmc_fwupdate::fault_log::FaultLogRecord;
use dmc_fwupdate::DmcConfig;
use dmc_messages::DeviceStatus;
use dmc_messages::DockIdentity;
use dmc_messages::DockStatus;
use dmc_messages::ImageType;
use dmc_messages::SerializedSize;
use dmc_messages::StatusCode;
use dmc_messages::VendorRequest;
use dmc_messages::FW_VERSION_SIZE;
use dmc_messages::MAX_RESPONSE_SIZE;
use serde_json::json;
use slog::debug;
use slog::info;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog_async::AsyncGuard;
use std::fs;
use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

mod dock;
mod host;
mod pack;

use dock::DockDevices;
use dock::StateDir;
use dock::UsbLink;
use host::PackageFile;

/// Command line program that simulates a dock management controller and
/// the host software that updates it.
#[derive(Parser, Debug)]
struct Args {
    #[clap(
        short,
        long,
        default_value = "info",
        value_parser = level_from_str,
        help = "Log level: {off,critical,error,warn,info,debug,trace}",
    )]
    log_level: Level,

    /// Write logs to a file instead of stderr.
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// Emit parseable JSON on stdout instead of "human-readable" data.
    #[clap(long, value_names = ["pretty"], value_parser = json_pretty_from_str)]
    json: Option<Option<JsonPretty>>,

    /// Directory holding the simulated dock's flash and devices.
    #[clap(long, env = "FAUX_DMC_STATE", default_value = "faux-dmc-state")]
    state_dir: PathBuf,

    /// Interval (in milliseconds) between state machine ticks.
    #[clap(
        long,
        default_value = "1",
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    tick_millis: u64,

    /// Maximum number of ticks to run while waiting for the dock to settle.
    #[clap(long, default_value = "100000")]
    max_ticks: usize,

    #[clap(subcommand)]
    command: Command,
}

fn level_from_str(s: &str) -> Result<Level> {
    if let Ok(level) = s.parse() {
        Ok(level)
    } else {
        bail!(format!("Invalid log level: {}", s))
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonPretty;

fn json_pretty_from_str(s: &str) -> Result<JsonPretty> {
    if s == "pretty" {
        Ok(JsonPretty)
    } else {
        bail!("expected \"pretty\"")
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Create a dock with erased flash in the state directory.
    Init {
        /// Dock configuration (topology, security, policy, flash layout).
        #[clap(long)]
        config: PathBuf,
        /// Running firmware of the controller and its external devices.
        #[clap(long)]
        devices: PathBuf,
        /// Size of the controller's internal flash, in rows.
        #[clap(long, default_value = "72")]
        flash_rows: u16,
    },

    /// Ask the dock for its update status.
    Status,

    /// Ask the dock for its identity.
    Identity,

    /// Run a Phase 1 update from a package file.
    Update {
        package: PathBuf,
        /// Signature block slot to present to the dock.
        #[clap(long, default_value = "0")]
        slot: usize,
    },

    /// Apply the package stored in SPI flash.
    TriggerPhase2,

    /// Abandon any update in progress.
    StateReset,

    /// Read the dock's persistent fault counters.
    FlashLog,

    /// Dump SPI flash contents.
    SpiRead {
        #[clap(value_parser = parse_int::parse::<u32>)]
        addr: u32,
        #[clap(value_parser = parse_int::parse::<usize>)]
        len: usize,
    },

    /// Power the dock on and let it run, e.g., to resume an interrupted
    /// update.
    Run {
        /// Ticks to run; defaults to running until the dock is idle.
        #[clap(long)]
        ticks: Option<usize>,
    },

    /// Build a composite package from a JSON manifest.
    Pack {
        manifest: PathBuf,
        #[clap(short, long)]
        out: PathBuf,
        /// Hex-encoded P-256 secret key to sign the package with.
        #[clap(long)]
        signing_key: Option<PathBuf>,
    },
}

fn build_logger(
    level: Level,
    path: Option<&Path>,
) -> Result<(Logger, AsyncGuard)> {
    fn make_drain<D: slog_term::Decorator + Send + 'static>(
        level: Level,
        decorator: D,
    ) -> (slog::Fuse<slog_async::Async>, AsyncGuard) {
        let drain = slog_term::FullFormat::new(decorator)
            .build()
            .filter_level(level)
            .fuse();
        let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
        (drain.fuse(), guard)
    }

    let (drain, guard) = if let Some(path) = path {
        let file = File::create(path).with_context(|| {
            format!("failed to create logfile {}", path.display())
        })?;
        make_drain(level, slog_term::PlainDecorator::new(file))
    } else {
        make_drain(level, slog_term::TermDecorator::new().build())
    };

    Ok((Logger::root(drain, o!("component" => "faux-dmc")), guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (log, log_guard) =
        build_logger(args.log_level, args.logfile.as_deref())?;

    let session = Session {
        state: StateDir::new(args.state_dir.clone()),
        tick: Duration::from_millis(args.tick_millis),
        max_ticks: args.max_ticks,
        json: args.json.is_some(),
        log,
    };
    let result = run_command(&session, args.command.clone()).await;

    let did_fail = result.is_err();
    let value = match result {
        Ok(Output::Json(value)) => Some(value),
        Ok(Output::Lines(lines)) => {
            for line in lines {
                println!("{line}");
            }
            None
        }
        Err(err) => {
            if args.json.is_some() {
                Some(json!({ "error": format!("{err:#}") }))
            } else {
                println!("Error: {err:#}");
                None
            }
        }
    };

    match (args.json, value) {
        (Some(Some(JsonPretty)), Some(value)) => {
            serde_json::to_writer_pretty(io::stdout().lock(), &value)
                .context("failed to write to stdout")?;
        }
        (Some(None), Some(value)) => {
            serde_json::to_writer(io::stdout().lock(), &value)
                .context("failed to write to stdout")?;
        }
        _ => {
            // nothing to do; already printed above
        }
    }

    if did_fail {
        drop(log_guard);
        std::process::exit(1);
    }

    Ok(())
}

/// Settings shared by every command.
struct Session {
    state: StateDir,
    tick: Duration,
    max_ticks: usize,
    json: bool,
    log: Logger,
}

impl Session {
    /// Power the dock on and let it reach its first idle state.
    async fn attach(&self) -> Result<UsbLink> {
        let dock = self.state.load(&self.log)?;
        let link = UsbLink::attach(dock, self.tick);
        let ticks = link.settle(self.max_ticks).await;
        debug!(self.log, "dock booted"; "ticks" => ticks);
        Ok(link)
    }
}

enum Output {
    Json(serde_json::Value),
    Lines(Vec<String>),
}

async fn run_command(session: &Session, command: Command) -> Result<Output> {
    let json = session.json;
    let log = &session.log;
    match command {
        Command::Init { config, devices, flash_rows } => {
            let config = DmcConfig::from_json(
                &fs::read_to_string(&config).with_context(|| {
                    format!("failed to read {}", config.display())
                })?,
            )
            .context("invalid dock configuration")?;
            let devices: DockDevices = serde_json::from_str(
                &fs::read_to_string(&devices).with_context(|| {
                    format!("failed to read {}", devices.display())
                })?,
            )
            .context("invalid devices file")?;
            session.state.init(&config, &devices, flash_rows)?;
            info!(log, "dock created"; "flash_rows" => flash_rows);
            if json {
                Ok(Output::Json(json!({ "ack": "init" })))
            } else {
                Ok(Output::Lines(vec!["dock created".to_string()]))
            }
        }
        Command::Status => {
            let link = session.attach().await?;
            let status = dock_status(&link).await;
            link.detach().await?;
            let status = status?;
            if json {
                Ok(Output::Json(dock_status_to_json(&status)))
            } else {
                Ok(Output::Lines(dock_status_to_lines(&status)))
            }
        }
        Command::Identity => {
            let link = session.attach().await?;
            let reply = link
                .control(
                    VendorRequest::GetDockIdentity {
                        length: DockIdentity::MAX_SIZE as u16,
                    },
                    &[],
                )
                .await;
            link.detach().await?;
            let (identity, _) =
                dmc_messages::deserialize::<DockIdentity>(&reply?)
                    .map_err(|err| anyhow!("bad identity response: {err}"))?;
            let vendor = String::from_utf8_lossy(identity.vendor());
            let product = String::from_utf8_lossy(identity.product());
            if json {
                Ok(Output::Json(json!({
                    "valid": identity.is_valid(),
                    "cdtt_version": identity.cdtt_version,
                    "vid": identity.vid,
                    "pid": identity.pid,
                    "device_id": identity.device_id,
                    "vendor": vendor,
                    "product": product,
                    "secured_only": identity.secured_only,
                    "model": <&str>::from(identity.model),
                })))
            } else {
                Ok(Output::Lines(vec![
                    format!("{vendor} {product}"),
                    format!(
                        "vid {:#06x} pid {:#06x} device {:#06x} cdtt v{}",
                        identity.vid,
                        identity.pid,
                        identity.device_id,
                        identity.cdtt_version,
                    ),
                    format!(
                        "model {}{}",
                        <&str>::from(identity.model),
                        if identity.secured_only { ", signed only" } else { "" },
                    ),
                ]))
            }
        }
        Command::Update { package, slot } => {
            let bytes = fs::read(&package).with_context(|| {
                format!("failed to read {}", package.display())
            })?;
            let package = PackageFile::from_bytes(bytes)?;
            let link = session.attach().await?;
            let report = host::update(&link, &package, slot, !json, log).await;
            // Any Phase 2 work the update kicked off runs to completion.
            link.settle(session.max_ticks).await;
            let status = dock_status(&link).await;
            link.detach().await?;
            let report = report?;
            let status = status?;
            if json {
                Ok(Output::Json(json!({
                    "outcome": status_code_to_json(report.outcome),
                    "images_requested": report.images_requested,
                    "rows_sent": report.rows_sent,
                    "reenumerated": report.reenumerated,
                    "dock_status": <&str>::from(status.status()),
                })))
            } else {
                Ok(Output::Lines(vec![
                    format!(
                        "update {} ({} images, {} rows)",
                        status_code_to_string(report.outcome),
                        report.images_requested,
                        report.rows_sent,
                    ),
                    format!("dock status: {}", <&str>::from(status.status())),
                ]))
            }
        }
        Command::TriggerPhase2 => {
            simple_request(session, VendorRequest::TriggerPhase2Update).await
        }
        Command::StateReset => {
            simple_request(session, VendorRequest::StateReset).await
        }
        Command::FlashLog => {
            let link = session.attach().await?;
            let reply = link
                .control(
                    VendorRequest::RetrieveFlashLog {
                        length: FaultLogRecord::MAX_SIZE as u16,
                    },
                    &[],
                )
                .await;
            link.detach().await?;
            let (record, _) =
                dmc_messages::deserialize::<FaultLogRecord>(&reply?)
                    .map_err(|err| anyhow!("bad flash log response: {err}"))?;
            if json {
                Ok(Output::Json(serde_json::to_value(record)?))
            } else {
                Ok(Output::Lines(vec![
                    format!("fw update failures:   {}", record.fw_update_failures),
                    format!("phase 1 auth failures: {}", record.phase1_auth_failures),
                    format!("phase 2 auth failures: {}", record.phase2_auth_failures),
                    format!("power cycles:          {}", record.power_cycles),
                ]))
            }
        }
        Command::SpiRead { addr, len } => {
            let link = session.attach().await?;
            let data = link.with_dock(|dock| dock.spi_contents(addr, len)).await;
            link.detach().await?;
            let data = data?;
            if json {
                Ok(Output::Json(json!({
                    "addr": addr,
                    "data": hex::encode(&data),
                })))
            } else {
                Ok(Output::Lines(hexdump(addr, &data)))
            }
        }
        Command::Run { ticks } => {
            let link = session.attach().await?;
            if let Some(ticks) = ticks {
                tokio::time::sleep(session.tick * ticks as u32).await;
            }
            let state = link.with_dock(|dock| dock.controller.state()).await;
            link.detach().await?;
            let state = <&str>::from(state);
            if json {
                Ok(Output::Json(json!({ "state": state })))
            } else {
                Ok(Output::Lines(vec![format!("state: {state}")]))
            }
        }
        Command::Pack { manifest, out, signing_key } => {
            let key = signing_key
                .as_deref()
                .map(pack::load_signing_key)
                .transpose()?;
            let packed = pack::pack(&manifest, key.as_ref())?;
            fs::write(&out, &packed.bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            let digest = hex::encode(packed.digest);
            let public_key = packed.public_key.as_deref().map(hex::encode);
            if json {
                Ok(Output::Json(json!({
                    "size": packed.bytes.len(),
                    "digest": digest,
                    "public_key": public_key,
                })))
            } else {
                let mut lines = vec![
                    format!("wrote {} bytes to {}", packed.bytes.len(), out.display()),
                    format!("digest:     {digest}"),
                ];
                if let Some(public_key) = public_key {
                    lines.push(format!("public key: {public_key}"));
                }
                Ok(Output::Lines(lines))
            }
        }
    }
}

/// Send a request with no data in either direction, then let the dock act
/// on it.
async fn simple_request(
    session: &Session,
    request: VendorRequest,
) -> Result<Output> {
    let link = session.attach().await?;
    let result = link.control(request, &[]).await;
    let status = match result {
        Ok(_) => {
            link.settle(session.max_ticks).await;
            dock_status(&link).await
        }
        Err(err) => Err(err),
    };
    link.detach().await?;
    let status = status?;
    let name = <&str>::from(request);
    if session.json {
        Ok(Output::Json(json!({
            "ack": name,
            "dock_status": <&str>::from(status.status()),
        })))
    } else {
        Ok(Output::Lines(vec![
            format!("{name} accepted"),
            format!("dock status: {}", <&str>::from(status.status())),
        ]))
    }
}

async fn dock_status(link: &UsbLink) -> Result<DockStatus> {
    let reply = link
        .control(
            VendorRequest::GetDockStatus { length: MAX_RESPONSE_SIZE as u16 },
            &[],
        )
        .await?;
    DockStatus::decode_response(&reply)
        .map_err(|err| anyhow!("bad dock status response: {err}"))
}

fn version_string(version: &[u8; FW_VERSION_SIZE]) -> String {
    let fw = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    let app =
        u32::from_le_bytes([version[4], version[5], version[6], version[7]]);
    format!("{fw}.{app}")
}

fn status_code_to_string(code: StatusCode) -> String {
    match code {
        StatusCode::Success => "succeeded".to_string(),
        StatusCode::InProgress => "in progress".to_string(),
        StatusCode::Idle => "idle".to_string(),
        StatusCode::Failed(n) => format!("failed ({n:#04x})"),
    }
}

fn status_code_to_json(code: StatusCode) -> serde_json::Value {
    match code {
        StatusCode::Success => json!("success"),
        StatusCode::InProgress => json!("in_progress"),
        StatusCode::Idle => json!("idle"),
        StatusCode::Failed(n) => json!({ "failed": n }),
    }
}

fn populated(status: &DockStatus) -> impl Iterator<Item = &DeviceStatus> {
    status.devices.iter().filter(|d| d.is_populated())
}

fn dock_status_to_json(status: &DockStatus) -> serde_json::Value {
    let devices = populated(status)
        .map(|d| {
            let images = [ImageType::Image1, ImageType::Image2].map(|image| {
                json!({
                    "status": <&str>::from(d.image_status(image)),
                    "version": version_string(d.version(image)),
                    "update_attempts": d.update_attempts(image),
                })
            });
            json!({
                "component_id": d.component_id(),
                "device_type": d.device_type().map(<&str>::from),
                "image_mode": d.image_mode().map(<&str>::from),
                "current_image": d.current_image().map(<&str>::from),
                "image1": images[0],
                "image2": images[1],
            })
        })
        .collect::<Vec<_>>();
    json!({
        "status": <&str>::from(status.status()),
        "composite_version": status.header.composite_version,
        "devices": devices,
    })
}

fn dock_status_to_lines(status: &DockStatus) -> Vec<String> {
    let mut lines = vec![
        format!("status: {}", <&str>::from(status.status())),
        format!("composite version: {}", status.header.composite_version),
    ];
    for d in populated(status) {
        lines.push(format!(
            "component {}: {} running {}",
            d.component_id(),
            d.device_type().map_or("unknown", <&str>::from),
            d.current_image().map_or("unknown", <&str>::from),
        ));
        for image in [ImageType::Image1, ImageType::Image2] {
            lines.push(format!(
                "    {:<6} {:<10} {} (attempts {})",
                <&str>::from(image),
                <&str>::from(d.image_status(image)),
                version_string(d.version(image)),
                d.update_attempts(image),
            ));
        }
    }
    lines
}

fn hexdump(addr: u32, data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            format!("{:08x}: {}", addr as usize + i * 16, hex::encode(chunk))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use dmc_fwupdate::config::Cdtt;
    use dmc_fwupdate::config::DeviceAccess;
    use dmc_fwupdate::config::DeviceTopology;
    use dmc_fwupdate::config::FlashLayout;
    use dmc_fwupdate::config::RowRange;
    use dmc_fwupdate::config::SecurityConfig;
    use dmc_fwupdate::config::SpiLayout;
    use dmc_fwupdate::config::UpdatePolicy;
    use dmc_fwupdate::device_ops::DmcFirmware;
    use dmc_fwupdate::sim::SimDevice;
    use dmc_messages::fw_version_bytes;
    use dmc_messages::DeviceType;
    use dmc_messages::DockStatusCode;
    use dmc_messages::ImageMode;
    use dmc_messages::ImageStatus;
    use dmc_messages::SignatureAlgorithm;
    use p256::ecdsa::SigningKey;
    use std::collections::BTreeMap;

    const SECRET: [u8; 32] = [0x2C; 32];

    fn test_logger() -> Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        Logger::root(drain, o!())
    }

    fn config(public_key: Vec<u8>) -> DmcConfig {
        let device = |component_id, device_type, image_mode, access| {
            DeviceTopology { component_id, device_type, image_mode, access }
        };
        DmcConfig {
            cdtt: Cdtt {
                cdtt_version: 2,
                vid: 0x04b4,
                pid: 0x5210,
                device_id: 7,
                vendor: "Dockworks".to_string(),
                product: "USB-C Travel Dock".to_string(),
                devices: vec![
                    device(
                        0,
                        DeviceType::DmcPmg1s3,
                        ImageMode::DualSymmetric,
                        DeviceAccess::Internal,
                    ),
                    device(
                        1,
                        DeviceType::Ccg5,
                        ImageMode::DualSymmetric,
                        DeviceAccess::Hpi { i2c_address: 0x08 },
                    ),
                    device(
                        3,
                        DeviceType::SpiComponent,
                        ImageMode::SingleImage,
                        DeviceAccess::Internal,
                    ),
                ],
            },
            security: SecurityConfig {
                secured_only: true,
                algorithm: SignatureAlgorithm::EcdsaP256,
                key_slot: 0,
                public_keys: vec![public_key],
            },
            policy: UpdatePolicy::default(),
            spi: Some(SpiLayout {
                primary_addr: 0,
                factory_addr: 0x10000,
                package_size: 0x10000,
            }),
            flash: FlashLayout {
                metadata_row: 0,
                metadata_rows_per_copy: 2,
                fault_log_row: 4,
                dmc_image1: RowRange { first: 8, count: 32 },
                dmc_image2: RowRange { first: 40, count: 32 },
            },
        }
    }

    fn devices() -> DockDevices {
        let v1 = fw_version_bytes(1, 0);
        DockDevices {
            dmc: DmcFirmware {
                running: ImageType::Image1,
                bootloader_version: fw_version_bytes(0, 1),
                image1_version: v1,
                image2_version: v1,
                image1_valid: true,
                image2_valid: true,
            },
            factory_condition: false,
            devices: BTreeMap::from([(1, SimDevice::new(ImageType::Image1, v1))]),
        }
    }

    fn write_manifest(dir: &Path, composite_version: u32) -> PathBuf {
        fs::write(dir.join("pd.bin"), vec![0x3C; 4 * 256]).unwrap();
        let manifest = json!({
            "cdtt_version": 2,
            "vid": 0x04b4,
            "pid": 0x5210,
            "device_id": 7,
            "composite_version": composite_version,
            "images": [{
                "device_type": DeviceType::Ccg5 as u8,
                "image_type": ImageType::Image2 as u8,
                "component_id": 1,
                "row_size": 256,
                "fw_version": 2,
                "segments": [[0x100, 4]],
                "file": "pd.bin",
            }],
        });
        let path = dir.join("manifest.json");
        fs::write(&path, manifest.to_string()).unwrap();
        path
    }

    fn session(dir: &Path) -> Session {
        Session {
            state: StateDir::new(dir.join("dock")),
            tick: Duration::from_millis(1),
            max_ticks: 100_000,
            json: true,
            log: test_logger(),
        }
    }

    #[tokio::test]
    async fn signed_update_over_usb() {
        let tmp = Utf8TempDir::new().unwrap();
        let dir = tmp.path().as_std_path();
        let key = SigningKey::from_slice(&SECRET).unwrap();
        let public =
            key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        let session = session(dir);
        session.state.init(&config(public), &devices(), 72).unwrap();

        let packed =
            pack::pack(&write_manifest(dir, 4), Some(&key)).unwrap();
        let package = PackageFile::from_bytes(packed.bytes).unwrap();

        let link = session.attach().await.unwrap();
        let report =
            host::update(&link, &package, 0, false, &session.log).await.unwrap();
        assert_eq!(report.outcome, StatusCode::Success);
        assert_eq!(report.images_requested, 1);
        assert_eq!(report.rows_sent, 4);
        assert!(report.reenumerated);
        link.detach().await.unwrap();

        // A fresh power-on sees the saved result.
        let link = session.attach().await.unwrap();
        let status = dock_status(&link).await.unwrap();
        link.detach().await.unwrap();
        assert_eq!(status.status(), DockStatusCode::Phase1UpdateComplete);
        assert_eq!(status.header.composite_version, 4);
        let pd = status.device(1).unwrap();
        assert_eq!(pd.image_status(ImageType::Image2), ImageStatus::Valid);
        assert_eq!(version_string(pd.version(ImageType::Image2)), "2.0");

        let saved: DockDevices = serde_json::from_str(
            &fs::read_to_string(dir.join("dock").join("devices.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.devices[&1u8].rows.len(), 4);
    }

    #[tokio::test]
    async fn unsigned_package_rejected_by_secured_dock() {
        let tmp = Utf8TempDir::new().unwrap();
        let dir = tmp.path().as_std_path();
        let key = SigningKey::from_slice(&SECRET).unwrap();
        let public =
            key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        let session = session(dir);
        session.state.init(&config(public), &devices(), 72).unwrap();

        let packed = pack::pack(&write_manifest(dir, 4), None).unwrap();
        let package = PackageFile::from_bytes(packed.bytes).unwrap();
        let link = session.attach().await.unwrap();
        let err = host::update(&link, &package, 0, false, &session.log)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("AuthenticationFailed"), "{err:#}");
        link.detach().await.unwrap();

        let out = run_command(&session, Command::FlashLog).await.unwrap();
        let Output::Json(value) = out else {
            panic!("expected JSON output");
        };
        assert_eq!(value["phase1_auth_failures"], 1);
    }

    #[tokio::test]
    async fn status_and_identity_commands() {
        let tmp = Utf8TempDir::new().unwrap();
        let dir = tmp.path().as_std_path();
        let session = session(dir);
        session.state.init(&config(vec![0x04; 65]), &devices(), 72).unwrap();

        let Output::Json(status) =
            run_command(&session, Command::Status).await.unwrap()
        else {
            panic!("expected JSON output");
        };
        assert_eq!(status["devices"][1]["component_id"], 1);
        assert_eq!(status["devices"][1]["device_type"], "Ccg5");

        let Output::Json(identity) =
            run_command(&session, Command::Identity).await.unwrap()
        else {
            panic!("expected JSON output");
        };
        assert_eq!(identity["product"], "USB-C Travel Dock");
        assert_eq!(identity["secured_only"], true);

        // No package in SPI flash yet.
        let Output::Json(trigger) =
            run_command(&session, Command::TriggerPhase2).await.unwrap()
        else {
            panic!("expected JSON output");
        };
        assert_eq!(trigger["dock_status"], "Phase2FailNoValidSpiPackage");
    }

    #[test]
    fn hexdump_lines_carry_addresses() {
        let lines = hexdump(0x100, &[0xAB; 20]);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "00000110: abababab");
    }
}
