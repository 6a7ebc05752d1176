// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent failure counters, returned to the host by
//! `RetrieveFlashLog`.

use crate::error::FlashError;
use crate::platform::FlashRows;
use dmc_messages::HubpackError;
use hubpack::SerializedSize;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::Logger;

/// "CY" in little-endian byte order.
pub const FAULT_LOG_SIGNATURE: u16 = u16::from_le_bytes(*b"CY");

pub const FAULT_LOG_VERSION: u8 = 1;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, SerializedSize, Serialize, Deserialize,
)]
pub struct FaultLogRecord {
    pub signature: u16,
    pub version: u8,
    pub fw_update_failures: u16,
    pub phase1_auth_failures: u16,
    pub phase2_auth_failures: u16,
    pub power_cycles: u16,
    /// Makes the byte sum of the encoded record zero.
    pub checksum: u8,
}

impl Default for FaultLogRecord {
    fn default() -> Self {
        Self {
            signature: FAULT_LOG_SIGNATURE,
            version: FAULT_LOG_VERSION,
            fw_update_failures: 0,
            phase1_auth_failures: 0,
            phase2_auth_failures: 0,
            power_cycles: 0,
            checksum: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum Fault {
    FwUpdateFailure,
    Phase1AuthFailure,
    Phase2AuthFailure,
    PowerCycle,
}

pub struct FaultLog {
    row: u16,
    record: FaultLogRecord,
}

impl FaultLog {
    /// Read the log from `row`, starting a fresh one if it is absent or
    /// corrupt.
    pub fn load(row: u16, flash: &mut dyn FlashRows, log: &Logger) -> Self {
        let mut buf = vec![0; flash.row_size()];
        let record = flash
            .read_row(row, &mut buf)
            .ok()
            .and_then(|()| decode(&buf))
            .unwrap_or_else(|| {
                debug!(log, "starting a new fault log"; "row" => row);
                FaultLogRecord::default()
            });
        Self { row, record }
    }

    pub fn record(&self) -> &FaultLogRecord {
        &self.record
    }

    /// Count one occurrence of `fault` and persist the log.
    pub fn count(
        &mut self,
        flash: &mut dyn FlashRows,
        fault: Fault,
    ) -> Result<(), FlashError> {
        let counter = match fault {
            Fault::FwUpdateFailure => &mut self.record.fw_update_failures,
            Fault::Phase1AuthFailure => &mut self.record.phase1_auth_failures,
            Fault::Phase2AuthFailure => &mut self.record.phase2_auth_failures,
            Fault::PowerCycle => &mut self.record.power_cycles,
        };
        *counter = counter.saturating_add(1);

        let mut buf = vec![0xFF; flash.row_size()];
        // The row size is checked against the record size at start-up.
        encode(&mut self.record, &mut buf)
            .map_err(|_| FlashError::BadRowLength {
                expected: FaultLogRecord::MAX_SIZE,
                got: buf.len(),
            })?;
        flash.write_row(self.row, &buf)
    }

    /// The response to `RetrieveFlashLog`.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, HubpackError> {
        hubpack::serialize(out, &self.record)
    }
}

fn encode(
    record: &mut FaultLogRecord,
    out: &mut [u8],
) -> Result<usize, HubpackError> {
    record.checksum = 0;
    let n = hubpack::serialize(out, record)?;
    let sum = out[..n].iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
    record.checksum = 0u8.wrapping_sub(sum);
    hubpack::serialize(out, record)
}

fn decode(data: &[u8]) -> Option<FaultLogRecord> {
    let (record, _) = hubpack::deserialize::<FaultLogRecord>(data).ok()?;
    let sum = data[..FaultLogRecord::MAX_SIZE]
        .iter()
        .fold(0u8, |sum, b| sum.wrapping_add(*b));
    (record.signature == FAULT_LOG_SIGNATURE
        && record.version == FAULT_LOG_VERSION
        && sum == 0)
        .then_some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;
    use slog::o;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn blank_row_starts_fresh() {
        let mut flash = SimFlash::new(8, 64);
        let faults = FaultLog::load(3, &mut flash, &log());
        assert_eq!(*faults.record(), FaultLogRecord::default());
    }

    #[test]
    fn counts_persist() {
        let mut flash = SimFlash::new(8, 64);
        let mut faults = FaultLog::load(3, &mut flash, &log());
        faults.count(&mut flash, Fault::PowerCycle).unwrap();
        faults.count(&mut flash, Fault::PowerCycle).unwrap();
        faults.count(&mut flash, Fault::Phase2AuthFailure).unwrap();

        let reloaded = FaultLog::load(3, &mut flash, &log());
        assert_eq!(reloaded.record().power_cycles, 2);
        assert_eq!(reloaded.record().phase2_auth_failures, 1);
        assert_eq!(reloaded.record().fw_update_failures, 0);
        assert_eq!(&flash.row(3)[..2], b"CY");
    }

    #[test]
    fn counters_saturate() {
        let mut flash = SimFlash::new(8, 64);
        let mut faults = FaultLog::load(3, &mut flash, &log());
        faults.record.fw_update_failures = u16::MAX - 1;
        faults.count(&mut flash, Fault::FwUpdateFailure).unwrap();
        faults.count(&mut flash, Fault::FwUpdateFailure).unwrap();
        assert_eq!(faults.record().fw_update_failures, u16::MAX);
    }

    #[test]
    fn corrupt_row_is_discarded() {
        let mut flash = SimFlash::new(8, 64);
        let mut faults = FaultLog::load(3, &mut flash, &log());
        faults.count(&mut flash, Fault::FwUpdateFailure).unwrap();

        let mut row = flash.row(3);
        row[4] ^= 0x40;
        flash.write_row(3, &row).unwrap();
        let reloaded = FaultLog::load(3, &mut flash, &log());
        assert_eq!(reloaded.record().fw_update_failures, 0);
    }

    #[test]
    fn response_layout() {
        let mut flash = SimFlash::new(8, 64);
        let mut faults = FaultLog::load(3, &mut flash, &log());
        faults.count(&mut flash, Fault::Phase1AuthFailure).unwrap();
        let mut out = [0; 64];
        let n = faults.encode(&mut out).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&out[..7], &[b'C', b'Y', 1, 0, 0, 1, 0]);
    }
}
