// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Behavior implemented by both real and simulated DMCs.

use crate::BadRequestReason;
use crate::DmcError;
use crate::DockIdentity;
use crate::DockStatus;
use crate::EcdsaSignature;
use crate::SetupPacket;
use crate::StatusCode;
use crate::VendorRequest;
use crate::MAX_RESPONSE_SIZE;
use hubpack::SerializedSize;

/// Entry points the vendor interface forwards into. Implementations hold all
/// update state; the dispatch functions below hold none.
pub trait DmcHandler {
    fn upgrade_start(
        &mut self,
        signature: Option<&EcdsaSignature>,
    ) -> Result<(), DmcError>;

    fn fwct_write(&mut self, fwct: &[u8]) -> Result<(), DmcError>;

    fn image_write(
        &mut self,
        start_row: u16,
        row_count: u16,
    ) -> Result<(), DmcError>;

    /// One bulk OUT packet of row data.
    fn row_data(&mut self, data: &[u8]) -> Result<(), DmcError>;

    fn image_write_status(&mut self) -> StatusCode;

    fn upgrade_status(&mut self) -> StatusCode;

    fn dock_status(&mut self) -> DockStatus;

    fn dock_identity(&mut self) -> DockIdentity;

    fn state_reset(&mut self) -> Result<(), DmcError>;

    fn trigger_phase2_update(&mut self) -> Result<(), DmcError>;

    /// Write the persisted fault log into `out`, returning its length.
    fn flash_log(&mut self, out: &mut [u8]) -> Result<usize, DmcError>;
}

/// Handle one control transfer: `setup` is the 8-byte setup packet, `data`
/// the host-to-device data stage (empty for device-to-host requests).
///
/// On success, returns the number of bytes of `out` to send back in the
/// data stage, never more than the setup packet's `length`. An error
/// should be reported to the host as a stall.
pub fn handle_vendor_request<H: DmcHandler>(
    setup: &[u8],
    data: &[u8],
    handler: &mut H,
    out: &mut [u8],
) -> Result<usize, DmcError> {
    let setup = read_setup_packet(setup)?;
    let request = VendorRequest::from_setup(&setup)?;

    if !request.opcode().is_device_to_host()
        && data.len() != usize::from(setup.length)
    {
        return Err(BadRequestReason::BadLength {
            expected: setup.length,
            got: data.len() as u16,
        }
        .into());
    }

    let mut response = [0; MAX_RESPONSE_SIZE];
    let n = match request {
        VendorRequest::UpgradeStart { signed } => {
            let signature = if signed {
                let (sig, _) = hubpack::deserialize::<EcdsaSignature>(data)
                    .map_err(|_| BadRequestReason::DeserializationError)?;
                Some(sig)
            } else {
                None
            };
            handler.upgrade_start(signature.as_ref())?;
            0
        }
        VendorRequest::FwctWrite { .. } => {
            handler.fwct_write(data)?;
            0
        }
        VendorRequest::ImageWrite { start_row, row_count } => {
            handler.image_write(start_row, row_count)?;
            0
        }
        VendorRequest::GetImageWriteStatus => {
            response[0] = handler.image_write_status().as_byte();
            1
        }
        VendorRequest::GetUpgradeStatus => {
            response[0] = handler.upgrade_status().as_byte();
            1
        }
        VendorRequest::GetDockStatus { .. } => handler
            .dock_status()
            .encode_response(&mut response)
            .map_err(|_| DmcError::ResponseTooLarge)?,
        VendorRequest::GetDockIdentity { .. } => {
            hubpack::serialize(&mut response, &handler.dock_identity())
                .map_err(|_| DmcError::ResponseTooLarge)?
        }
        VendorRequest::StateReset => {
            handler.state_reset()?;
            0
        }
        VendorRequest::TriggerPhase2Update => {
            handler.trigger_phase2_update()?;
            0
        }
        VendorRequest::RetrieveFlashLog { .. } => {
            handler.flash_log(&mut response)?
        }
    };

    // The host gets no more than it asked for.
    let n = n.min(usize::from(setup.length));
    let dest = out.get_mut(..n).ok_or(DmcError::ResponseTooLarge)?;
    dest.copy_from_slice(&response[..n]);
    Ok(n)
}

/// Handle one packet received on the bulk OUT endpoint.
pub fn handle_bulk_out<H: DmcHandler>(
    data: &[u8],
    handler: &mut H,
) -> Result<(), DmcError> {
    handler.row_data(data)
}

fn read_setup_packet(data: &[u8]) -> Result<SetupPacket, BadRequestReason> {
    if data.len() != SetupPacket::MAX_SIZE {
        return Err(BadRequestReason::BadSetupPacket);
    }
    let (setup, _) = hubpack::deserialize::<SetupPacket>(data)
        .map_err(|_| BadRequestReason::BadSetupPacket)?;
    Ok(setup)
}
