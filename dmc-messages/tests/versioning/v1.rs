// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The tests in this module check that the host-visible and flash-resident
//! layouts have not changed.
//!
//! If a test in this module fails, _do not change the test_! Hosts in the
//! field and metadata already written to docks depend on these layouts;
//! revert the change to the type instead.

use super::assert_serialized;
use dmc_messages::DeviceStatus;
use dmc_messages::DeviceType;
use dmc_messages::DmcError;
use dmc_messages::DockIdentity;
use dmc_messages::DockStatusCode;
use dmc_messages::DockStatusHeader;
use dmc_messages::FwctAnalysisStatus;
use dmc_messages::ImageMode;
use dmc_messages::ImageStatus;
use dmc_messages::ImageType;
use dmc_messages::IntEpMessage;
use dmc_messages::Notification;
use dmc_messages::SerializedSize;
use dmc_messages::StatusCode;
use dmc_messages::UpdateModel;
use dmc_messages::VendorRequest;

#[test]
fn setup_packet() {
    let mut out = [0; 8];
    let setup = VendorRequest::ImageWrite { start_row: 0x0102, row_count: 4 }
        .to_setup();

    #[rustfmt::skip]
    let expected = &[
        0x40, // vendor, host to device
        0xd3, // image write
        0x02, 0x01, // start row
        0x04, 0x00, // row count
        0x00, 0x00, // no data stage
    ];
    assert_serialized(&mut out, expected, &setup);

    let setup = VendorRequest::GetDockStatus { length: 264 }.to_setup();
    #[rustfmt::skip]
    let expected = &[
        0xc0, // vendor, device to host
        0xd6, // dock status
        0x00, 0x00,
        0x00, 0x00,
        0x08, 0x01, // length
    ];
    assert_serialized(&mut out, expected, &setup);
}

#[test]
fn device_status() {
    let mut out = [0; DeviceStatus::MAX_SIZE];
    let mut status =
        DeviceStatus::new(DeviceType::Ccg5, 3, ImageMode::DualAsymmetric);
    status.set_current_image(ImageType::Image2);
    status.set_image_status(ImageType::Image1, ImageStatus::Invalid);
    status.set_image_status(ImageType::Image2, ImageStatus::Valid);
    status.record_update_attempt(ImageType::Image1);
    status.record_update_attempt(ImageType::Image1);
    status.device_specific = [0xaa, 0xbb];
    status.set_version(ImageType::Bootloader, [1, 2, 3, 4, 5, 6, 7, 8]);
    status.set_version(ImageType::Image1, [0x11; 8]);
    status.set_version(ImageType::Image2, [0x22; 8]);

    #[rustfmt::skip]
    let expected = &[
        0x04, // device type
        3, // component id
        2, // dual asymmetric
        2, // running image 2
        0x12, // image 2 valid, image 1 invalid
        0x02, // image 1 attempted twice
        0xaa, 0xbb, // device specific
        1, 2, 3, 4, 5, 6, 7, 8, // bootloader version
        0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, // image 1 version
        0x22, 0x22, 0x22, 0x22, 0x22, 0x22, 0x22, 0x22, // image 2 version
    ];
    assert_serialized(&mut out, expected, &status);
}

#[test]
fn dock_status_header() {
    let mut out = [0; DockStatusHeader::MAX_SIZE];
    let mut header = DockStatusHeader::default();
    header.device_count = 3;
    header.status_length = 104;
    header.composite_version = 0x0a0b0c0d;
    header.set_status(DockStatusCode::Phase2FailSpiReadFailed);

    #[rustfmt::skip]
    let expected = &[
        0x8b, // SPI read failed
        3, // device count
        104, 0, // status length
        0x0d, 0x0c, 0x0b, 0x0a, // composite version
    ];
    assert_serialized(&mut out, expected, &header);
}

#[test]
fn dock_identity() {
    let mut out = [0; DockIdentity::MAX_SIZE];
    let identity = DockIdentity {
        structure_version: 2,
        cdtt_version: 1,
        vid: 0x04b4,
        pid: 0x521a,
        device_id: 0x0102,
        vendor_string: dmc_messages::padded_string(b"A"),
        product_string: dmc_messages::padded_string(b"B"),
        secured_only: true,
        model: UpdateModel::DownloadTrigger,
    };

    let mut expected = vec![2, 1, 0xb4, 0x04, 0x1a, 0x52, 0x02, 0x01];
    expected.push(b'A');
    expected.extend_from_slice(&[0; 31]);
    expected.push(b'B');
    expected.extend_from_slice(&[0; 31]);
    expected.push(1); // secured only
    expected.push(1); // download then trigger
    assert_serialized(&mut out, &expected, &identity);
}

#[test]
fn notifications() {
    let mut out = [0; IntEpMessage::MAX_SIZE];

    let msg = IntEpMessage::from(Notification::FwUpgradeRequest {
        image_index: 2,
    });
    #[rustfmt::skip]
    let expected = &[
        0x01, // upgrade request
        1, // length
        2, 0, 0, 0, 0, 0, 0, 0,
    ];
    assert_serialized(&mut out, expected, &msg);

    let msg = IntEpMessage::from(Notification::ImageWriteStatus(
        StatusCode::GENERIC_FAILURE,
    ));
    #[rustfmt::skip]
    let expected = &[
        0x81, // image write status
        1,
        0xff, 0, 0, 0, 0, 0, 0, 0,
    ];
    assert_serialized(&mut out, expected, &msg);

    let msg = IntEpMessage::from(Notification::FwctAnalysisStatus(
        FwctAnalysisStatus::AuthenticationFailed,
    ));
    #[rustfmt::skip]
    let expected = &[
        0x83, // FWCT analysis status
        1,
        3, 0, 0, 0, 0, 0, 0, 0,
    ];
    assert_serialized(&mut out, expected, &msg);
}

#[test]
fn dmc_error() {
    let mut out = [0; DmcError::MAX_SIZE];

    #[rustfmt::skip]
    let expected = &[
        3, // Busy
    ];
    assert_serialized(&mut out, expected, &DmcError::Busy);
}
