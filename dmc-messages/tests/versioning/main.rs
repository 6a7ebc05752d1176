// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Serialize;

mod v1;

pub fn assert_serialized(
    out: &mut [u8],
    expected: &[u8],
    item: &(impl Serialize + std::fmt::Debug),
) {
    let n = dmc_messages::serialize(out, item).unwrap();
    assert_eq!(expected, &out[..n], "incorrect serialization of {item:?}");
}
