// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implements passthrough of host bus devices into the guest.

mod passthrough;

pub use self::passthrough::Error;
pub use self::passthrough::PassthroughDevice;
pub use self::passthrough::PassthroughMatcher;
pub use self::passthrough::Result;
pub use self::passthrough::VBUS_DEVICE_PROP;
