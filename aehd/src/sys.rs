// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as platform;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as platform;
    } else {
        compile_error!("Unsupported platform");
    }
}

pub use platform::pagesize;
pub use platform::DeviceChannel;
pub use platform::DEFAULT_DEVICE_PATH;
