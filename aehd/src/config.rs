// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::sys::DEFAULT_DEVICE_PATH;

/// Slot table size assumed when the driver does not report one.
pub const DEFAULT_NR_SLOTS: usize = 32;
/// Recommended vCPU count assumed when the driver does not report one.
pub const DEFAULT_NR_VCPUS: usize = 4;

/// Settings consumed by `AehdState::init`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the hypervisor device.
    pub device_path: PathBuf,
    /// Number of vCPUs present at boot.
    pub smp_cpus: usize,
    /// Number of vCPUs that may ever be plugged.
    pub max_cpus: usize,
    pub default_nr_slots: usize,
    pub default_nr_vcpus: usize,
    /// Overrides the host page size used for slot alignment and dirty logging.
    pub page_size: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_path: PathBuf::from(DEFAULT_DEVICE_PATH),
            smp_cpus: 1,
            max_cpus: 1,
            default_nr_slots: DEFAULT_NR_SLOTS,
            default_nr_vcpus: DEFAULT_NR_VCPUS,
            page_size: None,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> serde_json::Result<Config> {
        serde_json::from_str(json)
    }
}
