// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use argh::FromArgs;

#[derive(FromArgs)]
/// Inspect the Android Emulator hypervisor driver
pub struct AehdCmdlineArgs {
    #[argh(option, arg_name = "PATH")]
    /// JSON configuration file
    pub config: Option<PathBuf>,
    #[argh(option, arg_name = "PATH")]
    /// hypervisor device, overrides the configuration file
    pub device: Option<PathBuf>,
    #[argh(option, arg_name = "N")]
    /// number of vcpus present at boot, checked against the driver limits
    pub smp: Option<usize>,
    #[argh(option, default = "String::from(\"info\")")]
    /// log filter in env_logger syntax
    pub log_level: String,
    #[argh(subcommand)]
    pub command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
/// Actions
pub enum Command {
    Inspect(InspectCommand),
    Config(ConfigCommand),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "inspect")]
/// Create a VM and report what the driver supports
pub struct InspectCommand {}

#[derive(FromArgs)]
#[argh(subcommand, name = "config")]
/// Print the effective configuration as JSON
pub struct ConfigCommand {}
