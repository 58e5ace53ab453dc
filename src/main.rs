// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Inspects the AEHD driver and validates VM settings against it.

mod cmdline;

use std::fs;

use aehd::arch::ArchVm;
use aehd::memory::NullDirtyTracker;
use aehd::AehdState;
use aehd::Cap;
use aehd::Config;
use anyhow::Context;
use log::info;

use crate::cmdline::AehdCmdlineArgs;
use crate::cmdline::Command;

/// VM setup without any architecture specific devices.
struct GenericVm;

impl ArchVm for GenericVm {}

fn load_config(args: &AehdCmdlineArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            Config::from_json(&json)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(device) = &args.device {
        config.device_path = device.clone();
    }
    if let Some(smp) = args.smp {
        config.smp_cpus = smp;
        config.max_cpus = config.max_cpus.max(smp);
    }
    Ok(config)
}

fn inspect(config: &Config) -> anyhow::Result<()> {
    let state = AehdState::open(config, &mut GenericVm, Box::new(NullDirtyTracker))
        .with_context(|| format!("failed to initialize AEHD on {}", config.device_path.display()))?;

    let limits = state.vcpu_limits();
    println!("device:            {}", config.device_path.display());
    println!("recommended vcpus: {}", limits.recommended);
    println!("max vcpus:         {}", limits.max);
    println!("max vcpu id:       {}", limits.max_vcpu_id);
    println!("page size:         {:#x}", state.page_size());
    {
        let resources = state.lock();
        println!("memory slots:      {}", resources.memory.nr_slots());
        println!("routable gsis:     {}", resources.irq.gsi_count());
    }
    for cap in [Cap::Irqchip, Cap::UserMemory, Cap::IrqRouting] {
        println!("{:<19}{}", format!("{:?}:", cap), state.vm_check_extension(cap));
    }
    info!("inspection finished");
    Ok(())
}

fn run(args: AehdCmdlineArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    match args.command {
        Command::Inspect(_) => inspect(&config),
        Command::Config(_) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn main() {
    let args: AehdCmdlineArgs = argh::from_env();
    env_logger::Builder::new()
        .parse_filters(&args.log_level)
        .init();
    if let Err(e) = run(args) {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}
